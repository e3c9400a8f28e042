//! Control-flow processors every graph can use without an application
//! factory: start, end, loop, human review and external-signal wait.

pub mod human_review;
pub mod loop_node;
pub mod passthrough;
pub mod wait;

pub use human_review::HumanReviewProcessor;
pub use loop_node::LoopProcessor;
pub use passthrough::PassthroughProcessor;
pub use wait::WaitSignalProcessor;
