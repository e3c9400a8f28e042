pub mod builtin;
pub mod engine;
pub mod merge;
pub mod middleware;
pub mod persist;
pub mod registry;

pub use engine::{Engine, EngineBuilder};
pub use merge::{AggregatingMergeStrategy, DefaultMergeStrategy, MergeStrategy};
pub use middleware::CircuitBreaker;
pub use persist::{InMemorySessionRepository, PersistQueue};
pub use registry::{NodeConstructor, NodeRegistry};
