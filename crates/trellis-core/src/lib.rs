pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod session;
pub mod traits;
pub mod types;
pub mod validate;

pub use config::AppConfig;
pub use error::{Result, TrellisError};
pub use event::{BackpressurePolicy, EventReceiver, EventSender, EventStream};
pub use graph::{GraphDefinition, Node, NodeType};
pub use session::Session;
pub use traits::{
    ConditionalRouter, FactoryDeps, Middleware, NodeContext, NodeFactory, NodeOutcome,
    NodeProcessor, SessionRepository,
};
pub use types::*;
pub use validate::validate;
