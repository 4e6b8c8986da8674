//! Flow engine
//!
//! A flow reads records from one or more inputs, passes each record
//! through a transformer chain and delivers the result to its outputs.
//!
//! - [`component`]: the `InputSource`, `Transformer` and `OutputDestination` traits
//! - [`definition`]: declarative [`FlowDefinition`]
//! - [`registry`]: named flows and components
//! - [`executor`]: runs one flow through its lifecycle
//! - [`engine`]: concurrency limits, background runs and cancellation
//! - [`testing`]: in-memory components for tests

pub mod component;
pub mod definition;
pub mod engine;
pub mod executor;
pub mod registry;
pub mod result;
pub mod testing;

pub use component::{
    FlowContext, FnTransformer, InputSource, MappingSpec, MappingTransformer, OutputDestination, Transformer,
};
pub use definition::{FlowDefinition, FlowDefinitionBuilder};
pub use engine::{EngineStatistics, FlowHandle, IntegrationEngine, RunningFlow, DEFAULT_WORKER_POOL_SIZE};
pub use executor::FlowExecutor;
pub use registry::ComponentRegistry;
pub use result::{FlowResult, FlowState, SendResult, SendStatus, ValidationResult};
