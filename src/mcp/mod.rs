//! Model Context Protocol runtime.
//!
//! # Architecture
//!
//! - `protocol` - Wire types, method names, and the error-code table
//! - `registry` - Tool/resource/prompt registries and handler traits
//! - `session` - Session lifecycle and connect/disconnect events
//! - `operations` - In-flight tool calls, progress, and cancellation
//! - `engine` - The dispatcher binding everything to one transport
//! - `transport` - Transport contract and the stdio transport

pub mod engine;
pub mod operations;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use engine::Engine;
pub use operations::{
    CancellationToken, Operation, OperationManager, ProgressReporter, ProgressSink,
};
pub use registry::{
    PromptHandler, PromptRegistry, RequestContext, ResourceHandler, ResourceRegistry,
    ToolHandler, ToolRegistry,
};
pub use session::{Session, SessionEvent, SessionManager};
pub use transport::{StdioTransport, Transport, TransportMessage};
