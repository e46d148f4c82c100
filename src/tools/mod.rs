pub mod dispatcher;
pub mod echo;
pub mod registry;

pub use dispatcher::ToolDispatcher;
pub use echo::EchoTool;
pub use registry::{Tool, ToolRegistry};
