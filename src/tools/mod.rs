pub mod echo;
pub mod registry;
pub mod sleep;

pub use echo::EchoTool;
pub use registry::{ToolDescriptor, ToolHandler, ToolInvocation, ToolRegistry};
pub use sleep::SleepTool;
