mod error;
mod pool;
mod session;

pub use error::{ConnectError, InvokeError};
pub use pool::SessionPool;
pub use session::{McpSession, SessionState, ToolSession, extract_tool_text};
