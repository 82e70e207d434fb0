pub mod channel;
pub mod error;
pub mod forwarder;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use channel::{Channel, ChannelInfo};
pub use error::{MethodError, RelayError, Result};
pub use registry::Registry;
pub use server::{Server, ServerConfig};
pub use session::{Session, SessionInfo, SessionState};
