pub mod handler;
pub mod protocol;
pub mod registry;

pub use handler::{client_ws_handler, sandbox_ws_handler};
pub use registry::{BroadcastMode, ClientInfo, Outbound, SocketSender, WebSocketRegistry};
