//! JSON-RPC control surface: framing, request validation, method
//! dispatch and the TCP server.

pub mod framing;
pub mod handler;
pub mod request;
pub mod server;

pub use framing::{read_frame, write_frame, MAX_FRAME_LEN};
pub use handler::RpcHandler;
pub use request::{notification, RpcError, RpcRequest};
pub use server::RpcServer;
