// battwatch-api: wire protocol and websocket command channel for the panel

pub mod error;
pub mod proto;
pub mod socket;
pub mod transport;

pub use error::Error;
pub use socket::WsTransport;
pub use transport::{RedialConfig, Transport, TransportConfig, calls};
