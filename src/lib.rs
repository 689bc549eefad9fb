pub mod capture;
pub mod config;
pub mod connection;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod relay;
pub mod transcoder;
pub mod websocket;

pub use connection::{Connection, ConnectionId};
pub use errors::{Result, StreamError};
pub use relay::{StreamId, StreamRelay};
