pub mod connection;
pub mod protocol;
pub mod server;

pub use connection::{ConnectionPhase, StratumConnection};
pub use protocol::{StratumNotification, StratumRequest, StratumResponse};
pub use server::{RequestHandler, StratumServer, TimestampedRequest};
