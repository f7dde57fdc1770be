mod error;
mod protocol;

pub use error::{err, Error, Result};
pub use protocol::ProtocolError;
