use std::fmt;

/// The behavioral error taxonomy for the transaction engine. Unlike
/// [`crate::Error`], which wraps opaque library failures with a backtrace,
/// every variant here drives a specific client-visible outcome and is
/// matched on directly by the coordinator/participant FSM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The read or write target account has no version visible to the
    /// requesting timestamp. Surfaces as `NOT FOUND, ABORTED`.
    NotFound,
    /// A timestamp-ordering rule was violated, or a commit found a negative
    /// balance. Surfaces as `ABORTED`. Carries a human-readable reason that
    /// is forwarded verbatim to the client.
    Abort(String),
    /// The client sent a command that could not be parsed. Does not alter
    /// transaction state.
    Malformed(String),
    /// The connection to a peer (client or branch) was dropped.
    LinkFailure,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::NotFound => write!(f, "NOT FOUND, ABORTED"),
            ProtocolError::Abort(reason) => write!(f, "ABORTED: {reason}"),
            ProtocolError::Malformed(reason) => write!(f, "INVALID COMMAND: {reason}"),
            ProtocolError::LinkFailure => write!(f, "link failure"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl ProtocolError {
    pub fn abort(reason: impl Into<String>) -> Self {
        ProtocolError::Abort(reason.into())
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::Malformed(reason.into())
    }

    /// The exact reply text the coordinator sends back to the client for
    /// this failure.
    pub fn client_reply(&self) -> String {
        match self {
            ProtocolError::NotFound => "NOT FOUND, ABORTED".to_string(),
            ProtocolError::Abort(_) => "ABORTED".to_string(),
            ProtocolError::Malformed(_) => "INVALID COMMAND".to_string(),
            ProtocolError::LinkFailure => "ABORTED".to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn not_found_reply_matches_contract() {
        assert_eq!(ProtocolError::NotFound.client_reply(), "NOT FOUND, ABORTED");
    }

    #[test]
    fn abort_reply_matches_contract() {
        assert_eq!(ProtocolError::abort("negative balance").client_reply(), "ABORTED");
    }
}
