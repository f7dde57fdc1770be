use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use clearinghouse_base::{err, Result};

/// A totally ordered transaction identifier: `(physical_ns, branch_id)`,
/// with a sentinel that compares below every real timestamp. Putting the
/// sentinel in its own enum variant, rather than
/// picking a magic `nanos` value, makes the "below all real timestamps"
/// invariant a property of the derived [`Ord`] impl instead of something
/// callers have to remember.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Timestamp {
    Zero,
    Real { nanos: u128, branch: String },
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp::Zero;

    pub fn is_zero(&self) -> bool {
        matches!(self, Timestamp::Zero)
    }

    pub fn branch(&self) -> Option<&str> {
        match self {
            Timestamp::Zero => None,
            Timestamp::Real { branch, .. } => Some(branch),
        }
    }

    /// Renders the canonical `transaction_id` form used on the wire and as
    /// the transaction registry key: `"<nanoseconds>:<coordinator_branch>"`.
    pub fn parse(s: &str) -> Result<Timestamp> {
        let (nanos, branch) = s
            .split_once(':')
            .ok_or_else(|| err(format!("malformed transaction id {s:?}")))?;
        let nanos: u128 = nanos
            .parse()
            .map_err(|_| err(format!("malformed transaction id {s:?}")))?;
        Ok(Timestamp::Real {
            nanos,
            branch: branch.to_string(),
        })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Zero => write!(f, "0:"),
            Timestamp::Real { nanos, branch } => write!(f, "{nanos}:{branch}"),
        }
    }
}

/// Mints fresh, monotonically-increasing timestamps for one branch. Ties
/// within the same nanosecond are broken by branch id, so no in-process
/// coordination beyond reading the clock is required.
#[derive(Clone, Debug)]
pub struct TimestampSource {
    branch: String,
}

impl TimestampSource {
    pub fn new(branch: impl Into<String>) -> Self {
        TimestampSource { branch: branch.into() }
    }

    pub fn next(&self) -> Timestamp {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_nanos();
        Timestamp::Real {
            nanos,
            branch: self.branch.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_sorts_below_every_real_timestamp() {
        let real = Timestamp::Real { nanos: 0, branch: "A".to_string() };
        assert!(Timestamp::ZERO < real);
    }

    #[test]
    fn ties_break_on_branch_id() {
        let a = Timestamp::Real { nanos: 5, branch: "A".to_string() };
        let b = Timestamp::Real { nanos: 5, branch: "B".to_string() };
        assert!(a < b);
    }

    #[test]
    fn display_and_parse_round_trip() {
        let ts = Timestamp::Real { nanos: 12345, branch: "A".to_string() };
        assert_eq!(Timestamp::parse(&ts.to_string()).unwrap(), ts);
    }

    #[test]
    fn source_produces_strictly_increasing_timestamps() {
        let source = TimestampSource::new("A");
        let a = source.next();
        let b = source.next();
        assert!(a <= b);
    }
}
