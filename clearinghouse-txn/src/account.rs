use std::sync::{Condvar, Mutex};

use tracing::debug;

use clearinghouse_base::ProtocolError;

use crate::timestamp::Timestamp;

/// A write recorded against an account but not yet promoted to the
/// committed value.
#[derive(Clone, Debug)]
struct TentativeWrite {
    ts: Timestamp,
    value: i64,
}

#[derive(Debug)]
struct AccountState {
    committed_value: i64,
    commit_ts: Timestamp,
    reads: Vec<Timestamp>,
    /// Pending (uncommitted) writes, kept sorted ascending by `ts`. There is
    /// no literal sentinel entry here: "no committed value yet" is
    /// represented directly by `commit_ts == Timestamp::ZERO` rather than a
    /// placeholder record, giving an equivalent predicate-based encoding of
    /// the wait/NotFound conditions.
    writes: Vec<TentativeWrite>,
}

impl AccountState {
    fn new() -> Self {
        AccountState {
            committed_value: 0,
            commit_ts: Timestamp::ZERO,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    fn max_read(&self) -> Option<&Timestamp> {
        self.reads.iter().max()
    }

    fn find_write(&self, ts: &Timestamp) -> Option<usize> {
        self.writes.iter().position(|w| &w.ts == ts)
    }

    /// The pending write with the greatest `ts <= ts_bound`, if any.
    fn greatest_write_at_or_before(&self, ts_bound: &Timestamp) -> Option<&TentativeWrite> {
        self.writes
            .iter()
            .filter(|w| &w.ts <= ts_bound)
            .max_by(|a, b| a.ts.cmp(&b.ts))
    }
}

/// One account's state plus the lock/condvar pair that arbitrates access to
/// it. Every operation here is keyed by the calling transaction's
/// timestamp, never by the account's own notion of "current transaction" —
/// there is no such thing, multiple transactions may have live tentative
/// writes against the same account at once.
pub struct Account {
    state: Mutex<AccountState>,
    condvar: Condvar,
}

impl Account {
    pub fn new() -> Self {
        Account {
            state: Mutex::new(AccountState::new()),
            condvar: Condvar::new(),
        }
    }

    /// Enforces the write-write and read-write ordering rule. Never blocks.
    pub fn write(&self, value: i64, ts: &Timestamp) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().unwrap();
        if !(ts > &state.commit_ts) {
            return Err(ProtocolError::abort("write timestamp not after last commit"));
        }
        if let Some(max_read) = state.max_read() {
            if ts < max_read {
                return Err(ProtocolError::abort("write timestamp precedes an existing read"));
            }
        }
        if let Some(idx) = state.find_write(ts) {
            state.writes[idx].value = value;
        } else {
            let pos = state.writes.partition_point(|w| w.ts < *ts);
            state.writes.insert(pos, TentativeWrite { ts: ts.clone(), value });
        }
        Ok(())
    }

    /// Blocking read. Blocks on the account's condvar whenever an older,
    /// still-uncommitted write stands between `commit_ts` and `ts`.
    pub fn read(&self, ts: &Timestamp) -> Result<i64, ProtocolError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if ts <= &state.commit_ts {
                return Err(ProtocolError::abort("read timestamp not after last commit"));
            }
            match state.greatest_write_at_or_before(ts) {
                Some(w) if &w.ts == ts => return Ok(w.value),
                Some(older) => {
                    debug!(ts = %ts, blocked_on = %older.ts, "read blocking on an earlier unresolved write");
                    state = self.condvar.wait(state).unwrap();
                }
                None => {
                    if state.commit_ts.is_zero() {
                        return Err(ProtocolError::NotFound);
                    }
                    state.reads.push(ts.clone());
                    return Ok(state.committed_value);
                }
            }
        }
    }

    /// True iff this transaction's own tentative write on this account (if
    /// any) would not drive the balance negative. Never blocks.
    pub fn can_commit(&self, ts: &Timestamp) -> bool {
        let state = self.state.lock().unwrap();
        match state.find_write(ts) {
            Some(idx) => state.writes[idx].value >= 0,
            None => true,
        }
    }

    /// Promotes this transaction's tentative write (if any) to the
    /// committed value, blocking until any older pending write resolves
    /// first.
    pub fn commit(&self, ts: &Timestamp) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().unwrap();
        loop {
            match state.find_write(ts) {
                None => {
                    state.reads.retain(|r| r != ts);
                    self.condvar.notify_all();
                    return Ok(());
                }
                Some(idx) => {
                    if idx != 0 {
                        debug!(ts = %ts, position = idx, "commit blocking behind an earlier pending write");
                        state = self.condvar.wait(state).unwrap();
                        continue;
                    }
                    let write = state.writes.remove(0);
                    if write.value < 0 {
                        self.condvar.notify_all();
                        return Err(ProtocolError::abort("commit would leave a negative balance"));
                    }
                    state.committed_value = write.value;
                    state.commit_ts = ts.clone();
                    state.reads.retain(|r| r != ts);
                    self.condvar.notify_all();
                    return Ok(());
                }
            }
        }
    }

    /// Discards this transaction's tentative write and read marker. Never
    /// fails.
    pub fn abort(&self, ts: &Timestamp) {
        let mut state = self.state.lock().unwrap();
        state.writes.retain(|w| &w.ts != ts);
        state.reads.retain(|r| r != ts);
        self.condvar.notify_all();
    }

    pub fn committed_value(&self) -> i64 {
        self.state.lock().unwrap().committed_value
    }
}

impl Default for Account {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ts(nanos: u128, branch: &str) -> Timestamp {
        Timestamp::Real { nanos, branch: branch.to_string() }
    }

    #[test]
    fn read_of_nonexistent_account_is_not_found() {
        let account = Account::new();
        assert_eq!(account.read(&ts(1, "A")), Err(ProtocolError::NotFound));
    }

    #[test]
    fn write_then_read_same_txn_sees_own_write() {
        let account = Account::new();
        let t = ts(1, "A");
        account.write(10, &t).unwrap();
        assert_eq!(account.read(&t), Ok(10));
    }

    #[test]
    fn commit_makes_value_visible_to_later_reads() {
        let account = Account::new();
        let t = ts(1, "A");
        account.write(10, &t).unwrap();
        account.commit(&t).unwrap();
        assert_eq!(account.read(&ts(2, "A")), Ok(10));
        assert_eq!(account.committed_value(), 10);
    }

    #[test]
    fn read_at_or_before_commit_ts_aborts() {
        let account = Account::new();
        let t1 = ts(5, "A");
        account.write(10, &t1).unwrap();
        account.commit(&t1).unwrap();
        assert!(matches!(account.read(&ts(3, "A")), Err(ProtocolError::Abort(_))));
    }

    #[test]
    fn idempotent_rewrite_nets_the_value() {
        let account = Account::new();
        let t = ts(1, "A");
        account.write(10, &t).unwrap();
        account.write(30, &t).unwrap();
        assert_eq!(account.read(&t), Ok(30));
    }

    #[test]
    fn can_commit_rejects_negative_balance() {
        let account = Account::new();
        let t = ts(1, "A");
        account.write(-5, &t).unwrap();
        assert!(!account.can_commit(&t));
    }

    #[test]
    fn can_commit_is_trivially_true_for_read_only() {
        let account = Account::new();
        account.write(100, &ts(1, "A")).unwrap();
        account.commit(&ts(1, "A")).unwrap();
        let reader = ts(2, "A");
        account.read(&reader).unwrap();
        assert!(account.can_commit(&reader));
    }

    #[test]
    fn abort_discards_the_tentative_write() {
        let account = Account::new();
        let t = ts(1, "A");
        account.write(10, &t).unwrap();
        account.abort(&t);
        assert_eq!(account.read(&ts(2, "A")), Err(ProtocolError::NotFound));
    }

    #[test]
    fn commit_blocks_until_an_earlier_write_resolves() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let account = Arc::new(Account::new());
        let early = ts(1, "A");
        let late = ts(2, "A");
        account.write(5, &early).unwrap();
        account.write(7, &late).unwrap();

        let later_account = Arc::clone(&account);
        let late_clone = late.clone();
        let handle = thread::spawn(move || {
            later_account.commit(&late_clone).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(account.committed_value(), 0);
        account.commit(&early).unwrap();
        handle.join().unwrap();
        assert_eq!(account.committed_value(), 7);
    }
}
