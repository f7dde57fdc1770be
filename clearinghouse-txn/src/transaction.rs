use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::timestamp::Timestamp;

/// A transaction's lifecycle state. `OPEN -> PREPARE -> COMMITTED`, `OPEN ->
/// ABORTED`, or `PREPARE -> ABORTED`; no other transition is legal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnState {
    Open,
    Prepare,
    Committed,
    Aborted,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }
}

/// Coordinator-side and participant-side per-transaction record.
/// `client_id` and `yes_votes` are only meaningful on the coordinator; every
/// branch, coordinator or participant, keeps one of these per transaction
/// it has touched.
#[derive(Debug)]
pub struct Transaction {
    pub id: Timestamp,
    pub client_id: String,
    pub accounts: Vec<String>,
    pub created_accounts: Vec<String>,
    pub state: TxnState,
    pub yes_votes: HashSet<String>,
    /// Coordinator-only: the branch a forwarded operation is currently
    /// awaiting a reply from, if any (sec. 5 guarantees at most one
    /// outstanding operation per transaction). Used to recognize, on that
    /// branch's disconnect, that its reply is never coming.
    pub pending_branch: Option<String>,
}

impl Transaction {
    pub fn new(id: Timestamp, client_id: impl Into<String>) -> Self {
        Transaction {
            id,
            client_id: client_id.into(),
            accounts: Vec::new(),
            created_accounts: Vec::new(),
            state: TxnState::Open,
            yes_votes: HashSet::new(),
            pending_branch: None,
        }
    }

    pub fn add_account(&mut self, id: &str) {
        if !self.accounts.iter().any(|a| a == id) {
            self.accounts.push(id.to_string());
        }
    }

    pub fn add_created_account(&mut self, id: &str) {
        if !self.created_accounts.iter().any(|a| a == id) {
            self.created_accounts.push(id.to_string());
        }
    }

    pub fn record_yes_vote(&mut self, branch: impl Into<String>) {
        self.yes_votes.insert(branch.into());
    }
}

/// Branch-local mapping from `transaction_id` to its record. Terminal
/// transactions are retained briefly so a late, duplicate message
/// (e.g. a redelivered `CoordinatorAbort`) can be recognized and ignored
/// rather than reviving a finished transaction.
#[derive(Default)]
pub struct TransactionRegistry {
    transactions: RwLock<HashMap<String, Transaction>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the transaction if absent: at `BEGIN` on the coordinator, or
    /// on a participant's first operation for this transaction id.
    pub fn get_or_create(&self, id: &Timestamp, client_id: &str) -> bool {
        let mut transactions = self.transactions.write().unwrap();
        let key = id.to_string();
        if transactions.contains_key(&key) {
            return false;
        }
        transactions.insert(key, Transaction::new(id.clone(), client_id));
        true
    }

    pub fn with<R>(&self, id: &str, f: impl FnOnce(&Transaction) -> R) -> Option<R> {
        self.transactions.read().unwrap().get(id).map(f)
    }

    pub fn with_mut<R>(&self, id: &str, f: impl FnOnce(&mut Transaction) -> R) -> Option<R> {
        self.transactions.write().unwrap().get_mut(id).map(f)
    }

    pub fn remove(&self, id: &str) -> Option<Transaction> {
        self.transactions.write().unwrap().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.transactions.read().unwrap().contains_key(id)
    }

    /// Ids of every transaction matching `pred`, collected in one read-lock
    /// pass. Used by link-failure handling, which has to scan every
    /// outstanding transaction for ones waiting on a peer that just
    /// disconnected.
    pub fn ids_matching(&self, mut pred: impl FnMut(&Transaction) -> bool) -> Vec<String> {
        self.transactions
            .read()
            .unwrap()
            .iter()
            .filter(|(_, t)| pred(t))
            .map(|(id, _)| id.clone())
            .collect()
    }
}
