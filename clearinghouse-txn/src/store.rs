use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::account::Account;

/// Branch-local registry of accounts, keyed by account id; each account is
/// exclusively owned by its branch's store. Accounts are created lazily on
/// first `DEPOSIT` and may be deleted again if the creating transaction
/// aborts.
#[derive(Default)]
pub struct AccountStore {
    accounts: RwLock<HashMap<String, Arc<Account>>>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.accounts.read().unwrap().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Account>> {
        self.accounts.read().unwrap().get(id).cloned()
    }

    /// Creates the account if absent and returns it either way, reporting
    /// whether this call created it (the participant uses this to decide
    /// whether to record the account in a transaction's `created_accounts`).
    pub fn get_or_create(&self, id: &str) -> (Arc<Account>, bool) {
        if let Some(existing) = self.get(id) {
            return (existing, false);
        }
        let mut accounts = self.accounts.write().unwrap();
        if let Some(existing) = accounts.get(id) {
            return (existing.clone(), false);
        }
        let account = Arc::new(Account::new());
        accounts.insert(id.to_string(), account.clone());
        (account, true)
    }

    /// Removes an account outright, used to roll back account creation when
    /// the creating transaction aborts.
    pub fn remove(&self, id: &str) {
        self.accounts.write().unwrap().remove(id);
    }

    /// Every account whose committed value is strictly positive, sorted by
    /// id ascending — feeds the post-commit balance snapshot.
    pub fn positive_balances(&self) -> Vec<(String, i64)> {
        let accounts = self.accounts.read().unwrap();
        let mut snapshot: Vec<(String, i64)> = accounts
            .iter()
            .map(|(id, account)| (id.clone(), account.committed_value()))
            .filter(|(_, value)| *value > 0)
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_or_create_only_creates_once() {
        let store = AccountStore::new();
        let (first, created_first) = store.get_or_create("x");
        let (second, created_second) = store.get_or_create("x");
        assert!(created_first);
        assert!(!created_second);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn remove_drops_the_account() {
        let store = AccountStore::new();
        store.get_or_create("x");
        assert!(store.contains("x"));
        store.remove("x");
        assert!(!store.contains("x"));
    }

    #[test]
    fn positive_balances_omits_empty_accounts_and_sorts_by_id() {
        use crate::timestamp::Timestamp;

        let store = AccountStore::new();
        let (b, _) = store.get_or_create("b");
        let (a, _) = store.get_or_create("a");
        let (z, _) = store.get_or_create("z");
        let t = Timestamp::Real { nanos: 1, branch: "A".to_string() };
        b.write(5, &t).unwrap();
        b.commit(&t).unwrap();
        a.write(10, &t).unwrap();
        a.commit(&t).unwrap();
        z.write(0, &t).unwrap();
        z.commit(&t).unwrap();

        assert_eq!(
            store.positive_balances(),
            vec![("a".to_string(), 10), ("b".to_string(), 5)]
        );
    }
}
