//! The distributed transaction engine: per-account timestamp-ordered
//! concurrency control (`account`, `store`), the per-transaction
//! bookkeeping that both coordinator and participant roles
//! share (`transaction`), the command grammar (`command`), and the
//! coordinator/participant finite state machine (`Branch`, below) that
//! stitches per-branch participants into a serializable whole.

pub mod account;
pub mod command;
pub mod store;
pub mod timestamp;
pub mod transaction;

use std::sync::Arc;

use tracing::{debug, error, info, info_span, trace, warn};

use clearinghouse_base::ProtocolError;
use clearinghouse_net::{Dispatch, Kind, Packet, PeerSet};

pub use account::Account;
pub use command::Command;
pub use store::AccountStore;
pub use timestamp::{Timestamp, TimestampSource};
pub use transaction::{Transaction, TransactionRegistry, TxnState};

/// One branch's view of the whole system: its own account store, its own
/// transaction registry (shared between the coordinator and participant
/// roles it plays), a handle to every peer it can reach, and a timestamp
/// minter for transactions it coordinates.
///
/// `Branch` implements [`Dispatch`]: the net layer hands it fully decoded
/// packets and peer lifecycle events, and never looks inside them itself —
/// all transaction semantics live here, not in the net layer.
pub struct Branch {
    id: String,
    branch_ids: Vec<String>,
    store: AccountStore,
    transactions: TransactionRegistry,
    peers: Arc<PeerSet>,
    ts_source: TimestampSource,
}

impl Branch {
    pub fn new(id: impl Into<String>, branch_ids: Vec<String>, peers: Arc<PeerSet>) -> Arc<Self> {
        let id = id.into();
        let ts_source = TimestampSource::new(id.clone());
        Arc::new(Branch {
            id,
            branch_ids,
            store: AccountStore::new(),
            transactions: TransactionRegistry::new(),
            peers,
            ts_source,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, target: &str, packet: Packet) {
        match self.peers.get(target) {
            Some(handle) => {
                if let Err(e) = handle.send(packet) {
                    warn!(peer = %target, error = ?e, "failed to deliver packet");
                }
            }
            None => warn!(peer = %target, "no route to peer"),
        }
    }

    /// Like [`Self::send`], but refuses to deliver to a peer registered as a
    /// client: every branch-to-branch message (forwarded operations,
    /// prepare/commit/abort, and their replies) should only ever reach a
    /// peer that identified itself as a branch during its handshake.
    fn send_to_branch(&self, target: &str, packet: Packet) {
        match self.peers.get(target) {
            Some(handle) if !handle.is_client() => {
                if let Err(e) = handle.send(packet) {
                    warn!(peer = %target, error = ?e, "failed to deliver packet");
                }
            }
            Some(_) => warn!(peer = %target, "refusing to route a branch message to a client-registered peer"),
            None => warn!(peer = %target, "no route to peer"),
        }
    }

    fn reply_to_client(&self, client_id: &str, transaction_id: &str, payload: impl Into<String>) {
        self.send(
            client_id,
            Packet::new(false, &self.id, transaction_id, Kind::CoordinatorResponse, payload),
        );
    }

    fn broadcast(&self, transaction_id: &str, kind: Kind, payload: &str) {
        for branch in &self.branch_ids {
            self.send_to_branch(branch, Packet::new(false, &self.id, transaction_id, kind, payload));
        }
    }

    fn client_of(&self, transaction_id: &str) -> Option<String> {
        self.transactions.with(transaction_id, |t| t.client_id.clone())
    }

    // ---- coordinator role ----

    fn handle_client_request(&self, packet: Packet) {
        let command = match Command::parse(&packet.payload) {
            Ok(c) => c,
            Err(e) => {
                self.reply_to_client(&packet.id, &packet.transaction_id, e.client_reply());
                return;
            }
        };
        match command {
            Command::Deposit { branch, account, value } => {
                self.forward_operation(&packet, &branch, &format!("DEPOSIT {branch}.{account} {value}"));
            }
            Command::Withdraw { branch, account, value } => {
                self.forward_operation(&packet, &branch, &format!("WITHDRAW {branch}.{account} {value}"));
            }
            Command::Balance { branch, account } => {
                self.forward_operation(&packet, &branch, &format!("BALANCE {branch}.{account}"));
            }
            Command::Commit => self.begin_commit(&packet),
            Command::Abort => self.begin_abort(&packet),
        }
    }

    fn forward_operation(&self, packet: &Packet, branch: &str, command_text: &str) {
        if !self.branch_ids.iter().any(|b| b == branch) {
            let reply = ProtocolError::malformed(format!("unknown branch {branch:?}")).client_reply();
            self.reply_to_client(&packet.id, &packet.transaction_id, reply);
            return;
        }
        self.transactions
            .with_mut(&packet.transaction_id, |txn| txn.pending_branch = Some(branch.to_string()));
        let forward = Packet::new(false, &self.id, &packet.transaction_id, Kind::CoordinatorRequest, command_text);
        self.send_to_branch(branch, forward);
    }

    fn begin_commit(&self, packet: &Packet) {
        self.transactions.with_mut(&packet.transaction_id, |txn| txn.state = TxnState::Prepare);
        info!(txn = %packet.transaction_id, "broadcasting prepare");
        self.broadcast(&packet.transaction_id, Kind::CoordinatorPrepare, "");
    }

    fn begin_abort(&self, packet: &Packet) {
        self.broadcast(&packet.transaction_id, Kind::CoordinatorAbort, "");
        self.reply_to_client(&packet.id, &packet.transaction_id, "ABORTED");
    }

    fn handle_participant_response(&self, packet: Packet) {
        self.transactions
            .with_mut(&packet.transaction_id, |txn| txn.pending_branch = None);
        if let Some(client_id) = self.client_of(&packet.transaction_id) {
            self.reply_to_client(&client_id, &packet.transaction_id, packet.payload);
        }
    }

    fn handle_participant_abort(&self, packet: Packet) {
        warn!(txn = %packet.transaction_id, reason = %packet.payload, "participant aborted, broadcasting abort");
        self.transactions
            .with_mut(&packet.transaction_id, |txn| txn.pending_branch = None);
        self.broadcast(&packet.transaction_id, Kind::CoordinatorAbort, "");
        if let Some(client_id) = self.client_of(&packet.transaction_id) {
            self.reply_to_client(&client_id, &packet.transaction_id, packet.payload);
        }
    }

    fn handle_participant_yes(&self, packet: Packet) {
        let ready = self.transactions.with_mut(&packet.transaction_id, |txn| {
            txn.record_yes_vote(packet.id.clone());
            txn.yes_votes.len() == self.branch_ids.len()
        });
        if ready != Some(true) {
            return;
        }
        self.transactions.with_mut(&packet.transaction_id, |txn| txn.state = TxnState::Committed);
        info!(txn = %packet.transaction_id, "unanimous yes, broadcasting commit");
        self.broadcast(&packet.transaction_id, Kind::CoordinatorCommit, "");
        if let Some(client_id) = self.client_of(&packet.transaction_id) {
            self.reply_to_client(&client_id, &packet.transaction_id, "COMMIT OK");
        }
    }

    // ---- participant role ----

    fn handle_coordinator_request(&self, packet: Packet) {
        let ts = match Timestamp::parse(&packet.transaction_id) {
            Ok(ts) => ts,
            Err(e) => {
                error!(error = ?e, "malformed transaction id on coordinator request");
                return;
            }
        };
        self.transactions.get_or_create(&ts, "");

        let result = match Command::parse(&packet.payload) {
            Ok(Command::Deposit { account, value, .. }) => {
                self.participant_deposit(&ts, &packet.transaction_id, &account, value)
            }
            Ok(Command::Withdraw { account, value, .. }) => {
                self.participant_withdraw(&ts, &packet.transaction_id, &account, value)
            }
            Ok(Command::Balance { account, .. }) => {
                self.participant_balance(&ts, &packet.transaction_id, &account)
            }
            Ok(Command::Commit | Command::Abort) => {
                Err(ProtocolError::malformed("commit/abort cannot be forwarded as an operation"))
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(reply) => self.send_to_branch(
                &packet.id,
                Packet::new(false, &self.id, &packet.transaction_id, Kind::ParticipantResponse, reply),
            ),
            Err(e) => self.send_to_branch(
                &packet.id,
                Packet::new(false, &self.id, &packet.transaction_id, Kind::ParticipantAbort, e.client_reply()),
            ),
        }
    }

    fn participant_deposit(&self, ts: &Timestamp, txn_id: &str, account: &str, value: i64) -> Result<String, ProtocolError> {
        let (acct, created) = self.store.get_or_create(account);
        self.transactions.with_mut(txn_id, |txn| {
            txn.add_account(account);
            if created {
                txn.add_created_account(account);
            }
        });
        let current = match acct.read(ts) {
            Ok(v) => v,
            Err(ProtocolError::NotFound) => 0,
            Err(e) => return Err(e),
        };
        acct.write(current + value, ts)?;
        Ok("OK".to_string())
    }

    fn participant_withdraw(&self, ts: &Timestamp, txn_id: &str, account: &str, value: i64) -> Result<String, ProtocolError> {
        let acct = self.store.get(account).ok_or(ProtocolError::NotFound)?;
        self.transactions.with_mut(txn_id, |txn| txn.add_account(account));
        let current = acct.read(ts)?;
        acct.write(current - value, ts)?;
        Ok("OK".to_string())
    }

    fn participant_balance(&self, ts: &Timestamp, txn_id: &str, account: &str) -> Result<String, ProtocolError> {
        let acct = self.store.get(account).ok_or(ProtocolError::NotFound)?;
        self.transactions.with_mut(txn_id, |txn| txn.add_account(account));
        let value = acct.read(ts)?;
        Ok(format!("{}.{} = {}", self.id, account, value))
    }

    fn handle_prepare(&self, packet: Packet) {
        let ts = match Timestamp::parse(&packet.transaction_id) {
            Ok(ts) => ts,
            Err(_) => return,
        };
        let accounts = self.transactions.with(&packet.transaction_id, |t| t.accounts.clone());
        let accounts = match accounts {
            Some(a) if !a.is_empty() => a,
            // Empty-transaction elision: no record, or a record
            // that never touched an account on this branch, votes yes
            // without any state change.
            _ => {
                self.send_to_branch(
                    &packet.id,
                    Packet::new(false, &self.id, &packet.transaction_id, Kind::ParticipantYes, ""),
                );
                return;
            }
        };
        for account_id in &accounts {
            let Some(acct) = self.store.get(account_id) else { continue };
            if !acct.can_commit(&ts) {
                acct.abort(&ts);
                // The other touched accounts on this branch keep their
                // tentative writes; the coordinator's follow-up
                // CoordinatorAbort (triggered by this vote) rolls every one
                // of them back, including any created_accounts, in
                // handle_coordinator_abort. Terminating the transaction
                // here too would make that follow-up a no-op and leave
                // created accounts behind.
                self.send_to_branch(
                    &packet.id,
                    Packet::new(false, &self.id, &packet.transaction_id, Kind::ParticipantAbort, "ABORTED"),
                );
                return;
            }
        }
        self.transactions.with_mut(&packet.transaction_id, |t| t.state = TxnState::Prepare);
        self.send_to_branch(
            &packet.id,
            Packet::new(false, &self.id, &packet.transaction_id, Kind::ParticipantYes, ""),
        );
    }

    fn handle_coordinator_commit(&self, packet: Packet) {
        let ts = match Timestamp::parse(&packet.transaction_id) {
            Ok(ts) => ts,
            Err(_) => return,
        };
        let accounts = self
            .transactions
            .with_mut(&packet.transaction_id, |t| {
                if t.state.is_terminal() {
                    return None;
                }
                t.state = TxnState::Committed;
                Some(t.accounts.clone())
            })
            .flatten();
        let Some(accounts) = accounts else { return };
        for account_id in &accounts {
            if let Some(acct) = self.store.get(account_id) {
                if let Err(e) = acct.commit(&ts) {
                    error!(account = %account_id, error = %e, "commit failed after unanimous prepare vote");
                }
            }
        }
        log_balance_snapshot(&self.id, &self.store);
    }

    fn handle_coordinator_abort(&self, packet: Packet) {
        self.abort_transaction_locally(&packet.transaction_id);
    }

    /// Aborts this branch's own record of a transaction exactly as a real
    /// `CoordinatorAbort` would: rolls every touched account's tentative
    /// write back and deletes any account this transaction created here.
    /// Shared by the actual `CoordinatorAbort` handler and by
    /// `on_peer_disconnected`'s link-failure synthesis, since a participant
    /// whose coordinator just disconnected will never receive that message.
    fn abort_transaction_locally(&self, transaction_id: &str) {
        let ts = match Timestamp::parse(transaction_id) {
            Ok(ts) => ts,
            Err(_) => return,
        };
        let work = self
            .transactions
            .with_mut(transaction_id, |t| {
                if t.state.is_terminal() {
                    return None;
                }
                t.state = TxnState::Aborted;
                Some((t.accounts.clone(), t.created_accounts.clone()))
            })
            .flatten();
        let Some((accounts, created)) = work else { return };
        for account_id in &accounts {
            if let Some(acct) = self.store.get(account_id) {
                acct.abort(&ts);
            }
        }
        for account_id in &created {
            self.store.remove(account_id);
        }
    }
}

/// The post-commit balance snapshot: every account on this branch whose
/// committed value is strictly positive, logged rather than sent over the
/// wire.
fn log_balance_snapshot(branch_id: &str, store: &AccountStore) {
    let positive = store.positive_balances();
    if positive.is_empty() {
        return;
    }
    let line = positive
        .iter()
        .map(|(id, value)| format!("{branch_id}.{id}:{value}"))
        .collect::<Vec<_>>()
        .join(" ");
    info!(%line, "BALANCES");
}

impl Dispatch for Branch {
    fn on_packet(&self, packet: Packet) {
        let span = info_span!("txn", id = %packet.transaction_id);
        let _enter = span.enter();
        trace!(from = %packet.id, kind = ?packet.kind, "dispatching packet");
        match packet.kind {
            Kind::ClientRequest => self.handle_client_request(packet),
            Kind::CoordinatorRequest => self.handle_coordinator_request(packet),
            Kind::CoordinatorPrepare => self.handle_prepare(packet),
            Kind::CoordinatorCommit => self.handle_coordinator_commit(packet),
            Kind::CoordinatorAbort => self.handle_coordinator_abort(packet),
            Kind::ParticipantResponse => self.handle_participant_response(packet),
            Kind::ParticipantYes => self.handle_participant_yes(packet),
            Kind::ParticipantAbort => self.handle_participant_abort(packet),
            Kind::CoordinatorResponse => {
                debug!("branch received a client-only packet kind, ignoring");
            }
        }
    }

    fn on_peer_connected(&self, peer_id: &str, is_client: bool) {
        if !is_client {
            return;
        }
        let ts = self.ts_source.next();
        self.transactions.get_or_create(&ts, peer_id);
        info!(client = %peer_id, txn = %ts, "new transaction");
        self.reply_to_client(peer_id, &ts.to_string(), "OK");
    }

    /// A dropped link is treated as if every outstanding reply to or from
    /// `peer_id` had been an `Abort`: a participant whose coordinator just
    /// vanished will never see `CoordinatorCommit`/`CoordinatorAbort`, and a
    /// coordinator with a reply pending from `peer_id` (a forwarded
    /// operation, an unvoted prepare, or the client itself) will never see
    /// its answer.
    fn on_peer_disconnected(&self, peer_id: &str) {
        debug!(peer = %peer_id, remaining = self.peers.len(), "peer disconnected");
        if self.peers.is_empty() {
            warn!("no peers remain connected");
        }

        // Participant side: this branch's coordinator for some transaction
        // just disconnected, so nothing will ever tell it to commit or
        // abort. Treat that exactly like a received CoordinatorAbort.
        let orphaned = self
            .transactions
            .ids_matching(|t| !t.state.is_terminal() && t.id.branch() == Some(peer_id));
        for txn_id in orphaned {
            warn!(txn = %txn_id, peer = %peer_id, "coordinator link lost, aborting locally");
            self.abort_transaction_locally(&txn_id);
        }

        // Coordinator side: this branch was waiting on a reply from
        // peer_id — either the client itself, a forwarded operation's
        // participant response, or an unvoted prepare vote. Synthesize the
        // Abort that reply was never going to carry.
        let stranded = self.transactions.ids_matching(|t| {
            if t.state.is_terminal() || t.client_id.is_empty() {
                return false;
            }
            t.client_id == peer_id
                || t.pending_branch.as_deref() == Some(peer_id)
                || (t.state == TxnState::Prepare
                    && self.branch_ids.iter().any(|b| b == peer_id)
                    && !t.yes_votes.contains(peer_id))
        });
        for txn_id in stranded {
            warn!(txn = %txn_id, peer = %peer_id, "link failure, synthesizing abort");
            self.broadcast(&txn_id, Kind::CoordinatorAbort, "");
            if let Some(client_id) = self.client_of(&txn_id) {
                self.reply_to_client(&client_id, &txn_id, ProtocolError::LinkFailure.client_reply());
            }
        }
    }
}

// Multi-branch coordinator/participant scenarios live in
// tests/scenarios.rs, driven entirely through this module's public API.
