//! Multi-branch coordinator/participant scenarios, driven entirely through
//! the crate's public API: each "branch" is a real
//! `Branch` wired to its peers over in-process channels, with no TCP
//! involved. This is the integration-style counterpart to the unit tests
//! inside `clearinghouse-txn`'s modules.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use clearinghouse_net::{bounded_channel, install_loopback, Dispatch, Kind, Packet, PeerHandle, PeerSet};
use clearinghouse_txn::Branch;
use test_log::test;

fn connect_client(branch: &Arc<Branch>, peers: &PeerSet, client_id: &str) -> (Receiver<Packet>, String) {
    let (tx, rx) = bounded_channel();
    peers.insert(PeerHandle::new(client_id.to_string(), true, tx));
    branch.on_peer_connected(client_id, true);
    let begin_reply = rx.recv_timeout(Duration::from_secs(1)).expect("no BEGIN reply");
    assert_eq!(begin_reply.payload, "OK");
    (rx, begin_reply.transaction_id)
}

fn send(branch: &Arc<Branch>, rx: &Receiver<Packet>, client_id: &str, txn_id: &str, command: &str) -> String {
    branch.on_packet(Packet::new(true, client_id, txn_id, Kind::ClientRequest, command));
    rx.recv_timeout(Duration::from_secs(1)).expect("no reply").payload
}

/// Wires up `ids.len()` branches with an in-process loopback and a direct
/// pump thread per ordered pair, standing in for the socket reader/writer
/// threads the real net layer runs. No TCP is involved; `Branch::on_packet`
/// is driven directly.
struct Harness {
    branches: Vec<Arc<Branch>>,
    peers: Vec<Arc<PeerSet>>,
}

impl Harness {
    fn new(ids: &[&str]) -> Self {
        let id_strings: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        let peer_sets: Vec<Arc<PeerSet>> = ids.iter().map(|_| Arc::new(PeerSet::new())).collect();
        let branches: Vec<Arc<Branch>> = ids
            .iter()
            .zip(&peer_sets)
            .map(|(id, peers)| Branch::new(*id, id_strings.clone(), peers.clone()))
            .collect();
        for (i, id) in ids.iter().enumerate() {
            install_loopback(id, branches[i].clone(), &peer_sets[i]);
        }
        for i in 0..ids.len() {
            for j in 0..ids.len() {
                if i == j {
                    continue;
                }
                let (tx, rx) = bounded_channel();
                peer_sets[i].insert(PeerHandle::new(ids[j].to_string(), false, tx));
                let target = branches[j].clone();
                std::thread::spawn(move || {
                    while let Ok(packet) = rx.recv() {
                        target.on_packet(packet);
                    }
                });
            }
        }
        Harness { branches, peers: peer_sets }
    }

    fn branch(&self, idx: usize) -> &Arc<Branch> {
        &self.branches[idx]
    }

    fn connect(&self, idx: usize, client_id: &str) -> (Receiver<Packet>, String) {
        connect_client(&self.branches[idx], &self.peers[idx], client_id)
    }
}

#[test]
fn deposit_then_commit_then_balance_read_back() {
    let h = Harness::new(&["A"]);
    let (rx, txn1) = h.connect(0, "client1");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "DEPOSIT A.x 10"), "OK");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "COMMIT"), "COMMIT OK");

    let (rx2, txn2) = h.connect(0, "client2");
    assert_eq!(send(h.branch(0), &rx2, "client2", &txn2, "BALANCE A.x"), "A.x = 10");
    assert_eq!(send(h.branch(0), &rx2, "client2", &txn2, "COMMIT"), "COMMIT OK");
}

#[test]
fn withdraw_nonexistent_account_aborts_without_creating_it() {
    let h = Harness::new(&["A"]);
    let (rx, txn1) = h.connect(0, "client1");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "WITHDRAW A.y 5"), "NOT FOUND, ABORTED");
}

#[test]
fn overdraft_aborts_commit_and_leaves_account_absent() {
    let h = Harness::new(&["A"]);
    let (rx, txn1) = h.connect(0, "client1");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "DEPOSIT A.x 100"), "OK");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "WITHDRAW A.x 150"), "OK");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "COMMIT"), "ABORTED");

    let (rx2, txn2) = h.connect(0, "client2");
    assert_eq!(send(h.branch(0), &rx2, "client2", &txn2, "WITHDRAW A.x 1"), "NOT FOUND, ABORTED");
}

#[test]
fn explicit_abort_leaves_created_account_absent() {
    let h = Harness::new(&["A"]);
    let (rx, txn1) = h.connect(0, "client1");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "DEPOSIT A.x 10"), "OK");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "ABORT"), "ABORTED");

    let (rx2, txn2) = h.connect(0, "client2");
    assert_eq!(send(h.branch(0), &rx2, "client2", &txn2, "WITHDRAW A.x 1"), "NOT FOUND, ABORTED");
}

#[test]
fn cross_branch_commit_reaches_both_participants() {
    let h = Harness::new(&["A", "B"]);
    let (rx, txn1) = h.connect(0, "client1");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "DEPOSIT A.x 50"), "OK");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "DEPOSIT B.y 30"), "OK");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "COMMIT"), "COMMIT OK");

    let (rx2, txn2) = h.connect(0, "client2");
    assert_eq!(send(h.branch(0), &rx2, "client2", &txn2, "BALANCE A.x"), "A.x = 50");
    assert_eq!(send(h.branch(0), &rx2, "client2", &txn2, "BALANCE B.y"), "B.y = 30");
    assert_eq!(send(h.branch(0), &rx2, "client2", &txn2, "COMMIT"), "COMMIT OK");
}

#[test]
fn idempotent_redeposit_nets_the_value() {
    let h = Harness::new(&["A"]);
    let (rx, txn1) = h.connect(0, "client1");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "DEPOSIT A.x 10"), "OK");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "DEPOSIT A.x 20"), "OK");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "COMMIT"), "COMMIT OK");

    let (rx2, txn2) = h.connect(0, "client2");
    assert_eq!(send(h.branch(0), &rx2, "client2", &txn2, "BALANCE A.x"), "A.x = 30");
    assert_eq!(send(h.branch(0), &rx2, "client2", &txn2, "COMMIT"), "COMMIT OK");
}

#[test]
fn empty_branch_prepare_votes_yes_with_no_state_change() {
    // B never receives an operation for this transaction; its Prepare reply
    // must still be counted by A's commit, and the coordinator must still
    // get COMMIT OK.
    let h = Harness::new(&["A", "B"]);
    let (rx, txn1) = h.connect(0, "client1");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "DEPOSIT A.x 5"), "OK");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "COMMIT"), "COMMIT OK");
}

#[test]
fn peer_disconnect_aborts_a_transaction_awaiting_its_prepare_vote() {
    // Sever A's link to B before COMMIT, so B never receives the Prepare it
    // would otherwise vote on; A must still unblock the client with an
    // abort instead of hanging forever on B's vote.
    let h = Harness::new(&["A", "B"]);
    let (rx, txn1) = h.connect(0, "client1");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "DEPOSIT A.x 50"), "OK");
    assert_eq!(send(h.branch(0), &rx, "client1", &txn1, "DEPOSIT B.y 30"), "OK");

    h.peers[0].remove("B");
    h.branch(0).on_packet(Packet::new(true, "client1", &txn1, Kind::ClientRequest, "COMMIT"));
    h.branch(0).on_peer_disconnected("B");

    let reply = rx.recv_timeout(Duration::from_secs(1)).expect("no reply");
    assert_eq!(reply.payload, "ABORTED");

    let (rx2, txn2) = h.connect(0, "client2");
    assert_eq!(send(h.branch(0), &rx2, "client2", &txn2, "WITHDRAW A.x 1"), "NOT FOUND, ABORTED");
}

#[test]
fn peer_disconnect_aborts_a_transaction_coordinated_by_that_peer() {
    // B is coordinating a transaction that touched A; when A's link to B
    // drops, A must roll back its own tentative write rather than hold it
    // forever waiting for a CoordinatorCommit/CoordinatorAbort that B (now
    // unreachable) will never send.
    let h = Harness::new(&["A", "B"]);
    let (rx, txn1) = h.connect(1, "client1");
    assert_eq!(send(h.branch(1), &rx, "client1", &txn1, "DEPOSIT A.x 50"), "OK");

    h.peers[0].remove("B");
    h.branch(0).on_peer_disconnected("B");

    let (rx2, txn2) = h.connect(0, "client2");
    assert_eq!(send(h.branch(0), &rx2, "client2", &txn2, "WITHDRAW A.x 1"), "NOT FOUND, ABORTED");
}
