use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, info_span, warn};

use clearinghouse_base::Result;

use crate::peer::{bounded_channel, Dispatch, PeerHandle, PeerSet};
use crate::wire::{read_packet, write_packet, Packet};

/// How long a bootstrap dial waits before retrying a peer that refused the
/// connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

fn spawn_writer(id: String, mut stream: TcpStream, rx: std::sync::mpsc::Receiver<Packet>) {
    thread::spawn(move || {
        let span = info_span!("peer", id = %id, role = "writer");
        let _enter = span.enter();
        while let Ok(packet) = rx.recv() {
            if let Err(e) = write_packet(&mut stream, &packet) {
                warn!(error = ?e, "write failed, link down");
                break;
            }
        }
        debug!("writer thread exiting");
    });
}

/// Decodes incoming frames and pushes them onto this peer's incoming
/// bounded queue; never calls into `Dispatch` itself. Keeping the reader
/// this thin is what lets a handler blocked on one transaction's account
/// lock (`Account::read`/`Account::commit`, which suspend on a condvar
/// behind an earlier uncommitted write) stall only the dispatch task, not
/// the socket read loop feeding every other transaction's packets on this
/// same link.
fn spawn_reader(
    id: String,
    mut stream: TcpStream,
    incoming_tx: std::sync::mpsc::SyncSender<Packet>,
    dispatch: Arc<dyn Dispatch>,
    peers: Arc<PeerSet>,
) {
    thread::spawn(move || {
        let span = info_span!("peer", id = %id, role = "reader");
        let _enter = span.enter();
        loop {
            match read_packet(&mut stream) {
                Ok(Some(packet)) => {
                    if incoming_tx.send(packet).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(error = ?e, "read failed, link down");
                    break;
                }
            }
        }
        drop(incoming_tx);
        peers.remove(&id);
        dispatch.on_peer_disconnected(&id);
    });
}

/// Drains one peer's incoming queue and routes each packet to the FSM. This
/// is the one thread per peer allowed to block inside `Dispatch::on_packet`;
/// it runs independently of the reader thread that fills its queue.
fn spawn_dispatcher(id: String, incoming_rx: std::sync::mpsc::Receiver<Packet>, dispatch: Arc<dyn Dispatch>) {
    thread::spawn(move || {
        let span = info_span!("peer", id = %id, role = "dispatch");
        let _enter = span.enter();
        while let Ok(packet) = incoming_rx.recv() {
            dispatch.on_packet(packet);
        }
        debug!("dispatch thread exiting");
    });
}

/// Accepts one already-established inbound connection: blocks for the
/// handshake packet to learn the peer's id and client-ness, registers it,
/// and spawns its reader, dispatch, and writer threads.
pub fn accept_peer(mut stream: TcpStream, dispatch: Arc<dyn Dispatch>, peers: Arc<PeerSet>) -> Result<()> {
    let handshake = match read_packet(&mut stream)? {
        Some(p) => p,
        None => return Ok(()),
    };
    let id = handshake.id.clone();
    let is_client = handshake.is_client;
    info!(%id, is_client, "accepted connection");

    let (tx, rx) = bounded_channel();
    let write_stream = stream.try_clone()?;
    peers.insert(PeerHandle::new(id.clone(), is_client, tx));
    dispatch.on_peer_connected(&id, is_client);

    let (incoming_tx, incoming_rx) = bounded_channel();
    spawn_writer(id.clone(), write_stream, rx);
    spawn_dispatcher(id.clone(), incoming_rx, dispatch.clone());
    spawn_reader(id, stream, incoming_tx, dispatch, peers);
    Ok(())
}

/// Dials out to a known peer (by convention, the branch whose id sorts
/// lower dials the one whose id sorts higher), sends the handshake, and
/// registers it under `target_id`.
pub fn dial_peer(
    addr: &str,
    self_id: &str,
    target_id: &str,
    dispatch: Arc<dyn Dispatch>,
    peers: Arc<PeerSet>,
) -> Result<()> {
    let mut stream = TcpStream::connect(addr)?;
    write_packet(&mut stream, &Packet::handshake(false, self_id))?;
    info!(peer = %target_id, %addr, "connected to peer");

    let (tx, rx) = bounded_channel();
    let write_stream = stream.try_clone()?;
    peers.insert(PeerHandle::new(target_id.to_string(), false, tx));
    dispatch.on_peer_connected(target_id, false);

    let (incoming_tx, incoming_rx) = bounded_channel();
    spawn_writer(target_id.to_string(), write_stream, rx);
    spawn_dispatcher(target_id.to_string(), incoming_rx, dispatch.clone());
    spawn_reader(target_id.to_string(), stream, incoming_tx, dispatch, peers);
    Ok(())
}

/// Installs the loopback pseudo-peer: its "writer" short-circuits directly
/// to its own incoming queue instead of a socket, and a dispatch thread
/// drains that queue exactly as it would for a remote peer — so the FSM's
/// "send to branch X" logic is uniform whether X is self or remote, and a
/// self-addressed message blocked on an account lock doesn't stall the next
/// self-addressed message behind it.
pub fn install_loopback(self_id: &str, dispatch: Arc<dyn Dispatch>, peers: &PeerSet) {
    let (tx, rx) = bounded_channel();
    let (incoming_tx, incoming_rx) = bounded_channel();
    let id = self_id.to_string();
    let writer_id = id.clone();
    thread::spawn(move || {
        let span = info_span!("peer", id = %writer_id, role = "writer");
        let _enter = span.enter();
        while let Ok(packet) = rx.recv() {
            if incoming_tx.send(packet).is_err() {
                break;
            }
        }
    });
    spawn_dispatcher(id, incoming_rx, dispatch);
    peers.insert(PeerHandle::new(self_id.to_string(), false, tx));
}

/// Keeps retrying an outgoing dial every [`RECONNECT_DELAY`] until it
/// succeeds, then returns. Intended to be run on its own thread per
/// configured peer.
pub fn connect_with_retry(addr: String, self_id: String, target_id: String, dispatch: Arc<dyn Dispatch>, peers: Arc<PeerSet>) {
    loop {
        match dial_peer(&addr, &self_id, &target_id, dispatch.clone(), peers.clone()) {
            Ok(()) => return,
            Err(e) => {
                warn!(peer = %target_id, %addr, error = ?e, "unable to connect, retrying");
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }
}
