//! Entry points for the two roles a clearinghouse node can play: `server`
//! runs one branch of the clearinghouse, `client` runs an interactive REPL
//! against any branch named in the same config file. Both are thin: all
//! engine semantics live in `clearinghouse-txn`, all wire/link plumbing
//! lives in `clearinghouse-net`.

use std::io::{BufRead, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use clearinghouse_base::{err, Result};
use clearinghouse_net::{
    accept_peer, connect_with_retry, install_loopback, parse_config, read_packet, write_packet,
    Dispatch, Kind, Packet, PeerSet,
};
use clearinghouse_txn::Branch;

/// Configures the `tracing` subscriber: `RUST_LOG` wins if set, otherwise
/// `-v`/`-vv` raises the default filter past `info`.
pub fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_env("RUST_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Runs one branch: loads the config, dials every peer whose id sorts
/// after ours (the branch with the lexicographically smaller id dials, the
/// other listens), installs the loopback pseudo-peer, then accepts inbound
/// connections forever.
pub fn run_server(branch_id: &str, config_path: &Path, verbose: u8) -> Result<()> {
    init_tracing(verbose);

    let contents = std::fs::read_to_string(config_path)
        .map_err(|e| err(format!("unable to read config {config_path:?}: {e}")))?;
    let branches = parse_config(&contents)?;
    let self_branch = branches
        .iter()
        .find(|b| b.id == branch_id)
        .ok_or_else(|| err(format!("branch {branch_id:?} is not listed in {config_path:?}")))?;
    let self_addr = self_branch.address();
    let branch_ids: Vec<String> = branches.iter().map(|b| b.id.clone()).collect();

    let peers = Arc::new(PeerSet::new());
    let branch = Branch::new(branch_id, branch_ids, peers.clone());
    let dispatch: Arc<dyn Dispatch> = branch;

    install_loopback(branch_id, dispatch.clone(), &peers);

    for peer in &branches {
        if peer.id == branch_id {
            continue;
        }
        // Only the lexicographically smaller id dials; the other side
        // listens for the inbound connection. This avoids both branches
        // racing to connect to each other.
        if branch_id < peer.id.as_str() {
            let addr = peer.address();
            let self_id = branch_id.to_string();
            let target_id = peer.id.clone();
            let dispatch = dispatch.clone();
            let peers = peers.clone();
            thread::spawn(move || connect_with_retry(addr, self_id, target_id, dispatch, peers));
        }
    }

    let listener = TcpListener::bind(&self_addr)
        .map_err(|e| err(format!("unable to bind {self_addr}: {e}")))?;
    info!(branch = %branch_id, addr = %self_addr, "listening");

    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(s) => s,
            Err(e) => {
                warn!(error = ?e, "failed to accept incoming connection");
                continue;
            }
        };
        let dispatch = dispatch.clone();
        let peers = peers.clone();
        thread::spawn(move || {
            if let Err(e) = accept_peer(stream, dispatch, peers) {
                warn!(error = ?e, "connection handshake failed");
            }
        });
    }
    Ok(())
}

/// Runs the interactive client REPL. Each `BEGIN` opens a fresh connection
/// to the first branch in the config (the config does not name a
/// preferred branch, so any deterministic choice works; see DESIGN.md);
/// every other recognized line is forwarded as one synchronous
/// request/reply round trip, since the client never has two operations of
/// the same transaction in flight.
pub fn run_client(client_id: &str, config_path: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(config_path)
        .map_err(|e| err(format!("unable to read config {config_path:?}: {e}")))?;
    let branches = parse_config(&contents)?;
    let target = branches
        .first()
        .ok_or_else(|| err(format!("config {config_path:?} names no branches")))?;

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut session: Option<(TcpStream, String)> = None;

    for line in stdin.lock().lines() {
        let line = line.map_err(|e| err(format!("stdin read failed: {e}")))?;
        let command = line.trim();
        if command.is_empty() {
            continue;
        }

        if command == "BEGIN" {
            let mut stream = TcpStream::connect(target.address())
                .map_err(|e| err(format!("unable to connect to {}: {e}", target.address())))?;
            write_packet(&mut stream, &Packet::handshake(true, client_id))?;
            let reply = read_packet(&mut stream)?
                .ok_or_else(|| err("branch closed connection during handshake"))?;
            writeln!(stdout, "{}", reply.payload).ok();
            session = Some((stream, reply.transaction_id));
            continue;
        }

        let Some((stream, transaction_id)) = session.as_mut() else {
            continue;
        };

        let request = Packet::new(true, client_id, transaction_id.clone(), Kind::ClientRequest, command);
        write_packet(stream, &request)?;
        let reply = match read_packet(stream)? {
            Some(reply) => reply,
            None => {
                warn!("branch closed the connection mid-transaction");
                session = None;
                continue;
            }
        };
        writeln!(stdout, "{}", reply.payload).ok();
        if reply.payload.contains("ABORTED") || reply.payload == "COMMIT OK" {
            session = None;
        }
    }
    Ok(())
}
