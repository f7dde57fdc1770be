mod config;
mod link;
mod peer;
mod wire;

pub use config::{parse_config, BranchAddr};
pub use link::{accept_peer, connect_with_retry, dial_peer, install_loopback};
pub use peer::{bounded_channel, Dispatch, PeerHandle, PeerSet, QUEUE_CAPACITY};
pub use wire::{read_packet, write_packet, Kind, Packet};
