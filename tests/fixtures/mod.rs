//! Reusable peers for integration tests

pub mod silent_peer;
pub mod two_node;

pub use silent_peer::SilentPeer;
pub use two_node::{Peer, TwoNodeFixture};
