// P2P networking

mod gossip;
mod message;
mod node;
mod peer;

pub use gossip::{Gossip, GossipAction, ImportOutcome, SeenCache};
pub use message::{
    Message, MessageType, RejectMessage, VersionMessage, COMMAND_LEN, HEADER_LEN, MAX_BLOCKS_PER_MESSAGE,
    MAX_PAYLOAD, MAX_PEER_ADDRESSES, PROTOCOL_VERSION,
};
pub use node::Node;
pub use peer::{read_message, write_message, Peer, PeerHandle, PeerInfo};
