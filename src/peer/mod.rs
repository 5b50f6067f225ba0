pub mod table;
pub mod types;

pub use table::PeerTable;
pub use types::{GeoLocation, Heartbeat, PeerAddress, PeerId, PeerNode};
