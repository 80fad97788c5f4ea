pub mod clock;
pub mod config;
mod core;
pub mod dht;
pub mod error;
pub mod persistence;
pub mod protocol;
mod test_support;
pub mod transport;

// Re-export commonly used types for consumers and integration tests
pub use crate::config::{BootstrapPeer, DhtConfig};
pub use crate::core::identifier::{between, Key, NodeID, NodeInfo};
pub use crate::core::location_table::{LocationTable, TableStatus};
pub use crate::core::storage::Record;
pub use crate::dht::PeerNode;
pub use crate::error::{Error, Result};
