//! kadnet - a Kademlia distributed hash table
//!
//! This library implements the Kademlia overlay: 160-bit identifiers under
//! the XOR metric, a k-bucket routing table with depth-bounded splitting,
//! the PING/STORE/FIND_NODE/FIND_VALUE RPCs, iterative serial and parallel
//! lookups, and the republish/expire/refresh maintenance loops, over
//! pluggable storage and transport.

pub mod config;
pub mod contact;
pub mod dht;
pub mod error;
pub mod id;
pub mod node;
pub mod protocol;
pub mod router;
pub mod routing;
pub mod snapshot;
pub mod storage;

// Re-export commonly used types
pub use config::DhtConfig;
pub use contact::{Contact, ContactRecord};
pub use dht::{Dht, DhtShared, FindResult};
pub use error::{Error, Result};
pub use id::{Distance, NodeId, ID_BITS, ID_BYTES};
pub use node::Node;
pub use protocol::{
    FindValueReply, LoopbackProtocol, Protocol, ProtocolDescriptor, TcpProtocol, TcpRpcServer,
};
pub use router::{LookupKind, LookupResult, ParallelRouter, Router, SerialRouter};
pub use routing::{AddOutcome, BucketList, KBucket};
pub use snapshot::{BucketRecord, DhtSnapshot, SNAPSHOT_VERSION};
pub use storage::{JsonFileStorage, MemoryStorage, Storage, StoredValue};
