//! Core library for the distributed BBS-style messaging service's
//! server-side coordination plane: Lamport clocks, rank/heartbeat
//! registry, Bully leader election, Berkeley clock synchronization, and
//! active peer replication. Linked by both the registry and message
//! server executables.

pub mod berkeley;
pub mod clock;
pub mod codec;
pub mod election;
pub mod model;
pub mod net;
pub mod registry;
pub mod replication;
pub mod server;
pub mod store;
pub mod utils;

pub use clock::LogicalClock;
pub use codec::{Envelope, Status};
pub use election::ElectionManager;
pub use registry::RegistryService;
pub use replication::ReplicationManager;
pub use server::{MessageServer, ServerAddrs};
pub use store::DataStore;
pub use utils::BbsError;
