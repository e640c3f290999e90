//! # drawsync-core: replicated diagram document
//!
//! Holds the serialized diagram (draw.io XML) in a single CRDT text field
//! so that concurrent writers converge without central coordination.
//!
//! ```text
//!  editor XML ──► DocumentReplica::local_edit ──► delta (yrs update v1)
//!                        │                              │
//!                        ▼                              ▼
//!                    DocChange                    wire (encrypted)
//!                        ▲                              │
//!  peer delta  ──► DocumentReplica::apply_remote_delta ◄┘
//! ```
//!
//! ## Modules
//!
//! - [`replica`]: yrs-backed replica, transaction origins, change notices

pub mod replica;

pub use replica::{
    DocChange, DocumentReplica, LocalEdit, MergeError, ReplicaStats, TxnOrigin,
    DIAGRAM_FIELD,
};
