//! CRDT replica of the shared diagram document.
//!
//! The whole diagram lives in one yrs text root. Every mutation runs in a
//! single transaction tagged with a [`TxnOrigin`], so callers can tell a
//! locally produced change (which must be broadcast) from a merged remote
//! change (which must not be echoed back out).
//!
//! Local edits replace the whole document: the current range is removed and
//! the new text inserted in one transaction. Concurrent replaces from two
//! writers are both kept and ordered by the yrs client id tie-break, so all
//! replicas converge, but overlapping edits resolve as last-writer-wins at
//! paragraph granularity rather than a structural XML merge.
//!
//! Reference: Kleppmann, Chapter 5, Replication

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

/// Name of the text root holding the serialized diagram.
pub const DIAGRAM_FIELD: &str = "diagram";

/// Who produced a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TxnOrigin {
    /// Edit made by the local editor; its delta goes out on the wire.
    Local,
    /// Delta merged from a peer, labelled with where it came from.
    Remote(String),
}

impl TxnOrigin {
    /// Remote origin for a peer label.
    pub fn remote(peer: impl Into<String>) -> Self {
        TxnOrigin::Remote(peer.into())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, TxnOrigin::Local)
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, TxnOrigin::Remote(_))
    }

    /// Label stored as the yrs transaction origin.
    fn label(&self) -> String {
        match self {
            TxnOrigin::Local => "local".to_string(),
            TxnOrigin::Remote(peer) => format!("remote:{peer}"),
        }
    }
}

/// Change notification emitted after a transaction altered the document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocChange {
    pub origin: TxnOrigin,
    /// Materialized document text after the change.
    pub text: String,
    /// Size of the update that produced the change.
    pub update_len: usize,
}

/// Result of a local edit: the delta to broadcast and the change notice.
#[derive(Debug, Clone)]
pub struct LocalEdit {
    pub delta: Vec<u8>,
    pub change: DocChange,
}

/// Counters for monitoring replica traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaStats {
    pub local_edits: u64,
    pub remote_merges: u64,
    pub rejected_deltas: u64,
}

/// Errors raised while merging remote state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("malformed delta: {0}")]
    Decode(String),
    #[error("delta could not be applied: {0}")]
    Apply(String),
}

/// Replicated document holding the diagram XML.
pub struct DocumentReplica {
    doc: Doc,
    text: TextRef,
    stats: ReplicaStats,
}

impl DocumentReplica {
    /// Create an empty replica with a fresh yrs client id.
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(DIAGRAM_FIELD);
        Self {
            doc,
            text,
            stats: ReplicaStats::default(),
        }
    }

    /// Replace the document with `new_text` as one local transaction.
    ///
    /// Returns `None` when the text is already current, so no empty
    /// update ever reaches the wire.
    pub fn local_edit(&mut self, new_text: &str) -> Option<LocalEdit> {
        if self.materialize() == new_text {
            return None;
        }

        let label = TxnOrigin::Local.label();
        let delta = {
            let mut txn = self.doc.transact_mut_with(label.as_str());
            let len = self.text.len(&txn);
            if len > 0 {
                self.text.remove_range(&mut txn, 0, len);
            }
            if !new_text.is_empty() {
                self.text.insert(&mut txn, 0, new_text);
            }
            txn.encode_update_v1()
        };

        self.stats.local_edits += 1;
        log::trace!("local edit produced {} byte delta", delta.len());

        let change = DocChange {
            origin: TxnOrigin::Local,
            text: new_text.to_string(),
            update_len: delta.len(),
        };
        Some(LocalEdit { delta, change })
    }

    /// Merge a delta received from a peer.
    ///
    /// Deltas may arrive out of order (yrs parks them until their causal
    /// dependencies are present) and may be applied more than once.
    /// Returns `Ok(None)` when the materialized text did not change.
    pub fn apply_remote_delta(
        &mut self,
        delta: &[u8],
        origin: TxnOrigin,
    ) -> Result<Option<DocChange>, MergeError> {
        let update = match Update::decode_v1(delta) {
            Ok(update) => update,
            Err(e) => {
                self.stats.rejected_deltas += 1;
                return Err(MergeError::Decode(e.to_string()));
            }
        };

        let before = self.materialize();
        let label = origin.label();
        let applied = {
            let mut txn = self.doc.transact_mut_with(label.as_str());
            txn.apply_update(update)
        };
        if let Err(e) = applied {
            self.stats.rejected_deltas += 1;
            return Err(MergeError::Apply(e.to_string()));
        }
        self.stats.remote_merges += 1;

        let after = self.materialize();
        if after == before {
            return Ok(None);
        }
        Ok(Some(DocChange {
            origin,
            text: after,
            update_len: delta.len(),
        }))
    }

    /// Current document text.
    pub fn materialize(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        self.text.len(&txn) == 0
    }

    /// Complete causal history, enough for a fresh replica to rebuild
    /// identical state.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encoded state vector describing what this replica has seen.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// History missing from a peer that reported `state_vector`.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, MergeError> {
        let remote_sv = StateVector::decode_v1(state_vector)
            .map_err(|e| MergeError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }

    pub fn stats(&self) -> ReplicaStats {
        self.stats
    }
}

impl Default for DocumentReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DocumentReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentReplica")
            .field("len", &self.materialize().len())
            .field("stats", &self.stats)
            .finish()
    }
}
