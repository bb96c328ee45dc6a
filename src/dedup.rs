//! Canonical-key deduplication.
//!
//! One frame per second of wall-clock time: the first source to claim a
//! canonical key wins, every later claimant is a duplicate. The index lives
//! for one run and is owned by the pipeline loop. Admission goes through a
//! single `&mut` borrow, so no two callers can both be accepted for a key.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};

/// Who holds a canonical key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// A source file processed earlier in this run.
    Source(PathBuf),
    /// A frame already present in the staging directory before the run.
    Staged(PathBuf),
}

/// Outcome of offering a key to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First claim on the key. The caller goes on to annotate.
    Accepted,
    /// The key was already claimed.
    ///
    /// For [`Claim::Source`] the pipeline deletes the later source file.
    /// That deletion is permanent: the file is not retried or archived.
    Duplicate(Claim),
}

/// Canonical key → first claimant.
#[derive(Debug, Default)]
pub struct DedupIndex {
    claims: HashMap<String, Claim>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame that already exists on disk, so a source resolving to
    /// the same key gets the same verdict the staging directory would give.
    pub fn seed_staged(&mut self, key: impl Into<String>, frame: impl Into<PathBuf>) {
        self.claims
            .entry(key.into())
            .or_insert_with(|| Claim::Staged(frame.into()));
    }

    /// Claim `key` for `source`.
    pub fn admit(&mut self, key: &str, source: &Path) -> Admission {
        match self.claims.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Claim::Source(source.to_path_buf()));
                Admission::Accepted
            }
            Entry::Occupied(slot) => Admission::Duplicate(slot.get().clone()),
        }
    }

    /// Give up a claim whose frame could not be produced.
    ///
    /// Only a source claim held by `source` is released. Staged claims and
    /// other sources' claims are left alone.
    pub fn release(&mut self, key: &str, source: &Path) {
        if let Entry::Occupied(slot) = self.claims.entry(key.to_string())
            && *slot.get() == Claim::Source(source.to_path_buf())
        {
            slot.remove();
        }
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
