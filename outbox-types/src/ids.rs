//! Queue entry ids.
//!
//! An id is minted once, when the entry is enqueued, and travels with the
//! mutation as its offline id. It is stored as hyphenated UUID text.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identity of one queued mutation.
///
/// Backed by a UUID v7, so ids minted later sort later. Replay order still
/// comes from the store's sequence, never from comparing ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Mints the id for an entry being enqueued.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Reads an id back from its stored or user-supplied text form.
    pub fn parse(s: &str) -> Result<Self> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for EntryId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
