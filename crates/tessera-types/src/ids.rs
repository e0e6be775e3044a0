//! Remote object identifiers.
//!
//! A [`RemoteId`] is whatever handle the blob store hands back from `put`.
//! It is opaque to the engine: a chat-bot document id, an object key, a
//! file name. Nothing here parses it. Local adapters that need to mint their
//! own ids use [`RemoteId::generate`], which yields a UUIDv7 in simple hex
//! form so ids sort by creation time in a directory listing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque handle for one stored object.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    /// Wrap an adapter-provided handle.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh time-ordered id (UUIDv7, 32 hex chars, no hyphens).
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().as_simple().to_string())
    }

    /// The raw handle.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines only. Never use for lookup.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl From<String> for RemoteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteId({})", self.short())
    }
}
