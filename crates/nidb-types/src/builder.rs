use std::time::{SystemTime, UNIX_EPOCH};

use crate::event::{Event, Tag};

/// Current unix time in seconds.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Deterministic 32-byte hex author key derived from a seed string.
pub fn fixture_pubkey(seed: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"nidb:pubkey:");
    hasher.update(seed.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Builds well-formed fixture events.
///
/// Ids are the BLAKE3 hash of the canonical `[0, pubkey, created_at, kind,
/// tags, content]` serialization and signatures are derived from the id,
/// so identical inputs always produce identical events. These are not
/// protocol signatures.
#[derive(Clone, Debug)]
pub struct EventBuilder {
    pubkey: String,
    created_at: u64,
    kind: u16,
    tags: Vec<Tag>,
    content: String,
}

impl EventBuilder {
    pub fn new(kind: u16) -> Self {
        Self {
            pubkey: fixture_pubkey("default"),
            created_at: unix_timestamp(),
            kind,
            tags: Vec::new(),
            content: String::new(),
        }
    }

    pub fn pubkey(mut self, pubkey: impl Into<String>) -> Self {
        self.pubkey = pubkey.into();
        self
    }

    /// Use the fixture key derived from `seed`.
    pub fn author(self, seed: &str) -> Self {
        self.pubkey(fixture_pubkey(seed))
    }

    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn tag<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(parts.into_iter().map(Into::into).collect());
        self
    }

    /// Shorthand for a `["d", identifier]` tag.
    pub fn identifier(self, identifier: &str) -> Self {
        self.tag(["d", identifier])
    }

    pub fn build(self) -> Event {
        let canonical = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        let id = blake3::hash(canonical.to_string().as_bytes()).to_hex().to_string();

        let mut sig = [0u8; 64];
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"nidb:sig:");
        hasher.update(id.as_bytes());
        hasher.finalize_xof().fill(&mut sig);

        Event {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig),
        }
    }
}
