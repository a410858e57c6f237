use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::kind::KindClass;

/// Storage key for an event.
///
/// Regular (and ephemeral) events are keyed by their id. Replaceable and
/// addressable events are keyed by `kind:pubkey:identifier`, where the
/// identifier is the first `d` tag value or the empty string, so that every
/// version of the same logical slot shares one key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    /// Derive the storage key of an event.
    pub fn of(event: &Event) -> Self {
        if event.class().is_keyed_by_address() {
            Self::replaceable(event.kind, &event.pubkey, event.identifier().unwrap_or(""))
        } else {
            Self(event.id.clone())
        }
    }

    /// Address key for a replaceable or addressable slot.
    pub fn replaceable(kind: u16, pubkey: &str, identifier: &str) -> Self {
        Self(format!("{kind}:{pubkey}:{identifier}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Returns `true` if this key has the address form.
    pub fn is_address(&self) -> bool {
        let mut parts = self.0.splitn(3, ':');
        matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(kind), Some(_), Some(_)) if kind.parse::<u16>().is_ok()
        )
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Uid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Uid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for Uid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&Event> for Uid {
    fn from(event: &Event) -> Self {
        Self::of(event)
    }
}

/// An event paired with its storage key.
///
/// The key is derived once when the wrapper is built; the wrapped event is
/// never modified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyedEvent {
    uid: Uid,
    event: Event,
}

impl KeyedEvent {
    pub fn new(event: Event) -> Self {
        Self {
            uid: Uid::of(&event),
            event,
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn class(&self) -> KindClass {
        self.event.class()
    }

    pub fn into_event(self) -> Event {
        self.event
    }

    pub fn into_parts(self) -> (Uid, Event) {
        (self.uid, self.event)
    }
}

impl Deref for KeyedEvent {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.event
    }
}

impl From<Event> for KeyedEvent {
    fn from(event: Event) -> Self {
        Self::new(event)
    }
}
