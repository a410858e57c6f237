use serde::{Deserialize, Serialize};

use crate::kind::KindClass;
use crate::uid::Uid;

/// A single tag: `[name, value, ...extra]`.
pub type Tag = Vec<String>;

/// An immutable signed event.
///
/// Events are never mutated after creation. Derived values (the storage
/// [`Uid`], indexable tag keys) are computed from the fields on demand or
/// carried alongside the event in a [`crate::KeyedEvent`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte lowercase hex event id.
    pub id: String,
    /// 32-byte lowercase hex author key.
    pub pubkey: String,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    pub content: String,
    /// 64-byte lowercase hex signature.
    pub sig: String,
}

impl Event {
    /// Storage class of this event's kind.
    pub fn class(&self) -> KindClass {
        KindClass::of(self.kind)
    }

    /// Storage key for this event.
    pub fn uid(&self) -> Uid {
        Uid::of(self)
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1).map(String::as_str))
    }

    /// Value of the first `d` tag, used as the addressable identifier.
    pub fn identifier(&self) -> Option<&str> {
        self.tag_value("d")
    }

    /// Index keys (`name + value`) for every indexable tag.
    ///
    /// A tag is indexable when it has at least a name and a value and its
    /// name is a single ASCII letter.
    pub fn indexable_tags(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter(|tag| tag.len() >= 2 && is_indexable_tag_name(&tag[0]))
            .map(|tag| format!("{}{}", tag[0], tag[1]))
            .collect()
    }

    /// Returns `true` if the event carries a `[name, v]` tag with `v` in `values`.
    pub fn has_tag_value(&self, name: char, values: &[String]) -> bool {
        self.tags.iter().any(|tag| {
            tag.len() >= 2
                && single_char(&tag[0]) == Some(name)
                && values.iter().any(|v| v == &tag[1])
        })
    }
}

/// Returns `true` if `name` is exactly one ASCII letter.
pub fn is_indexable_tag_name(name: &str) -> bool {
    single_char(name).is_some_and(|c| c.is_ascii_alphabetic())
}

/// Index key for a tag name and value.
pub fn tag_key(name: char, value: &str) -> String {
    let mut key = String::with_capacity(value.len() + 1);
    key.push(name);
    key.push_str(value);
    key
}

fn single_char(s: &str) -> Option<char> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}
