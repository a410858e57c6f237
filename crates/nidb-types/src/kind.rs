use std::fmt;

use serde::{Deserialize, Serialize};

/// Storage class of an event kind.
///
/// The class decides how an event is keyed and whether it is persisted:
///
/// | Class         | Kinds                     | Storage key                  |
/// |---------------|---------------------------|------------------------------|
/// | `Replaceable` | 0, 3, 10000..=19999       | `kind:pubkey:`               |
/// | `Ephemeral`   | 20000..=29999             | never stored                 |
/// | `Addressable` | 30000..=39999             | `kind:pubkey:identifier`     |
/// | `Regular`     | everything else           | event id                     |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KindClass {
    Regular,
    Replaceable,
    Ephemeral,
    Addressable,
}

impl KindClass {
    /// Classify a kind number.
    pub fn of(kind: u16) -> Self {
        if is_replaceable_kind(kind) {
            Self::Replaceable
        } else if is_ephemeral_kind(kind) {
            Self::Ephemeral
        } else if is_addressable_kind(kind) {
            Self::Addressable
        } else {
            Self::Regular
        }
    }

    /// Returns `true` for classes keyed by address rather than event id.
    pub fn is_keyed_by_address(self) -> bool {
        matches!(self, Self::Replaceable | Self::Addressable)
    }

    /// Returns `true` if events of this class are written to durable storage.
    pub fn is_persisted(self) -> bool {
        !matches!(self, Self::Ephemeral)
    }
}

impl fmt::Display for KindClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Regular => "regular",
            Self::Replaceable => "replaceable",
            Self::Ephemeral => "ephemeral",
            Self::Addressable => "addressable",
        };
        write!(f, "{s}")
    }
}

pub fn is_replaceable_kind(kind: u16) -> bool {
    kind == 0 || kind == 3 || (10_000..20_000).contains(&kind)
}

pub fn is_ephemeral_kind(kind: u16) -> bool {
    (20_000..30_000).contains(&kind)
}

pub fn is_addressable_kind(kind: u16) -> bool {
    (30_000..40_000).contains(&kind)
}

pub fn is_regular_kind(kind: u16) -> bool {
    KindClass::of(kind) == KindClass::Regular
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_boundaries() {
        assert_eq!(KindClass::of(0), KindClass::Replaceable);
        assert_eq!(KindClass::of(1), KindClass::Regular);
        assert_eq!(KindClass::of(3), KindClass::Replaceable);
        assert_eq!(KindClass::of(9_999), KindClass::Regular);
        assert_eq!(KindClass::of(10_000), KindClass::Replaceable);
        assert_eq!(KindClass::of(19_999), KindClass::Replaceable);
        assert_eq!(KindClass::of(20_000), KindClass::Ephemeral);
        assert_eq!(KindClass::of(29_999), KindClass::Ephemeral);
        assert_eq!(KindClass::of(30_000), KindClass::Addressable);
        assert_eq!(KindClass::of(39_999), KindClass::Addressable);
        assert_eq!(KindClass::of(40_000), KindClass::Regular);
    }

    #[test]
    fn only_ephemeral_is_not_persisted() {
        assert!(KindClass::Regular.is_persisted());
        assert!(KindClass::Replaceable.is_persisted());
        assert!(KindClass::Addressable.is_persisted());
        assert!(!KindClass::Ephemeral.is_persisted());
    }

    #[test]
    fn address_keyed_classes() {
        assert!(KindClass::Replaceable.is_keyed_by_address());
        assert!(KindClass::Addressable.is_keyed_by_address());
        assert!(!KindClass::Regular.is_keyed_by_address());
        assert!(!KindClass::Ephemeral.is_keyed_by_address());
    }
}
