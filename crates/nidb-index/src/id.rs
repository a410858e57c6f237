use std::fmt;

use nidb_types::Event;

/// Identity of one cached index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexId {
    Kind(u16),
    Author(String),
    /// Indexable tag key (`name + value`).
    Tag(String),
}

impl IndexId {
    /// Every index an event belongs to.
    pub fn for_event(event: &Event) -> Vec<IndexId> {
        let mut ids = vec![
            IndexId::Kind(event.kind),
            IndexId::Author(event.pubkey.clone()),
        ];
        ids.extend(event.indexable_tags().into_iter().map(IndexId::Tag));
        ids
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexId::Kind(kind) => write!(f, "kind:{kind}"),
            IndexId::Author(pubkey) => write!(f, "author:{pubkey}"),
            IndexId::Tag(key) => write!(f, "tag:{key}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nidb_types::EventBuilder;

    #[test]
    fn event_belongs_to_kind_author_and_tags() {
        let event = EventBuilder::new(1)
            .pubkey("ab")
            .tag(["e", "x"])
            .tag(["client", "ignored"])
            .build();
        assert_eq!(
            IndexId::for_event(&event),
            vec![
                IndexId::Kind(1),
                IndexId::Author("ab".into()),
                IndexId::Tag("ex".into()),
            ]
        );
    }
}
