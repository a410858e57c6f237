use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use nidb_types::Filter;

/// How filters are executed. Both strategies return the same events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStrategy {
    /// Resolve every field to a UID set and intersect.
    #[default]
    SetBased,
    /// Merge descending index cursors over authors and kinds, stopping at
    /// the limit. Falls back to `SetBased` for filters it cannot drive.
    CursorMerge,
}

impl QueryStrategy {
    /// Returns `true` if the cursor-merge executor can run `filter`.
    ///
    /// It needs at least one non-empty `authors` or `kinds` list to open
    /// cursors on, and cannot honour `ids` or `search`.
    pub fn cursor_eligible(filter: &Filter) -> bool {
        let authors = filter.authors.as_ref().map(Vec::len);
        let kinds = filter.kinds.as_ref().map(Vec::len);
        filter.ids.is_none()
            && filter.search.is_none()
            && authors != Some(0)
            && kinds != Some(0)
            && (authors.is_some() || kinds.is_some())
    }
}

impl fmt::Display for QueryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetBased => f.write_str("set_based"),
            Self::CursorMerge => f.write_str("cursor_merge"),
        }
    }
}

impl FromStr for QueryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set_based" | "set-based" => Ok(Self::SetBased),
            "cursor_merge" | "cursor-merge" => Ok(Self::CursorMerge),
            other => Err(format!("unknown query strategy: {other}")),
        }
    }
}
