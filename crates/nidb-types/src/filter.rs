use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::event::{is_indexable_tag_name, Event};

/// A closed query structure.
///
/// Fields are combined with AND; the values inside one field are combined
/// with OR. A list of filters is combined with OR (see [`matches_any`]).
///
/// Tag constraints live in [`Filter::tags`], keyed by the single-letter tag
/// name. In JSON they use the protocol's `"#x": [...]` form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFilter", into = "RawFilter")]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u16>>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<u64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<u64>,
    pub limit: Option<usize>,
    /// Full-text search. Not supported: a filter carrying it matches nothing.
    pub search: Option<String>,
    pub tags: BTreeMap<char, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds<I: IntoIterator<Item = u16>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    /// Add a tag constraint. Values for the same name accumulate.
    pub fn tag<I, S>(mut self, name: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(name)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Tag constraints that actually restrict the result.
    ///
    /// A tag listed with no values is ignored.
    pub fn tag_constraints(&self) -> impl Iterator<Item = (char, &[String])> {
        self.tags
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(name, values)| (*name, values.as_slice()))
    }

    /// Returns `true` if the filter has no constraining field at all.
    ///
    /// `limit` on its own does not constrain anything. An empty list in
    /// `ids`, `authors` or `kinds` does: it matches nothing.
    pub fn is_empty(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.since.is_none()
            && self.until.is_none()
            && self.search.is_none()
            && self.tag_constraints().next().is_none()
    }

    /// Returns `true` if the filter constrains `created_at`.
    pub fn has_time_range(&self) -> bool {
        self.since.is_some() || self.until.is_some()
    }

    /// Full match predicate.
    pub fn matches(&self, event: &Event) -> bool {
        if self.search.is_some() {
            return false;
        }
        if let Some(ref ids) = self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(ref authors) = self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        self.tag_constraints()
            .all(|(name, values)| event.has_tag_value(name, values))
    }
}

/// Returns `true` if any filter matches the event.
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}

/// Wire form of [`Filter`], with tag constraints as `#x` keys.
#[derive(Serialize, Deserialize)]
struct RawFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kinds: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    search: Option<String>,
    #[serde(flatten)]
    rest: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<RawFilter> for Filter {
    type Error = TypeError;

    fn try_from(raw: RawFilter) -> Result<Self, Self::Error> {
        let mut tags = BTreeMap::new();
        for (key, value) in raw.rest {
            // Unknown non-tag keys are ignored.
            let Some(name) = key.strip_prefix('#') else {
                continue;
            };
            if !is_indexable_tag_name(name) {
                return Err(TypeError::InvalidTagFilter(key));
            }
            let values: Vec<String> = serde_json::from_value(value)
                .map_err(|e| TypeError::Serialization(format!("{key}: {e}")))?;
            let letter = name.chars().next().ok_or(TypeError::InvalidTagFilter(key.clone()))?;
            tags.insert(letter, values);
        }

        Ok(Self {
            ids: raw.ids,
            authors: raw.authors,
            kinds: raw.kinds,
            since: raw.since,
            until: raw.until,
            limit: raw.limit,
            search: raw.search,
            tags,
        })
    }
}

impl From<Filter> for RawFilter {
    fn from(filter: Filter) -> Self {
        let rest = filter
            .tags
            .into_iter()
            .map(|(name, values)| (format!("#{name}"), serde_json::Value::from(values)))
            .collect();
        Self {
            ids: filter.ids,
            authors: filter.authors,
            kinds: filter.kinds,
            since: filter.since,
            until: filter.until,
            limit: filter.limit,
            search: filter.search,
            rest,
        }
    }
}
