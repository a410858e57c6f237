//! Cursor-merge execution.
//!
//! One descending cursor is opened per value in `authors` and in `kinds`.
//! Each step takes the row at the head of the furthest-ahead cursor, loads
//! it, and tests it against the whole filter. Rows are unique per
//! [`Position`], so once a row has been decided every cursor sitting on it
//! moves past it and it is never considered twice. Memory stays bounded by
//! the page size times the number of cursors, however broad the filter.

use std::collections::VecDeque;

use tracing::trace;

use nidb_store::{IndexKey, Position};
use nidb_types::{Event, Filter, Uid};

use crate::engine::QueryEngine;
use crate::error::QueryResult;

/// Rows fetched per cursor refill.
pub const CURSOR_PAGE: usize = 64;

/// Which OR-group a cursor belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Group {
    Authors,
    Kinds,
}

/// State of one descending index cursor.
#[derive(Clone, Debug)]
pub struct CursorState {
    pub key: IndexKey,
    pub group: Group,
    /// Fetched rows not yet consumed, highest first.
    pub buffer: VecDeque<Position>,
    /// Lowest row fetched so far; the next page starts below it.
    pub last: Option<Position>,
    /// The store has no rows left below `last`.
    pub drained: bool,
}

impl CursorState {
    pub fn new(key: IndexKey, group: Group, start: Option<Position>) -> Self {
        Self {
            key,
            group,
            buffer: VecDeque::new(),
            last: start,
            drained: false,
        }
    }

    pub fn head(&self) -> Option<&Position> {
        self.buffer.front()
    }

    pub fn is_exhausted(&self) -> bool {
        self.drained && self.buffer.is_empty()
    }

    /// Returns `true` if the row for `event` is in this cursor's index.
    pub fn covers(&self, event: &Event) -> bool {
        match &self.key {
            IndexKey::Kind(kind) => *kind == event.kind,
            IndexKey::Author(pubkey) => *pubkey == event.pubkey,
            IndexKey::Id(id) => *id == event.id,
            IndexKey::Tag(key) => event.indexable_tags().iter().any(|t| t == key),
        }
    }

    /// Drop buffered rows at or above `pos`.
    pub fn skip_to_below(&mut self, pos: &Position) {
        while self.buffer.front().is_some_and(|head| head >= pos) {
            self.buffer.pop_front();
        }
    }
}

/// Index of the cursor whose head row is furthest ahead (highest
/// position). Exhausted and empty cursors are ignored.
pub fn pick_furthest(cursors: &[CursorState]) -> Option<usize> {
    cursors
        .iter()
        .enumerate()
        .filter_map(|(i, c)| c.head().map(|head| (i, head)))
        .max_by(|(_, a), (_, b)| a.cmp(b))
        .map(|(i, _)| i)
}

/// Returns `true` if every cursor of some group is exhausted. No further
/// row can then satisfy the AND across groups.
pub fn group_exhausted(cursors: &[CursorState]) -> bool {
    [Group::Authors, Group::Kinds].iter().any(|group| {
        let mut members = cursors.iter().filter(|c| c.group == *group).peekable();
        members.peek().is_some() && members.all(CursorState::is_exhausted)
    })
}

/// Open the cursors for an eligible filter.
pub fn open_cursors(filter: &Filter) -> Vec<CursorState> {
    // Rows sort by (created_at, uid) and no uid is empty, so this sits just
    // above every row created at `until`.
    let start = filter
        .until
        .and_then(|until| until.checked_add(1))
        .map(|above| Position::new(above, Uid::from("")));

    let mut cursors = Vec::new();
    for pubkey in filter.authors.iter().flatten() {
        cursors.push(CursorState::new(
            IndexKey::Author(pubkey.clone()),
            Group::Authors,
            start.clone(),
        ));
    }
    for kind in filter.kinds.iter().flatten() {
        cursors.push(CursorState::new(IndexKey::Kind(*kind), Group::Kinds, start.clone()));
    }
    cursors.sort_by(|a, b| a.key.cmp(&b.key));
    cursors.dedup_by(|a, b| a.key == b.key);
    cursors
}

/// Run one filter with the cursor-merge executor. Results are newest first.
pub(crate) async fn execute(engine: &QueryEngine, filter: &Filter) -> QueryResult<Vec<Event>> {
    let limit = filter.limit.unwrap_or(usize::MAX);
    let mut out = Vec::new();
    if limit == 0 {
        return Ok(out);
    }

    let mut cursors = open_cursors(filter);
    let mut examined = 0usize;

    loop {
        for cursor in cursors.iter_mut() {
            refill(engine, cursor).await?;
        }
        if group_exhausted(&cursors) {
            break;
        }
        let Some(pick) = pick_furthest(&cursors) else {
            break;
        };
        let Some(candidate) = cursors[pick].head().cloned() else {
            break;
        };
        if filter.since.is_some_and(|since| candidate.created_at < since) {
            break;
        }
        examined += 1;

        let accepted = match engine.load_one(&candidate.uid).await? {
            Some(event) if filter.matches(&event) => Some(event),
            _ => None,
        };

        match accepted {
            Some(event) => {
                for cursor in cursors.iter_mut().filter(|c| c.covers(&event)) {
                    cursor.skip_to_below(&candidate);
                }
                // The loaded version may differ from the indexed row.
                for cursor in cursors.iter_mut() {
                    if cursor.head() == Some(&candidate) {
                        cursor.buffer.pop_front();
                    }
                }
                out.push(event);
                if out.len() >= limit {
                    break;
                }
            }
            None => {
                for cursor in cursors.iter_mut() {
                    if cursor.head() == Some(&candidate) {
                        cursor.buffer.pop_front();
                    }
                }
            }
        }
    }

    trace!(cursors = cursors.len(), examined, matched = out.len(), "cursor merge finished");
    Ok(out)
}

async fn refill(engine: &QueryEngine, cursor: &mut CursorState) -> QueryResult<()> {
    if !cursor.buffer.is_empty() || cursor.drained {
        return Ok(());
    }
    let page = engine
        .store()
        .scan_index(&cursor.key, cursor.last.as_ref(), CURSOR_PAGE)
        .await?;
    if page.len() < CURSOR_PAGE {
        cursor.drained = true;
    }
    if let Some(lowest) = page.last() {
        cursor.last = Some(lowest.clone());
    }
    cursor.buffer.extend(page);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(created_at: u64, uid: &str) -> Position {
        Position::new(created_at, Uid::from(uid))
    }

    fn cursor(key: IndexKey, group: Group, rows: &[Position]) -> CursorState {
        let mut c = CursorState::new(key, group, None);
        c.buffer.extend(rows.iter().cloned());
        c.drained = true;
        c
    }

    #[test]
    fn picks_highest_head() {
        let cursors = vec![
            cursor(IndexKey::Kind(1), Group::Kinds, &[pos(5, "a")]),
            cursor(IndexKey::Kind(2), Group::Kinds, &[pos(9, "b")]),
            cursor(IndexKey::Kind(3), Group::Kinds, &[]),
        ];
        assert_eq!(pick_furthest(&cursors), Some(1));
    }

    #[test]
    fn ties_on_time_break_by_uid() {
        let cursors = vec![
            cursor(IndexKey::Kind(1), Group::Kinds, &[pos(5, "b")]),
            cursor(IndexKey::Kind(2), Group::Kinds, &[pos(5, "a")]),
        ];
        assert_eq!(pick_furthest(&cursors), Some(0));
    }

    #[test]
    fn nothing_to_pick_when_all_empty() {
        let cursors = vec![cursor(IndexKey::Kind(1), Group::Kinds, &[])];
        assert_eq!(pick_furthest(&cursors), None);
    }

    #[test]
    fn group_exhaustion_needs_every_member() {
        let mut cursors = vec![
            cursor(IndexKey::Kind(1), Group::Kinds, &[]),
            cursor(IndexKey::Kind(2), Group::Kinds, &[pos(1, "x")]),
            cursor(IndexKey::Author("a".into()), Group::Authors, &[pos(1, "x")]),
        ];
        assert!(!group_exhausted(&cursors));
        cursors[1].buffer.clear();
        assert!(group_exhausted(&cursors));
    }

    #[test]
    fn skip_drops_rows_at_or_above() {
        let mut c = cursor(
            IndexKey::Kind(1),
            Group::Kinds,
            &[pos(9, "a"), pos(7, "b"), pos(3, "c")],
        );
        c.skip_to_below(&pos(7, "b"));
        assert_eq!(c.head(), Some(&pos(3, "c")));
    }

    #[test]
    fn opens_one_cursor_per_distinct_value() {
        let filter = Filter::new().kinds([1, 1, 7]).authors(["p"]).until(100);
        let cursors = open_cursors(&filter);
        assert_eq!(cursors.len(), 3);
        assert!(cursors.iter().all(|c| c.last == Some(pos(101, ""))));
    }
}
