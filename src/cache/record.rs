//! Match records: one record per way a table satisfies a cached query.

use crate::cache::arena::MatchId;
use crate::engine::table::TableId;
use crate::engine::types::{Entity, Id};
use crate::query::eval::FieldRecord;

/// Per-field array that is either borrowed from cache-level shared storage
/// (the query's declared ids, the zero-filled sources) or owned by the match
/// when a result diverged from the declared shape.
pub(crate) enum FieldArray<T> {
    Shared,
    Owned(Box<[T]>),
}

impl<T> FieldArray<T> {
    #[inline]
    pub fn as_slice<'a>(&'a self, shared: &'a [T]) -> &'a [T] {
        match self {
            FieldArray::Shared => shared,
            FieldArray::Owned(owned) => owned,
        }
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        matches!(self, FieldArray::Shared)
    }
}

/// Payload present only on non-trivial caches.
pub(crate) struct FullMatch {
    /// Next match for the same table, when wildcards produce several.
    pub next_match: Option<MatchId>,
    pub ids: FieldArray<Id>,
    pub sources: FieldArray<Entity>,
    /// Per-field providing table, allocated when any source is external.
    pub tables: Option<Box<[Option<TableId>]>>,
    pub set_fields: u32,
    pub up_fields: u32,
    /// Change-detection counters: slot 0 tracks rows, slot 1 + field tracks
    /// the field's column.
    pub monitor: Option<Box<[u32]>>,
}

impl FullMatch {
    pub fn new() -> Self {
        Self {
            next_match: None,
            ids: FieldArray::Shared,
            sources: FieldArray::Shared,
            tables: None,
            set_fields: 0,
            up_fields: 0,
            monitor: None,
        }
    }
}

/// Trivial caches drop the per-match payload entirely; the layout split makes
/// `next_match` unrepresentable for them rather than merely unused.
pub(crate) enum MatchData {
    Trivial,
    Full(Box<FullMatch>),
}

pub(crate) struct MatchRecord {
    pub table: TableId,
    /// Per-field record of the providing table, `None` for unset fields.
    pub trs: Box<[Option<FieldRecord>]>,
    pub prev: Option<MatchId>,
    pub next: Option<MatchId>,
    pub group_id: u64,
    pub data: MatchData,
}

impl MatchRecord {
    #[inline]
    pub fn next_match(&self) -> Option<MatchId> {
        match &self.data {
            MatchData::Trivial => None,
            MatchData::Full(full) => full.next_match,
        }
    }

    #[inline]
    pub fn set_next_match(&mut self, next: Option<MatchId>) {
        match &mut self.data {
            MatchData::Trivial => debug_assert!(next.is_none(), "trivial match cannot chain"),
            MatchData::Full(full) => full.next_match = next,
        }
    }

    #[inline]
    pub fn full(&self) -> Option<&FullMatch> {
        match &self.data {
            MatchData::Trivial => None,
            MatchData::Full(full) => Some(full),
        }
    }
}
