//! Cached iteration.
//!
//! Iteration visits matches in ordered-list order, in sorted-slice order
//! when an order_by is active, or within a single group after
//! [`CachedIter::set_group`]. The iterator is lending: each call to `next`
//! returns a view borrowing from the world and the cache.

use crate::cache::arena::MatchId;
use crate::cache::record::MatchRecord;
use crate::cache::QueryCache;
use crate::engine::error::{EcsError, EcsResult};
use crate::engine::table::{Table, TableId};
use crate::engine::types::{Entity, Id};
use crate::engine::world::World;
use crate::query::eval::{self, TableMatch};
use crate::query::Query;

pub struct CachedIter<'w> {
    world: &'w World,
    source: IterSource<'w>,
    started: bool,
}

enum IterSource<'w> {
    Cached {
        cache: &'w QueryCache,
        mode: CachedMode,
    },
    Uncached {
        query: &'w Query,
        tables: Vec<TableId>,
        cursor: usize,
        current_table: TableId,
        pending: Vec<TableMatch>,
        pending_ix: usize,
    },
}

enum CachedMode {
    List { node: Option<MatchId>, last: Option<MatchId> },
    Slices { index: usize },
}

impl<'w> CachedIter<'w> {
    pub(crate) fn for_cache(world: &'w World, cache: &'w QueryCache) -> Self {
        let mode = if cache.order_by.is_some() && !cache.table_slices.is_empty() {
            CachedMode::Slices { index: 0 }
        } else {
            CachedMode::List { node: cache.list.first, last: cache.list.last }
        };
        Self { world, source: IterSource::Cached { cache, mode }, started: false }
    }

    pub(crate) fn for_uncached(world: &'w World, query: &'w Query) -> Self {
        let tables = world.tables_iter().map(|t| t.id()).collect();
        Self {
            world,
            source: IterSource::Uncached {
                query,
                tables,
                cursor: 0,
                current_table: TableId::ROOT,
                pending: Vec::new(),
                pending_ix: 0,
            },
            started: false,
        }
    }

    /// Restricts iteration to one group. Unknown groups iterate nothing.
    pub fn set_group(&mut self, group_id: u64) -> EcsResult<()> {
        if self.started {
            return Err(EcsError::InvalidParameter("cannot set a group during iteration"));
        }
        let IterSource::Cached { cache, mode } = &mut self.source else {
            return Err(EcsError::InvalidParameter("set_group requires a cached query"));
        };
        *mode = match cache.group(group_id) {
            Some(list) => CachedMode::List { node: list.first, last: list.last },
            None => CachedMode::List { node: None, last: None },
        };
        Ok(())
    }

    /// Next matched table (or table slice). Empty tables are skipped unless
    /// the cache was configured to yield them.
    pub fn next(&mut self) -> Option<MatchView<'_>> {
        self.started = true;
        match &mut self.source {
            IterSource::Cached { cache, mode } => {
                // Copy the reference out so record borrows do not hold the
                // iterator's own state.
                let cache: &'w QueryCache = *cache;
                match mode {
                    CachedMode::List { node, last } => {
                        while let Some(m) = *node {
                            let record = cache.arena.node(m);
                            *node = if Some(m) == *last { None } else { record.next };
                            let Some(table) = self.world.table(record.table) else { continue };
                            if table.count() == 0 && !cache.yield_empty {
                                continue;
                            }
                            let count = table.count();
                            return Some(cached_view(cache, table, record, 0, count));
                        }
                        None
                    }
                    CachedMode::Slices { index } => {
                        if *index >= cache.table_slices.len() {
                            return None;
                        }
                        let slice = cache.table_slices[*index];
                        *index += 1;
                        let record = cache.arena.node(slice.match_id);
                        let table = self
                            .world
                            .table(record.table)
                            .expect("sorted slice references a missing table");
                        Some(cached_view(
                            cache,
                            table,
                            record,
                            slice.offset as usize,
                            slice.count as usize,
                        ))
                    }
                }
            }
            IterSource::Uncached { query, tables, cursor, current_table, pending, pending_ix } => {
                let query: &'w Query = *query;
                loop {
                    if *pending_ix < pending.len() {
                        let result = &pending[*pending_ix];
                        *pending_ix += 1;
                        let table = self
                            .world
                            .table(*current_table)
                            .expect("uncached iteration over a missing table");
                        let count = table.count();
                        return Some(MatchView {
                            table,
                            ids: &result.ids,
                            sources: &result.sources,
                            set_fields: result.set_fields,
                            up_fields: result.up_fields,
                            group_id: 0,
                            offset: 0,
                            count,
                        });
                    }
                    if *cursor >= tables.len() {
                        return None;
                    }
                    let t = tables[*cursor];
                    *cursor += 1;
                    let Some(table) = self.world.table(t) else { continue };
                    if table.count() == 0 {
                        continue;
                    }
                    let results = eval::match_table(self.world, query, table);
                    if results.is_empty() {
                        continue;
                    }
                    *current_table = t;
                    *pending = results;
                    *pending_ix = 0;
                }
            }
        }
    }
}

fn cached_view<'a>(
    cache: &'a QueryCache,
    table: &'a Table,
    record: &'a MatchRecord,
    offset: usize,
    count: usize,
) -> MatchView<'a> {
    let (ids, sources, set_fields, up_fields) = match record.full() {
        Some(full) => (
            full.ids.as_slice(&cache.query.ids),
            full.sources.as_slice(&cache.sources_zero),
            full.set_fields,
            full.up_fields,
        ),
        None => (
            &cache.query.ids[..],
            &cache.sources_zero[..],
            set_mask(cache.query.field_count),
            0,
        ),
    };
    MatchView {
        table,
        ids,
        sources,
        set_fields,
        up_fields,
        group_id: record.group_id,
        offset,
        count,
    }
}

#[inline]
fn set_mask(field_count: usize) -> u32 {
    if field_count >= 32 {
        u32::MAX
    } else {
        (1u32 << field_count) - 1
    }
}

/// One visited match: a table (or a slice of it) plus the per-field ids and
/// sources in effect for this match.
pub struct MatchView<'a> {
    table: &'a Table,
    ids: &'a [Id],
    sources: &'a [Entity],
    set_fields: u32,
    up_fields: u32,
    group_id: u64,
    offset: usize,
    count: usize,
}

impl<'a> MatchView<'a> {
    #[inline]
    pub fn table(&self) -> &'a Table {
        self.table
    }

    /// Entities covered by this view, honoring slice bounds.
    #[inline]
    pub fn entities(&self) -> &'a [Entity] {
        &self.table.entities()[self.offset..self.offset + self.count]
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Effective id of a field; differs from the declared id when a wildcard
    /// resolved.
    #[inline]
    pub fn id(&self, field: usize) -> Id {
        self.ids[field]
    }

    /// Source entity of a field; null when the field matched `$this`.
    #[inline]
    pub fn source(&self, field: usize) -> Entity {
        self.sources[field]
    }

    #[inline]
    pub fn is_set(&self, field: usize) -> bool {
        self.set_fields & (1 << field) != 0
    }

    #[inline]
    pub fn is_up(&self, field: usize) -> bool {
        self.up_fields & (1 << field) != 0
    }

    #[inline]
    pub fn group_id(&self) -> u64 {
        self.group_id
    }
}
