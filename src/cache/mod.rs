//! Cached query engine.
//!
//! A cache wraps an uncached query and keeps the set of matching tables
//! incrementally up to date: table lifecycle events drive single-table
//! match/unmatch, the world's monitor generation drives bulk revalidation,
//! and an intrusive ordered list (optionally sliced into groups, optionally
//! re-ordered by a comparator) defines iteration order.

pub mod arena;
pub mod event;
pub mod group;
pub mod iter;
pub mod list;
pub mod record;
pub mod rematch;
pub mod sort;

use std::any::Any;
use std::collections::HashMap;

use tracing::debug;

use crate::cache::arena::{MatchArena, MatchId};
use crate::cache::group::default_group_by;
use crate::cache::iter::CachedIter;
use crate::cache::list::{GroupInfo, MatchList};
use crate::cache::record::{FieldArray, FullMatch, MatchData, MatchRecord};
use crate::cache::sort::{OrderBy, TableSlice};
use crate::engine::error::{EcsError, EcsResult};
use crate::engine::event::{EVENT_TABLE_CREATE, EVENT_TABLE_DELETE};
use crate::engine::table::TableId;
use crate::engine::types::{pair, Entity, Id, EMPTY, IS_A, WILDCARD};
use crate::engine::world::{QueryHandle, QueryState, World};
use crate::query::eval::{self, TableMatch};
use crate::query::{
    CacheKind, GroupByFn, Query, QueryDesc, TermInOut, TermOper, TermRef, TERM_CASCADE, TERM_DESC,
    TERM_UP,
};

/// Per-table record of the cache: head and tail of the table's match chain
/// plus the rematch generation that last confirmed it.
#[derive(Default)]
pub struct TableEntry {
    pub(crate) first: Option<MatchId>,
    pub(crate) last: Option<MatchId>,
    pub(crate) rematch_count: u64,
}

impl TableEntry {
    #[inline]
    pub fn first(&self) -> Option<MatchId> {
        self.first
    }

    #[inline]
    pub fn last(&self) -> Option<MatchId> {
        self.last
    }
}

pub struct QueryCache {
    pub(crate) query: Query,
    pub(crate) tables: HashMap<TableId, TableEntry>,
    pub(crate) arena: MatchArena,
    pub(crate) list: MatchList,
    /// Present iff grouping is enabled.
    pub(crate) groups: Option<HashMap<u64, MatchList>>,
    pub(crate) group_by: Option<GroupByFn>,
    pub(crate) group_by_id: Entity,
    pub(crate) on_group_create: Option<crate::query::GroupCreateFn>,
    pub(crate) on_group_delete: Option<crate::query::GroupDeleteFn>,
    /// 1-based index of the cascade term, or 0.
    pub(crate) cascade_by: usize,
    pub(crate) group_desc: bool,
    pub(crate) order_by: Option<OrderBy>,
    pub(crate) table_slices: Vec<TableSlice>,
    /// Shared zero-filled sources for results that only match `$this`.
    pub(crate) sources_zero: Box<[Entity]>,
    pub(crate) monitored: Vec<Id>,
    pub(crate) observer: Option<u32>,
    pub(crate) entity: Entity,
    pub(crate) monitor_generation: u64,
    pub(crate) rematch_count: u64,
    /// Change epoch; strictly increases on every add, remove or move.
    pub(crate) match_count: u64,
    pub(crate) prev_match_count: i64,
    pub(crate) last_changed_mark: u64,
    pub(crate) trivial: bool,
    pub(crate) has_refs: bool,
    pub(crate) yield_empty: bool,
    pub(crate) detect_changes: bool,
}

impl QueryCache {
    pub(crate) fn init(
        world: &mut World,
        desc: QueryDesc,
        query_index: usize,
    ) -> EcsResult<Box<QueryCache>> {
        let QueryDesc {
            terms,
            cache_kind: _,
            match_empty_tables,
            detect_changes,
            group_by_id,
            group_by,
            on_group_create,
            on_group_delete,
            order_by_id,
            order_by,
            order_by_table,
            entity,
        } = desc;

        let query = Query::compile(terms)?;
        let field_count = query.field_count;
        let has_order_by = order_by.is_some();

        let mut cache = Box::new(QueryCache {
            sources_zero: vec![Entity::NULL; field_count].into_boxed_slice(),
            query,
            tables: HashMap::new(),
            arena: MatchArena::new(),
            list: MatchList::default(),
            groups: None,
            group_by: None,
            group_by_id: Entity::NULL,
            on_group_create: None,
            on_group_delete: None,
            cascade_by: 0,
            group_desc: false,
            order_by: None,
            table_slices: Vec::new(),
            monitored: Vec::new(),
            observer: None,
            entity,
            monitor_generation: world.monitors.generation,
            rematch_count: 0,
            match_count: 0,
            prev_match_count: -1,
            last_changed_mark: 0,
            trivial: false,
            has_refs: false,
            // order_by returns table slices, which cannot cover empty tables
            yield_empty: match_empty_tables && !has_order_by,
            detect_changes,
        });

        cache.process_signature(world)?;

        if cache.cascade_by != 0 {
            if group_by.is_some() || !group_by_id.is_null() {
                cache.unregister_monitors(world);
                return Err(EcsError::InvalidParameter("cannot mix cascade and group_by"));
            }
            let term = &cache.query.terms[cache.cascade_by - 1];
            let trav = term.trav;
            cache.group_desc = term.flags & TERM_DESC != 0;
            cache.set_group_by(
                Entity::NULL,
                Box::new(move |world, table, _| world.relation_depth(trav, table).max(0) as u64),
            )?;
        } else if group_by.is_some() || !group_by_id.is_null() {
            let group_by = group_by.unwrap_or_else(|| Box::new(default_group_by));
            cache.set_group_by(group_by_id, group_by)?;
            cache.on_group_create = on_group_create;
            cache.on_group_delete = on_group_delete;
        }

        cache.trivial = !detect_changes
            && !has_order_by
            && cache.groups.is_none()
            && !cache.query.matches_wildcards()
            && cache
                .query
                .terms
                .iter()
                .all(|t| t.match_this() && t.flags & TERM_UP == 0 && t.oper == TermOper::And);

        cache.match_tables(world);

        if cache.query.term_count() > 0 {
            cache.observer = Some(world.observer_init(
                EVENT_TABLE_CREATE | EVENT_TABLE_DELETE,
                query_index as u32,
            ));
        }

        if let Some(cmp) = order_by {
            if let Err(e) = cache.configure_order_by(world, order_by_id, cmp, order_by_table) {
                cache.fini(world);
                return Err(e);
            }
        }

        debug!(
            terms = cache.query.term_count(),
            tables = cache.tables.len(),
            trivial = cache.trivial,
            "query created"
        );
        Ok(cache)
    }

    /// One-time pass over the terms: reject unsupported shapes, find the
    /// cascade term and register the monitors that gate rematching.
    fn process_signature(&mut self, world: &mut World) -> EcsResult<()> {
        let mut cascade_by = 0usize;
        for (i, term) in self.query.terms.iter().enumerate() {
            debug_assert!(
                !matches!(term.src, TermRef::Var(_)),
                "named variables are rejected at compile time"
            );
            if term.inout == TermInOut::Filter {
                return Err(EcsError::Unsupported(
                    "InOutFilter terms are not supported by cached queries",
                ));
            }
            if term.flags & TERM_CASCADE != 0 {
                if cascade_by != 0 {
                    return Err(EcsError::InvalidParameter("query can only have one cascade term"));
                }
                cascade_by = i + 1;
            }
        }
        self.cascade_by = cascade_by;
        self.has_refs = self
            .query
            .terms
            .iter()
            .any(|t| t.flags & TERM_UP != 0 || matches!(t.src, TermRef::Entity(_)));

        let mut monitored = Vec::new();
        for term in self.query.terms.iter() {
            let id = term.id().expect("compiled terms carry valid ids");
            if term.flags & TERM_UP != 0 {
                monitored.push(pair(term.trav, WILDCARD));
                if term.trav != IS_A {
                    monitored.push(pair(IS_A, WILDCARD));
                }
                monitored.push(id);
            } else if !term.match_this() {
                monitored.push(id);
            }
        }
        for &id in &monitored {
            world.monitors.register(id);
        }
        self.monitored = monitored;
        Ok(())
    }

    fn set_group_by(&mut self, id: Entity, group_by: GroupByFn) -> EcsResult<()> {
        if self.group_by.is_some() {
            return Err(EcsError::InvalidOperation("query is already grouped"));
        }
        self.group_by_id = id;
        self.group_by = Some(group_by);
        self.groups = Some(HashMap::new());
        Ok(())
    }

    fn unregister_monitors(&mut self, world: &mut World) {
        for id in std::mem::take(&mut self.monitored) {
            world.monitors.unregister(id);
        }
    }

    /// Initial population: evaluate the query against every existing table.
    fn match_tables(&mut self, world: &World) {
        let table_ids: Vec<TableId> = world.tables_iter().map(|t| t.id()).collect();
        for t in table_ids {
            let results = {
                let table = world.table(t).expect("table vanished during population");
                eval::match_table(world, &self.query, table)
            };
            if results.is_empty() {
                continue;
            }
            self.tables.insert(t, TableEntry::default());
            for result in &results {
                let m = self.add_table_match(world, t);
                self.set_table_match(world, m, result);
            }
        }
    }

    /// Creates a match record for `table`, chains it into the table's entry
    /// and splices it into the ordered list. One table can have more than one
    /// match if the query contains wildcards.
    pub(crate) fn add_table_match(&mut self, world: &World, table: TableId) -> MatchId {
        let field_count = self.query.field_count;
        let data = if self.trivial {
            MatchData::Trivial
        } else {
            MatchData::Full(Box::new(FullMatch::new()))
        };
        let m = self.arena.alloc(MatchRecord {
            table,
            trs: vec![None; field_count].into_boxed_slice(),
            prev: None,
            next: None,
            group_id: 0,
            data,
        });

        let entry = self.tables.get_mut(&table).expect("match added without a table entry");
        match entry.first {
            None => {
                entry.first = Some(m);
                entry.last = Some(m);
            }
            Some(_) => {
                debug_assert!(!self.trivial, "trivial caches hold a single match per table");
                let last = entry.last.expect("chained entry without a tail");
                entry.last = Some(m);
                self.arena.node_mut(last).set_next_match(Some(m));
            }
        }

        self.insert_node(world, m);
        m
    }

    /// (Re)populates a match from one evaluation result, keeping the shared
    /// arrays whenever the result does not diverge from the declared shape.
    pub(crate) fn set_table_match(&mut self, _world: &World, m: MatchId, result: &TableMatch) {
        let field_count = self.query.field_count;
        debug_assert!(field_count > 0);

        let ids_diverge = result.ids.iter().zip(self.query.ids.iter()).any(|(a, b)| a != b);
        let has_sources = result.sources.iter().any(|s| !s.is_null());
        let detect_changes = self.detect_changes;

        let node = self.arena.node_mut(m);
        node.trs.copy_from_slice(&result.trs);

        match &mut node.data {
            MatchData::Trivial => {
                debug_assert!(
                    !ids_diverge && !has_sources,
                    "trivial cache produced a divergent result"
                );
            }
            MatchData::Full(full) => {
                full.ids = if ids_diverge {
                    FieldArray::Owned(result.ids.clone())
                } else {
                    FieldArray::Shared
                };
                if has_sources {
                    full.sources = FieldArray::Owned(result.sources.clone());
                    full.tables = Some(result.trs.iter().map(|tr| tr.map(|tr| tr.table)).collect());
                } else {
                    full.sources = FieldArray::Shared;
                    full.tables = None;
                }
                full.set_fields = result.set_fields;
                full.up_fields = result.up_fields;
                if detect_changes && full.monitor.is_none() {
                    full.monitor = Some(vec![0u32; 1 + field_count].into_boxed_slice());
                }
            }
        }
    }

    /// Drops a table's entry and frees its whole match chain, in order.
    pub(crate) fn unmatch_table(&mut self, world: &World, table: TableId) {
        if let Some(entry) = self.tables.remove(&table) {
            debug_assert!(
                entry.first.map_or(true, |m| self.arena.node(m).table == table),
                "table entry chained to a foreign match"
            );
            self.free_match_chain(world, entry.first);
        }
    }

    pub(crate) fn free_match_chain(&mut self, world: &World, first: Option<MatchId>) {
        let mut cursor = first;
        while let Some(m) = cursor {
            let next = self.arena.node(m).next_match();
            self.remove_node(world, m);
            self.arena.free(m);
            cursor = next;
        }
    }

    #[inline]
    pub(crate) fn table_count(&self) -> i32 {
        self.tables.len() as i32
    }

    pub(crate) fn entity_count(&self, world: &World) -> i32 {
        self.tables
            .keys()
            .map(|&t| world.table(t).map_or(0, |table| table.count() as i32))
            .sum()
    }

    /// Desired `EMPTY`-tag state of the query entity, if there is one.
    pub(crate) fn empty_state(&self) -> Option<(Entity, bool)> {
        if self.entity.is_null() || self.query.terms.is_empty() {
            return None;
        }
        Some((self.entity, self.list.first.is_none()))
    }

    pub(crate) fn check_changed(&mut self, world: &World) -> bool {
        let mut changed = self.match_count != self.last_changed_mark;
        self.last_changed_mark = self.match_count;
        if !self.detect_changes {
            return changed;
        }
        for (_, record) in self.arena.iter_mut() {
            let home = record.table;
            let Some(home_table) = world.table(home) else { continue };
            let trs = &record.trs;
            let MatchData::Full(full) = &mut record.data else { continue };
            let Some(monitor) = full.monitor.as_mut() else { continue };
            let dirty = home_table.dirty();
            if monitor[0] != dirty[0] {
                monitor[0] = dirty[0];
                changed = true;
            }
            for (i, tr) in trs.iter().enumerate() {
                let Some(tr) = tr else { continue };
                let Some(provider) = world.table(tr.table) else { continue };
                let slot = tr.type_index as usize + 1;
                let provider_dirty = provider.dirty();
                if slot < provider_dirty.len() && monitor[1 + i] != provider_dirty[slot] {
                    monitor[1 + i] = provider_dirty[slot];
                    changed = true;
                }
            }
        }
        changed
    }

    /// Tears the cache down: group destructors, monitor unregistration,
    /// match/entry release, empty-tag cleanup. Leaves the arena empty.
    pub(crate) fn fini(&mut self, world: &mut World) {
        if let Some(observer) = self.observer.take() {
            world.observer_fini(observer);
        }
        if let Some(on_delete) = self.on_group_delete.take() {
            if let Some(groups) = self.groups.as_mut() {
                for (&id, list) in groups.iter_mut() {
                    let ctx = list.info.ctx.take();
                    on_delete(&*world, id, ctx);
                }
            }
        }
        self.unregister_monitors(world);

        let table_ids: Vec<TableId> = self.tables.keys().copied().collect();
        for t in table_ids {
            self.unmatch_table(&*world, t);
        }
        debug_assert!(self.arena.live_count() == 0, "match records leaked");
        debug_assert!(self.list.first.is_none() && self.list.last.is_none());
        self.groups = None;
        self.table_slices.clear();

        if !self.entity.is_null()
            && world.is_alive(self.entity)
            && world.has_id(self.entity, EMPTY.id())
        {
            world.remove_id(self.entity, EMPTY.id());
        }
        debug!("query destroyed");
    }
}

impl World {
    /// Creates a query. With [`CacheKind::Auto`] the query gets a cache that
    /// is populated immediately and maintained through table events.
    pub fn query(&mut self, desc: QueryDesc) -> EcsResult<QueryHandle> {
        if self.finished {
            return Err(EcsError::InvalidOperation("cannot create a query after world shutdown"));
        }
        match desc.cache_kind {
            CacheKind::None => {
                let query = Query::compile(desc.terms)?;
                let index = self.alloc_query_slot();
                let generation = self.queries[index].generation;
                self.queries[index].state = QueryState::Uncached(Box::new(query));
                Ok(QueryHandle { index: index as u32, generation })
            }
            CacheKind::Auto => {
                let index = self.alloc_query_slot();
                let generation = self.queries[index].generation;
                match QueryCache::init(self, desc, index) {
                    Ok(cache) => {
                        self.queries[index].state = QueryState::Cached(cache);
                        self.sync_query_empty_tag(index);
                        self.flush_events();
                        Ok(QueryHandle { index: index as u32, generation })
                    }
                    Err(e) => {
                        self.queries[index].state = QueryState::Vacant;
                        self.queries[index].generation += 1;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Destroys a query and releases everything it owns.
    pub fn query_fini(&mut self, handle: QueryHandle) -> EcsResult<()> {
        let index = handle.index as usize;
        let valid = self.queries.get(index).is_some_and(|slot| {
            slot.generation == handle.generation
                && !matches!(slot.state, QueryState::Vacant | QueryState::InFlight)
        });
        if !valid {
            return Err(EcsError::InvalidParameter("stale query handle"));
        }
        let state = std::mem::replace(&mut self.queries[index].state, QueryState::InFlight);
        if let QueryState::Cached(mut cache) = state {
            cache.fini(self);
        }
        self.queries[index].state = QueryState::Vacant;
        self.queries[index].generation += 1;
        self.flush_events();
        Ok(())
    }

    /// Finalizes every query; later [`World::query`] calls fail.
    pub fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        for index in 0..self.queries.len() {
            let state = std::mem::replace(&mut self.queries[index].state, QueryState::InFlight);
            if let QueryState::Cached(mut cache) = state {
                cache.fini(self);
            }
            self.queries[index].state = QueryState::Vacant;
            self.queries[index].generation += 1;
        }
        debug_assert!(
            self.monitors.is_empty(),
            "monitor registrations must mirror unregistrations"
        );
        self.finished = true;
    }

    pub fn query_iter(&self, handle: QueryHandle) -> CachedIter<'_> {
        match &self.slot(handle).state {
            QueryState::Cached(cache) => CachedIter::for_cache(self, cache),
            QueryState::Uncached(query) => CachedIter::for_uncached(self, query),
            _ => panic!("stale query handle"),
        }
    }

    /// Revalidates matches that depend on state outside their table. Lazy: a
    /// no-op unless the world's monitor generation moved.
    pub fn query_rematch(&mut self, handle: QueryHandle) {
        let mut cache = self.take_cache(handle);
        cache.rematch(&*self);
        self.put_cache(handle, cache);
        self.sync_query_empty_tag(handle.index as usize);
        self.flush_events();
    }

    /// Safe-point maintenance: pending rematch plus sorted-view rebuild.
    pub fn query_update(&mut self, handle: QueryHandle) {
        let mut cache = self.take_cache(handle);
        if cache.has_refs {
            cache.rematch(&*self);
        }
        cache.update_sort(self);
        self.put_cache(handle, cache);
        self.sync_query_empty_tag(handle.index as usize);
        self.flush_events();
    }

    pub fn query_table_count(&self, handle: QueryHandle) -> i32 {
        self.cache_ref(handle).table_count()
    }

    /// Sum of entity counts over all matched tables.
    pub fn query_entity_count(&self, handle: QueryHandle) -> i32 {
        self.cache_ref(handle).entity_count(self)
    }

    pub fn query_group_info(&self, handle: QueryHandle, group_id: u64) -> Option<&GroupInfo> {
        self.cache_ref(handle).group(group_id).map(|list| &list.info)
    }

    pub fn query_group_ctx(&self, handle: QueryHandle, group_id: u64) -> Option<&(dyn Any + Send + Sync)> {
        self.query_group_info(handle, group_id)?.ctx()
    }

    pub fn query_has_trivial_cache(&self, handle: QueryHandle) -> bool {
        match &self.slot(handle).state {
            QueryState::Cached(cache) => cache.trivial,
            _ => false,
        }
    }

    /// The cache's per-table entry, if the table matched.
    pub fn query_cache_table(&self, handle: QueryHandle, table: TableId) -> Option<&TableEntry> {
        self.cache_ref(handle).tables.get(&table)
    }

    /// True when the cache changed since the previous call; with
    /// `detect_changes` also reflects table writes.
    pub fn query_changed(&mut self, handle: QueryHandle) -> bool {
        let mut cache = self.take_cache(handle);
        let changed = cache.check_changed(&*self);
        self.put_cache(handle, cache);
        changed
    }

    fn cache_ref(&self, handle: QueryHandle) -> &QueryCache {
        match &self.slot(handle).state {
            QueryState::Cached(cache) => cache,
            _ => panic!("query handle does not refer to a cached query"),
        }
    }
}
