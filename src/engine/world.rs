use std::collections::{HashMap, VecDeque};

use tracing::trace;

use crate::cache::QueryCache;
use crate::engine::entity::Entities;
use crate::engine::event::{Observer, TableEvent, TableEventKind};
use crate::engine::monitor::Monitors;
use crate::engine::storage::{make_column, Column, ColumnFactory};
use crate::engine::table::{Table, TableId};
use crate::engine::types::{Entity, Id, BUILTIN_COUNT, CHILD_OF, EMPTY, IS_A, WILDCARD};
use crate::query::Query;

const INVALID_ROW: u32 = u32::MAX;

#[derive(Clone, Copy)]
struct EntityRecord {
    table: TableId,
    row: u32,
}

impl Default for EntityRecord {
    fn default() -> Self {
        Self { table: TableId::ROOT, row: INVALID_ROW }
    }
}

pub(crate) enum QueryState {
    Vacant,
    /// Taken out for a mutating cache operation.
    InFlight,
    Uncached(Box<Query>),
    Cached(Box<QueryCache>),
}

pub(crate) struct QuerySlot {
    pub(crate) generation: u32,
    pub(crate) state: QueryState,
}

/// Handle to a query registered with [`World::query`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct QueryHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// The ECS world: entities, tables, component registry, monitors, observers
/// and registered queries.
///
/// All mutation is single-threaded cooperative; events produced by a
/// structural operation are drained before the operation returns.
pub struct World {
    entities: Entities,
    records: Vec<EntityRecord>,
    tables: Vec<Option<Table>>,
    table_index: HashMap<Box<[Id]>, TableId>,
    components: HashMap<Id, ColumnFactory>,
    pub(crate) monitors: Monitors,
    pub(crate) observers: Vec<Option<Observer>>,
    pub(crate) queries: Vec<QuerySlot>,
    events: VecDeque<TableEvent>,
    event_id: u64,
    flushing: bool,
    pub(crate) finished: bool,
}

impl World {
    pub fn new() -> Self {
        let mut world = Self {
            entities: Entities::new(),
            records: vec![EntityRecord::default()],
            tables: Vec::new(),
            table_index: HashMap::new(),
            components: HashMap::new(),
            monitors: Monitors::default(),
            observers: Vec::new(),
            queries: Vec::new(),
            events: VecDeque::new(),
            event_id: 0,
            flushing: false,
            finished: false,
        };
        let root = Table::new(TableId::ROOT, Vec::new(), &world.components);
        world.tables.push(Some(root));
        world.table_index.insert(Box::from([]), TableId::ROOT);

        let wildcard = world.entity();
        let is_a = world.entity();
        let child_of = world.entity();
        let empty = world.entity();
        debug_assert_eq!(wildcard, WILDCARD);
        debug_assert_eq!(is_a, IS_A);
        debug_assert_eq!(child_of, CHILD_OF);
        debug_assert_eq!(empty, EMPTY);
        debug_assert_eq!(empty.index(), BUILTIN_COUNT);
        world
    }

    // -- entities ---------------------------------------------------------

    /// Spawns an empty entity in the root table.
    pub fn entity(&mut self) -> Entity {
        let entity = self.entities.alloc();
        let index = entity.index() as usize;
        if self.records.len() <= index {
            self.records.resize(index + 1, EntityRecord::default());
        }
        let row = self.table_mut(TableId::ROOT).push_row(entity);
        self.records[index] = EntityRecord { table: TableId::ROOT, row: row as u32 };
        entity
    }

    /// Spawns an entity and registers a typed column for it, making it usable
    /// as a data-carrying component id.
    pub fn component<T: 'static + Send + Sync + Default>(&mut self) -> Entity {
        let entity = self.entity();
        self.components.insert(entity.id(), make_column::<T>);
        entity
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Current handle for a live entity index, if any.
    pub(crate) fn live_entity_from_index(&self, index: u32) -> Option<Entity> {
        let record = self.records.get(index as usize)?;
        if record.row == INVALID_ROW {
            return None;
        }
        let generation = self.entities.generation_of(index)?;
        Some(Entity::from_parts(index, generation))
    }

    pub fn despawn(&mut self, entity: Entity) {
        assert!(self.is_alive(entity), "despawn of a dead entity");
        let record = self.records[entity.index() as usize];
        let table = self.table_mut(record.table);
        let ids: Vec<Id> = table.ids().to_vec();
        let moved = table.swap_remove_row(record.row as usize);
        if let Some(moved) = moved {
            self.records[moved.index() as usize].row = record.row;
        }
        self.records[entity.index() as usize] = EntityRecord::default();
        self.entities.dealloc(entity);
        for id in ids {
            self.monitors.note_structural_change(id);
        }
    }

    // -- ids and values ---------------------------------------------------

    pub fn has_id(&self, entity: Entity, pattern: Id) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        let record = self.records[entity.index() as usize];
        self.table(record.table).is_some_and(|t| t.has(pattern))
    }

    pub fn add_id(&mut self, entity: Entity, id: Id) {
        assert!(self.is_alive(entity), "add_id on a dead entity");
        let record = self.records[entity.index() as usize];
        let ids = {
            let table = self.table_ref(record.table);
            if table.type_index_of(id).is_some() {
                return;
            }
            let mut ids = table.ids().to_vec();
            let pos = ids.binary_search(&id).unwrap_err();
            ids.insert(pos, id);
            ids
        };
        let dst = self.table_ensure(ids);
        self.move_entity(entity, dst);
        self.monitors.note_structural_change(id);
        self.flush_events();
    }

    pub fn remove_id(&mut self, entity: Entity, id: Id) {
        assert!(self.is_alive(entity), "remove_id on a dead entity");
        let record = self.records[entity.index() as usize];
        let ids = {
            let table = self.table_ref(record.table);
            let Some(pos) = table.type_index_of(id) else { return };
            let mut ids = table.ids().to_vec();
            ids.remove(pos);
            ids
        };
        let dst = self.table_ensure(ids);
        self.move_entity(entity, dst);
        self.monitors.note_structural_change(id);
        self.flush_events();
    }

    /// Writes a component value, adding the id first if needed.
    pub fn set<T: 'static + Send + Sync + Default>(&mut self, entity: Entity, component: Entity, value: T) {
        if !self.has_id(entity, component.id()) {
            self.add_id(entity, component.id());
        }
        let record = self.records[entity.index() as usize];
        let table = self.table_mut(record.table);
        let type_index = table
            .type_index_of(component.id())
            .expect("set on an id the entity does not have");
        let column = table
            .column_downcast_mut::<T>(type_index)
            .expect("set on an id without a matching typed column");
        column.set(record.row as usize, value);
        table.bump_column_dirty(type_index);
    }

    pub fn get<T: 'static + Send + Sync + Default>(&self, entity: Entity, component: Entity) -> Option<&T> {
        if !self.is_alive(entity) {
            return None;
        }
        let record = self.records[entity.index() as usize];
        let table = self.table(record.table)?;
        let type_index = table.type_index_of(component.id())?;
        table
            .column(type_index)?
            .as_any()
            .downcast_ref::<Column<T>>()?
            .get(record.row as usize)
    }

    /// Recovers the object entity of a pair id, if it is still alive.
    pub fn pair_second(&self, id: Id) -> Option<Entity> {
        if !id.is_pair() {
            return None;
        }
        self.live_entity_from_index(id.pair_second_index())
    }

    // -- tables -----------------------------------------------------------

    #[inline]
    pub fn table(&self, id: TableId) -> Option<&Table> {
        self.tables.get(id.index() as usize)?.as_ref()
    }

    fn table_ref(&self, id: TableId) -> &Table {
        self.table(id).expect("missing table")
    }

    fn table_mut(&mut self, id: TableId) -> &mut Table {
        self.tables[id.index() as usize]
            .as_mut()
            .expect("missing table")
    }

    pub fn tables_iter(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().flatten()
    }

    pub fn entity_table(&self, entity: Entity) -> Option<TableId> {
        if !self.is_alive(entity) {
            return None;
        }
        Some(self.records[entity.index() as usize].table)
    }

    fn table_ensure(&mut self, ids: Vec<Id>) -> TableId {
        if let Some(&existing) = self.table_index.get(ids.as_slice()) {
            return existing;
        }
        let id = TableId(self.tables.len() as u32);
        let table = Table::new(id, ids.clone(), &self.components);
        self.tables.push(Some(table));
        self.table_index.insert(ids.into_boxed_slice(), id);
        self.emit(TableEventKind::TableCreate, id);
        id
    }

    fn move_entity(&mut self, entity: Entity, dst: TableId) {
        let record = self.records[entity.index() as usize];
        if record.table == dst {
            return;
        }
        let mut src = self.tables[record.table.index() as usize]
            .take()
            .expect("missing source table");
        let (moved, dst_row) = {
            let dst_table = self.tables[dst.index() as usize]
                .as_mut()
                .expect("missing destination table");
            src.move_row(record.row as usize, dst_table)
        };
        self.tables[record.table.index() as usize] = Some(src);
        self.records[entity.index() as usize] = EntityRecord { table: dst, row: dst_row as u32 };
        if let Some(moved) = moved {
            self.records[moved.index() as usize].row = record.row;
        }
    }

    /// Destroys a table, despawning any entities still stored in it.
    pub fn delete_table(&mut self, id: TableId) {
        assert!(id != TableId::ROOT, "cannot delete the root table");
        let Some(table) = self.tables[id.index() as usize].take() else {
            return;
        };
        for &entity in table.entities() {
            self.records[entity.index() as usize] = EntityRecord::default();
            self.entities.dealloc(entity);
        }
        for &tid in table.ids() {
            self.monitors.note_structural_change(tid);
        }
        self.table_index.remove(table.ids());
        self.emit(TableEventKind::TableDelete, id);
        self.flush_events();
    }

    pub(crate) fn entity_row(&self, entity: Entity) -> Option<(TableId, u32)> {
        if !self.is_alive(entity) {
            return None;
        }
        let record = self.records[entity.index() as usize];
        Some((record.table, record.row))
    }

    /// Swaps two rows of a table and fixes the entity records; used by the
    /// cached-query sorter.
    pub(crate) fn table_swap_rows(&mut self, id: TableId, a: usize, b: usize) {
        if a == b {
            return;
        }
        let table = self.table_mut(id);
        table.swap_rows(a, b);
        let ea = table.entities()[a];
        let eb = table.entities()[b];
        self.records[ea.index() as usize].row = a as u32;
        self.records[eb.index() as usize].row = b as u32;
    }

    /// Depth of a table under `rel`, following `pair(rel, *)` targets.
    pub fn relation_depth(&self, rel: Entity, table: TableId) -> i32 {
        let pattern = crate::engine::types::pair(rel, WILDCARD);
        let mut depth = 0;
        let mut current = table;
        let limit = self.tables.len() as i32 + 1;
        loop {
            let Some(t) = self.table(current) else { break };
            let Some(ix) = t.search(pattern) else { break };
            let object = t.ids()[ix].pair_second_index();
            let Some(target) = self.live_entity_from_index(object) else { break };
            current = self.records[target.index() as usize].table;
            depth += 1;
            debug_assert!(depth < limit, "relationship cycle under {rel}");
            if depth >= limit {
                break;
            }
        }
        depth
    }

    // -- events and observers ---------------------------------------------

    pub(crate) fn emit(&mut self, kind: TableEventKind, table: TableId) {
        self.event_id += 1;
        self.events.push_back(TableEvent { kind, table, event_id: self.event_id });
    }

    /// Drains pending table events, dispatching each to interested observers.
    ///
    /// Reentrant calls (from empty-tag updates performed mid-drain) return
    /// immediately; the outer drain picks up whatever they queued.
    pub(crate) fn flush_events(&mut self) {
        if self.flushing {
            return;
        }
        self.flushing = true;
        while let Some(event) = self.events.pop_front() {
            self.dispatch_table_event(event);
        }
        self.flushing = false;
    }

    fn dispatch_table_event(&mut self, event: TableEvent) {
        for index in 0..self.observers.len() {
            let Some(observer) = self.observers[index].as_ref() else { continue };
            if observer.events & event.kind.bit() == 0 {
                continue;
            }
            if observer.last_event_id == Some(event.event_id) {
                continue;
            }
            let query_index = observer.query_index as usize;
            self.observers[index].as_mut().unwrap().last_event_id = Some(event.event_id);

            let state = std::mem::replace(&mut self.queries[query_index].state, QueryState::InFlight);
            let QueryState::Cached(mut cache) = state else {
                self.queries[query_index].state = state;
                continue;
            };
            cache.on_table_event(self, event);
            self.queries[query_index].state = QueryState::Cached(cache);
            self.sync_query_empty_tag(query_index);
        }
    }

    pub(crate) fn observer_init(&mut self, events: u8, query_index: u32) -> u32 {
        let observer = Observer { events, query_index, last_event_id: None };
        for (i, slot) in self.observers.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(observer);
                return i as u32;
            }
        }
        self.observers.push(Some(observer));
        (self.observers.len() - 1) as u32
    }

    pub(crate) fn observer_fini(&mut self, handle: u32) {
        let slot = self
            .observers
            .get_mut(handle as usize)
            .expect("unknown observer handle");
        debug_assert!(slot.is_some(), "observer already removed");
        *slot = None;
    }

    /// Applies a duplicated delivery of `event`; used to exercise observer
    /// dedup without a second world mutation.
    #[cfg(test)]
    pub(crate) fn redeliver(&mut self, event: TableEvent) {
        self.dispatch_table_event(event);
    }

    // -- query slot plumbing ----------------------------------------------

    pub(crate) fn alloc_query_slot(&mut self) -> usize {
        for (i, slot) in self.queries.iter_mut().enumerate() {
            if matches!(slot.state, QueryState::Vacant) {
                slot.state = QueryState::InFlight;
                return i;
            }
        }
        self.queries.push(QuerySlot { generation: 0, state: QueryState::InFlight });
        self.queries.len() - 1
    }

    pub(crate) fn slot(&self, handle: QueryHandle) -> &QuerySlot {
        let slot = self
            .queries
            .get(handle.index as usize)
            .expect("unknown query handle");
        assert!(slot.generation == handle.generation, "stale query handle");
        slot
    }

    pub(crate) fn take_cache(&mut self, handle: QueryHandle) -> Box<QueryCache> {
        let index = handle.index as usize;
        assert!(
            self.queries.get(index).is_some_and(|s| s.generation == handle.generation),
            "stale query handle"
        );
        match std::mem::replace(&mut self.queries[index].state, QueryState::InFlight) {
            QueryState::Cached(cache) => cache,
            other => {
                self.queries[index].state = other;
                panic!("query handle does not refer to a cached query");
            }
        }
    }

    pub(crate) fn put_cache(&mut self, handle: QueryHandle, cache: Box<QueryCache>) {
        let slot = &mut self.queries[handle.index as usize];
        debug_assert!(matches!(slot.state, QueryState::InFlight));
        slot.state = QueryState::Cached(cache);
    }

    /// Mirrors a cache's emptiness onto its query entity via the `EMPTY` tag.
    pub(crate) fn sync_query_empty_tag(&mut self, query_index: usize) {
        let state = match &self.queries[query_index].state {
            QueryState::Cached(cache) => cache.empty_state(),
            _ => None,
        };
        let Some((entity, is_empty)) = state else { return };
        if !self.is_alive(entity) {
            return;
        }
        let tagged = self.has_id(entity, EMPTY.id());
        if is_empty && !tagged {
            trace!(%entity, "query empty");
            self.add_id(entity, EMPTY.id());
        } else if !is_empty && tagged {
            trace!(%entity, "query non-empty");
            self.remove_id(entity, EMPTY.id());
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for World {
    fn drop(&mut self) {
        self.shutdown();
    }
}
