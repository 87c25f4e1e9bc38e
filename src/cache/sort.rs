//! Sorted view: order_by validation, in-place table sorting and the slice
//! merge that flattens matched tables into one globally ordered sequence.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashMap;

use rayon::prelude::*;

use crate::cache::arena::MatchId;
use crate::cache::QueryCache;
use crate::engine::error::{EcsError, EcsResult};
use crate::engine::table::TableId;
use crate::engine::types::{id_is_wildcard, Entity};
use crate::engine::world::World;
use crate::query::{OrderByFn, SortTableFn, TermOper};

/// Tables below this row count sort on the calling thread.
const PAR_SORT_THRESHOLD: usize = 4096;

pub(crate) struct OrderBy {
    pub id: Entity,
    pub term_index: usize,
    pub cmp: OrderByFn,
    pub table_sort: Option<SortTableFn>,
    /// Dirty snapshot per table at its last sort; unchanged tables skip
    /// resorting.
    sorted_dirty: HashMap<TableId, u32>,
}

/// Contiguous run of already-ordered rows inside one matched table.
#[derive(Clone, Copy)]
pub struct TableSlice {
    pub(crate) match_id: MatchId,
    pub(crate) offset: u32,
    pub(crate) count: u32,
}

impl QueryCache {
    pub(crate) fn configure_order_by(
        &mut self,
        world: &mut World,
        id: Entity,
        cmp: OrderByFn,
        table_sort: Option<SortTableFn>,
    ) -> EcsResult<()> {
        if id.is_null() {
            return Err(EcsError::InvalidParameter("order_by requires a component id"));
        }
        if id_is_wildcard(id.id()) {
            return Err(EcsError::InvalidParameter("order_by id cannot be a wildcard"));
        }
        let term_index = self
            .query
            .terms
            .iter()
            .enumerate()
            .position(|(i, term)| {
                term.oper == TermOper::And && self.query.ids[i] == id.id()
            })
            .ok_or(EcsError::InvalidParameter("order_by component is not queried for"))?;

        self.order_by = Some(OrderBy {
            id,
            term_index,
            cmp,
            table_sort,
            sorted_dirty: HashMap::new(),
        });
        self.update_sort(world);
        Ok(())
    }

    /// Rebuilds the sorted view when the cache or any sorted table changed.
    pub(crate) fn update_sort(&mut self, world: &mut World) {
        if self.order_by.is_none() {
            return;
        }
        let resorted = self.sort_tables(world);
        let moved = self.match_count as i64 != self.prev_match_count;
        if resorted || moved || self.table_slices.is_empty() {
            self.build_sorted_tables(world);
            self.prev_match_count = self.match_count as i64;
        }
    }

    /// Physically sorts every matched table whose order-by column changed
    /// since its last sort. Returns true if any table was reordered.
    fn sort_tables(&mut self, world: &mut World) -> bool {
        let order_by = self.order_by.as_ref().expect("sorting without order_by");
        let term_index = order_by.term_index;

        let mut jobs: Vec<(TableId, usize)> = Vec::new();
        for (&t, entry) in &self.tables {
            let Some(first) = entry.first else { continue };
            let node = self.arena.node(first);
            // A field resolved through traversal shares one value for every
            // row; the table has nothing to sort on.
            if node
                .full()
                .map_or(false, |full| full.up_fields & (1 << term_index) != 0)
            {
                continue;
            }
            if node
                .full()
                .map_or(false, |full| {
                    !full.sources.as_slice(&self.sources_zero)[term_index].is_null()
                })
            {
                continue;
            }
            let Some(tr) = node.trs[term_index] else { continue };
            if tr.table != t {
                continue;
            }
            let Some(table) = world.table(t) else { continue };
            if table.count() == 0 {
                continue;
            }
            let column_slot = tr.type_index as usize;
            let dirty = table.dirty()[0].wrapping_add(table.dirty()[column_slot + 1]);
            if order_by.sorted_dirty.get(&t) == Some(&dirty) {
                continue;
            }
            jobs.push((t, column_slot));
        }

        let resorted = !jobs.is_empty();
        for (t, column_slot) in jobs {
            if world.table(t).map_or(0, |table| table.count()) > 1 {
                self.sort_table(world, t, column_slot);
            }
            let table = world.table(t).expect("table vanished during sort");
            let dirty = table.dirty()[0].wrapping_add(table.dirty()[column_slot + 1]);
            self.order_by
                .as_mut()
                .unwrap()
                .sorted_dirty
                .insert(t, dirty);
        }
        resorted
    }

    fn sort_table(&mut self, world: &mut World, t: TableId, column_slot: usize) {
        let permutation: Vec<u32> = {
            let order_by = self.order_by.as_ref().unwrap();
            match &order_by.table_sort {
                Some(table_sort) => table_sort(&*world, t, column_slot),
                None => {
                    let table = world.table(t).expect("missing table during sort");
                    let column = table
                        .column(column_slot)
                        .expect("order_by component has no column");
                    let entities = table.entities();
                    let cmp = &order_by.cmp;
                    let by = |a: &u32, b: &u32| {
                        cmp(
                            entities[*a as usize],
                            column.value_any(*a as usize),
                            entities[*b as usize],
                            column.value_any(*b as usize),
                        )
                    };
                    let mut permutation: Vec<u32> = (0..entities.len() as u32).collect();
                    if entities.len() >= PAR_SORT_THRESHOLD {
                        permutation.par_sort_by(|a, b| by(a, b));
                    } else {
                        permutation.sort_by(|a, b| by(a, b));
                    }
                    permutation
                }
            }
        };
        debug_assert_eq!(
            permutation.len(),
            world.table(t).map_or(0, |table| table.count()),
            "table sort permutation has the wrong length"
        );
        apply_permutation(world, t, permutation);
    }

    /// Merges the sorted tables into slices: walk all table cursors, always
    /// taking the least element, starting a new slice whenever the winning
    /// table changes.
    pub(crate) fn build_sorted_tables(&mut self, world: &World) {
        self.table_slices.clear();

        struct Cursor {
            m: MatchId,
            table: TableId,
            row: u32,
            count: u32,
        }

        let mut cursors: Vec<Cursor> = Vec::new();
        for (&t, entry) in &self.tables {
            let Some(first) = entry.first else { continue };
            let Some(table) = world.table(t) else { continue };
            if table.count() == 0 {
                continue;
            }
            cursors.push(Cursor { m: first, table: t, row: 0, count: table.count() as u32 });
        }
        cursors.sort_by_key(|cursor| cursor.table);

        while !cursors.is_empty() {
            let mut best = 0;
            for i in 1..cursors.len() {
                let (entity_i, value_i) = self.sort_value(world, cursors[i].m, cursors[i].row);
                let (entity_b, value_b) = self.sort_value(world, cursors[best].m, cursors[best].row);
                let cmp = &self.order_by.as_ref().unwrap().cmp;
                if cmp(entity_i, value_i, entity_b, value_b) == Ordering::Less {
                    best = i;
                }
            }

            let cursor = &mut cursors[best];
            let extend = self
                .table_slices
                .last()
                .map_or(false, |slice| {
                    slice.match_id == cursor.m && slice.offset + slice.count == cursor.row
                });
            if extend {
                self.table_slices.last_mut().unwrap().count += 1;
            } else {
                self.table_slices.push(TableSlice { match_id: cursor.m, offset: cursor.row, count: 1 });
            }
            cursor.row += 1;
            if cursor.row >= cursor.count {
                cursors.swap_remove(best);
            }
        }
    }

    /// Entity and order-by value at `row` of a match's table. A field
    /// resolved on an external source yields the source's single value.
    fn sort_value<'w>(&self, world: &'w World, m: MatchId, row: u32) -> (Entity, &'w dyn Any) {
        let node = self.arena.node(m);
        let term_index = self.order_by.as_ref().unwrap().term_index;
        let tr = node.trs[term_index].expect("order_by field is unset");
        let table = world.table(node.table).expect("missing table in sorted view");
        let entity = table.entities()[row as usize];

        let source = node
            .full()
            .map_or(Entity::NULL, |full| full.sources.as_slice(&self.sources_zero)[term_index]);
        if source.is_null() {
            debug_assert_eq!(tr.table, node.table);
            let column = table
                .column(tr.type_index as usize)
                .expect("order_by component has no column");
            (entity, column.value_any(row as usize))
        } else {
            let provider = world.table(tr.table).expect("missing provider table");
            let (provider_table, provider_row) =
                world.entity_row(source).expect("dead order_by source");
            debug_assert_eq!(provider_table, tr.table, "stale field record; rematch required");
            let column = provider
                .column(tr.type_index as usize)
                .expect("order_by component has no column on provider");
            (entity, column.value_any(provider_row as usize))
        }
    }
}

/// Applies a row permutation with in-place swaps; `permutation[dest]` names
/// the original row that must land at `dest`.
fn apply_permutation(world: &mut World, t: TableId, permutation: Vec<u32>) {
    let n = permutation.len();
    // Current row of each original index, and the original index at each row.
    let mut position: Vec<u32> = (0..n as u32).collect();
    let mut occupant: Vec<u32> = (0..n as u32).collect();
    for dest in 0..n {
        let want = permutation[dest] as usize;
        let at = position[want] as usize;
        if at != dest {
            world.table_swap_rows(t, dest, at);
            let displaced = occupant[dest] as usize;
            occupant.swap(dest, at);
            position[want] = dest as u32;
            position[displaced] = at as u32;
        }
    }
}
