//! Event-driven incremental maintenance.
//!
//! The cache reacts to exactly two table lifecycle events. Creation runs the
//! matcher on the affected table only; deletion frees the table's chain if
//! the cache knows it. Duplicate deliveries are filtered upstream by the
//! observer's last-seen event id.

use tracing::trace;

use crate::cache::QueryCache;
use crate::engine::event::{TableEvent, TableEventKind};
use crate::engine::table::TableId;
use crate::engine::world::World;
use crate::query::eval;

impl QueryCache {
    pub(crate) fn on_table_event(&mut self, world: &World, event: TableEvent) {
        match event.kind {
            TableEventKind::TableCreate => {
                if self.match_table(world, event.table) {
                    trace!(table = %event.table, "cache matched created table");
                }
            }
            TableEventKind::TableDelete => {
                if self.tables.contains_key(&event.table) {
                    trace!(table = %event.table, "cache dropped deleted table");
                    self.unmatch_table(world, event.table);
                }
            }
        }
    }

    /// Matches a single table, inserting an entry and one record per result.
    ///
    /// Release builds short-circuit through the table's id filter; debug
    /// builds skip the filter and instead verify it would not have rejected a
    /// matching table.
    pub(crate) fn match_table(&mut self, world: &World, table_id: TableId) -> bool {
        let Some(table) = world.table(table_id) else {
            return false;
        };
        if !cfg!(debug_assertions) && !table.filter().contains_all(self.query.filter()) {
            return false;
        }

        let results = eval::match_table(world, &self.query, table);
        if results.is_empty() {
            return false;
        }
        debug_assert!(
            table.filter().contains_all(self.query.filter()),
            "id filter rejected a matching table"
        );

        debug_assert!(!self.tables.contains_key(&table_id), "table matched twice");
        self.tables.insert(table_id, super::TableEntry::default());
        for result in &results {
            let m = self.add_table_match(world, table_id);
            self.set_table_match(world, m, result);
        }
        true
    }
}
