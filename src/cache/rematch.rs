//! Bulk revalidation.
//!
//! Queries that look beyond their table (up traversal, external sources)
//! cannot be invalidated by table events alone. The world bumps a monitor
//! generation whenever a monitored id is involved in a structural change;
//! rematching rescans the uncached query at most once per generation,
//! reusing existing records in place and dropping whatever is no longer
//! confirmed.

use std::time::Instant;

use tracing::debug;

use crate::cache::arena::MatchId;
use crate::cache::QueryCache;
use crate::engine::table::TableId;
use crate::engine::world::World;
use crate::query::eval;

impl QueryCache {
    pub(crate) fn rematch(&mut self, world: &World) {
        // Trivial caches have no indirect matches to revalidate.
        if self.trivial {
            return;
        }
        if self.monitor_generation == world.monitors.generation {
            return;
        }
        self.monitor_generation = world.monitors.generation;
        self.rematch_count += 1;
        let rematch_count = self.rematch_count;
        let started = Instant::now();

        let table_ids: Vec<TableId> = world.tables_iter().map(|t| t.id()).collect();
        for t in table_ids {
            let results = {
                let table = world.table(t).expect("table vanished during rematch");
                eval::match_table(world, &self.query, table)
            };
            if results.is_empty() {
                continue;
            }

            self.tables.entry(t).or_default().rematch_count = rematch_count;

            let mut current: Option<MatchId> = None;
            for result in &results {
                let reuse = match current {
                    None => self.tables[&t].first,
                    Some(m) => self.arena.node(m).next_match(),
                };
                let m = match reuse {
                    Some(m) => m,
                    None => self.add_table_match(world, t),
                };
                self.set_table_match(world, m, result);

                let fresh = self
                    .group_by
                    .as_ref()
                    .map(|group_by| group_by(world, t, self.group_by_id));
                if let Some(fresh) = fresh {
                    if fresh != self.arena.node(m).group_id {
                        // Group changed; relocate by removing and re-adding.
                        self.remove_node(world, m);
                        self.insert_node(world, m);
                    }
                }
                current = Some(m);
            }

            self.truncate_chain_after(world, t, current);
        }

        let stale: Vec<TableId> = self
            .tables
            .iter()
            .filter(|(_, entry)| entry.rematch_count != rematch_count)
            .map(|(&t, _)| t)
            .collect();
        for t in stale {
            self.unmatch_table(world, t);
        }

        debug!(
            sweep = rematch_count,
            tables = self.tables.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "rematch"
        );
    }

    /// Frees the stale tail of a table's chain, keeping `keep` as the new
    /// chain tail.
    fn truncate_chain_after(&mut self, world: &World, table: TableId, keep: Option<MatchId>) {
        let Some(keep) = keep else { return };
        let Some(tail) = self.arena.node(keep).next_match() else { return };
        self.free_match_chain(world, Some(tail));
        self.arena.node_mut(keep).set_next_match(None);
        self.tables.get_mut(&table).expect("entry vanished mid-rematch").last = Some(keep);
    }
}
