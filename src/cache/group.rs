//! Group index and group ordering.

use tracing::trace;

use crate::cache::arena::MatchId;
use crate::cache::list::MatchList;
use crate::cache::QueryCache;
use crate::engine::table::TableId;
use crate::engine::types::{pair, Entity, WILDCARD};
use crate::engine::world::World;

/// Builtin group-by: resolves `rel` as a relationship and returns the object
/// of the first matching pair in the table, or 0.
pub(crate) fn default_group_by(world: &World, table: TableId, rel: Entity) -> u64 {
    let Some(table) = world.table(table) else { return 0 };
    let Some(ix) = table.search(pair(rel, WILDCARD)) else { return 0 };
    match world.pair_second(table.ids()[ix]) {
        Some(object) => object.raw(),
        None => 0,
    }
}

impl QueryCache {
    #[inline]
    pub(crate) fn group(&self, id: u64) -> Option<&MatchList> {
        self.groups.as_ref()?.get(&id)
    }

    #[inline]
    pub(crate) fn group_mut(&mut self, id: u64) -> Option<&mut MatchList> {
        self.groups.as_mut()?.get_mut(&id)
    }

    pub(crate) fn compute_group_id(&mut self, world: &World, m: MatchId) {
        let group_id = match &self.group_by {
            Some(group_by) => {
                let table = self.arena.node(m).table;
                group_by(world, table, self.group_by_id)
            }
            None => 0,
        };
        self.arena.node_mut(m).group_id = group_id;
    }

    pub(crate) fn ensure_group(&mut self, world: &World, id: u64) {
        let groups = self.groups.as_ref().expect("grouping not enabled");
        if groups.contains_key(&id) {
            return;
        }
        let ctx = match &self.on_group_create {
            Some(on_create) => on_create(world, id),
            None => None,
        };
        let mut list = MatchList::default();
        list.info.ctx = ctx;
        self.groups.as_mut().unwrap().insert(id, list);
        trace!(group = id, "group created");
    }

    pub(crate) fn remove_group(&mut self, world: &World, id: u64) {
        let Some(groups) = self.groups.as_mut() else { return };
        if let Some(mut list) = groups.remove(&id) {
            let ctx = list.info.ctx.take();
            if let Some(on_delete) = &self.on_group_delete {
                on_delete(world, id, ctx);
            }
            trace!(group = id, "group deleted");
        }
    }

    /// Last node of the group after which a brand-new group with `group_id`
    /// must be spliced, or `None` when the group belongs at the head.
    ///
    /// "Nearest" uses wrapping distance on the unsigned id, matching the
    /// behavior callers rely on for monotone id schemes.
    pub(crate) fn find_group_insertion_node(&self, group_id: u64) -> Option<MatchId> {
        debug_assert!(self.group_by.is_some());
        let desc = self.group_desc;

        let mut closest: Option<(u64, MatchId)> = None;
        for (&id, list) in self.groups.as_ref().unwrap() {
            if (!desc && id >= group_id) || (desc && id <= group_id) {
                continue;
            }
            let Some(last) = list.last else {
                debug_assert!(list.first.is_none());
                continue;
            };
            let take = match closest {
                None => true,
                Some((closest_id, _)) => {
                    let candidate = group_id.wrapping_sub(id);
                    let current = group_id.wrapping_sub(closest_id);
                    if !desc { candidate < current } else { candidate > current }
                }
            };
            if take {
                closest = Some((id, last));
            }
        }
        closest.map(|(_, last)| last)
    }

    /// Splices the first node of a new group into the global list at the
    /// position that keeps group ids monotone.
    pub(crate) fn link_new_group(&mut self, m: MatchId) {
        let group_id = self.arena.node(m).group_id;
        match self.find_group_insertion_node(group_id) {
            None => {
                // Group becomes the head of the list.
                match self.list.first {
                    Some(head) => {
                        self.arena.node_mut(m).next = Some(head);
                        self.arena.node_mut(head).prev = Some(m);
                        self.list.first = Some(m);
                    }
                    None => {
                        debug_assert!(self.list.last.is_none());
                        self.list.first = Some(m);
                        self.list.last = Some(m);
                    }
                }
            }
            Some(after) => {
                debug_assert!(self.list.first.is_some());
                debug_assert!(self.list.last.is_some());
                let insert_before = self.arena.node(after).next;
                self.arena.node_mut(m).prev = Some(after);
                self.arena.node_mut(after).next = Some(m);
                self.arena.node_mut(m).next = insert_before;
                match insert_before {
                    Some(before) => self.arena.node_mut(before).prev = Some(m),
                    None => {
                        debug_assert!(self.list.last == Some(after));
                        self.list.last = Some(m);
                    }
                }
            }
        }
    }
}
