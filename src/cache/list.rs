//! The ordered match list.
//!
//! All active matches form one doubly linked list, threaded through the arena
//! by `MatchId`. When grouping is enabled each group owns a contiguous run of
//! that list, delimited by its own first/last handles; insert and remove keep
//! the global endpoints, the group endpoints and the counters consistent in
//! one pass.

use std::any::Any;

use crate::cache::arena::MatchId;
use crate::cache::QueryCache;
use crate::engine::world::World;
use crate::query::GroupCtx;

/// Counters and user context exposed per group (and for the whole cache).
///
/// `match_count` is a change epoch, not a size: it advances whenever the
/// group's membership changes.
#[derive(Default)]
pub struct GroupInfo {
    pub table_count: i32,
    pub match_count: i32,
    pub(crate) ctx: Option<GroupCtx>,
}

impl GroupInfo {
    pub fn ctx(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.ctx.as_deref()
    }
}

#[derive(Default)]
pub(crate) struct MatchList {
    pub first: Option<MatchId>,
    pub last: Option<MatchId>,
    pub info: GroupInfo,
}

impl QueryCache {
    /// Appends `m` to its sub-list (the global list, or its group's slice,
    /// creating the group lazily).
    pub(crate) fn insert_node(&mut self, world: &World, m: MatchId) {
        {
            let node = self.arena.node(m);
            debug_assert!(node.prev.is_none() && node.next.is_none(), "node already linked");
        }
        self.compute_group_id(world, m);
        let grouped = self.group_by.is_some();
        let group_id = self.arena.node(m).group_id;

        let (list_first, list_last) = if grouped {
            self.ensure_group(world, group_id);
            let group = self.group(group_id).unwrap();
            (group.first, group.last)
        } else {
            (self.list.first, self.list.last)
        };

        if let Some(last) = list_last {
            debug_assert!(self.list.first.is_some());
            debug_assert!(self.list.last.is_some());
            debug_assert!(list_first.is_some());

            let last_next = self.arena.node(last).next;
            {
                let node = self.arena.node_mut(m);
                node.prev = Some(last);
                node.next = last_next;
            }
            self.arena.node_mut(last).next = Some(m);
            if let Some(ln) = last_next {
                self.arena.node_mut(ln).prev = Some(m);
            }

            if grouped {
                self.group_mut(group_id).unwrap().last = Some(m);
                if self.list.last == Some(last) {
                    self.list.last = Some(m);
                }
            } else {
                self.list.last = Some(m);
            }
        } else {
            debug_assert!(list_first.is_none());
            if grouped {
                {
                    let group = self.group_mut(group_id).unwrap();
                    group.first = Some(m);
                    group.last = Some(m);
                }
                self.link_new_group(m);
            } else {
                debug_assert!(self.list.last.is_none());
                self.list.first = Some(m);
                self.list.last = Some(m);
            }
        }

        if grouped {
            let group = self.group_mut(group_id).unwrap();
            group.info.table_count += 1;
            group.info.match_count += 1;
            debug_assert!(group.last == Some(m));
        }
        self.list.info.table_count += 1;
        self.match_count += 1;
        if self.order_by.is_some() {
            self.table_slices.clear();
        }

        debug_assert!(self.arena.node(m).prev != Some(m));
        debug_assert!(self.arena.node(m).next != Some(m));
        debug_assert!(self.list.first.is_some());
        debug_assert!(self.list.last.is_some());
        debug_assert!(self.arena.node(self.list.first.unwrap()).prev.is_none());
        debug_assert!(self.arena.node(self.list.last.unwrap()).next.is_none());
    }

    /// Unlinks `m`, fixing the global endpoints, its group's slice and the
    /// counters; drops the group when this was its last match.
    pub(crate) fn remove_node(&mut self, world: &World, m: MatchId) {
        let (mut prev, mut next, group_id) = {
            let node = self.arena.node(m);
            (node.prev, node.next, node.group_id)
        };
        debug_assert!(prev != Some(m), "self-referential link");
        debug_assert!(next != Some(m), "self-referential link");
        debug_assert!(prev.is_none() || prev != next);

        let grouped = self.group_by.is_some();
        let list_first = if grouped {
            self.group(group_id).map(|list| list.first)
        } else {
            Some(self.list.first)
        };
        if !matches!(list_first, Some(Some(_))) {
            // The owning list holds nothing, so the node cannot be linked.
            debug_assert!(prev.is_none() && next.is_none());
            return;
        }

        debug_assert!(prev.is_some() || self.list.first == Some(m));
        debug_assert!(next.is_some() || self.list.last == Some(m));

        if let Some(p) = prev {
            self.arena.node_mut(p).next = next;
        }
        if let Some(n) = next {
            self.arena.node_mut(n).prev = prev;
        }

        if grouped {
            {
                let group = self.group_mut(group_id).unwrap();
                debug_assert!(group.info.table_count > 0);
                group.info.table_count -= 1;
            }

            if self.list.first == Some(m) {
                debug_assert!(prev.is_none());
                self.list.first = next;
                prev = next;
            }
            if self.list.last == Some(m) {
                debug_assert!(next.is_none());
                self.list.last = prev;
                next = prev;
            }

            debug_assert!(self.list.info.table_count > 0);
            self.list.info.table_count -= 1;
            self.group_mut(group_id).unwrap().info.match_count += 1;

            // Clamp neighbors to this group's slice.
            if prev.is_some_and(|p| self.arena.node(p).group_id != group_id) {
                prev = next;
            }
            if next.is_some_and(|n| self.arena.node(n).group_id != group_id) {
                next = prev;
            }

            let group_empty = (prev.is_none() && next.is_none())
                || prev.is_some_and(|p| self.arena.node(p).group_id != group_id);
            if group_empty {
                self.remove_group(world, group_id);
            } else {
                let group = self.group_mut(group_id).unwrap();
                if group.first == Some(m) {
                    group.first = next;
                }
                if group.last == Some(m) {
                    group.last = prev;
                }
            }
        } else {
            debug_assert!(self.list.info.table_count > 0);
            self.list.info.table_count -= 1;
            if self.list.first == Some(m) {
                self.list.first = next;
            }
            if self.list.last == Some(m) {
                self.list.last = prev;
            }
        }

        {
            let node = self.arena.node_mut(m);
            node.prev = None;
            node.next = None;
        }
        self.match_count += 1;
        if self.order_by.is_some() {
            self.table_slices.clear();
        }
    }
}
