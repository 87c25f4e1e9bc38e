use std::collections::HashMap;

use crate::engine::types::{id_matches, Id};

/// Refcounted registry of monitored ids and the world generation they gate.
///
/// A monitored entry may be a concrete id or a pair pattern. Any structural
/// change involving a matching id advances the generation; caches compare it
/// against their own observed generation to decide whether to rematch. The
/// counter is deliberately coarse: one bump forces a full rescan for every
/// lagging cache.
#[derive(Default)]
pub(crate) struct Monitors {
    ids: HashMap<Id, u32>,
    pub(crate) generation: u64,
}

impl Monitors {
    pub fn register(&mut self, id: Id) {
        *self.ids.entry(id).or_insert(0) += 1;
    }

    pub fn unregister(&mut self, id: Id) {
        match self.ids.get_mut(&id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.ids.remove(&id);
            }
            None => debug_assert!(false, "unregistering an id that was never monitored"),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Advances the generation if `id` is covered by any monitor.
    pub fn note_structural_change(&mut self, id: Id) {
        let hit = self
            .ids
            .keys()
            .any(|&pattern| id_matches(id, pattern) || pattern == id);
        if hit {
            self.generation += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{pair, Entity, WILDCARD};

    #[test]
    fn pattern_monitor_catches_concrete_change() {
        let rel = Entity::from_parts(9, 0);
        let obj = Entity::from_parts(10, 0);
        let mut monitors = Monitors::default();
        monitors.register(pair(rel, WILDCARD));

        let before = monitors.generation;
        monitors.note_structural_change(pair(rel, obj));
        assert_eq!(monitors.generation, before + 1);

        monitors.note_structural_change(obj.id());
        assert_eq!(monitors.generation, before + 1);

        monitors.unregister(pair(rel, WILDCARD));
        assert!(monitors.is_empty());
    }
}
