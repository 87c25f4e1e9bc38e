use std::collections::HashMap;
use std::fmt;

use crate::engine::storage::{Column, ColumnFactory, ColumnStorage};
use crate::engine::types::{id_is_wildcard, id_matches, Entity, Id, IdFilter};

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TableId(pub(crate) u32);

impl TableId {
    pub(crate) const ROOT: TableId = TableId(0);

    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table {}", self.0)
    }
}

/// Contiguous storage for all entities sharing one id set.
///
/// Invariant:
/// - `ids` is sorted and duplicate-free.
/// - `columns` and `dirty[1..]` are parallel to `ids`; every column has
///   exactly `entities.len()` rows.
pub struct Table {
    id: TableId,
    ids: Box<[Id]>,
    entities: Vec<Entity>,
    columns: Box<[Option<Box<dyn ColumnStorage>>]>,
    filter: IdFilter,
    dirty: Box<[u32]>,
}

impl Table {
    pub(crate) fn new(id: TableId, ids: Vec<Id>, registry: &HashMap<Id, ColumnFactory>) -> Self {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]), "table type must be sorted");
        let mut filter = IdFilter::default();
        let columns: Vec<Option<Box<dyn ColumnStorage>>> = ids
            .iter()
            .map(|tid| {
                filter.add_with_patterns(*tid);
                registry.get(tid).map(|factory| factory())
            })
            .collect();
        let dirty = vec![0u32; ids.len() + 1].into_boxed_slice();
        Self {
            id,
            ids: ids.into_boxed_slice(),
            entities: Vec::new(),
            columns: columns.into_boxed_slice(),
            filter,
            dirty,
        }
    }

    #[inline]
    pub fn id(&self) -> TableId {
        self.id
    }

    #[inline]
    pub fn ids(&self) -> &[Id] {
        &self.ids
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    #[inline]
    pub fn filter(&self) -> IdFilter {
        self.filter
    }

    /// Type index of an exact id.
    #[inline]
    pub fn type_index_of(&self, id: Id) -> Option<usize> {
        self.ids.binary_search(&id).ok()
    }

    /// First type index matching `pattern` (wildcards allowed).
    pub fn search(&self, pattern: Id) -> Option<usize> {
        self.search_from(pattern, 0)
    }

    pub fn search_from(&self, pattern: Id, start: usize) -> Option<usize> {
        if !id_is_wildcard(pattern) {
            let ix = self.type_index_of(pattern)?;
            return (ix >= start).then_some(ix);
        }
        self.ids[start..]
            .iter()
            .position(|&id| id_matches(id, pattern))
            .map(|offset| start + offset)
    }

    pub fn has(&self, pattern: Id) -> bool {
        self.search(pattern).is_some()
    }

    #[inline]
    pub(crate) fn column(&self, type_index: usize) -> Option<&dyn ColumnStorage> {
        self.columns.get(type_index)?.as_deref()
    }

    pub fn column_slice<T: 'static>(&self, type_index: usize) -> Option<&[T]> {
        self.column(type_index)?
            .as_any()
            .downcast_ref::<Column<T>>()
            .map(Column::as_slice)
    }

    pub(crate) fn column_downcast_mut<T: 'static>(&mut self, type_index: usize) -> Option<&mut Column<T>> {
        self.columns
            .get_mut(type_index)?
            .as_deref_mut()?
            .as_any_mut()
            .downcast_mut::<Column<T>>()
    }

    /// Per-row structural counter (slot 0) and per-column write counters.
    #[inline]
    pub(crate) fn dirty(&self) -> &[u32] {
        &self.dirty
    }

    #[inline]
    pub(crate) fn bump_column_dirty(&mut self, type_index: usize) {
        self.dirty[type_index + 1] = self.dirty[type_index + 1].wrapping_add(1);
    }

    #[inline]
    fn bump_rows_dirty(&mut self) {
        self.dirty[0] = self.dirty[0].wrapping_add(1);
    }

    pub(crate) fn push_row(&mut self, entity: Entity) -> usize {
        for column in self.columns.iter_mut().flatten() {
            column.push_default();
        }
        self.entities.push(entity);
        self.bump_rows_dirty();
        self.entities.len() - 1
    }

    /// Swap-removes `row`; returns the entity that now occupies it, if any.
    pub(crate) fn swap_remove_row(&mut self, row: usize) -> Option<Entity> {
        debug_assert!(row < self.entities.len());
        for column in self.columns.iter_mut().flatten() {
            column.swap_remove(row);
        }
        self.entities.swap_remove(row);
        self.bump_rows_dirty();
        self.entities.get(row).copied()
    }

    pub(crate) fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for column in self.columns.iter_mut().flatten() {
            column.swap(a, b);
        }
        self.entities.swap(a, b);
        self.bump_rows_dirty();
    }

    /// Moves `row` into `dst`, carrying values for shared columns and
    /// defaulting the rest. Returns the entity moved into `row` here, if any,
    /// and the destination row.
    pub(crate) fn move_row(&mut self, row: usize, dst: &mut Table) -> (Option<Entity>, usize) {
        debug_assert!(row < self.entities.len());
        let entity = self.entities[row];
        let dst_row = dst.entities.len();
        dst.entities.push(entity);

        let mut taken = vec![false; self.ids.len()];
        for (i, id) in dst.ids.iter().enumerate() {
            let Some(dst_column) = dst.columns[i].as_deref_mut() else { continue };
            match self.type_index_of(*id) {
                Some(si) if self.columns[si].is_some() => {
                    self.columns[si].as_deref_mut().unwrap().move_row_to(row, dst_column);
                    taken[si] = true;
                }
                _ => dst_column.push_default(),
            }
        }
        for (si, column) in self.columns.iter_mut().enumerate() {
            if let Some(column) = column.as_deref_mut() {
                if !taken[si] {
                    column.swap_remove(row);
                }
            }
        }
        self.entities.swap_remove(row);
        self.bump_rows_dirty();
        dst.bump_rows_dirty();
        (self.entities.get(row).copied(), dst_row)
    }
}
