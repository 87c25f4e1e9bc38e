//! Query descriptions and the uncached matcher.
//!
//! A [`QueryDesc`] is a data-only description assembled with builder calls:
//! which ids must be present or absent, where each term is resolved (`$this`,
//! a fixed entity, or up a relationship), and how the cached view should be
//! grouped or ordered. [`Query::compile`] turns the terms into the immutable
//! representation the evaluator and the cache work from.

pub mod eval;

use std::any::Any;
use std::cmp::Ordering;

use crate::engine::error::{EcsError, EcsResult};
use crate::engine::table::TableId;
use crate::engine::types::{id_is_wildcard, pair, Entity, Id, IdFilter, IS_A, WILDCARD, WILDCARD_INDEX};
use crate::engine::world::World;

/// Term resolves on the matched table itself.
pub const TERM_SELF: u8 = 1 << 0;
/// Term may resolve on an ancestor reached through `trav` pairs.
pub const TERM_UP: u8 = 1 << 1;
/// Term requests breadth-first iteration order along `trav`.
pub const TERM_CASCADE: u8 = 1 << 2;
/// Cascade walks groups in descending id order.
pub const TERM_DESC: u8 = 1 << 3;

pub const MAX_TERMS: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TermOper {
    #[default]
    And,
    Not,
    Optional,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TermInOut {
    #[default]
    Default,
    In,
    Out,
    /// Filter terms are matched but never loaded; unsupported by caches.
    Filter,
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub enum TermRef {
    #[default]
    None,
    This,
    Entity(Entity),
    Var(String),
}

/// One constraint of a query.
#[derive(Clone, Debug)]
pub struct Term {
    pub first: TermRef,
    pub second: TermRef,
    pub src: TermRef,
    pub trav: Entity,
    pub oper: TermOper,
    pub inout: TermInOut,
    pub flags: u8,
}

impl Default for Term {
    fn default() -> Self {
        Self {
            first: TermRef::None,
            second: TermRef::None,
            src: TermRef::This,
            trav: Entity::NULL,
            oper: TermOper::And,
            inout: TermInOut::Default,
            flags: TERM_SELF,
        }
    }
}

impl Term {
    pub fn new(component: Entity) -> Self {
        Self { first: TermRef::Entity(component), ..Default::default() }
    }

    pub fn new_pair(rel: Entity, obj: Entity) -> Self {
        Self {
            first: TermRef::Entity(rel),
            second: TermRef::Entity(obj),
            ..Default::default()
        }
    }

    pub fn src(mut self, entity: Entity) -> Self {
        self.src = TermRef::Entity(entity);
        self
    }

    pub fn src_var(mut self, name: &str) -> Self {
        self.src = TermRef::Var(name.to_string());
        self
    }

    /// Resolve on ancestors only, reached through `rel`.
    pub fn up(mut self, rel: Entity) -> Self {
        self.flags = (self.flags & !TERM_SELF) | TERM_UP;
        self.trav = rel;
        self
    }

    /// Resolve on the table itself, then on ancestors through `rel`.
    pub fn self_up(mut self, rel: Entity) -> Self {
        self.flags |= TERM_SELF | TERM_UP;
        self.trav = rel;
        self
    }

    /// Request breadth-first order along `rel`. Cascade terms are optional so
    /// roots still match.
    pub fn cascade(mut self, rel: Entity) -> Self {
        self.flags = (self.flags & !TERM_SELF) | TERM_UP | TERM_CASCADE;
        self.trav = rel;
        self
    }

    pub fn desc(mut self) -> Self {
        self.flags |= TERM_DESC;
        self
    }

    pub fn not(mut self) -> Self {
        self.oper = TermOper::Not;
        self
    }

    pub fn optional(mut self) -> Self {
        self.oper = TermOper::Optional;
        self
    }

    pub fn read(mut self) -> Self {
        self.inout = TermInOut::In;
        self
    }

    pub fn write(mut self) -> Self {
        self.inout = TermInOut::Out;
        self
    }

    pub fn filter(mut self) -> Self {
        self.inout = TermInOut::Filter;
        self
    }

    #[inline]
    pub(crate) fn match_this(&self) -> bool {
        matches!(self.src, TermRef::This)
    }

    pub(crate) fn id(&self) -> EcsResult<Id> {
        let first = match &self.first {
            TermRef::Entity(e) => *e,
            TermRef::None => return Err(EcsError::InvalidParameter("term has no id")),
            _ => return Err(EcsError::Unsupported("named variables are not supported")),
        };
        match &self.second {
            TermRef::None => Ok(first.id()),
            TermRef::Entity(obj) => Ok(pair(first, *obj)),
            _ => Err(EcsError::Unsupported("named variables are not supported")),
        }
    }
}

pub type GroupByFn = Box<dyn Fn(&World, TableId, Entity) -> u64 + Send + Sync>;
pub type GroupCtx = Box<dyn Any + Send + Sync>;
pub type GroupCreateFn = Box<dyn Fn(&World, u64) -> Option<GroupCtx> + Send + Sync>;
pub type GroupDeleteFn = Box<dyn Fn(&World, u64, Option<GroupCtx>) + Send + Sync>;
pub type OrderByFn = Box<dyn Fn(Entity, &dyn Any, Entity, &dyn Any) -> Ordering + Send + Sync>;
/// Per-table pre-sort hook; returns the row permutation to apply.
pub type SortTableFn = Box<dyn Fn(&World, TableId, usize) -> Vec<u32> + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum CacheKind {
    /// Build and maintain a cache for the query.
    #[default]
    Auto,
    /// Evaluate the query on demand without a cache.
    None,
}

/// Query description consumed by [`World::query`].
#[derive(Default)]
pub struct QueryDesc {
    pub(crate) terms: Vec<Term>,
    pub(crate) cache_kind: CacheKind,
    pub(crate) match_empty_tables: bool,
    pub(crate) detect_changes: bool,
    pub(crate) group_by_id: Entity,
    pub(crate) group_by: Option<GroupByFn>,
    pub(crate) on_group_create: Option<GroupCreateFn>,
    pub(crate) on_group_delete: Option<GroupDeleteFn>,
    pub(crate) order_by_id: Entity,
    pub(crate) order_by: Option<OrderByFn>,
    pub(crate) order_by_table: Option<SortTableFn>,
    pub(crate) entity: Entity,
}

impl QueryDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(mut self, term: Term) -> Self {
        self.terms.push(term);
        self
    }

    pub fn with(self, component: Entity) -> Self {
        self.term(Term::new(component))
    }

    pub fn with_pair(self, rel: Entity, obj: Entity) -> Self {
        self.term(Term::new_pair(rel, obj))
    }

    pub fn without(self, component: Entity) -> Self {
        self.term(Term::new(component).not())
    }

    pub fn optional(self, component: Entity) -> Self {
        self.term(Term::new(component).optional())
    }

    pub fn cache_kind(mut self, kind: CacheKind) -> Self {
        self.cache_kind = kind;
        self
    }

    pub fn match_empty_tables(mut self, yes: bool) -> Self {
        self.match_empty_tables = yes;
        self
    }

    pub fn detect_changes(mut self, yes: bool) -> Self {
        self.detect_changes = yes;
        self
    }

    /// Group matches by the object of `rel` pairs, using the builtin
    /// resolver.
    pub fn group_by(mut self, rel: Entity) -> Self {
        self.group_by_id = rel;
        self
    }

    pub fn group_by_fn<F>(mut self, id: Entity, f: F) -> Self
    where
        F: Fn(&World, TableId, Entity) -> u64 + Send + Sync + 'static,
    {
        self.group_by_id = id;
        self.group_by = Some(Box::new(f));
        self
    }

    pub fn on_group_create<F>(mut self, f: F) -> Self
    where
        F: Fn(&World, u64) -> Option<GroupCtx> + Send + Sync + 'static,
    {
        self.on_group_create = Some(Box::new(f));
        self
    }

    pub fn on_group_delete<F>(mut self, f: F) -> Self
    where
        F: Fn(&World, u64, Option<GroupCtx>) + Send + Sync + 'static,
    {
        self.on_group_delete = Some(Box::new(f));
        self
    }

    pub fn order_by<F>(mut self, component: Entity, cmp: F) -> Self
    where
        F: Fn(Entity, &dyn Any, Entity, &dyn Any) -> Ordering + Send + Sync + 'static,
    {
        self.order_by_id = component;
        self.order_by = Some(Box::new(cmp));
        self
    }

    pub fn order_by_table<F>(mut self, f: F) -> Self
    where
        F: Fn(&World, TableId, usize) -> Vec<u32> + Send + Sync + 'static,
    {
        self.order_by_table = Some(Box::new(f));
        self
    }

    /// Entity representing this query in the world; tagged `EMPTY` while the
    /// cache has no matches.
    pub fn entity(mut self, entity: Entity) -> Self {
        self.entity = entity;
        self
    }
}

/// Compiled, immutable query shared by the evaluator and the cache.
pub struct Query {
    pub(crate) terms: Box<[Term]>,
    /// Declared per-field ids; fields map 1:1 onto terms.
    pub(crate) ids: Box<[Id]>,
    pub(crate) field_count: usize,
    pub(crate) filter: IdFilter,
}

impl Query {
    pub(crate) fn compile(mut terms: Vec<Term>) -> EcsResult<Query> {
        if terms.len() > MAX_TERMS {
            return Err(EcsError::InvalidParameter("query has too many terms"));
        }
        let mut ids = Vec::with_capacity(terms.len());
        let mut filter = IdFilter::default();
        for term in &mut terms {
            if matches!(term.src, TermRef::Var(_)) {
                return Err(EcsError::Unsupported("named variables are not supported"));
            }
            if matches!(term.src, TermRef::None) {
                term.src = TermRef::This;
            }
            if term.flags & TERM_UP != 0 && term.trav.is_null() {
                term.trav = IS_A;
            }
            if term.flags & TERM_CASCADE != 0 {
                // Cascade must also match roots, which have nothing to
                // traverse to.
                term.oper = TermOper::Optional;
            }
            let id = term.id()?;
            ids.push(id);

            let self_only_and = term.oper == TermOper::And
                && term.match_this()
                && term.flags & TERM_SELF != 0;
            // Fully wild patterns have no stable bit in table filters.
            let filterable = id != WILDCARD.id()
                && !(id.is_pair()
                    && id.pair_first_index() == WILDCARD_INDEX
                    && id.pair_second_index() == WILDCARD_INDEX);
            if self_only_and && filterable {
                filter.add(id);
            }
        }
        let field_count = terms.len();
        Ok(Query {
            terms: terms.into_boxed_slice(),
            ids: ids.into_boxed_slice(),
            field_count,
            filter,
        })
    }

    #[inline]
    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    #[inline]
    pub fn field_count(&self) -> usize {
        self.field_count
    }

    #[inline]
    pub(crate) fn filter(&self) -> &IdFilter {
        &self.filter
    }

    pub(crate) fn matches_wildcards(&self) -> bool {
        self.ids.iter().any(|&id| id_is_wildcard(id))
    }
}
