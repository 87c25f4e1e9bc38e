//! Uncached per-table matching.
//!
//! Evaluation binds `$this` to one table and produces every way the table
//! satisfies the terms. Wildcard terms contribute one candidate per matching
//! type index, so a single table can yield several results. Field data is
//! never loaded here; only the shape of the match is reported.

use crate::engine::table::{Table, TableId};
use crate::engine::types::{id_is_wildcard, pair, Entity, Id, WILDCARD};
use crate::engine::world::World;
use crate::query::{Query, Term, TermOper, TermRef, TERM_SELF, TERM_UP};

/// Where one field resolved: the providing table and the type index of the
/// matched id inside it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FieldRecord {
    pub table: TableId,
    pub type_index: u32,
}

/// One way a table satisfies a query.
pub(crate) struct TableMatch {
    pub trs: Box<[Option<FieldRecord>]>,
    pub ids: Box<[Id]>,
    pub sources: Box<[Entity]>,
    pub set_fields: u32,
    pub up_fields: u32,
}

#[derive(Clone, Copy)]
struct Solution {
    id: Id,
    source: Entity,
    tr: Option<FieldRecord>,
    up: bool,
    set: bool,
}

impl Solution {
    fn unset(declared: Id) -> Self {
        Self { id: declared, source: Entity::NULL, tr: None, up: false, set: false }
    }
}

const UP_DEPTH_LIMIT: u32 = 64;

/// Evaluates `query` against one table. Empty result means no match; a query
/// with zero terms never matches.
pub(crate) fn match_table(world: &World, query: &Query, table: &Table) -> Vec<TableMatch> {
    if query.terms.is_empty() {
        return Vec::new();
    }

    let mut per_term: Vec<Vec<Solution>> = Vec::with_capacity(query.terms.len());
    for (i, term) in query.terms.iter().enumerate() {
        let solutions = eval_term(world, table, term, query.ids[i]);
        if solutions.is_empty() {
            return Vec::new();
        }
        per_term.push(solutions);
    }

    let mut total: usize = 1;
    for solutions in &per_term {
        total = total.saturating_mul(solutions.len());
    }
    debug_assert!(total <= 4096, "wildcard product too large");

    let field_count = query.field_count;
    let mut results = Vec::with_capacity(total);
    for combination in 0..total {
        let mut trs = vec![None; field_count].into_boxed_slice();
        let mut ids = vec![Id::NULL; field_count].into_boxed_slice();
        let mut sources = vec![Entity::NULL; field_count].into_boxed_slice();
        let mut set_fields = 0u32;
        let mut up_fields = 0u32;

        let mut k = combination;
        for (i, solutions) in per_term.iter().enumerate() {
            let solution = &solutions[k % solutions.len()];
            k /= solutions.len();
            trs[i] = solution.tr;
            ids[i] = solution.id;
            sources[i] = solution.source;
            if solution.set {
                set_fields |= 1 << i;
            }
            if solution.up {
                up_fields |= 1 << i;
            }
        }
        results.push(TableMatch { trs, ids, sources, set_fields, up_fields });
    }
    results
}

fn eval_term(world: &World, table: &Table, term: &Term, declared: Id) -> Vec<Solution> {
    let found = match &term.src {
        TermRef::This => eval_this(world, table, term, declared),
        TermRef::Entity(src) => eval_fixed(world, *src, term, declared),
        _ => unreachable!("unsupported term refs are rejected at compile time"),
    };

    match term.oper {
        TermOper::And => found,
        TermOper::Not => {
            if found.is_empty() {
                vec![Solution::unset(declared)]
            } else {
                Vec::new()
            }
        }
        TermOper::Optional => {
            if found.is_empty() {
                vec![Solution::unset(declared)]
            } else {
                found
            }
        }
    }
}

fn eval_this(world: &World, table: &Table, term: &Term, declared: Id) -> Vec<Solution> {
    let mut solutions = Vec::new();
    if term.flags & TERM_SELF != 0 {
        let mut start = 0;
        while let Some(ix) = table.search_from(declared, start) {
            solutions.push(Solution {
                id: table.ids()[ix],
                source: Entity::NULL,
                tr: Some(FieldRecord { table: table.id(), type_index: ix as u32 }),
                up: false,
                set: true,
            });
            if !id_is_wildcard(declared) {
                break;
            }
            start = ix + 1;
        }
    }
    if solutions.is_empty() && term.flags & TERM_UP != 0 {
        if let Some(solution) = search_up(world, table, declared, term.trav, 0) {
            solutions.push(solution);
        }
    }
    solutions
}

fn eval_fixed(world: &World, src: Entity, term: &Term, declared: Id) -> Vec<Solution> {
    let Some(table_id) = world.entity_table(src) else { return Vec::new() };
    let Some(table) = world.table(table_id) else { return Vec::new() };

    if term.flags & TERM_SELF != 0 {
        if let Some(ix) = table.search(declared) {
            return vec![Solution {
                id: table.ids()[ix],
                source: src,
                tr: Some(FieldRecord { table: table_id, type_index: ix as u32 }),
                up: false,
                set: true,
            }];
        }
    }
    if term.flags & TERM_UP != 0 {
        if let Some(solution) = search_up(world, table, declared, term.trav, 0) {
            return vec![solution];
        }
    }
    Vec::new()
}

/// Depth-first walk along `pair(trav, *)` targets; returns the first ancestor
/// solution found.
fn search_up(world: &World, table: &Table, pattern: Id, trav: Entity, depth: u32) -> Option<Solution> {
    if depth >= UP_DEPTH_LIMIT {
        debug_assert!(false, "traversal deeper than {UP_DEPTH_LIMIT} levels");
        return None;
    }
    let edge = pair(trav, WILDCARD);
    let mut start = 0;
    while let Some(ix) = table.search_from(edge, start) {
        let object = table.ids()[ix].pair_second_index();
        if let Some(target) = world.live_entity_from_index(object) {
            let target_table = world
                .table(world.entity_table(target)?)
                .expect("live entity without a table");
            if let Some(tix) = target_table.search(pattern) {
                return Some(Solution {
                    id: target_table.ids()[tix],
                    source: target,
                    tr: Some(FieldRecord {
                        table: target_table.id(),
                        type_index: tix as u32,
                    }),
                    up: true,
                    set: true,
                });
            }
            if let Some(solution) = search_up(world, target_table, pattern, trav, depth + 1) {
                return Some(solution);
            }
        }
        start = ix + 1;
    }
    None
}
