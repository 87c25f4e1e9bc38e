use std::fmt;

pub type Bits = u8;

pub const INDEX_BITS: Bits = 32;
pub const GENERATION_BITS: Bits = 16;

const _: [(); 1] = [(); ((INDEX_BITS as u32 + GENERATION_BITS as u32) < 64) as usize];

const fn mask(bits: Bits) -> u64 {
    if bits == 0 { 0 } else { (1u64 << bits) - 1 }
}

pub const INDEX_MASK: u64 = mask(INDEX_BITS);
pub const GENERATION_MASK: u64 = mask(GENERATION_BITS);

/// High bit marks an id as a (relationship, object) pair.
pub const PAIR_FLAG: u64 = 1u64 << 63;

/// Entity handle: index in the low 32 bits, generation above it.
///
/// The generation is bumped on despawn so stale handles never alias a
/// recycled index.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct Entity(u64);

impl Entity {
    pub const NULL: Entity = Entity(0);

    #[inline]
    pub const fn from_parts(index: u32, generation: u16) -> Self {
        Entity(((generation as u64) << INDEX_BITS) | index as u64)
    }

    #[inline] pub const fn index(self) -> u32 { (self.0 & INDEX_MASK) as u32 }
    #[inline] pub const fn generation(self) -> u16 { ((self.0 >> INDEX_BITS) & GENERATION_MASK) as u16 }
    #[inline] pub const fn is_null(self) -> bool { self.0 == 0 }
    #[inline] pub const fn raw(self) -> u64 { self.0 }

    /// The entity used as a component/tag id.
    #[inline]
    pub const fn id(self) -> Id { Id(self.0) }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index(), self.generation())
    }
}

/// Component id: either an entity id or a packed pair.
///
/// Pairs strip entity generations; the relationship index sits in bits
/// 32..63, the object index in the low word.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct Id(u64);

impl Id {
    pub const NULL: Id = Id(0);

    #[inline] pub const fn raw(self) -> u64 { self.0 }
    #[inline] pub const fn is_null(self) -> bool { self.0 == 0 }
    #[inline] pub const fn is_pair(self) -> bool { self.0 & PAIR_FLAG != 0 }

    #[inline]
    pub const fn pair_first_index(self) -> u32 {
        ((self.0 & !PAIR_FLAG) >> INDEX_BITS) as u32
    }

    #[inline]
    pub const fn pair_second_index(self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }

    #[inline]
    pub(crate) const fn pair_from_indexes(first: u32, second: u32) -> Id {
        Id(PAIR_FLAG | ((first as u64) << INDEX_BITS) | second as u64)
    }
}

/// Builds a pair id from a relationship and an object entity.
#[inline]
pub const fn pair(rel: Entity, obj: Entity) -> Id {
    Id::pair_from_indexes(rel.index(), obj.index())
}

/// Matches any id, or any pair part when used inside a pair.
pub const WILDCARD: Entity = Entity::from_parts(1, 0);
/// Builtin inheritance relationship.
pub const IS_A: Entity = Entity::from_parts(2, 0);
/// Builtin hierarchy relationship.
pub const CHILD_OF: Entity = Entity::from_parts(3, 0);
/// Tag carried by a query entity while its cache has no matches.
pub const EMPTY: Entity = Entity::from_parts(4, 0);

pub(crate) const WILDCARD_INDEX: u32 = 1;
pub(crate) const BUILTIN_COUNT: u32 = 4;

/// Returns true if `id` satisfies `pattern`, where `pattern` may be the bare
/// wildcard or a pair with wildcard parts.
#[inline]
pub fn id_matches(id: Id, pattern: Id) -> bool {
    if pattern == WILDCARD.id() {
        return true;
    }
    match (id.is_pair(), pattern.is_pair()) {
        (true, true) => {
            let pf = pattern.pair_first_index();
            let ps = pattern.pair_second_index();
            (pf == WILDCARD_INDEX || pf == id.pair_first_index())
                && (ps == WILDCARD_INDEX || ps == id.pair_second_index())
        }
        (false, false) => id == pattern,
        _ => false,
    }
}

#[inline]
pub fn id_is_wildcard(id: Id) -> bool {
    id == WILDCARD.id()
        || (id.is_pair()
            && (id.pair_first_index() == WILDCARD_INDEX
                || id.pair_second_index() == WILDCARD_INDEX))
}

/// Advisory 64-bit filter over a set of ids.
///
/// `contains_all` may report false positives, never false negatives; callers
/// must not rely on it for correctness.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct IdFilter(u64);

impl IdFilter {
    #[inline]
    pub fn add(&mut self, id: Id) {
        self.0 |= 1u64 << (id.raw() % 64);
    }

    /// Adds a table id plus the pair patterns a query could probe it with.
    pub fn add_with_patterns(&mut self, id: Id) {
        self.add(id);
        if id.is_pair() {
            self.add(Id::pair_from_indexes(id.pair_first_index(), WILDCARD_INDEX));
            self.add(Id::pair_from_indexes(WILDCARD_INDEX, id.pair_second_index()));
        }
    }

    #[inline]
    pub fn contains_all(&self, required: &IdFilter) -> bool {
        self.0 & required.0 == required.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}
