//! Deterministic hash-based symbol identity.
//!
//! Every routine, type and field is keyed by a [`SymbolId`]: a 64-bit XXHash
//! of its qualified name, mixed with a per-domain constant so a type and a
//! routine of the same name never collide. Ids are computed, never allocated,
//! so two threads compiling different types agree on the identity of a
//! shared routine without coordinating. The module builder keys bodies by
//! these ids, which is what makes arrival order irrelevant.
//!
//! # Examples
//!
//! ```
//! use kiln_core::SymbolId;
//!
//! let point = SymbolId::for_type("Geometry.Point");
//! assert_eq!(point, SymbolId::for_type("Geometry.Point"));
//!
//! let ctor_a = SymbolId::for_routine(point, ".ctor", &[SymbolId::for_type("int")]);
//! let ctor_b = SymbolId::for_routine(point, ".ctor", &[]);
//! assert_ne!(ctor_a, ctor_b);
//! ```

use std::fmt;
use xxhash_rust::xxh64::xxh64;

/// Domain-specific mixing constants for id computation.
pub mod hash_constants {
    /// Separator constant between an owner and a member name.
    pub const SEP: u64 = 0x4bc94d6bd06053ad;

    /// Domain marker for type ids.
    pub const TYPE: u64 = 0x2fac10b63a6cc57c;

    /// Domain marker for routine ids.
    pub const ROUTINE: u64 = 0x5ea77ffbcdf5f302;

    /// Domain marker for field ids.
    pub const FIELD: u64 = 0x7d3c8b4a92e15f6d;

    /// Domain marker for compiler-synthesized members.
    pub const SYNTHESIZED: u64 = 0x9a7f3d5e2b8c4601;

    /// Parameter position mixing constants, so `(int, bool)` and
    /// `(bool, int)` produce different routine ids.
    pub const PARAM_MARKERS: [u64; 8] = [
        0x9e3779b97f4a7c15,
        0xbf58476d1ce4e5b9,
        0x94d049bb133111eb,
        0xd6e8feb86659fd93,
        0xe7037ed1a0b428db,
        0xc6a4a7935bd1e995,
        0x8648dbbc94d49b8d,
        0xa2b48b2c69e0d657,
    ];
}

use hash_constants::*;

/// A deterministic 64-bit identity for a type, routine or field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct SymbolId(pub u64);

impl SymbolId {
    /// Empty/invalid id.
    pub const EMPTY: SymbolId = SymbolId(0);

    /// Id of a type from its qualified name.
    #[inline]
    pub fn for_type(qualified_name: &str) -> Self {
        SymbolId(TYPE ^ xxh64(qualified_name.as_bytes(), 0))
    }

    /// Id of a routine from its owner, name and parameter type ids.
    pub fn for_routine(owner: SymbolId, name: &str, params: &[SymbolId]) -> Self {
        let mut hash = ROUTINE ^ owner.0.rotate_left(17) ^ SEP ^ xxh64(name.as_bytes(), 0);
        for (position, param) in params.iter().enumerate() {
            let marker = PARAM_MARKERS[position % PARAM_MARKERS.len()];
            hash = hash.wrapping_mul(31) ^ param.0.wrapping_add(marker);
        }
        SymbolId(hash)
    }

    /// Id of a field from its owner and name.
    #[inline]
    pub fn for_field(owner: SymbolId, name: &str) -> Self {
        SymbolId(FIELD ^ owner.0.rotate_left(29) ^ SEP ^ xxh64(name.as_bytes(), 0))
    }

    /// Id of a compiler-synthesized member, unique per owner and ordinal.
    #[inline]
    pub fn for_synthesized(owner: SymbolId, name: &str, ordinal: u32) -> Self {
        SymbolId(
            SYNTHESIZED ^ owner.0.rotate_left(7) ^ xxh64(name.as_bytes(), u64::from(ordinal)),
        )
    }

    /// Whether this is the empty id.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolId(0x{:016x})", self.0)
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_do_not_collide() {
        let owner = SymbolId::for_type("C");
        assert_ne!(SymbolId::for_type("x"), SymbolId::for_field(owner, "x"));
        assert_ne!(
            SymbolId::for_field(owner, "x"),
            SymbolId::for_routine(owner, "x", &[])
        );
    }

    #[test]
    fn parameter_order_matters() {
        let owner = SymbolId::for_type("C");
        let int = SymbolId::for_type("int");
        let boolean = SymbolId::for_type("bool");
        assert_ne!(
            SymbolId::for_routine(owner, "m", &[int, boolean]),
            SymbolId::for_routine(owner, "m", &[boolean, int])
        );
    }

    #[test]
    fn synthesized_ordinals_are_distinct() {
        let owner = SymbolId::for_type("C");
        assert_ne!(
            SymbolId::for_synthesized(owner, "<>b", 0),
            SymbolId::for_synthesized(owner, "<>b", 1)
        );
    }
}
