//! Intrinsic heap object kinds.

mod closure;
mod fields;
mod future;
mod map;
mod pair;
mod rest;
mod seq;
mod string;

pub use closure::ClosureObject;
pub use fields::{FieldPolicy, FieldsObject};
pub use future::FutureObject;
pub use map::{MapIterator, MapObject};
pub use pair::PairObject;
pub use rest::RestObject;
pub use seq::{SeqIterator, SeqObject};
pub use string::{BytesObject, StringObject, UrlObject};

use std::hash::Hash;

/// Process-stable structural hash for `hash_value` implementations.
pub(crate) fn stable_hash(value: impl Hash) -> u64 {
    ahash::RandomState::with_seeds(0x5851_f42d, 0x4c95_7f2d, 0x1405_7b7e, 0xf767_814f)
        .hash_one(value)
}
