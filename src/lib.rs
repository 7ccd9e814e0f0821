#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

pub mod hash;
pub use hash::MaskHash;

pub mod hash_map;
pub use hash_map::{Builder, Error, HashMap, Statistics};

pub mod slab;
pub use slab::{Slab, SlotAllocator};

pub mod sync;

mod exit_guard;

#[cfg(feature = "serde")]
mod serde;
