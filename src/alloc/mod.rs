//! Record allocators.
//!
//! Fixed-size records live in CPU staging arrays and are mirrored into one
//! device buffer per frame in flight. Device programs index them by slot.
//!
//! - [`BlockAllocator`] - free-list slots with generation-checked handles
//! - [`InternedBlockAllocator`] - one slot per distinct value, reference counted

mod block;
mod interned;

pub use block::{BlockAllocator, SlotHandle};
pub use interned::InternedBlockAllocator;
