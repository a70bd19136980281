//! Position counters over a shared counters region.
//!
//! Counter values live in a flat region of 64-byte cells, one value per
//! cache line so independent counters never share a line. A [`Position`] is
//! the owner-side handle (release stores), a [`PositionReader`] the
//! observer side (acquire loads). Allocation is conductor-only; the handles
//! themselves are freely copyable across threads.

use crate::buffer::{AtomicBuffer, CACHE_LINE_LENGTH};

/// Stride of one counter cell in the values region.
pub const COUNTER_LENGTH: usize = CACHE_LINE_LENGTH;

/// Offset of the value within its cell (the rest of the line is padding).
const VALUE_OFFSET: i32 = 0;

/// Allocator over a counters values region. Single-threaded (conductor).
#[cfg(any(test, feature = "alloc"))]
pub struct Counters {
    values: AtomicBuffer,
    in_use: alloc::vec::Vec<bool>,
}

#[cfg(any(test, feature = "alloc"))]
impl Counters {
    /// Wrap a values region. Capacity is `values.capacity() / 64` counters.
    pub fn new(values: AtomicBuffer) -> Self {
        let capacity = values.capacity() / COUNTER_LENGTH;
        Self {
            values,
            in_use: alloc::vec![false; capacity],
        }
    }

    /// Number of counter ids this region can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.in_use.len()
    }

    /// Allocate a counter id with its value zeroed.
    ///
    /// Returns `None` when the region is exhausted.
    pub fn allocate(&mut self) -> Option<i32> {
        let id = self.in_use.iter().position(|used| !used)?;
        self.in_use[id] = true;
        let position = self.position(id as i32);
        position.set(0);
        Some(id as i32)
    }

    /// Return a counter id to the free pool.
    ///
    /// The cell is zeroed so a stale value can never leak into the next
    /// owner's first read.
    pub fn free(&mut self, id: i32) {
        let slot = &mut self.in_use[id as usize];
        assert!(*slot, "double free of counter id {id}");
        *slot = false;
        self.position(id).set_release(0);
    }

    /// Owner-side handle for `id`.
    pub fn position(&self, id: i32) -> Position {
        Position::new(self.values, id)
    }

    /// Observer-side handle for `id`.
    pub fn reader(&self, id: i32) -> PositionReader {
        PositionReader::new(self.values, id)
    }
}

#[inline]
fn value_offset(id: i32) -> i32 {
    id * COUNTER_LENGTH as i32 + VALUE_OFFSET
}

/// Owner-side handle over one counter cell.
///
/// The owner publishes with release stores; `get_and_add` serves counters
/// that are bumped rather than set.
#[derive(Clone, Copy)]
pub struct Position {
    values: AtomicBuffer,
    id: i32,
}

impl Position {
    /// Wrap cell `id` of a values region.
    pub fn new(values: AtomicBuffer, id: i32) -> Self {
        assert!(id >= 0, "counter id must be non-negative");
        assert!(
            (id as usize + 1) * COUNTER_LENGTH <= values.capacity(),
            "counter id {id} out of range"
        );
        Self { values, id }
    }

    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Plain read, only coherent on the owning thread.
    #[inline]
    pub fn get(&self) -> i64 {
        self.values.get_i64(value_offset(self.id))
    }

    /// Read with acquire semantics.
    #[inline]
    pub fn get_volatile(&self) -> i64 {
        self.values.get_i64_volatile(value_offset(self.id))
    }

    /// Plain store, only coherent on the owning thread.
    #[inline]
    pub fn set(&self, value: i64) {
        self.values.put_i64(value_offset(self.id), value);
    }

    /// Publish a new value with release semantics.
    #[inline]
    pub fn set_release(&self, value: i64) {
        self.values.put_i64_release(value_offset(self.id), value);
    }

    /// Atomically add `delta`, returning the prior value.
    #[inline]
    pub fn get_and_add(&self, delta: i64) -> i64 {
        self.values.get_and_add_i64(value_offset(self.id), delta)
    }

    /// Bump the counter by one.
    #[inline]
    pub fn increment(&self) {
        self.get_and_add(1);
    }

    /// Observer-side view of the same cell.
    #[inline]
    pub fn reader(&self) -> PositionReader {
        PositionReader::new(self.values, self.id)
    }
}

/// Observer-side handle over one counter cell.
#[derive(Clone, Copy)]
pub struct PositionReader {
    values: AtomicBuffer,
    id: i32,
}

impl PositionReader {
    /// Wrap cell `id` of a values region.
    pub fn new(values: AtomicBuffer, id: i32) -> Self {
        assert!(id >= 0, "counter id must be non-negative");
        assert!(
            (id as usize + 1) * COUNTER_LENGTH <= values.capacity(),
            "counter id {id} out of range"
        );
        Self { values, id }
    }

    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Read the published value with acquire semantics.
    #[inline]
    pub fn get_volatile(&self) -> i64 {
        self.values.get_i64_volatile(value_offset(self.id))
    }
}
