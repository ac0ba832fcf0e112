//! Fixed-capacity single-producer ring with overwrite-oldest eviction.
//!
//! The producer side is a non-cloneable [`Producer`] handle; any number of
//! readers share the [`RingBuffer`] through an `Arc`. Both head and tail
//! are derived from one monotonically increasing push counter, so a reader
//! always sees a consistent pair of indices.

use std::ops::Deref;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Value type storable in a [`RingBuffer`].
///
/// Each slot is backed by an atomic cell, so a reader racing the producer
/// sees either the old or the new value of a slot, never a torn one.
pub trait Element: Copy + Default + Send + Sync + 'static {
    type Cell: Send + Sync;

    fn new_cell(value: Self) -> Self::Cell;
    fn load(cell: &Self::Cell) -> Self;
    fn store(cell: &Self::Cell, value: Self);
}

macro_rules! atomic_element {
    ($t:ty, $cell:ty) => {
        impl Element for $t {
            type Cell = $cell;

            fn new_cell(value: Self) -> Self::Cell {
                <$cell>::new(value)
            }

            fn load(cell: &Self::Cell) -> Self {
                cell.load(Ordering::Relaxed)
            }

            fn store(cell: &Self::Cell, value: Self) {
                cell.store(value, Ordering::Relaxed)
            }
        }
    };
}

atomic_element!(u8, AtomicU8);
atomic_element!(u16, AtomicU16);
atomic_element!(u32, AtomicU32);

impl Element for f64 {
    type Cell = AtomicU64;

    fn new_cell(value: Self) -> Self::Cell {
        AtomicU64::new(value.to_bits())
    }

    fn load(cell: &Self::Cell) -> Self {
        f64::from_bits(cell.load(Ordering::Relaxed))
    }

    fn store(cell: &Self::Cell, value: Self) {
        cell.store(value.to_bits(), Ordering::Relaxed)
    }
}

pub struct RingBuffer<T: Element> {
    slots: Box<[T::Cell]>,
    pushed: AtomicU64,
}

/// Creates a ring of `capacity` elements and returns its only producer
/// together with a shareable read handle.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn channel<T: Element>(capacity: usize) -> (Producer<T>, Arc<RingBuffer<T>>) {
    let ring = Arc::new(RingBuffer::new(capacity));
    (
        Producer {
            ring: Arc::clone(&ring),
        },
        ring,
    )
}

impl<T: Element> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");

        Self {
            slots: (0..capacity).map(|_| T::new_cell(T::default())).collect(),
            pushed: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of elements ever pushed.
    pub fn total_pushed(&self) -> u64 {
        self.pushed.load(Ordering::Acquire)
    }

    /// Number of retained elements, at most [`capacity`](Self::capacity).
    pub fn occupied(&self) -> usize {
        self.view().occupied()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    /// Index of the most recently written slot.
    pub fn head(&self) -> usize {
        self.view().head()
    }

    /// Index of the oldest retained slot.
    pub fn tail(&self) -> usize {
        self.view().tail()
    }

    /// Index `offset` positions behind the head. Offsets reaching past the
    /// oldest retained element saturate at the tail, so unwritten slots are
    /// never addressed.
    pub fn index_minus(&self, offset: usize) -> usize {
        self.view().index_minus(offset)
    }

    /// # Panics
    ///
    /// Panics if `index` is not below the capacity.
    pub fn get(&self, index: usize) -> T {
        T::load(&self.slots[index])
    }

    pub fn latest(&self) -> Option<T> {
        let view = self.view();
        if view.occupied() == 0 {
            None
        } else {
            Some(self.get(view.head()))
        }
    }

    /// Copies up to `count` trailing elements, oldest first.
    pub fn last(&self, count: usize) -> Vec<T> {
        let view = self.view();
        let count = count.min(view.occupied());

        (0..count)
            .rev()
            .map(|offset| self.get(view.index_minus(offset)))
            .collect()
    }

    fn view(&self) -> View {
        View {
            pushed: self.pushed.load(Ordering::Acquire),
            capacity: self.slots.len() as u64,
        }
    }

    /// Publishes the slot just written by the producer. Head moves forward
    /// and, once the ring is full, the tail moves with it.
    fn advance(&self) {
        self.pushed.fetch_add(1, Ordering::Release);
    }
}

/// Index arithmetic over one snapshot of the push counter.
#[derive(Clone, Copy)]
struct View {
    pushed: u64,
    capacity: u64,
}

impl View {
    fn occupied(self) -> usize {
        self.pushed.min(self.capacity) as usize
    }

    fn head(self) -> usize {
        (self.pushed.saturating_sub(1) % self.capacity) as usize
    }

    fn tail(self) -> usize {
        ((self.pushed - self.occupied() as u64) % self.capacity) as usize
    }

    fn index_minus(self, offset: usize) -> usize {
        if offset >= self.occupied() {
            return self.tail();
        }
        ((self.pushed - 1 - offset as u64) % self.capacity) as usize
    }
}

/// Write side of a [`RingBuffer`]. Exactly one exists per ring.
pub struct Producer<T: Element> {
    ring: Arc<RingBuffer<T>>,
}

impl<T: Element> Producer<T> {
    pub fn push(&mut self, value: T) {
        // Only this handle writes the counter.
        let pushed = self.ring.pushed.load(Ordering::Relaxed);
        let slot = (pushed % self.ring.slots.len() as u64) as usize;

        T::store(&self.ring.slots[slot], value);
        self.ring.advance();
    }
}

impl<T: Element> Deref for Producer<T> {
    type Target = RingBuffer<T>;

    fn deref(&self) -> &Self::Target {
        &self.ring
    }
}
