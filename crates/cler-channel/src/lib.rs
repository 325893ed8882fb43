//! A bounded, lock-free single-producer/single-consumer channel.
//!
//! One slot of the requested capacity is reserved to disambiguate the full
//! and empty states (`capacity_slots = capacity + 1`). Where the platform
//! supports it ([`cler_platform::supports_doubly_mapped_buffers`]), the
//! backing storage is a [`cler_vmem::DoublyMappedAllocation`] so that
//! [`Channel::read_dbf`]/[`Channel::write_dbf`] can hand back one
//! contiguous span of up to the full logical capacity with no wraparound
//! copy. Otherwise storage falls back to a padded standard buffer and
//! callers use [`Channel::peek_read`]/[`Channel::peek_write`], which may
//! return the available range split across two segments.

mod span;

pub use span::{DbfSpan, DbfSpanMut};

use std::cell::{Cell, UnsafeCell};
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};

use cler_platform::CACHE_LINE_SIZE;
use cler_vmem::DoublyMappedAllocation;
use crossbeam_utils::CachePadded;

/// Errors returned while constructing a [`Channel`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("capacity must be a positive number")]
    InvalidCapacity,
    #[error("capacity with padding overflows the address space")]
    CapacityOverflow,
    #[error("failed to allocate channel storage")]
    AllocationFailed,
}

struct WriterState {
    write_index: AtomicUsize,
    read_index_cache: Cell<usize>,
}

struct ReaderState {
    read_index: AtomicUsize,
    write_index_cache: Cell<usize>,
}

enum Storage<T> {
    Standard { buf: Box<[UnsafeCell<T>]>, padding: usize },
    DoublyMapped { alloc: DoublyMappedAllocation, _t: std::marker::PhantomData<T> },
}

/// A bounded SPSC ring buffer. Construct with [`Channel::new`], then share
/// `&Channel<T>` between exactly one producer thread and one consumer
/// thread — the producer only calls the push-family methods, the consumer
/// only the pop-family methods.
pub struct Channel<T: Copy + Default> {
    storage: Storage<T>,
    /// `capacity_slots = capacity() + 1`; for doubly-mapped storage this
    /// is rounded up to the allocation granularity and may exceed the
    /// value implied by the originally requested capacity.
    capacity_slots: usize,
    writer: CachePadded<WriterState>,
    reader: CachePadded<ReaderState>,
}

// SAFETY: `Channel` is designed for exactly one producer and one consumer
// operating concurrently through a shared reference; the atomics at the
// writer/reader boundary establish the necessary happens-before edges.
unsafe impl<T: Copy + Default + Send> Send for Channel<T> {}
unsafe impl<T: Copy + Default + Send> Sync for Channel<T> {}

impl<T: Copy + Default> Channel<T> {
    /// Creates a channel holding at least `capacity` elements. Tries a
    /// doubly-mapped backing first when the platform supports it and
    /// falls back to a padded standard buffer otherwise.
    pub fn new(capacity: usize) -> Result<Self, ChannelError> {
        if capacity < 1 {
            return Err(ChannelError::InvalidCapacity);
        }
        let requested_slots = capacity
            .checked_add(1)
            .ok_or(ChannelError::CapacityOverflow)?;

        if cler_platform::supports_doubly_mapped_buffers() {
            let bytes_needed = requested_slots
                .checked_mul(size_of::<T>())
                .ok_or(ChannelError::CapacityOverflow)?;
            match DoublyMappedAllocation::create(bytes_needed) {
                Ok(alloc) => {
                    let capacity_slots = alloc.size() / size_of::<T>();
                    tracing::debug!(
                        target: "channel",
                        requested = capacity,
                        capacity_slots,
                        "channel using doubly-mapped storage"
                    );
                    return Ok(Self::from_storage(
                        Storage::DoublyMapped { alloc, _t: std::marker::PhantomData },
                        capacity_slots,
                    ));
                }
                Err(e) => {
                    tracing::debug!(target: "channel", error = %e, "doubly-mapped allocation failed, falling back");
                }
            }
        }

        let padding = ((CACHE_LINE_SIZE - 1) / size_of::<T>()) + 1;
        let total_size = requested_slots
            .checked_add(2 * padding)
            .ok_or(ChannelError::CapacityOverflow)?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(total_size)
            .map_err(|_| ChannelError::AllocationFailed)?;
        buf.resize_with(total_size, || UnsafeCell::new(T::default()));

        Ok(Self::from_storage(
            Storage::Standard { buf: buf.into_boxed_slice(), padding },
            requested_slots,
        ))
    }

    fn from_storage(storage: Storage<T>, capacity_slots: usize) -> Self {
        Self {
            storage,
            capacity_slots,
            writer: CachePadded::new(WriterState {
                write_index: AtomicUsize::new(0),
                read_index_cache: Cell::new(0),
            }),
            reader: CachePadded::new(ReaderState {
                read_index: AtomicUsize::new(0),
                write_index_cache: Cell::new(0),
            }),
        }
    }

    /// True if this channel's storage is a doubly-mapped alias rather
    /// than a padded standard buffer.
    pub fn is_doubly_mapped(&self) -> bool {
        matches!(self.storage, Storage::DoublyMapped { .. })
    }

    /// Maximum number of elements this channel can hold at once.
    pub fn capacity(&self) -> usize {
        self.capacity_slots - 1
    }

    #[inline]
    fn slot_ptr(&self, logical_index: usize) -> *mut T {
        match &self.storage {
            Storage::Standard { buf, padding } => buf[logical_index + padding].get(),
            Storage::DoublyMapped { alloc, .. } => unsafe { (alloc.data() as *mut T).add(logical_index) },
        }
    }

    /// Number of elements currently queued.
    pub fn size(&self) -> usize {
        let write_index = self.writer.write_index.load(Ordering::Acquire);
        let read_index = self.reader.read_index.load(Ordering::Acquire);
        if write_index >= read_index {
            write_index - read_index
        } else {
            (self.capacity_slots - read_index) + write_index
        }
    }

    pub fn empty(&self) -> bool {
        self.writer.write_index.load(Ordering::Acquire) == self.reader.read_index.load(Ordering::Acquire)
    }

    pub fn space(&self) -> usize {
        self.capacity() - self.size()
    }

    /// Blocking push: spins until there is room.
    pub fn push(&self, val: T) {
        let write_index = self.writer.write_index.load(Ordering::Relaxed);
        let next_write_index = Self::next_index(write_index, self.capacity_slots);
        while next_write_index == self.writer.read_index_cache.get() {
            self.writer
                .read_index_cache
                .set(self.reader.read_index.load(Ordering::Acquire));
            cler_platform::spin_wait(1);
        }
        unsafe { self.slot_ptr(write_index).write(val) };
        self.writer.write_index.store(next_write_index, Ordering::Release);
    }

    /// Overwrites the oldest unread element if the channel is full
    /// instead of blocking.
    pub fn force_push(&self, val: T) {
        let write_index = self.writer.write_index.load(Ordering::Relaxed);
        let next_write_index = Self::next_index(write_index, self.capacity_slots);
        let read_index = self.reader.read_index.load(Ordering::Acquire);
        if next_write_index == read_index {
            let next_read_index = Self::next_index(read_index, self.capacity_slots);
            self.reader.read_index.store(next_read_index, Ordering::Release);
        }
        unsafe { self.slot_ptr(write_index).write(val) };
        self.writer.write_index.store(next_write_index, Ordering::Release);
    }

    /// Non-blocking push; returns `false` if the channel is full.
    #[must_use]
    pub fn try_push(&self, val: T) -> bool {
        let write_index = self.writer.write_index.load(Ordering::Relaxed);
        let next_write_index = Self::next_index(write_index, self.capacity_slots);
        if next_write_index == self.writer.read_index_cache.get() {
            self.writer
                .read_index_cache
                .set(self.reader.read_index.load(Ordering::Acquire));
            if next_write_index == self.writer.read_index_cache.get() {
                return false;
            }
        }
        unsafe { self.slot_ptr(write_index).write(val) };
        self.writer.write_index.store(next_write_index, Ordering::Release);
        true
    }

    /// Blocking pop: spins until an element is available.
    pub fn pop(&self) -> T {
        let read_index = self.reader.read_index.load(Ordering::Relaxed);
        while read_index == self.reader.write_index_cache.get() {
            self.reader
                .write_index_cache
                .set(self.writer.write_index.load(Ordering::Acquire));
            cler_platform::spin_wait(1);
        }
        let val = unsafe { *self.slot_ptr(read_index) };
        let next_read_index = Self::next_index(read_index, self.capacity_slots);
        self.reader.read_index.store(next_read_index, Ordering::Release);
        val
    }

    /// Non-blocking pop; returns `None` if the channel is empty.
    pub fn try_pop(&self) -> Option<T> {
        let read_index = self.reader.read_index.load(Ordering::Relaxed);
        if read_index == self.reader.write_index_cache.get() {
            self.reader
                .write_index_cache
                .set(self.writer.write_index.load(Ordering::Acquire));
            if read_index == self.reader.write_index_cache.get() {
                return None;
            }
        }
        let val = unsafe { *self.slot_ptr(read_index) };
        let next_read_index = Self::next_index(read_index, self.capacity_slots);
        self.reader.read_index.store(next_read_index, Ordering::Release);
        Some(val)
    }

    #[inline]
    fn next_index(index: usize, capacity_slots: usize) -> usize {
        if index == capacity_slots - 1 { 0 } else { index + 1 }
    }

    /// Writes as many elements of `src` as fit, splitting the copy at the
    /// physical end of the buffer if necessary. Returns the count written.
    pub fn write_n(&self, src: &[T]) -> usize {
        let capacity = self.capacity_slots;
        let write_index = self.writer.write_index.load(Ordering::Relaxed);
        let read_index_cache = self.reader.read_index.load(Ordering::Acquire);
        self.writer.read_index_cache.set(read_index_cache);

        let space = if read_index_cache > write_index {
            read_index_cache - write_index - 1
        } else {
            capacity - write_index + read_index_cache - 1
        };

        let to_write = src.len().min(space);
        if to_write == 0 {
            return 0;
        }
        self.copy_in(write_index, &src[..to_write]);
        self.writer
            .write_index
            .store((write_index + to_write) % capacity, Ordering::Release);
        to_write
    }

    /// Writes `src`, overwriting the oldest unread elements if necessary
    /// to make room. `src` longer than `capacity() ` is truncated to the
    /// last `capacity()` elements it can hold; the queue never silently
    /// keeps only a sub-slice beyond that clamp.
    pub fn force_write_n(&self, src: &[T]) -> usize {
        let capacity = self.capacity_slots;
        let write_index = self.writer.write_index.load(Ordering::Relaxed);
        let read_index = self.reader.read_index.load(Ordering::Acquire);

        let used_space = if read_index > write_index {
            write_index + (capacity - read_index)
        } else {
            write_index - read_index
        };

        let mut count = src.len();
        if count > capacity - 1 {
            count = capacity - 1;
        }

        if count > (capacity - 1 - used_space) {
            let advance = count - (capacity - 1 - used_space);
            let new_read_index = (read_index + advance) % capacity;
            self.reader.read_index.store(new_read_index, Ordering::Release);
        }

        self.copy_in(write_index, &src[..count]);
        self.writer
            .write_index
            .store((write_index + count) % capacity, Ordering::Release);
        count
    }

    /// Reads up to `dst.len()` elements, splitting the copy at the
    /// physical end of the buffer if necessary. Returns the count read.
    pub fn read_n(&self, dst: &mut [T]) -> usize {
        let capacity = self.capacity_slots;
        let read_index = self.reader.read_index.load(Ordering::Relaxed);
        let write_index = self.writer.write_index.load(Ordering::Acquire);
        self.reader.write_index_cache.set(write_index);

        let available = if write_index >= read_index {
            write_index - read_index
        } else {
            capacity - read_index + write_index
        };

        let to_read = dst.len().min(available);
        if to_read == 0 {
            return 0;
        }
        self.copy_out(read_index, &mut dst[..to_read]);
        self.reader
            .read_index
            .store((read_index + to_read) % capacity, Ordering::Release);
        to_read
    }

    fn copy_in(&self, write_index: usize, src: &[T]) {
        let capacity = self.capacity_slots;
        let first_chunk = src.len().min(capacity - write_index);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.slot_ptr(write_index), first_chunk);
            if first_chunk < src.len() {
                std::ptr::copy_nonoverlapping(
                    src[first_chunk..].as_ptr(),
                    self.slot_ptr(0),
                    src.len() - first_chunk,
                );
            }
        }
    }

    fn copy_out(&self, read_index: usize, dst: &mut [T]) {
        let capacity = self.capacity_slots;
        let first_chunk = dst.len().min(capacity - read_index);
        unsafe {
            std::ptr::copy_nonoverlapping(self.slot_ptr(read_index), dst.as_mut_ptr(), first_chunk);
            if first_chunk < dst.len() {
                std::ptr::copy_nonoverlapping(
                    self.slot_ptr(0),
                    dst[first_chunk..].as_mut_ptr(),
                    dst.len() - first_chunk,
                );
            }
        }
    }

    /// Zero-copy view of writable space, split across up to two segments
    /// when the free region wraps the physical end of the buffer.
    pub fn peek_write(&self) -> (&mut [T], Option<&mut [T]>) {
        let capacity = self.capacity_slots;
        let write_index = self.writer.write_index.load(Ordering::Relaxed);
        let read_index_cache = self.reader.read_index.load(Ordering::Acquire);
        self.writer.read_index_cache.set(read_index_cache);

        let space = if read_index_cache > write_index {
            read_index_cache - write_index - 1
        } else {
            capacity - write_index + read_index_cache - 1
        };
        if space == 0 {
            return (&mut [], None);
        }

        let (first_chunk, second_len) = if read_index_cache > write_index {
            (space, 0)
        } else if read_index_cache == 0 {
            // No wrap-around free region: the reserved slot sits at the
            // physical end of the buffer, so the first segment alone
            // must exclude it.
            (capacity - write_index - 1, 0)
        } else {
            (capacity - write_index, read_index_cache - 1)
        };
        let first = unsafe { std::slice::from_raw_parts_mut(self.slot_ptr(write_index), first_chunk) };
        let second = if second_len > 0 {
            Some(unsafe { std::slice::from_raw_parts_mut(self.slot_ptr(0), second_len) })
        } else {
            None
        };
        (first, second)
    }

    pub fn commit_write(&self, count: usize) {
        let capacity = self.capacity_slots;
        let write_index = self.writer.write_index.load(Ordering::Relaxed);
        self.writer
            .write_index
            .store((write_index + count) % capacity, Ordering::Release);
    }

    /// Zero-copy view of readable data, split across up to two segments
    /// when the available region wraps the physical end of the buffer.
    pub fn peek_read(&self) -> (&[T], Option<&[T]>) {
        let capacity = self.capacity_slots;
        let read_index = self.reader.read_index.load(Ordering::Relaxed);
        let write_index_cache = self.writer.write_index.load(Ordering::Acquire);
        self.reader.write_index_cache.set(write_index_cache);

        let available = if write_index_cache >= read_index {
            write_index_cache - read_index
        } else {
            capacity - read_index + write_index_cache
        };
        if available == 0 {
            return (&[], None);
        }

        let first_chunk = if write_index_cache >= read_index {
            available
        } else {
            capacity - read_index
        };
        let first = unsafe { std::slice::from_raw_parts(self.slot_ptr(read_index), first_chunk) };
        let second = if write_index_cache < read_index {
            Some(unsafe { std::slice::from_raw_parts(self.slot_ptr(0), write_index_cache) })
        } else {
            None
        };
        (first, second)
    }

    pub fn commit_read(&self, count: usize) {
        let capacity = self.capacity_slots;
        let read_index = self.reader.read_index.load(Ordering::Relaxed);
        self.reader
            .read_index
            .store((read_index + count) % capacity, Ordering::Release);
    }

    /// Returns a single contiguous span of currently-available data, or
    /// `None` on standard (non-doubly-mapped) storage where the available
    /// range may wrap and can't be expressed as one span.
    pub fn read_dbf(&self) -> Option<DbfSpan<'_, T>> {
        if !self.is_doubly_mapped() {
            return None;
        }
        let (first, _) = self.peek_read();
        // Doubly-mapped storage never wraps: the mirrored alias makes the
        // full available range contiguous starting at `first`'s pointer.
        let available = self.size();
        if available == 0 {
            return None;
        }
        Some(DbfSpan::new(unsafe { std::slice::from_raw_parts(first.as_ptr(), available) }))
    }

    /// Returns a single contiguous span of currently-writable space, or
    /// `None` on standard storage.
    pub fn write_dbf(&self) -> Option<DbfSpanMut<'_, T>> {
        if !self.is_doubly_mapped() {
            return None;
        }
        let write_index = self.writer.write_index.load(Ordering::Relaxed);
        let space = self.space();
        if space == 0 {
            return None;
        }
        Some(DbfSpanMut::new(unsafe {
            std::slice::from_raw_parts_mut(self.slot_ptr(write_index), space)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(Channel::<f32>::new(0), Err(ChannelError::InvalidCapacity)));
    }

    #[test]
    fn capacity_is_n_not_n_plus_one() {
        let ch = Channel::<i32>::new(16).unwrap();
        assert_eq!(ch.capacity(), 16);
    }

    #[test]
    fn push_pop_round_trips() {
        let ch = Channel::<i32>::new(4).unwrap();
        ch.push(1);
        ch.push(2);
        assert_eq!(ch.size(), 2);
        assert_eq!(ch.pop(), 1);
        assert_eq!(ch.pop(), 2);
        assert!(ch.empty());
    }

    #[test]
    fn try_push_fails_when_full() {
        let ch = Channel::<i32>::new(2).unwrap();
        assert!(ch.try_push(1));
        assert!(ch.try_push(2));
        assert!(!ch.try_push(3));
    }

    #[test]
    fn try_pop_fails_when_empty() {
        let ch = Channel::<i32>::new(2).unwrap();
        assert!(ch.try_pop().is_none());
    }

    #[test]
    fn force_push_overwrites_oldest() {
        let ch = Channel::<i32>::new(2).unwrap();
        ch.push(1);
        ch.push(2);
        ch.force_push(3);
        assert_eq!(ch.pop(), 2);
        assert_eq!(ch.pop(), 3);
    }

    #[test]
    fn write_n_read_n_wrap_correctly() {
        let ch = Channel::<i32>::new(4).unwrap();
        assert_eq!(ch.write_n(&[1, 2, 3]), 3);
        let mut out = [0; 2];
        assert_eq!(ch.read_n(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(ch.write_n(&[4, 5, 6]), 2);
        let mut out = [0; 4];
        assert_eq!(ch.read_n(&mut out), 4);
        assert_eq!(out, [3, 4, 5, 0]);
    }

    #[test]
    fn force_write_n_clamps_to_capacity_minus_one() {
        let ch = Channel::<i32>::new(4).unwrap();
        let src: Vec<i32> = (0..10).collect();
        let written = ch.force_write_n(&src);
        assert_eq!(written, 3);
        assert_eq!(ch.size(), 3);
    }

    #[test]
    fn peek_write_commit_write_round_trip() {
        let ch = Channel::<i32>::new(4).unwrap();
        {
            let (first, _second) = ch.peek_write();
            first[0] = 42;
            first[1] = 43;
        }
        ch.commit_write(2);
        assert_eq!(ch.pop(), 42);
        assert_eq!(ch.pop(), 43);
    }

    #[test]
    fn peek_read_commit_read_round_trip() {
        let ch = Channel::<i32>::new(4).unwrap();
        ch.push(7);
        ch.push(8);
        {
            let (first, _second) = ch.peek_read();
            assert_eq!(first, &[7, 8]);
        }
        ch.commit_read(2);
        assert!(ch.empty());
    }

    #[test]
    fn space_and_size_are_consistent() {
        let ch = Channel::<i32>::new(8).unwrap();
        assert_eq!(ch.space(), 8);
        ch.push(1);
        assert_eq!(ch.size(), 1);
        assert_eq!(ch.space(), 7);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // P1: size() + space() == capacity() at all times.
        #[test]
        fn size_plus_space_equals_capacity(cap in 1usize..64, ops in proptest::collection::vec(any::<bool>(), 0..200)) {
            let ch = Channel::<u8>::new(cap).unwrap();
            for push in ops {
                if push {
                    let _ = ch.try_push(1);
                } else {
                    let _ = ch.try_pop();
                }
                prop_assert_eq!(ch.size() + ch.space(), ch.capacity());
            }
        }

        // P2/P3: try_push never exceeds capacity; try_pop never underflows.
        #[test]
        fn try_push_respects_capacity(cap in 1usize..64, n in 0usize..200) {
            let ch = Channel::<u8>::new(cap).unwrap();
            let mut accepted = 0;
            for _ in 0..n {
                if ch.try_push(1) {
                    accepted += 1;
                }
            }
            prop_assert!(accepted <= cap);
            prop_assert_eq!(ch.size(), accepted.min(cap));
        }

        // P4: data survives a push/pop sequence in FIFO order.
        #[test]
        fn fifo_order_preserved(cap in 2usize..64, values in proptest::collection::vec(any::<u8>(), 0..64)) {
            let ch = Channel::<u8>::new(cap).unwrap();
            let mut expected = Vec::new();
            let mut actual = Vec::new();
            for v in &values {
                if ch.try_push(*v) {
                    expected.push(*v);
                } else {
                    if let Some(popped) = ch.try_pop() {
                        actual.push(popped);
                    }
                    let _ = ch.try_push(*v);
                    expected.push(*v);
                }
            }
            while let Some(v) = ch.try_pop() {
                actual.push(v);
            }
            prop_assert_eq!(actual, expected);
        }

        // P5: write_n/read_n never report more transferred than requested.
        #[test]
        fn write_n_read_n_bounded(cap in 1usize..64, chunk in proptest::collection::vec(any::<u8>(), 0..64)) {
            let ch = Channel::<u8>::new(cap).unwrap();
            let written = ch.write_n(&chunk);
            prop_assert!(written <= chunk.len());
            prop_assert!(written <= cap);
            let mut dst = vec![0u8; chunk.len()];
            let read = ch.read_n(&mut dst);
            prop_assert_eq!(read, written);
        }

        // P6: force_write_n never writes more than capacity() elements total.
        #[test]
        fn force_write_n_clamped(cap in 1usize..32, chunk in proptest::collection::vec(any::<u8>(), 0..128)) {
            let ch = Channel::<u8>::new(cap).unwrap();
            let written = ch.force_write_n(&chunk);
            prop_assert!(written <= cap);
            prop_assert_eq!(ch.size(), written.min(cap));
        }
    }
}
