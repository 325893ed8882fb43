use std::ops::{Deref, DerefMut};

/// A read-only contiguous view into a doubly-mapped channel's available
/// data. Replaces the raw-pointer-plus-length pair the original C++
/// `read_dbf()` returns.
#[derive(Debug)]
pub struct DbfSpan<'a, T> {
    data: &'a [T],
}

impl<'a, T> DbfSpan<'a, T> {
    pub(crate) fn new(data: &'a [T]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<'a, T> Deref for DbfSpan<'a, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        self.data
    }
}

/// A writable contiguous view into a doubly-mapped channel's free space.
#[derive(Debug)]
pub struct DbfSpanMut<'a, T> {
    data: &'a mut [T],
}

impl<'a, T> DbfSpanMut<'a, T> {
    pub(crate) fn new(data: &'a mut [T]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<'a, T> Deref for DbfSpanMut<'a, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        self.data
    }
}

impl<'a, T> DerefMut for DbfSpanMut<'a, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.data
    }
}
