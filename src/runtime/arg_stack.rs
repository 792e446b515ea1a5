//! Native argument stack
//!
//! Off-heap buffer of 64-bit words used to stage arguments that native
//! code receives by pointer (the varargs array of a `VarArgs` call, for
//! example). Allocation is a bump of the top pointer; freeing must happen
//! in strict LIFO order, which trampoline frames guarantee by construction.

use std::alloc::{self, Layout};

/// Default capacity in words.
pub const DEFAULT_ARG_STACK_WORDS: usize = 32 * 1024;

/// A region handed out by [`ArgStack::push`].
///
/// Not `Clone`: a region is freed exactly once.
#[derive(Debug)]
pub struct ArgRegion {
    offset: usize,
    len: usize,
    ptr: *mut u64,
}

impl ArgRegion {
    /// Pointer to the first staged word.
    #[inline]
    pub fn as_ptr(&self) -> *const u64 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct ArgStack {
    /// Start of the buffer.
    base: *mut u64,
    /// Capacity in words.
    capacity: usize,
    /// Next free word.
    top: usize,
}

impl ArgStack {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let base = unsafe { alloc::alloc(Self::layout(capacity)) as *mut u64 };
        if base.is_null() {
            alloc::handle_alloc_error(Self::layout(capacity));
        }
        Self {
            base,
            capacity,
            top: 0,
        }
    }

    fn layout(capacity: usize) -> Layout {
        match Layout::array::<u64>(capacity) {
            Ok(layout) => layout,
            Err(_) => panic!("argument stack of {} words is too large", capacity),
        }
    }

    /// Copies `words` onto the stack.
    ///
    /// Returns None if the stack is full.
    pub fn push(&mut self, words: &[u64]) -> Option<ArgRegion> {
        let new_top = self.top.checked_add(words.len())?;
        if new_top > self.capacity {
            return None;
        }
        let ptr = unsafe { self.base.add(self.top) };
        unsafe {
            std::ptr::copy_nonoverlapping(words.as_ptr(), ptr, words.len());
        }
        let region = ArgRegion {
            offset: self.top,
            len: words.len(),
            ptr,
        };
        self.top = new_top;
        Some(region)
    }

    /// Frees the most recently pushed region.
    ///
    /// Panics if `region` is not the top of the stack.
    pub fn free(&mut self, region: ArgRegion) {
        assert!(
            region.offset + region.len == self.top,
            "argument stack freed out of order: region {}..{} but top is {}",
            region.offset,
            region.offset + region.len,
            self.top
        );
        self.top = region.offset;
    }

    /// Words in use.
    pub fn depth(&self) -> usize {
        self.top
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.top
    }
}

impl Drop for ArgStack {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.base as *mut u8, Self::layout(self.capacity));
        }
    }
}
