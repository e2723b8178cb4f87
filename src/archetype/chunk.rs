use std::{
    alloc::{alloc, dealloc, handle_alloc_error, Layout},
    ptr::NonNull,
};

/// A fixed-capacity block of columnar storage for one archetype.
///
/// The chunk only owns the raw allocation. Which columns live at which offsets, and running
/// destructors for the rows in use, is the business of the owning [Archetype](super::Archetype).
pub struct Chunk {
    data: NonNull<u8>,
    layout: Layout,
    len: u16,
}

// SAFETY: The chunk is a plain allocation; values placed in it are `Send + Sync` as required by
//         the `Component` trait.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    pub fn new(layout: Layout) -> Self {
        debug_assert!(layout.size() > 0);

        // SAFETY: Layout size is non-zero, as every archetype carries the entity id column.
        let ptr = unsafe { alloc(layout) };
        let Some(data) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };

        Self { data, layout, len: 0 }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(len <= u16::MAX as usize);
        self.len = len as u16;
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub fn byte_size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: Allocated in `new` with this exact layout.
        unsafe { dealloc(self.data.as_ptr(), self.layout) };
    }
}
