//! Non-owning view over the memory region an arena lives in.
//!
//! Every structure inside the region is addressed by a byte offset from the
//! aligned base rather than by native pointer, so handles stay meaningful in
//! every process that maps the region, wherever it lands.

use crate::size_class::ALIGN;
use core::fmt;
use core::ptr::NonNull;

/// Offset of a fragment header from the aligned arena base.
///
/// Offset zero is always occupied by the arena header, so it doubles as the
/// null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FragOffset(usize);

impl FragOffset {
    /// The null handle.
    pub const NULL: Self = Self(0);

    /// Wraps a raw offset.
    #[inline]
    pub const fn new(offset: usize) -> Self {
        Self(offset)
    }

    /// Raw byte offset.
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Whether this is the null handle.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Maps the null handle to `None`.
    #[inline]
    pub const fn non_null(self) -> Option<Self> {
        if self.is_null() { None } else { Some(self) }
    }

    /// Handle `bytes` further into the region.
    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for FragOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// A raw memory region handed to the allocator.
///
/// The base is aligned up to [`ALIGN`] on construction; `len` shrinks by the
/// shift and is rounded down to the alignment unit.
#[derive(Clone, Copy)]
pub struct SharedRegion {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the region is only ever accessed through atomics in control
// structures and through bucket locks; payload bytes belong to whichever
// caller holds the allocation.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Wraps `len` bytes at `base`.
    ///
    /// Returns `None` if `base` is null or nothing usable remains after
    /// alignment.
    ///
    /// # Safety
    /// `base..base + len` must be valid, initialized (e.g. zero-filled),
    /// readable and writable memory for as long as any arena built on this
    /// region is in use, and must not be accessed by anything but arenas
    /// built on it and the owners of live allocations.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Option<Self> {
        let addr = base as usize;
        let shift = addr.checked_add(ALIGN - 1)? & !(ALIGN - 1);
        let shift = shift - addr;
        if len < shift {
            return None;
        }
        let len = (len - shift) & !(ALIGN - 1);
        let base = NonNull::new(base.add(shift))?;
        Some(Self { base, len })
    }

    /// Aligned base address.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Usable length after alignment.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region has no usable bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a shared reference to a `T` living at `offset`.
    ///
    /// # Safety
    /// A valid `T` must live at `offset`, inside the region, suitably aligned.
    /// `T` must tolerate shared mutation (atomics only).
    #[inline]
    pub(crate) unsafe fn at<T>(&self, offset: usize) -> &T {
        debug_assert!(offset + core::mem::size_of::<T>() <= self.len);
        debug_assert_eq!((self.base.as_ptr() as usize + offset) % core::mem::align_of::<T>(), 0);
        &*(self.base.as_ptr().add(offset) as *const T)
    }

    /// Raw pointer at `offset`.
    #[inline]
    pub(crate) fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        // Safety: offset is within the region.
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Offset of `ptr` from the base, if it lies inside the region.
    #[inline]
    pub(crate) fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        if addr < base || addr >= base + self.len {
            return None;
        }
        Some(addr - base)
    }
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}
