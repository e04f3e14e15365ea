//! The untyped/page supplier interface.
//!
//! The cspace never owns physical memory. A supplier hands out 4 KiB
//! untypeds (and takes them back), and installs frames into the cspace's
//! own address space. It is a function triple plus an opaque cookie, so a
//! single cspace implementation can run over any memory authority.

use core::ptr::NonNull;

use muon_sys::{CPtr, Word};

use crate::MAPPING_SLOTS;

/// Opaque, word-sized handle the supplier mints for a 4 KiB untyped.
///
/// The null handle never names live storage; zeroed bookkeeping memory
/// therefore starts out holding no handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct UtHandle(*mut ());

impl UtHandle {
    /// The absent handle.
    pub const NULL: Self = Self(core::ptr::null_mut());

    /// Wraps a raw supplier-owned pointer.
    pub const fn new(raw: *mut ()) -> Self {
        Self(raw)
    }

    /// Returns whether this is the absent handle.
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Returns the raw supplier-owned pointer.
    pub const fn as_raw(self) -> *mut () {
        self.0
    }
}

/// Allocates a 4 KiB untyped, writing the capability naming it to
/// `ut_cptr`. Returns `None` when the supplier is exhausted.
pub type Alloc4KFn = fn(cookie: *mut (), ut_cptr: &mut CPtr) -> Option<UtHandle>;

/// Returns a 4 KiB untyped to the supplier.
pub type Free4KFn = fn(cookie: *mut (), untyped: UtHandle);

/// Maps `frame` into the cspace's address space and returns its virtual
/// address, or `None` on failure.
///
/// Installing intermediate paging objects may require cspace slots; the
/// service takes them from `free_slots` and reports each taken entry by
/// setting the corresponding bit in `used`. During cspace bootstrap the
/// array can contain `NULL_CAP` entries, which must not be consumed.
pub type MapFrameFn = fn(
    cookie: *mut (),
    frame: CPtr,
    free_slots: &[CPtr; MAPPING_SLOTS],
    used: &mut Word,
) -> Option<NonNull<u8>>;

/// The supplier call triple, with its cookie.
#[derive(Clone, Copy)]
pub struct UntypedSupplier {
    /// Opaque state passed to every call.
    pub cookie: *mut (),
    /// See [`Alloc4KFn`].
    pub alloc_4k: Alloc4KFn,
    /// See [`Free4KFn`].
    pub free_4k: Free4KFn,
    /// See [`MapFrameFn`].
    pub map_frame: MapFrameFn,
}
