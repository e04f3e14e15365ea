//! The cspace allocator and lifecycle.
//!
//! A [`CSpace`] administers one kernel capability table hierarchy from
//! userspace. One-level cspaces are fully pre-allocated at creation;
//! two-level cspaces materialize their second-level tables lazily, on the
//! first allocation that lands in them. Materialization needs a mapped
//! bookkeeping frame, and mapping a frame can itself demand cspace slots,
//! so every two-level cspace carries a standing reserve (the watermark)
//! that is lent to the mapping service and refilled once the outer
//! operation has completed.

use core::fmt;
use core::ptr::NonNull;

use alloc::boxed::Box;

use log::{debug, error, warn};
use muon_sys::{
    CPtr, CapRights, KernelOps, NULL_CAP, ObjectType, PAGE_BITS_4K, PAGE_SIZE_4K, SysError,
    SysResult, WORD_BITS, Word, cap_data,
};
use planck_noalloc::vec::ArrayVec;

use crate::bitfield::Bitfield;
use crate::node::{
    BotLvlNode, MAX_BOT_LVL_NODES, bot_index, node_index, table_index, top_index,
};
use crate::supplier::{UntypedSupplier, UtHandle};
use crate::watermark::Watermark;
use crate::{MAPPING_SLOTS, SLOT_BITS, SLOTS_PER_TABLE, TWO_LEVEL_SLOTS};

/// Errors from cspace creation and internal resource acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CSpaceError {
    /// The host allocator could not provide bookkeeping memory.
    HostMemoryExhausted,
    /// No free capability slot was available.
    SlotsExhausted,
    /// The supplier had no 4 KiB untyped to give.
    SupplierExhausted,
    /// A second-level table or its bookkeeping frame could not be
    /// materialized.
    Materialization,
    /// The kernel rejected a primitive; passed through verbatim.
    Kernel(SysError),
}

impl fmt::Display for CSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostMemoryExhausted => f.write_str("host allocator out of memory"),
            Self::SlotsExhausted => f.write_str("no free capability slots"),
            Self::SupplierExhausted => f.write_str("untyped supplier exhausted"),
            Self::Materialization => f.write_str("failed to materialize cspace levels"),
            Self::Kernel(err) => write!(f, "kernel error: {err}"),
        }
    }
}

/// Two-level bookkeeping: the node directory and the mapping reserve.
struct TwoLevel {
    /// Append-only directory of bookkeeping node frames, indexed by
    /// [`node_index`]. Entry `i` exists iff `i < directory.len()`.
    directory: ArrayVec<NonNull<BotLvlNode>, MAX_BOT_LVL_NODES>,
    watermark: Watermark,
}

/// The two table shapes, each with its own addressing and bookkeeping.
enum Mode {
    /// A single table; a slot name indexes it directly.
    OneLevel,
    /// A top table of second-level tables; a slot name is `top || bot`.
    TwoLevel(Box<TwoLevel>),
}

/// A capability space: one protection domain's capability table hierarchy
/// and the userspace bookkeeping that allocates out of it.
///
/// Not thread safe; callers sharing a cspace across execution contexts
/// must serialize every operation externally.
pub struct CSpace {
    /// Capability naming the root table, living in the bootstrap cspace.
    root: CPtr,
    /// Backing untyped of the root table; null on the primordial cspace.
    root_ut: UtHandle,
    /// The cspace whose slots back our root and bookkeeping frames.
    /// `None` only on the primordial cspace.
    bootstrap: Option<NonNull<CSpace>>,
    supplier: UntypedSupplier,
    kernel: KernelOps,
    /// Use bitmap of the top (or only) table. A set bit means no further
    /// slot can be produced from that index without a free first.
    top: Box<Bitfield>,
    mode: Mode,
}

impl CSpace {
    /// Wraps the boot-provided root table as the primordial cspace.
    ///
    /// The primordial cspace is one-level, has no bootstrap, and can never
    /// be destroyed. Slots `[0, first_free)` are marked used, matching the
    /// boot protocol's report of where its own consumption ends.
    pub fn primordial(
        root: CPtr,
        first_free: CPtr,
        supplier: UntypedSupplier,
        kernel: KernelOps,
    ) -> Result<Self, CSpaceError> {
        let mut top =
            Box::try_new(Bitfield::new()).map_err(|_| CSpaceError::HostMemoryExhausted)?;
        for slot in 0..first_free.min(SLOTS_PER_TABLE) {
            top.set(slot);
        }
        Ok(Self {
            root,
            root_ut: UtHandle::NULL,
            bootstrap: None,
            supplier,
            kernel,
            top,
            mode: Mode::OneLevel,
        })
    }

    /// Creates a one-level cspace whose root table is minted inside
    /// `bootstrap`. The child inherits the bootstrap's supplier.
    ///
    /// # Safety
    ///
    /// The returned cspace keeps a pointer to `bootstrap`: the bootstrap
    /// must outlive it, must not move, and must not be borrowed while an
    /// operation on the child is in flight.
    pub unsafe fn create_one_level(bootstrap: &mut CSpace) -> Result<CSpace, CSpaceError> {
        let supplier = bootstrap.supplier;
        // SAFETY: contract forwarded to the caller.
        unsafe { Self::create(bootstrap, supplier, false) }
    }

    /// Creates a two-level cspace whose root table is minted inside
    /// `bootstrap` and whose untypeds come from `supplier`.
    ///
    /// # Safety
    ///
    /// Same contract as [`CSpace::create_one_level`].
    pub unsafe fn create_two_level(
        bootstrap: &mut CSpace,
        supplier: UntypedSupplier,
    ) -> Result<CSpace, CSpaceError> {
        // SAFETY: contract forwarded to the caller.
        unsafe { Self::create(bootstrap, supplier, true) }
    }

    /// Shared creation path. See the public wrappers for the safety
    /// contract.
    unsafe fn create(
        bootstrap: &mut CSpace,
        supplier: UntypedSupplier,
        two_level: bool,
    ) -> Result<CSpace, CSpaceError> {
        let top = Box::try_new(Bitfield::new()).map_err(|_| CSpaceError::HostMemoryExhausted)?;
        let mode = if two_level {
            let two = Box::try_new(TwoLevel {
                directory: ArrayVec::new(),
                watermark: Watermark::empty(),
            })
            .map_err(|_| CSpaceError::HostMemoryExhausted)?;
            Mode::TwoLevel(two)
        } else {
            Mode::OneLevel
        };

        debug!("creating a {} cspace", if two_level { "two-level" } else { "one-level" });

        // Retype the root table into a temporary bootstrap slot.
        let (root_ut, tmp) = bootstrap.retype_4k(ObjectType::CapTable)?;

        // The guard pads the table hierarchy's depth out to the full word
        // width, so slots are invoked with depth WORD_BITS everywhere.
        let levels = if two_level { 2 } else { 1 };
        let guard = cap_data(0, WORD_BITS - SLOT_BITS * levels);

        let Some(root) = bootstrap.alloc_slot() else {
            error!("no bootstrap slot for the new root table");
            let _ = bootstrap.delete(tmp);
            bootstrap.free_slot(tmp);
            let sup = bootstrap.supplier;
            (sup.free_4k)(sup.cookie, root_ut);
            return Err(CSpaceError::SlotsExhausted);
        };

        if let Err(err) = bootstrap.mint(root, tmp, CapRights::all(), guard) {
            error!("failed to mint the guarded root table: {err}");
            bootstrap.free_slot(root);
            let _ = bootstrap.delete(tmp);
            bootstrap.free_slot(tmp);
            let sup = bootstrap.supplier;
            (sup.free_4k)(sup.cookie, root_ut);
            return Err(CSpaceError::Kernel(err));
        }

        // The unguarded original is no longer needed.
        let _ = bootstrap.delete(tmp);
        bootstrap.free_slot(tmp);

        let mut target = CSpace {
            root,
            root_ut,
            bootstrap: Some(NonNull::from(&mut *bootstrap)),
            supplier,
            kernel: bootstrap.kernel,
            top,
            mode,
        };

        if two_level {
            // The table covering slot 0 must exist before slot 0 can be
            // reserved, and materializing it is what first exercises the
            // mapping service. The reserve is still empty here, so fund
            // every entry once slot 0 is in place.
            let mut used: Word = 0;
            if !target.ensure_levels(NULL_CAP, &mut used) {
                debug!("failed to materialize the first second-level table");
                target.release();
                return Err(CSpaceError::Materialization);
            }
            let zero = target.alloc_slot();
            debug_assert_eq!(zero, Some(NULL_CAP), "slot 0 must be the first allocation");
            target.refill_watermark(Watermark::full_mask());
        } else {
            // Reserve slot 0 so the null capability is never handed out.
            let zero = target.alloc_slot();
            debug_assert_eq!(zero, Some(NULL_CAP), "slot 0 must be the first allocation");
        }

        debug!("finished creating the new cspace");
        Ok(target)
    }

    /// Tears the cspace down, returning every untyped to its supplier and
    /// every bootstrap slot to the bootstrap cspace.
    ///
    /// Second-level tables and bookkeeping frames are released even though
    /// they were never unmapped; the address space dies with the domain.
    ///
    /// # Panics
    ///
    /// The primordial cspace has no bootstrap to free its root into;
    /// destroying it is fatal.
    pub fn destroy(mut self) {
        if self.bootstrap.is_none() {
            error!("cannot destroy the primordial cspace");
            panic!("cspace: destroy of the primordial cspace");
        }
        self.release();
    }

    /// Releases every kernel-side and supplier-side resource. Requires a
    /// bootstrap; no-op on the primordial cspace.
    fn release(&mut self) {
        let Some(bs_ptr) = self.bootstrap else {
            return;
        };
        let own_sup = self.supplier;
        // SAFETY: the creation contract keeps the bootstrap alive, in
        // place, and unborrowed for as long as we exist.
        let bootstrap = unsafe { &mut *bs_ptr.as_ptr() };
        let boot_sup = bootstrap.supplier;

        if let Mode::TwoLevel(two) = &mut self.mode {
            for node_ptr in two.directory.iter() {
                // SAFETY: every directory entry points at a live mapped
                // bookkeeping frame.
                let node = unsafe { node_ptr.as_ref() };
                for record in node.tables.iter().take(node.n_tables) {
                    (own_sup.free_4k)(own_sup.cookie, record.untyped);
                }
                let _ = bootstrap.delete(node.frame);
                bootstrap.free_slot(node.frame);
                (boot_sup.free_4k)(boot_sup.cookie, node.untyped);
            }
            two.directory.clear();
        }

        if self.root != NULL_CAP {
            let _ = bootstrap.delete(self.root);
            bootstrap.free_slot(self.root);
        }
        if !self.root_ut.is_null() {
            (boot_sup.free_4k)(boot_sup.cookie, self.root_ut);
        }
    }

    /// Allocates the lowest free slot, returning its name.
    ///
    /// Returns `None` when the cspace is full or a second-level table
    /// could not be materialized; in the latter case everything acquired
    /// along the way has already been released.
    pub fn alloc_slot(&mut self) -> Option<CPtr> {
        let Some(top) = self.top.first_free() else {
            error!("cspace is full");
            return None;
        };
        if let Mode::OneLevel = self.mode {
            self.top.set(top);
            return Some(top);
        }
        self.alloc_two_level(top)
    }

    fn alloc_two_level(&mut self, top: usize) -> Option<CPtr> {
        let cptr = top << SLOT_BITS;
        let mut used: Word = 0;

        if !self.levels_present(cptr) && !self.ensure_levels(cptr, &mut used) {
            // Failed materialization may still have spent reserve entries
            // on a successful mapping; hand those back before reporting.
            self.refill_watermark(used);
            return None;
        }

        let node_ptr = {
            let Mode::TwoLevel(two) = &self.mode else {
                unreachable!()
            };
            two.directory[node_index(cptr)]
        };
        // SAFETY: levels_present/ensure_levels guarantee the node frame
        // and the table record exist; the frame stays mapped for the
        // cspace's lifetime and we are the only execution context.
        let node = unsafe { &mut *node_ptr.as_ptr() };
        let record = &mut node.tables[table_index(cptr)];

        let Some(bot) = record.bitmap.first_free() else {
            error!("second-level table full below an unset top bit");
            self.refill_watermark(used);
            return None;
        };
        record.bitmap.set(bot);
        if bot == SLOTS_PER_TABLE - 1 {
            // That was the table's last slot; stop searches landing here.
            self.top.set(top);
        }

        self.refill_watermark(used);
        Some(cptr | bot)
    }

    /// Marks `cptr` free again.
    ///
    /// Freeing an out-of-range, never-materialized, or null slot is
    /// misuse: it is logged and otherwise ignored. Freeing never
    /// unmaterializes a second-level table.
    pub fn free_slot(&mut self, cptr: CPtr) {
        if cptr == NULL_CAP {
            error!("attempt to free the null capability");
            return;
        }
        match &mut self.mode {
            Mode::OneLevel => {
                if cptr >= SLOTS_PER_TABLE {
                    error!("attempt to free a slot beyond the cspace bounds");
                    return;
                }
                self.top.clear(cptr);
            }
            Mode::TwoLevel(two) => {
                if cptr >= TWO_LEVEL_SLOTS {
                    error!("attempt to free a slot beyond the cspace bounds");
                    return;
                }
                // The covering table now has room whether or not it was
                // full, so the top bit always comes back down.
                self.top.clear(top_index(cptr));

                let node = node_index(cptr);
                if node >= two.directory.len() {
                    error!("attempt to free an unallocated slot");
                    return;
                }
                // SAFETY: directory entries point at live mapped frames.
                let node_ref = unsafe { &mut *two.directory[node].as_ptr() };
                let table = table_index(cptr);
                if table >= node_ref.n_tables {
                    error!("attempt to free an unallocated slot");
                    return;
                }
                node_ref.tables[table].bitmap.clear(bot_index(cptr));
            }
        }
    }

    /// Retypes the untyped named by `untyped` into `target`, producing one
    /// object of `ty`.
    ///
    /// Table objects are sized by their branching factor: pass slot-bits,
    /// not byte-bits, when `ty` is [`ObjectType::CapTable`].
    pub fn untyped_retype(
        &mut self,
        untyped: CPtr,
        target: CPtr,
        ty: ObjectType,
        size_bits: usize,
    ) -> SysResult {
        let k = self.kernel;
        match self.mode {
            // Address the second-level table holding the target directly.
            Mode::TwoLevel(_) => (k.untyped_retype)(
                k.cookie,
                untyped,
                ty,
                size_bits,
                self.root,
                target >> SLOT_BITS,
                (WORD_BITS - SLOT_BITS) as u8,
                target % SLOTS_PER_TABLE,
                1,
            ),
            Mode::OneLevel => (k.untyped_retype)(
                k.cookie,
                untyped,
                ty,
                size_bits,
                self.root,
                0,
                0,
                target,
                1,
            ),
        }
    }

    /// Copies the capability in `src` into `dest` (both slots of this
    /// cspace), applying `rights` and `badge`.
    pub fn mint(&mut self, dest: CPtr, src: CPtr, rights: CapRights, badge: Word) -> SysResult {
        let k = self.kernel;
        (k.cnode_mint)(
            k.cookie,
            self.root,
            dest,
            WORD_BITS as u8,
            self.root,
            src,
            WORD_BITS as u8,
            rights,
            badge,
        )
    }

    /// Removes the capability in `cptr`, leaving the slot empty (but still
    /// allocated).
    pub fn delete(&mut self, cptr: CPtr) -> SysResult {
        let k = self.kernel;
        (k.cnode_delete)(k.cookie, self.root, cptr, WORD_BITS as u8)
    }

    /// The root table capability, as a slot of the bootstrap cspace.
    pub fn root(&self) -> CPtr {
        self.root
    }

    /// Whether this cspace uses the two-level layout.
    pub fn is_two_level(&self) -> bool {
        matches!(self.mode, Mode::TwoLevel(_))
    }

    /// Whether `cptr` currently names an allocated slot.
    pub fn is_allocated(&self, cptr: CPtr) -> bool {
        match &self.mode {
            Mode::OneLevel => cptr < SLOTS_PER_TABLE && self.top.get(cptr),
            Mode::TwoLevel(two) => {
                if cptr >= TWO_LEVEL_SLOTS {
                    return false;
                }
                let node = node_index(cptr);
                if node >= two.directory.len() {
                    return false;
                }
                // SAFETY: directory entries point at live mapped frames.
                let node_ref = unsafe { two.directory[node].as_ref() };
                let table = table_index(cptr);
                table < node_ref.n_tables && node_ref.tables[table].bitmap.get(bot_index(cptr))
            }
        }
    }

    /// The current mapping reserve, or `None` on a one-level cspace.
    pub fn watermark_slots(&self) -> Option<&[CPtr; MAPPING_SLOTS]> {
        match &self.mode {
            Mode::TwoLevel(two) => Some(two.watermark.slots()),
            Mode::OneLevel => None,
        }
    }

    /// Allocates a 4 KiB untyped from this cspace's supplier and retypes
    /// it into a freshly allocated slot of this cspace. Returns the
    /// untyped's handle and the new slot. Unwinds fully on failure.
    fn retype_4k(&mut self, ty: ObjectType) -> Result<(UtHandle, CPtr), CSpaceError> {
        let sup = self.supplier;
        let mut ut_cptr = NULL_CAP;
        let Some(untyped) = (sup.alloc_4k)(sup.cookie, &mut ut_cptr) else {
            error!("supplier has no 4 KiB untyped");
            return Err(CSpaceError::SupplierExhausted);
        };

        let Some(slot) = self.alloc_slot() else {
            error!("failed to allocate a slot to retype into");
            (sup.free_4k)(sup.cookie, untyped);
            return Err(CSpaceError::SlotsExhausted);
        };

        // Only 4 KiB objects come through here, but tables are sized by
        // their branching factor rather than their footprint.
        let size_bits = match ty {
            ObjectType::CapTable => SLOT_BITS,
            _ => PAGE_BITS_4K,
        };

        if let Err(err) = self.untyped_retype(ut_cptr, slot, ty, size_bits) {
            error!("retype failed: {err}");
            self.free_slot(slot);
            (sup.free_4k)(sup.cookie, untyped);
            return Err(CSpaceError::Kernel(err));
        }

        Ok((untyped, slot))
    }

    fn directory_len(&self) -> usize {
        match &self.mode {
            Mode::TwoLevel(two) => two.directory.len(),
            Mode::OneLevel => 0,
        }
    }

    /// Whether the node frame and second-level table covering `cptr`
    /// already exist.
    fn levels_present(&self, cptr: CPtr) -> bool {
        match &self.mode {
            Mode::OneLevel => true,
            Mode::TwoLevel(two) => {
                let node = node_index(cptr);
                node < two.directory.len() && {
                    // SAFETY: directory entries point at live mapped frames.
                    let node_ref = unsafe { two.directory[node].as_ref() };
                    table_index(cptr) < node_ref.n_tables
                }
            }
        }
    }

    /// Materializes the node frame and second-level table covering `cptr`.
    ///
    /// Consumed reserve entries are reported through `used`; the caller
    /// refills them once its own bookkeeping is settled. Any interior
    /// failure releases what this call acquired, in reverse order, and
    /// leaves the directory as it found it.
    fn ensure_levels(&mut self, cptr: CPtr, used: &mut Word) -> bool {
        if let Mode::OneLevel = self.mode {
            // One-level cspaces are fully pre-allocated.
            return true;
        }
        let node = node_index(cptr);

        if node >= self.directory_len() {
            // Tables fill lowest-first, so a new node is always the next one.
            debug_assert_eq!(node, self.directory_len());

            let Some(bs_ptr) = self.bootstrap else {
                error!("two-level cspace without a bootstrap cspace");
                return false;
            };
            // SAFETY: creation contract; see `release`.
            let bootstrap = unsafe { &mut *bs_ptr.as_ptr() };
            let Ok((untyped, frame)) = bootstrap.retype_4k(ObjectType::SmallPage) else {
                return false;
            };
            let boot_sup = bootstrap.supplier;

            let reserve = {
                let Mode::TwoLevel(two) = &self.mode else {
                    unreachable!()
                };
                // Only the very first node of a fresh cspace maps with an
                // unfunded reserve.
                debug_assert!(node == 0 || two.watermark.is_full());
                two.watermark.image()
            };
            let sup = self.supplier;
            let Some(va) = (sup.map_frame)(sup.cookie, frame, &reserve, used) else {
                debug!("bookkeeping frame mapping failed");
                let _ = bootstrap.delete(frame);
                bootstrap.free_slot(frame);
                (boot_sup.free_4k)(boot_sup.cookie, untyped);
                return false;
            };

            // SAFETY: `va` addresses a private, freshly mapped 4 KiB frame.
            unsafe { core::ptr::write_bytes(va.as_ptr(), 0, PAGE_SIZE_4K) };
            let node_ptr = va.cast::<BotLvlNode>();
            // SAFETY: just zeroed; the all-zero node image is valid.
            let node_ref = unsafe { &mut *node_ptr.as_ptr() };
            node_ref.n_tables = 0;
            node_ref.untyped = untyped;
            node_ref.frame = frame;

            let Mode::TwoLevel(two) = &mut self.mode else {
                unreachable!()
            };
            two.directory.push(node_ptr);
        }

        let node_ptr = {
            let Mode::TwoLevel(two) = &self.mode else {
                unreachable!()
            };
            two.directory[node]
        };
        // SAFETY: the node frame exists (just materialized or found above)
        // and stays mapped; single execution context.
        let node_ref = unsafe { &mut *node_ptr.as_ptr() };

        let table = table_index(cptr);
        if table >= node_ref.n_tables {
            debug_assert_eq!(table, node_ref.n_tables);

            let sup = self.supplier;
            let mut ut_cptr = NULL_CAP;
            let Some(untyped) = (sup.alloc_4k)(sup.cookie, &mut ut_cptr) else {
                error!("supplier has no 4 KiB untyped");
                return false;
            };

            // The table is retyped straight into the root at this top
            // index; no intermediate slot is involved.
            let k = self.kernel;
            if let Err(err) = (k.untyped_retype)(
                k.cookie,
                ut_cptr,
                ObjectType::CapTable,
                SLOT_BITS,
                self.root,
                0,
                0,
                top_index(cptr),
                1,
            ) {
                error!("failed to retype a second-level table: {err}");
                (sup.free_4k)(sup.cookie, untyped);
                return false;
            }

            node_ref.tables[table].untyped = untyped;
            node_ref.n_tables += 1;
        }

        true
    }

    /// Re-allocates every reserve entry `used` reports consumed.
    ///
    /// Runs only after the outer operation has finished with its own
    /// bookkeeping, so the recursive allocations here can never observe a
    /// half-mutated structure.
    fn refill_watermark(&mut self, used: Word) {
        if used == 0 {
            return;
        }
        for i in 0..MAPPING_SLOTS {
            if used & (1 << i) == 0 {
                continue;
            }
            let slot = self.alloc_slot().unwrap_or(NULL_CAP);
            if slot == NULL_CAP {
                warn!("cspace full while refilling the mapping reserve");
            }
            let Mode::TwoLevel(two) = &mut self.mode else {
                return;
            };
            two.watermark.set(i, slot);
        }
    }
}
