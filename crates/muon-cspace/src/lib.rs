//! Capability-space management for the muon userland.
//!
//! A cspace is a one- or two-level capability table owned by a single
//! protection domain. This crate administers such tables from userspace:
//! slot allocation and release, lazy materialization of second-level
//! tables, retyping untypeds into table slots, and the full create/destroy
//! lifecycle. The kernel is reached through the [`muon_sys::KernelOps`]
//! call table; physical backing comes from an [`UntypedSupplier`].
//!
//! Nothing here is thread safe. A cspace and everything bootstrapped from
//! it belong to one execution context, and a bootstrap cspace must outlive
//! every cspace created from it.

#![cfg_attr(not(test), no_std)]
#![feature(allocator_api)]

extern crate alloc;

pub mod bitfield;
mod cspace;
mod node;
pub mod supplier;
mod watermark;

pub use cspace::{CSpace, CSpaceError};
pub use supplier::{UntypedSupplier, UtHandle};

/// log2 of the number of slots in one capability table.
pub const SLOT_BITS: usize = 12;

/// Number of slots in one capability table.
pub const SLOTS_PER_TABLE: usize = 1 << SLOT_BITS;

/// Total addressable slots in a two-level cspace.
pub const TWO_LEVEL_SLOTS: usize = 1 << (2 * SLOT_BITS);

/// Most slots the frame-mapping service can consume from a cspace's
/// standing reserve during a single mapping (one per intermediate paging
/// object it may have to install).
pub const MAPPING_SLOTS: usize = 3;
