//! Kernel object types.

use crate::PAGE_BITS_4K;

/// The kind of object an untyped can be retyped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    /// Raw unformed memory, subdividable by further retypes.
    Untyped,
    /// A capability table. Sized by the caller in slot-bits, not byte-bits.
    CapTable,
    /// A 4 KiB page frame.
    SmallPage,
    /// A synchronous IPC endpoint.
    Endpoint,
    /// An asynchronous notification object.
    Notification,
    /// A thread control block.
    Tcb,
}

impl ObjectType {
    /// Returns the fixed log2 size of the object, or `None` for types whose
    /// size the caller chooses at retype time (`Untyped` is sized in
    /// byte-bits, `CapTable` in slot-bits).
    pub const fn size_bits(self) -> Option<usize> {
        match self {
            Self::Untyped | Self::CapTable => None,
            Self::SmallPage => Some(PAGE_BITS_4K),
            Self::Endpoint | Self::Notification => Some(4),
            Self::Tcb => Some(11),
        }
    }
}
