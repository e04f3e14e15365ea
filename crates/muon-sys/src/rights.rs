//! Capability access rights.

use bitflags::bitflags;

bitflags! {
    /// Rights carried by a capability, reduced or preserved on mint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapRights: u8 {
        /// Permission to read from / receive on the object.
        const READ = 1 << 0;
        /// Permission to write to / send on the object.
        const WRITE = 1 << 1;
        /// Permission to transfer capabilities through the object.
        const GRANT = 1 << 2;
        /// Permission to transfer reply capabilities.
        const GRANT_REPLY = 1 << 3;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_contains_every_right() {
        let all = CapRights::all();
        assert!(all.contains(CapRights::READ | CapRights::WRITE));
        assert!(all.contains(CapRights::GRANT | CapRights::GRANT_REPLY));
    }
}
