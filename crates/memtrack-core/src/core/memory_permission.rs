use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Host page permission flags.
    ///
    /// The empty set means no access at all: any access to the page faults.
    /// Intersecting two permissions (`a & b`) yields the more restrictive
    /// one, which is how the permission of a region shared by several
    /// handles is derived.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryPermission: u8 {
        /// Read permission.
        const R = 0b00000001;

        /// Write permission.
        const W = 0b00000010;

        /// Combined Read and Write permissions.
        const RW = Self::R.bits() | Self::W.bits();
    }
}

impl MemoryPermission {
    /// No access. Alias of [`MemoryPermission::empty`].
    pub const NONE: Self = Self::empty();
}

impl std::fmt::Display for MemoryPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut result = [b'-'; 2];

        if self.contains(MemoryPermission::R) {
            result[0] = b'r';
        }
        if self.contains(MemoryPermission::W) {
            result[1] = b'w';
        }

        // SAFETY: The `result` array is always valid UTF-8.
        f.write_str(unsafe { std::str::from_utf8_unchecked(&result) })
    }
}
