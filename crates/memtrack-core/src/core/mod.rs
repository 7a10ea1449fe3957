mod address;
pub(crate) mod macros;
mod memory_permission;

pub use self::{
    address::{AddressRange, Chunks, Va},
    memory_permission::MemoryPermission,
};
