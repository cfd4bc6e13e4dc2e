mod access_context;
pub(crate) mod macros;
mod memory_access;

pub use self::{
    access_context::{AccessContext, AddressContext, Gfn, Pa, TranslationMechanism, Va},
    memory_access::MemoryAccess,
};
