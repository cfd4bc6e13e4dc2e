use serde::{Deserialize, Serialize};

use super::macros::impl_ops;

impl_ops!(Gfn, u64, "Guest Frame Number");
impl_ops!(Pa, u64, "Guest Physical Address");
impl_ops!(Va, u64, "Guest Virtual Address");

impl Va {
    /// Checks if the virtual address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Pa {
    /// Checks if the physical address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A virtual address paired with the translation root that resolves it.
///
/// Used for reporting translation faults: the same virtual address means
/// different things under different page-table roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressContext {
    /// The virtual address.
    pub va: Va,

    /// The physical address of the top-level page directory.
    pub root: Pa,
}

impl AddressContext {
    /// Creates a new `AddressContext`.
    pub fn new(va: impl Into<Va>, root: impl Into<Pa>) -> Self {
        Self {
            va: va.into(),
            root: root.into(),
        }
    }
}

impl From<(Va, Pa)> for AddressContext {
    fn from(value: (Va, Pa)) -> Self {
        Self::new(value.0, value.1)
    }
}

/// The mechanism used for resolving an address against the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TranslationMechanism {
    /// Direct mapping (no translation).
    ///
    /// The address is treated as a guest physical address.
    Direct,

    /// Paging-based translation.
    ///
    /// The address is a guest virtual address, resolved by walking the page
    /// tables rooted at `root`.
    Paging {
        /// The physical address of the top-level page directory.
        root: Pa,
    },
}

/// Defines the context for a memory access against the image.
///
/// Encapsulates the target address and the mechanism used to resolve it into
/// an image offset. Every read helper on [`GmiCore`] accepts anything that
/// converts into an `AccessContext`; a bare [`Pa`] converts to a direct
/// access, a `(Va, Pa)` pair to a paging access.
///
/// [`GmiCore`]: crate::GmiCore
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccessContext {
    /// The address to access.
    ///
    /// Interpreted according to the [`mechanism`] field.
    ///
    /// [`mechanism`]: Self::mechanism
    pub address: u64,

    /// The mechanism used for address resolution.
    pub mechanism: TranslationMechanism,
}

impl AccessContext {
    /// Creates a new `AccessContext` with direct mapping.
    pub fn direct(address: impl Into<Pa>) -> Self {
        Self {
            address: u64::from(address.into()),
            mechanism: TranslationMechanism::Direct,
        }
    }

    /// Creates a new `AccessContext` with paging-based translation.
    pub fn paging(address: impl Into<Va>, root: impl Into<Pa>) -> Self {
        Self {
            address: address.into().0,
            mechanism: TranslationMechanism::Paging { root: root.into() },
        }
    }
}

impl From<Pa> for AccessContext {
    fn from(value: Pa) -> Self {
        Self::direct(value)
    }
}

impl From<(Va, Pa)> for AccessContext {
    fn from(value: (Va, Pa)) -> Self {
        Self::paging(value.0, value.1)
    }
}

impl From<AddressContext> for AccessContext {
    fn from(value: AddressContext) -> Self {
        Self::paging(value.va, value.root)
    }
}

impl ::std::ops::Add<u64> for AccessContext {
    type Output = AccessContext;

    fn add(self, rhs: u64) -> Self::Output {
        Self {
            address: self.address + rhs,
            ..self
        }
    }
}

impl ::std::ops::AddAssign<u64> for AccessContext {
    fn add_assign(&mut self, rhs: u64) {
        self.address += rhs;
    }
}
