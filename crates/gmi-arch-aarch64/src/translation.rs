use smallvec::SmallVec;

use gmi_core::Pa;

use super::{PageTableEntry, PageTableLevel};

/// A single entry in the page table hierarchy during virtual address
/// translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    /// The level of the page table hierarchy this entry belongs to.
    pub level: PageTableLevel,

    /// The descriptor itself.
    pub entry: PageTableEntry,

    /// The physical address where this descriptor is located in the image.
    pub entry_address: Pa,
}

/// Collection of translation entries gathered during a page table walk.
pub type TranslationEntries = SmallVec<[TranslationEntry; 4]>;

/// The result of a diagnostic virtual address translation.
///
/// Unlike the plain translate call, this records every descriptor read on
/// the way down, which is useful when deciding why an address does not
/// resolve.
#[derive(Debug)]
pub struct VaTranslation {
    /// The page table entries traversed during the translation process.
    pub(crate) entries: TranslationEntries,

    /// The physical address corresponding to the virtual address, if the
    /// translation was successful.
    pub(crate) pa: Option<Pa>,
}

impl VaTranslation {
    /// Returns the page table entries traversed during the translation
    /// process.
    pub fn entries(&self) -> &[TranslationEntry] {
        &self.entries
    }

    /// Consumes the `VaTranslation` and returns the entries.
    pub fn into_entries(self) -> TranslationEntries {
        self.entries
    }

    /// Returns the physical address resulting from the translation, if
    /// successful.
    pub fn pa(&self) -> Option<Pa> {
        self.pa
    }
}

impl IntoIterator for VaTranslation {
    type Item = TranslationEntry;
    type IntoIter = <TranslationEntries as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
