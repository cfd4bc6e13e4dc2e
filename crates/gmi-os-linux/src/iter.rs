//! Iterators over kernel collections.

use std::{collections::HashSet, iter::FusedIterator};

use gmi_core::{Architecture as _, GmiCore, GmiError, ImageDriver, Pa, Va};

use gmi_arch_aarch64::Aarch64;

/// An iterator for traversing `list_head` entries.
///
/// Yields the containing structure of every node on the circular list,
/// excluding the head itself. The `offset` is subtracted from each node
/// address to get the containing structure, similar to the
/// `container_of` macro in the kernel.
///
/// Every link is an untrusted kernel VA: a non-kernel pointer or a read
/// miss ends the iteration with one final `Err`, and revisiting a node
/// (a corrupted list that loops without closing) ends it silently.
pub struct ListEntryIterator<'a, Driver>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    gmi: &'a GmiCore<Driver>,

    /// Root of all pointer translations.
    kernel_pgd: Pa,

    /// Address of the list head.
    list_head: Va,

    /// Current entry.
    current: Option<Va>,

    /// Offset to the containing structure.
    offset: u64,

    /// Nodes already yielded, for cycle termination.
    seen: HashSet<Va>,

    /// Whether the iteration has ended.
    done: bool,
}

impl<'a, Driver> ListEntryIterator<'a, Driver>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    /// Creates a new list entry iterator.
    pub fn new(gmi: &'a GmiCore<Driver>, kernel_pgd: Pa, list_head: Va, offset: u64) -> Self {
        Self {
            gmi,
            kernel_pgd,
            list_head,
            current: None,
            offset,
            seen: HashSet::new(),
            done: false,
        }
    }

    fn __next(&mut self) -> Result<Option<Va>, GmiError> {
        let entry = match self.current {
            Some(entry) => entry,
            None => {
                let first = self.gmi.read_va((self.list_head, self.kernel_pgd))?;
                self.current = Some(first);
                first
            }
        };

        if entry == self.list_head || !Aarch64::is_kernel_va(entry) || !self.seen.insert(entry) {
            return Ok(None);
        }

        self.current = Some(self.gmi.read_va((entry, self.kernel_pgd))?);

        Ok(Some(entry - self.offset))
    }
}

impl<Driver> Iterator for ListEntryIterator<'_, Driver>
where
    Driver: ImageDriver<Architecture = Aarch64>,
{
    type Item = Result<Va, GmiError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.__next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<Driver> FusedIterator for ListEntryIterator<'_, Driver> where
    Driver: ImageDriver<Architecture = Aarch64>
{
}

#[cfg(test)]
mod tests {
    use gmi_core::GmiCore;

    use super::*;
    use crate::testutil::MockImage;

    const RAM_BASE: u64 = 0x4000_0000;
    const RAM_SIZE: u64 = 0x10_0000;

    const KVA: u64 = 0xFFFF_0000_0000_0000;

    #[test]
    fn yields_members_and_closes_on_the_head() {
        let head = RAM_BASE + 0x1000;
        let a = RAM_BASE + 0x2000;
        let b = RAM_BASE + 0x3000;

        let mut image = MockImage::new(RAM_BASE, RAM_SIZE);
        image.write_u64(head, KVA | a);
        image.write_u64(a, KVA | b);
        image.write_u64(b, KVA | head);

        let gmi = GmiCore::new(image.into_driver()).expect("core");

        let entries: Vec<_> = ListEntryIterator::new(&gmi, Pa(RAM_BASE), Va(KVA | head), 0x10)
            .collect::<Result<_, _>>()
            .expect("list");

        assert_eq!(entries, vec![Va((KVA | a) - 0x10), Va((KVA | b) - 0x10)]);
    }

    #[test]
    fn corrupted_loops_terminate() {
        let head = RAM_BASE + 0x1000;
        let a = RAM_BASE + 0x2000;
        let b = RAM_BASE + 0x3000;

        let mut image = MockImage::new(RAM_BASE, RAM_SIZE);
        image.write_u64(head, KVA | a);
        image.write_u64(a, KVA | b);
        // b points back at a instead of the head.
        image.write_u64(b, KVA | a);

        let gmi = GmiCore::new(image.into_driver()).expect("core");

        let entries: Vec<_> = ListEntryIterator::new(&gmi, Pa(RAM_BASE), Va(KVA | head), 0)
            .collect::<Result<_, _>>()
            .expect("list");

        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn null_links_end_the_iteration() {
        let head = RAM_BASE + 0x1000;

        let image = MockImage::new(RAM_BASE, RAM_SIZE);
        let gmi = GmiCore::new(image.into_driver()).expect("core");

        let mut iter = ListEntryIterator::new(&gmi, Pa(RAM_BASE), Va(KVA | head), 0);
        assert!(iter.next().is_none());
    }
}
