use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use xlat_core::{EntryState, GuestAddr, GuestCodeEntry};

/// Ordered map of region entries plus the set of entries currently
/// being translated. Always accessed under the cache mutex.
pub(crate) struct RegionEntryStore {
    entries: BTreeMap<GuestAddr, GuestCodeEntry>,
    translating: BTreeSet<GuestAddr>,
    /// Largest published guest size. Bounds how far before an
    /// invalidated range a region may start and still overlap it.
    max_guest_size: u32,
}

impl RegionEntryStore {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            translating: BTreeSet::new(),
            max_guest_size: 1,
        }
    }

    pub fn get(&self, pc: GuestAddr) -> Option<&GuestCodeEntry> {
        self.entries.get(&pc)
    }

    pub fn get_mut(&mut self, pc: GuestAddr) -> Option<&mut GuestCodeEntry> {
        self.entries.get_mut(&pc)
    }

    /// Entry for `pc`, created in `initial` state if absent. The flag
    /// tells whether it was created.
    pub fn get_or_insert(
        &mut self,
        pc: GuestAddr,
        initial: EntryState,
    ) -> (&mut GuestCodeEntry, bool) {
        let mut added = false;
        let entry = self.entries.entry(pc).or_insert_with(|| {
            added = true;
            GuestCodeEntry::new(initial)
        });
        (entry, added)
    }

    pub fn remove(&mut self, pc: GuestAddr) -> Option<GuestCodeEntry> {
        self.translating.remove(&pc);
        let removed = self.entries.remove(&pc);
        if self.entries.is_empty() {
            self.max_guest_size = 1;
        }
        removed
    }

    pub fn mark_translating(&mut self, pc: GuestAddr) {
        let inserted = self.translating.insert(pc);
        assert!(inserted, "entry {pc:#x} is already being translated");
    }

    pub fn unmark_translating(&mut self, pc: GuestAddr) {
        let removed = self.translating.remove(&pc);
        assert!(removed, "entry {pc:#x} is not being translated");
    }

    pub fn take_translating(&mut self) -> BTreeSet<GuestAddr> {
        std::mem::take(&mut self.translating)
    }

    pub fn note_guest_size(&mut self, guest_size: u32) {
        self.max_guest_size = self.max_guest_size.max(guest_size);
    }

    pub fn max_guest_size(&self) -> u32 {
        self.max_guest_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn translating_len(&self) -> usize {
        self.translating.len()
    }

    /// Entries whose `[pc, pc + guest_size)` overlaps `[start, end)`.
    ///
    /// The scan starts `max_guest_size` bytes before `start`, which is
    /// as far back as an overlapping region can begin.
    pub fn overlapping_mut(
        &mut self,
        start: GuestAddr,
        end: GuestAddr,
    ) -> impl Iterator<Item = (GuestAddr, &mut GuestCodeEntry)> {
        assert!(start < end, "empty range [{start:#x}, {end:#x})");
        let max = u64::from(self.max_guest_size);
        let lower = if start <= max {
            Bound::Unbounded
        } else {
            Bound::Excluded(start - max)
        };
        self.entries
            .range_mut((lower, Bound::Excluded(end)))
            .map(|(pc, entry)| (*pc, entry))
            .filter(move |(pc, entry)| {
                assert!(entry.guest_size > 0, "entry {pc:#x} has zero guest size");
                pc.saturating_add(u64::from(entry.guest_size)) > start
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (GuestAddr, &GuestCodeEntry)> {
        self.entries.iter().map(|(&pc, entry)| (pc, entry))
    }

    pub fn range_mut(
        &mut self,
        first: GuestAddr,
        last: GuestAddr,
    ) -> impl Iterator<Item = (GuestAddr, &mut GuestCodeEntry)> {
        self.entries
            .range_mut(first..=last)
            .map(|(&pc, entry)| (pc, entry))
    }
}
