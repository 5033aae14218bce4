//! Cache of translated guest code regions.
//!
//! Thread-safe: coordinates translation across threads. Every guest
//! region start address has an entry that is a small state machine;
//! only the Translated and Wrapped states hold real code, but the
//! dispatch cell of every address always holds something to jump to.
//!
//! - Reads of dispatch cells are lock- and wait-free.
//! - Every state transition happens under one mutex, so the cell value,
//!   the entry state and the translating set never disagree.
//! - Code generation happens between `acquire_*` and `publish_*`,
//!   outside the mutex.
//!
//! Until a translation finishes its guest extent is unknown, so any
//! range invalidation abandons every translation in flight. The owner
//! finds out at publish time and its result is discarded.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use xlat_core::config::GEAR_SWITCH_THRESHOLD;
use xlat_core::{
    AtomicHostCode, CodeKind, EntryState, GuestAddr, GuestCodeEntry,
    HostCode, HostCodePiece, LockKind, Sentinel,
};

use crate::address_table::{RootSnapshot, SparseAddressTable, TableGeometry};
use crate::region_store::RegionEntryStore;
use crate::ExecError;

/// Exclusive right to finish translating or wrapping one address.
///
/// Returned by the `acquire_*` methods and consumed by the matching
/// `publish_*` method, which releases the lock exactly once.
#[must_use = "a locked entry must be published to release it"]
#[derive(Debug)]
pub struct EntryLock {
    pc: GuestAddr,
    kind: LockKind,
    counter: Arc<AtomicU32>,
}

impl EntryLock {
    #[inline]
    pub fn pc(&self) -> GuestAddr {
        self.pc
    }

    #[inline]
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn invocation_counter(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }

    /// The entry's invocation counter, for self-profiling code.
    pub fn counter(&self) -> &Arc<AtomicU32> {
        &self.counter
    }
}

/// What happened to a published result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// The code is now served from the dispatch cell.
    Installed,
    /// The region was invalidated while locked; the entry was erased.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub translating: usize,
    pub max_guest_size: u32,
    pub leaves: usize,
}

pub struct TranslationCache {
    store: Mutex<RegionEntryStore>,
    table: SparseAddressTable,
}

impl TranslationCache {
    /// Cache for 48-bit guest addresses.
    pub fn new() -> Result<Self, ExecError> {
        Self::with_geometry(TableGeometry::LP64)
    }

    pub fn with_geometry(geometry: TableGeometry) -> Result<Self, ExecError> {
        let table = SparseAddressTable::new(
            Sentinel::NotTranslated.host_code(),
            geometry,
        )
        .map_err(ExecError::AddressTable)?;
        Ok(Self {
            store: Mutex::new(RegionEntryStore::new()),
            table,
        })
    }

    /// Dispatch target for `pc`. Lock-free, never allocates.
    #[inline]
    pub fn read_dispatch_cell(&self, pc: GuestAddr) -> HostCode {
        self.table.read(pc)
    }

    /// Dispatch cell for `pc`, allocating its leaf if needed.
    pub fn dispatch_cell(&self, pc: GuestAddr) -> &AtomicHostCode {
        self.table.get_cell(pc)
    }

    pub fn root_snapshot(&self) -> RootSnapshot<'_> {
        self.table.root_snapshot()
    }

    /// Make `pc` dispatch to the Stop stub if nothing else is there.
    /// Returns whether the cell now holds Stop.
    pub fn set_stop(&self, pc: GuestAddr) -> bool {
        let stop = Sentinel::Stop.host_code();
        match self
            .dispatch_cell(pc)
            .compare_exchange(Sentinel::NotTranslated.host_code(), stop)
        {
            Ok(_) => true,
            Err(current) => current == stop,
        }
    }

    pub fn clear_stop(&self, pc: GuestAddr) {
        self.dispatch_cell(pc)
            .store(Sentinel::NotTranslated.host_code());
    }

    /// Lock `pc` for translation.
    ///
    /// Creates the entry if absent. Returns `None` if the entry already
    /// has code or is locked, or if it has been interpreted fewer than
    /// `threshold` times, in which case its counter is bumped and the
    /// caller should interpret once more.
    pub fn acquire_for_translation(
        &self,
        pc: GuestAddr,
        threshold: u32,
    ) -> Option<EntryLock> {
        let mut store = self.store.lock();
        let cell = self.table.get_cell(pc);

        let (entry, added) = store.get_or_insert(pc, EntryState::NotTranslated);
        if added {
            cell.store(entry.state.cell_value());
        }
        // The cell can hold Stop while the entry is still NotTranslated.
        if entry.state != EntryState::NotTranslated
            || cell.load() != Sentinel::NotTranslated.host_code()
        {
            return None;
        }

        let counter = entry.counter();
        if counter.load(Ordering::Relaxed) < threshold {
            counter.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        Some(self.lock_for_translation(&mut store, pc, None))
    }

    /// Lock a light-translated region for re-translation by the
    /// optimizing tier. The light code keeps being served meanwhile.
    pub fn acquire_for_gear_up(&self, pc: GuestAddr) -> Option<EntryLock> {
        let mut store = self.store.lock();
        // The entry could have been invalidated and erased, or changed
        // kind, since the caller decided to gear up.
        let serving = match store.get(pc)?.state {
            EntryState::Translated {
                kind: CodeKind::LightTranslated,
                code,
            } => code,
            _ => return None,
        };
        Some(self.lock_for_translation(&mut store, pc, Some(serving)))
    }

    fn lock_for_translation(
        &self,
        store: &mut RegionEntryStore,
        pc: GuestAddr,
        serving: Option<HostCode>,
    ) -> EntryLock {
        let counter = match store.get_mut(pc) {
            Some(entry) => {
                entry.state = EntryState::Translating { serving };
                self.table.get_cell(pc).store(entry.state.cell_value());
                Arc::clone(entry.counter())
            }
            None => panic!("locking missing entry {pc:#x}"),
        };
        store.mark_translating(pc);
        tracing::trace!(
            pc = format_args!("{pc:#x}"),
            gear_up = serving.is_some(),
            "locked for translation"
        );
        EntryLock {
            pc,
            kind: LockKind::Translation,
            counter,
        }
    }

    /// Finish a translation: install `code` covering `guest_size`
    /// guest bytes, or discard it if the region was invalidated
    /// meanwhile.
    pub fn publish_translation(
        &self,
        lock: EntryLock,
        guest_size: u32,
        kind: CodeKind,
        code: HostCodePiece,
    ) -> Publish {
        assert!(
            kind.is_translated(),
            "cannot publish translation of {:#x} as {kind:?}",
            lock.pc
        );
        assert_eq!(
            lock.kind,
            LockKind::Translation,
            "publishing translation with a wrapping lock"
        );
        let pc = lock.pc;
        let mut store = self.store.lock();
        let cell = self.table.get_cell(pc);

        let entry = match store.get_mut(pc) {
            Some(entry) => entry,
            None => panic!("publishing translation of missing entry {pc:#x}"),
        };
        let state = entry.state;
        match state {
            EntryState::Invalidating { .. } => {
                cell.store(Sentinel::NotTranslated.host_code());
                store.remove(pc);
                tracing::trace!(
                    pc = format_args!("{pc:#x}"),
                    "translation discarded"
                );
                return Publish::Discarded;
            }
            EntryState::Translating { .. } => {}
            _ => panic!(
                "publishing translation of {pc:#x} in state {state:?} (cell {:?})",
                cell.load()
            ),
        }

        assert!(guest_size > 0, "zero guest size for {pc:#x}");
        entry.state = EntryState::Translated {
            kind,
            code: code.code,
        };
        entry.host_size = code.size;
        entry.guest_size = guest_size;
        cell.store(entry.state.cell_value());

        store.unmark_translating(pc);
        store.note_guest_size(guest_size);
        tracing::trace!(
            pc = format_args!("{pc:#x}"),
            guest_size,
            ?kind,
            code = ?code.code,
            "translation published"
        );
        Publish::Installed
    }

    /// Lock `pc` for generating a call trampoline.
    ///
    /// Only succeeds for an address that has no entry at all.
    pub fn acquire_for_wrapping(&self, pc: GuestAddr) -> Option<EntryLock> {
        let mut store = self.store.lock();
        let cell = self.table.get_cell(pc);

        let (entry, added) = store.get_or_insert(pc, EntryState::Wrapping);
        if !added {
            return None;
        }
        cell.store(entry.state.cell_value());
        tracing::trace!(pc = format_args!("{pc:#x}"), "locked for wrapping");
        Some(EntryLock {
            pc,
            kind: LockKind::Wrapping,
            counter: Arc::clone(entry.counter()),
        })
    }

    pub fn publish_wrapping(
        &self,
        lock: EntryLock,
        is_host_function: bool,
        code: HostCodePiece,
    ) -> Publish {
        assert_eq!(
            lock.kind,
            LockKind::Wrapping,
            "publishing wrapper with a translation lock"
        );
        let pc = lock.pc;
        let mut store = self.store.lock();
        let cell = self.table.get_cell(pc);

        let entry = match store.get_mut(pc) {
            Some(entry) => entry,
            None => panic!("publishing wrapper of missing entry {pc:#x}"),
        };
        let state = entry.state;
        match state {
            EntryState::Invalidating { .. } => {
                cell.store(Sentinel::NotTranslated.host_code());
                store.remove(pc);
                tracing::trace!(pc = format_args!("{pc:#x}"), "wrapper discarded");
                return Publish::Discarded;
            }
            EntryState::Wrapping => {}
            _ => panic!(
                "publishing wrapper of {pc:#x} in state {state:?} (cell {:?})",
                cell.load()
            ),
        }

        entry.state = EntryState::Wrapped {
            host_function: is_host_function,
            code: code.code,
        };
        entry.host_size = code.size;
        // guest_size stays 1 from wrapping.
        assert_eq!(entry.guest_size, 1);
        cell.store(entry.state.cell_value());
        Publish::Installed
    }

    pub fn is_host_function_wrapped(&self, pc: GuestAddr) -> bool {
        self.store
            .lock()
            .get(pc)
            .is_some_and(|e| e.kind() == CodeKind::HostWrapped)
    }

    pub fn invocation_counter(&self, pc: GuestAddr) -> u32 {
        self.store
            .lock()
            .get(pc)
            .map_or(0, GuestCodeEntry::invocation_counter)
    }

    /// Snapshot of the entry for `pc`.
    pub fn entry(&self, pc: GuestAddr) -> Option<GuestCodeEntry> {
        self.store.lock().get(pc).cloned()
    }

    /// Invalidate everything overlapping `[start, end)`.
    ///
    /// All translations in flight are abandoned regardless of the range.
    /// Wrappers in flight that overlap are abandoned. Finished entries
    /// that overlap are erased and their cells reset.
    pub fn invalidate_range(&self, start: GuestAddr, end: GuestAddr) {
        let mut store = self.store.lock();

        for pc in store.take_translating() {
            let entry = match store.get_mut(pc) {
                Some(entry) => entry,
                None => panic!("translating entry {pc:#x} is missing"),
            };
            assert!(
                matches!(entry.state, EntryState::Translating { .. }),
                "translating set holds {pc:#x} in state {:?}",
                entry.state
            );
            entry.state = EntryState::Invalidating {
                abandoned: LockKind::Translation,
            };
            entry.host_size = 0;
            self.table.get_cell(pc).store(entry.state.cell_value());
        }

        if start >= end {
            return;
        }

        let mut erased = Vec::new();
        for (pc, entry) in store.overlapping_mut(start, end) {
            match entry.state {
                // Handled on publish.
                EntryState::Invalidating { .. } => {}
                EntryState::Wrapping => {
                    entry.state = EntryState::Invalidating {
                        abandoned: LockKind::Wrapping,
                    };
                    self.table.get_cell(pc).store(entry.state.cell_value());
                }
                EntryState::Translating { .. } => {
                    unreachable!("translating entry {pc:#x} survived the sweep")
                }
                _ => erased.push(pc),
            }
        }
        for &pc in &erased {
            self.table.get_cell(pc).store(Sentinel::NotTranslated.host_code());
            store.remove(pc);
        }

        tracing::debug!(
            start = format_args!("{start:#x}"),
            end = format_args!("{end:#x}"),
            erased = erased.len(),
            "invalidated guest range"
        );
    }

    /// Make light-translated regions starting within `range` bytes of
    /// `pc` request a gear-up on their next profiling check.
    pub fn trigger_gear_shift(&self, pc: GuestAddr, range: u64) {
        let mut store = self.store.lock();
        let first = pc.saturating_sub(range);
        let last = pc.saturating_add(range);
        for (_, entry) in store.range_mut(first, last) {
            if entry.kind() == CodeKind::LightTranslated {
                entry.counter().store(GEAR_SWITCH_THRESHOLD, Ordering::Relaxed);
            }
        }
    }

    /// Guest start address of the region whose host code contains
    /// `host`. Walks every entry.
    pub fn lookup_guest_pc_by_host_pc(&self, host: HostCode) -> Option<GuestAddr> {
        let store = self.store.lock();
        let found = store.iter().find_map(|(pc, entry)| {
            let code = self.table.read(pc);
            HostCodePiece::new(code, entry.host_size)
                .contains(host)
                .then_some(pc)
        });
        found
    }

    pub fn stats(&self) -> CacheStats {
        let store = self.store.lock();
        CacheStats {
            entries: store.len(),
            translating: store.translating_len(),
            max_guest_size: store.max_guest_size(),
            leaves: self.table.leaf_count(),
        }
    }
}
