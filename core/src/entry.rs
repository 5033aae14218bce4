use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::runtime_library::Sentinel;
use crate::types::HostCode;

/// What kind of code a guest region entry currently maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeKind {
    Interpreted,
    LightTranslated,
    HeavyOptimized,
    GuestWrapped,
    HostWrapped,
    /// Translating, wrapping or invalidating.
    UnderProcessing,
    /// Non-executable, unpredictable, etc.
    SpecialHandler,
}

impl CodeKind {
    /// Kinds a translation may be published with.
    pub fn is_translated(self) -> bool {
        matches!(
            self,
            CodeKind::Interpreted
                | CodeKind::LightTranslated
                | CodeKind::HeavyOptimized
                | CodeKind::SpecialHandler
        )
    }
}

/// Which lock an in-flight entry is held under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Translation,
    Wrapping,
}

/// State of a guest region entry.
///
/// The dispatch cell value and the reported [`CodeKind`] are both
/// derived from this, so they cannot disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Seen (and possibly interpreted) but no code yet.
    NotTranslated,
    /// Locked by a translating thread. `serving` is the light-tier code
    /// that keeps running while a gear-up is in progress.
    Translating { serving: Option<HostCode> },
    /// Lock holder must discard its result on publish.
    Invalidating { abandoned: LockKind },
    Translated { kind: CodeKind, code: HostCode },
    Wrapping,
    Wrapped { host_function: bool, code: HostCode },
}

impl EntryState {
    pub fn kind(&self) -> CodeKind {
        match *self {
            EntryState::NotTranslated => CodeKind::Interpreted,
            EntryState::Translating { .. }
            | EntryState::Invalidating { .. }
            | EntryState::Wrapping => CodeKind::UnderProcessing,
            EntryState::Translated { kind, .. } => kind,
            EntryState::Wrapped { host_function: true, .. } => {
                CodeKind::HostWrapped
            }
            EntryState::Wrapped { host_function: false, .. } => {
                CodeKind::GuestWrapped
            }
        }
    }

    /// Value the dispatch cell must hold in this state.
    pub fn cell_value(&self) -> HostCode {
        match *self {
            EntryState::NotTranslated => Sentinel::NotTranslated.host_code(),
            EntryState::Translating { serving: Some(code) } => code,
            EntryState::Translating { serving: None } => {
                Sentinel::Translating.host_code()
            }
            EntryState::Invalidating { .. } => {
                Sentinel::Invalidating.host_code()
            }
            EntryState::Translated { code, .. } => code,
            EntryState::Wrapping => Sentinel::Wrapping.host_code(),
            EntryState::Wrapped { code, .. } => code,
        }
    }

    /// Held by a translator or wrapper-generator thread.
    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            EntryState::Translating { .. }
                | EntryState::Invalidating { .. }
                | EntryState::Wrapping
        )
    }
}

/// Bookkeeping for one guest region start address.
#[derive(Debug, Clone)]
pub struct GuestCodeEntry {
    pub state: EntryState,
    /// Size of the generated host code.
    pub host_size: u32,
    /// Guest bytes covered. Never zero, even for special entries.
    pub guest_size: u32,
    counter: Arc<AtomicU32>,
}

impl GuestCodeEntry {
    pub fn new(state: EntryState) -> Self {
        Self {
            state,
            host_size: 0,
            guest_size: 1,
            counter: Arc::new(AtomicU32::new(0)),
        }
    }

    #[inline]
    pub fn kind(&self) -> CodeKind {
        self.state.kind()
    }

    pub fn invocation_counter(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Counter shared with self-profiling generated code.
    pub fn counter(&self) -> &Arc<AtomicU32> {
        &self.counter
    }
}
