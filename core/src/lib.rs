//! Shared types for the translation cache: guest/host addresses,
//! dispatch stubs, region entries and configuration.

pub mod config;
pub mod entry;
pub mod runtime_library;
pub mod types;

pub use config::{Config, ConfigError, TranslationMode};
pub use entry::{CodeKind, EntryState, GuestCodeEntry, LockKind};
pub use runtime_library::{Dispatch, Sentinel};
pub use types::{
    AtomicHostCode, GuestAddr, HostCode, HostCodePiece, NULL_GUEST_ADDR,
};
