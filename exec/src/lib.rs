//! Translation cache and execution glue.
//!
//! Maps guest program counters to host code through a lock-free
//! two-level table, coordinates translation, gear-up, wrapping and
//! invalidation of guest regions across threads, and drives the
//! dispatch -> translate -> execute cycle.

pub mod address_table;
pub mod exec_loop;
mod region_store;
pub mod translation_cache;
pub mod translator;

pub use address_table::{RootSnapshot, SparseAddressTable, TableGeometry};
pub use exec_loop::{run_guest, ExitReason, GeneratedExit};
pub use translation_cache::{CacheStats, EntryLock, Publish, TranslationCache};
pub use translator::{
    dispatch_address, handle_lite_counter_threshold_reached,
    handle_not_translated, translate_region, unwrap_host_function,
    wrap_function, LiteOutcome, LiteParams, RegionTranslation,
    TranslatedRegion, TranslationGear,
};

use std::io;

use thiserror::Error;
use xlat_backend::CodePool;
use xlat_core::{Config, ConfigError, GuestAddr, HostCode};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to map address table: {0}")]
    AddressTable(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Guest thread state driven by [`run_guest`].
pub trait GuestThread {
    /// Current guest program counter.
    fn pc(&self) -> GuestAddr;

    /// Whether signals are waiting to be delivered to this thread.
    fn has_pending_signals(&self) -> bool;

    /// Interpret the instruction at `pc()` and advance.
    fn interpret_insn(&mut self);

    /// Run generated code starting at `code` until it leaves for the
    /// dispatcher.
    fn run_generated(&mut self, code: HostCode) -> GeneratedExit;
}

/// Region translation tiers.
///
/// Implementations emit machine code only; installing it and
/// publishing it into the cache is done by [`translate_region`].
pub trait RegionTranslator: Send + Sync {
    /// Size of the instruction at `pc`. At least two bytes at `pc`
    /// are known to be executable.
    fn insn_size(&self, pc: GuestAddr) -> u8;

    /// Cheap single-pass translation.
    fn lite_translate(&self, pc: GuestAddr, params: &LiteParams<'_>) -> LiteOutcome;

    /// Optimizing translation of up to `end_pc`. `None` if not even the
    /// first instruction could be translated.
    fn heavy_optimize(&self, pc: GuestAddr, end_pc: GuestAddr) -> Option<TranslatedRegion>;
}

/// Executable-bit shadow of guest memory.
pub trait GuestMapShadow: Send + Sync {
    /// Whether all of `[pc, pc + len)` is executable.
    fn is_executable(&self, pc: GuestAddr, len: u64) -> bool;

    /// Length of the executable run starting at `pc`, capped at
    /// `max_size`. Zero if `pc` is not executable.
    fn executable_region_size(&self, pc: GuestAddr, max_size: u64) -> u64;
}

/// Execution environment holding all shared translation state.
///
/// Shared by reference between every guest thread.
pub struct ExecEnv<T: RegionTranslator, M: GuestMapShadow> {
    pub cache: TranslationCache,
    pub code_pool: CodePool,
    pub translator: T,
    pub shadow: M,
    pub config: Config,
}

impl<T: RegionTranslator, M: GuestMapShadow> ExecEnv<T, M> {
    pub fn new(config: Config, translator: T, shadow: M) -> Result<Self, ExecError> {
        config.validate()?;
        let geometry = TableGeometry::for_guest_addr_bits(config.guest_addr_bits)
            .ok_or(ConfigError::UnsupportedAddrBits(config.guest_addr_bits))?;
        let cache = TranslationCache::with_geometry(geometry)?;
        tracing::info!(
            mode = %config.mode,
            translation_threshold = config.translation_threshold,
            guest_addr_bits = config.guest_addr_bits,
            "execution environment ready"
        );
        Ok(Self {
            cache,
            code_pool: CodePool::new(),
            translator,
            shadow,
            config,
        })
    }
}
