//! Runtime glue between the dispatcher, the translation tiers and the
//! cache.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use xlat_core::config::GUEST_PAGE_SIZE;
use xlat_core::{
    CodeKind, GuestAddr, HostCode, HostCodePiece, Sentinel, TranslationMode,
    NULL_GUEST_ADDR,
};

use crate::translation_cache::{Publish, TranslationCache};
use crate::{ExecEnv, GuestMapShadow, RegionTranslator};

/// Shortest guest instruction. Also the alignment of guest code.
const MIN_INSN_SIZE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationGear {
    /// First translation of a region.
    First,
    /// Re-translation of a hot light-translated region.
    Second,
}

/// Machine code produced by a tier, not yet installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedRegion {
    pub machine_code: Vec<u8>,
    /// Guest bytes covered, starting at the region pc.
    pub guest_size: u32,
}

pub enum LiteOutcome {
    Translated(TranslatedRegion),
    /// The instruction at this address is not supported. If it is past
    /// the region start, translating up to it will succeed.
    StoppedAt(GuestAddr),
}

pub struct LiteParams<'a> {
    pub end_pc: GuestAddr,
    /// Invocation counter the generated code should bump, exiting with
    /// [`GeneratedExit::CounterThresholdReached`] once it reaches
    /// `counter_threshold`. `None` disables self-profiling.
    ///
    /// [`GeneratedExit::CounterThresholdReached`]:
    ///     crate::GeneratedExit::CounterThresholdReached
    pub counter: Option<&'a Arc<AtomicU32>>,
    pub counter_threshold: u32,
}

/// Installed result of a translation, ready to publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionTranslation {
    pub code: HostCodePiece,
    pub guest_size: u32,
    pub kind: CodeKind,
}

impl RegionTranslation {
    /// Interpret the first instruction and re-dispatch.
    fn interpret(first_insn_size: u8) -> Self {
        Self {
            code: HostCodePiece::new(Sentinel::Interpret.host_code(), 0),
            guest_size: first_insn_size.into(),
            kind: CodeKind::Interpreted,
        }
    }

    fn no_exec(first_insn_size: u8) -> Self {
        Self {
            code: HostCodePiece::new(Sentinel::NoExec.host_code(), 0),
            guest_size: first_insn_size.into(),
            kind: CodeKind::SpecialHandler,
        }
    }
}

/// Whether the first instruction at `pc` is executable, and its size.
///
/// The shortest instruction is probed first so the instruction bytes
/// are never read from memory that is not known to be executable.
fn is_pc_executable<T, M>(env: &ExecEnv<T, M>, pc: GuestAddr) -> (bool, u8)
where
    T: RegionTranslator,
    M: GuestMapShadow,
{
    if !env.shadow.is_executable(pc, MIN_INSN_SIZE.into()) {
        return (false, MIN_INSN_SIZE);
    }
    let first_insn_size = env.translator.insn_size(pc);
    if first_insn_size > MIN_INSN_SIZE
        && !env.shadow.is_executable(
            pc + u64::from(MIN_INSN_SIZE),
            u64::from(first_insn_size - MIN_INSN_SIZE),
        )
    {
        return (false, first_insn_size);
    }
    (true, first_insn_size)
}

fn executable_region_size<T, M>(env: &ExecEnv<T, M>, pc: GuestAddr) -> u64
where
    T: RegionTranslator,
    M: GuestMapShadow,
{
    let size = env.shadow.executable_region_size(pc, GUEST_PAGE_SIZE);
    assert!(size > 0, "region at {pc:#x} was checked executable");
    size
}

fn install<T, M>(
    env: &ExecEnv<T, M>,
    pc: GuestAddr,
    region: TranslatedRegion,
    kind: CodeKind,
    tier: &'static str,
) -> RegionTranslation
where
    T: RegionTranslator,
    M: GuestMapShadow,
{
    let code = env
        .code_pool
        .add(&region.machine_code)
        .unwrap_or_else(|err| panic!("failed to install {tier} code for {pc:#x}: {err}"));
    tracing::trace!(
        pc = format_args!("{pc:#x}"),
        tier,
        guest_size = region.guest_size,
        host_size = code.size,
        "installed region"
    );
    RegionTranslation {
        code,
        guest_size: region.guest_size,
        kind,
    }
}

fn try_lite_translate_and_install<T, M>(
    env: &ExecEnv<T, M>,
    pc: GuestAddr,
    counter: Option<&Arc<AtomicU32>>,
) -> Option<RegionTranslation>
where
    T: RegionTranslator,
    M: GuestMapShadow,
{
    let mut params = LiteParams {
        end_pc: pc + executable_region_size(env, pc),
        counter,
        counter_threshold: env.config.gear_switch_threshold,
    };
    let region = match env.translator.lite_translate(pc, &params) {
        LiteOutcome::Translated(region) => region,
        // Not even the first instruction.
        LiteOutcome::StoppedAt(stop_pc) if stop_pc <= pc => return None,
        LiteOutcome::StoppedAt(stop_pc) => {
            params.end_pc = stop_pc;
            match env.translator.lite_translate(pc, &params) {
                LiteOutcome::Translated(region) => region,
                LiteOutcome::StoppedAt(again) => panic!(
                    "lite translation of {pc:#x} up to {stop_pc:#x} stopped at {again:#x}"
                ),
            }
        }
    };
    Some(install(env, pc, region, CodeKind::LightTranslated, "lite"))
}

fn heavy_optimize_and_install<T, M>(
    env: &ExecEnv<T, M>,
    pc: GuestAddr,
) -> Option<RegionTranslation>
where
    T: RegionTranslator,
    M: GuestMapShadow,
{
    let end_pc = pc + executable_region_size(env, pc);
    let region = env.translator.heavy_optimize(pc, end_pc)?;
    Some(install(env, pc, region, CodeKind::HeavyOptimized, "heavy"))
}

/// Translate the region at `pc` with the tiers the configured mode
/// selects for `gear`, and publish the result.
///
/// Returns `None` if the region could not be locked (already has code,
/// is being processed, or is still below the translation threshold).
pub fn translate_region<T, M>(
    env: &ExecEnv<T, M>,
    pc: GuestAddr,
    gear: TranslationGear,
) -> Option<Publish>
where
    T: RegionTranslator,
    M: GuestMapShadow,
{
    let mode = env.config.mode;
    let lock = match gear {
        TranslationGear::First => env
            .cache
            .acquire_for_translation(pc, env.config.translation_threshold)?,
        TranslationGear::Second => {
            assert_eq!(mode, TranslationMode::TwoGear, "gear-up requested in {mode} mode");
            env.cache.acquire_for_gear_up(pc)?
        }
    };

    let (is_executable, first_insn_size) = is_pc_executable(env, pc);
    let result = if !is_executable {
        RegionTranslation::no_exec(first_insn_size)
    } else {
        let translated = match (mode, gear) {
            (TranslationMode::InterpretOnly, _) => None,
            (TranslationMode::LiteTranslateOrFallbackToInterpret, _) => {
                try_lite_translate_and_install(env, pc, None)
            }
            // Heavy supports more instructions than lite.
            (TranslationMode::TwoGear, TranslationGear::First) => {
                try_lite_translate_and_install(env, pc, Some(lock.counter()))
                    .or_else(|| heavy_optimize_and_install(env, pc))
            }
            (TranslationMode::HeavyOptimizeOrFallbackToInterpret, _)
            | (TranslationMode::TwoGear, TranslationGear::Second) => {
                heavy_optimize_and_install(env, pc)
            }
            (TranslationMode::HeavyOptimizeOrFallbackToLiteTranslator, _) => {
                heavy_optimize_and_install(env, pc)
                    .or_else(|| try_lite_translate_and_install(env, pc, None))
            }
        };
        translated.unwrap_or_else(|| RegionTranslation::interpret(first_insn_size))
    };

    Some(
        env.cache
            .publish_translation(lock, result.guest_size, result.kind, result.code),
    )
}

/// Runtime entry for a cell holding the NotTranslated stub.
pub fn handle_not_translated<T, M>(env: &ExecEnv<T, M>, pc: GuestAddr)
where
    T: RegionTranslator,
    M: GuestMapShadow,
{
    translate_region(env, pc, TranslationGear::First);
}

/// Runtime entry for self-profiling light code whose counter reached
/// the gear switch threshold.
pub fn handle_lite_counter_threshold_reached<T, M>(env: &ExecEnv<T, M>, pc: GuestAddr)
where
    T: RegionTranslator,
    M: GuestMapShadow,
{
    assert_eq!(
        env.config.mode,
        TranslationMode::TwoGear,
        "self-profiling code outside two-gear mode"
    );
    translate_region(env, pc, TranslationGear::Second);
}

/// Where to continue after generated code left to the dispatcher.
pub fn dispatch_address(
    cache: &TranslationCache,
    pc: GuestAddr,
    pending_signals: bool,
) -> HostCode {
    if pending_signals {
        return Sentinel::ExitGeneratedCode.host_code();
    }
    cache.read_dispatch_cell(pc)
}

/// Make `pc` callable through a trampoline produced by `build`.
///
/// A null `pc` is ignored. The trampoline is built only if `pc` has
/// never been seen before; otherwise returns `None`.
pub fn wrap_function<T, M, F>(
    env: &ExecEnv<T, M>,
    pc: GuestAddr,
    is_host_function: bool,
    name: &str,
    build: F,
) -> Option<Publish>
where
    T: RegionTranslator,
    M: GuestMapShadow,
    F: FnOnce(GuestAddr) -> Vec<u8>,
{
    if pc == NULL_GUEST_ADDR {
        return None;
    }
    // The guest cannot encode a call to it by immediate.
    if pc % u64::from(MIN_INSN_SIZE) != 0 {
        tracing::warn!(
            pc = format_args!("{pc:#x}"),
            name,
            "address of wrapped function is not aligned"
        );
    }
    let lock = env.cache.acquire_for_wrapping(pc)?;
    let machine_code = build(pc);
    let code = env
        .code_pool
        .add(&machine_code)
        .unwrap_or_else(|err| panic!("failed to install trampoline for {name}: {err}"));
    Some(env.cache.publish_wrapping(lock, is_host_function, code))
}

/// `pc` itself if it is the address of a wrapped host function.
pub fn unwrap_host_function(cache: &TranslationCache, pc: GuestAddr) -> Option<GuestAddr> {
    cache.is_host_function_wrapped(pc).then_some(pc)
}
