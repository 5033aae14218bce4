use xlat_core::{Dispatch, GuestAddr, Sentinel};

use crate::translator::{
    dispatch_address, handle_lite_counter_threshold_reached, handle_not_translated,
};
use crate::{ExecEnv, GuestMapShadow, GuestThread, RegionTranslator};

/// Why generated code returned to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratedExit {
    /// Left the region; look up the new pc.
    Dispatch,
    /// Self-profiling light code got hot; pc is its region start.
    CounterThresholdReached,
}

/// Reason the execution loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Reached a Stop cell.
    Stop,
    /// Signals are pending, or generated code asked to leave.
    ExitGeneratedCode,
    /// Tried to execute non-executable guest memory at this address.
    NoExec(GuestAddr),
}

/// Main guest execution loop.
///
/// Repeatedly reads the dispatch cell of the current pc and runs what
/// it holds: generated code directly, sentinels through the matching
/// runtime handler, until a sentinel asks to leave.
pub fn run_guest<T, M, G>(env: &ExecEnv<T, M>, thread: &mut G) -> ExitReason
where
    T: RegionTranslator,
    M: GuestMapShadow,
    G: GuestThread,
{
    loop {
        let pc = thread.pc();
        let target = dispatch_address(&env.cache, pc, thread.has_pending_signals());

        let sentinel = match target.classify() {
            Dispatch::Code(code) => {
                match thread.run_generated(code) {
                    GeneratedExit::Dispatch => {}
                    GeneratedExit::CounterThresholdReached => {
                        handle_lite_counter_threshold_reached(env, thread.pc());
                    }
                }
                continue;
            }
            Dispatch::Sentinel(sentinel) => sentinel,
        };

        match sentinel {
            Sentinel::NotTranslated => {
                handle_not_translated(env, pc);
                // Below the translation threshold, or lost the race to
                // another translator: interpret this occurrence.
                if env.cache.read_dispatch_cell(pc) == Sentinel::NotTranslated.host_code() {
                    thread.interpret_insn();
                }
            }
            Sentinel::Translating | Sentinel::Invalidating | Sentinel::Interpret => {
                thread.interpret_insn();
            }
            // Trampoline is about to be published.
            Sentinel::Wrapping => std::thread::yield_now(),
            Sentinel::NoExec => return ExitReason::NoExec(pc),
            Sentinel::Stop => return ExitReason::Stop,
            Sentinel::ExitGeneratedCode => return ExitReason::ExitGeneratedCode,
        }
    }
}
