//! Dispatch stubs.
//!
//! Every dispatch cell holds either generated code or the address of one
//! of the stubs below. Runtime trampolines recognise a stub purely by
//! address identity, so each stub must be a distinct function: the
//! bodies differ by the sentinel they report, which keeps the linker
//! from folding them together.

use crate::types::HostCode;

/// Special dispatch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sentinel {
    /// No code yet: translate or interpret.
    NotTranslated,
    /// Another thread is translating this address.
    Translating,
    /// Translation/wrapping in flight was hit by an invalidation.
    Invalidating,
    /// A host/guest call trampoline is being generated.
    Wrapping,
    /// Interpret one instruction and re-dispatch.
    Interpret,
    /// Return control to the host scheduler.
    ExitGeneratedCode,
    /// Raise the guest no-execute fault.
    NoExec,
    /// Halt a single run of generated code (tests).
    Stop,
}

impl Sentinel {
    pub const ALL: [Sentinel; 8] = [
        Sentinel::NotTranslated,
        Sentinel::Translating,
        Sentinel::Invalidating,
        Sentinel::Wrapping,
        Sentinel::Interpret,
        Sentinel::ExitGeneratedCode,
        Sentinel::NoExec,
        Sentinel::Stop,
    ];

    /// Address of the stub function for this sentinel.
    #[inline]
    pub fn host_code(self) -> HostCode {
        let stub: extern "C" fn() = match self {
            Sentinel::NotTranslated => entry_not_translated,
            Sentinel::Translating => entry_translating,
            Sentinel::Invalidating => entry_invalidating,
            Sentinel::Wrapping => entry_wrapping,
            Sentinel::Interpret => entry_interpret,
            Sentinel::ExitGeneratedCode => entry_exit_generated_code,
            Sentinel::NoExec => entry_no_exec,
            Sentinel::Stop => entry_stop,
        };
        HostCode::from_addr(stub as usize)
    }

    pub fn from_host_code(code: HostCode) -> Option<Sentinel> {
        Self::ALL.into_iter().find(|s| s.host_code() == code)
    }
}

/// Result of classifying a dispatch cell value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Code(HostCode),
    Sentinel(Sentinel),
}

#[inline(never)]
#[cold]
fn stub_called(sentinel: Sentinel) -> ! {
    tracing::error!(
        ?sentinel,
        "dispatch stub called directly; it must be handled by the runtime"
    );
    std::process::abort()
}

macro_rules! dispatch_stub {
    ($name:ident, $sentinel:ident) => {
        #[inline(never)]
        extern "C" fn $name() {
            stub_called(Sentinel::$sentinel)
        }
    };
}

dispatch_stub!(entry_not_translated, NotTranslated);
dispatch_stub!(entry_translating, Translating);
dispatch_stub!(entry_invalidating, Invalidating);
dispatch_stub!(entry_wrapping, Wrapping);
dispatch_stub!(entry_interpret, Interpret);
dispatch_stub!(entry_exit_generated_code, ExitGeneratedCode);
dispatch_stub!(entry_no_exec, NoExec);
dispatch_stub!(entry_stop, Stop);
