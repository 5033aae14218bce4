use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::runtime_library::{Dispatch, Sentinel};

/// Guest virtual address.
pub type GuestAddr = u64;

pub const NULL_GUEST_ADDR: GuestAddr = 0;

/// Address of executable host code.
///
/// Either the entry point of generated code or the address of one of
/// the dispatch stubs (see [`Sentinel`]). The cache never dereferences it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct HostCode(usize);

impl HostCode {
    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }

    #[inline]
    pub fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }

    /// Split into "real code" vs. one of the dispatch stubs.
    pub fn classify(self) -> Dispatch {
        match Sentinel::from_host_code(self) {
            Some(s) => Dispatch::Sentinel(s),
            None => Dispatch::Code(self),
        }
    }

    pub fn is_sentinel(self) -> bool {
        Sentinel::from_host_code(self).is_some()
    }
}

impl fmt::Debug for HostCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Sentinel::from_host_code(*self) {
            Some(s) => write!(f, "HostCode({s:?})"),
            None => write!(f, "HostCode({:#x})", self.0),
        }
    }
}

/// Dispatch cell: one machine word holding a [`HostCode`].
///
/// `repr(transparent)` over `AtomicUsize` so generated code can load the
/// cell with a plain word load and jump to the result.
#[repr(transparent)]
pub struct AtomicHostCode(AtomicUsize);

impl AtomicHostCode {
    pub const fn new(code: HostCode) -> Self {
        Self(AtomicUsize::new(code.0))
    }

    #[inline]
    pub fn load(&self) -> HostCode {
        HostCode(self.0.load(Ordering::Acquire))
    }

    /// Publish `code`. Everything written before the store (in
    /// particular the generated code bytes) happens-before any load
    /// that observes it.
    #[inline]
    pub fn store(&self, code: HostCode) {
        self.0.store(code.0, Ordering::Release);
    }

    pub fn compare_exchange(
        &self,
        current: HostCode,
        new: HostCode,
    ) -> Result<HostCode, HostCode> {
        self.0
            .compare_exchange(
                current.0,
                new.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(HostCode)
            .map_err(HostCode)
    }
}

impl fmt::Debug for AtomicHostCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}

/// Installed host code and its size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCodePiece {
    pub code: HostCode,
    pub size: u32,
}

impl HostCodePiece {
    pub const fn new(code: HostCode, size: u32) -> Self {
        Self { code, size }
    }

    /// Whether `addr` lies inside `[code, code + size)`.
    pub fn contains(&self, addr: HostCode) -> bool {
        let start = self.code.addr();
        addr.addr() >= start && addr.addr() < start + self.size as usize
    }
}
