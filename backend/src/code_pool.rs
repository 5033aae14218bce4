use std::io;
use std::ptr;

use parking_lot::Mutex;
use xlat_core::{HostCode, HostCodePiece};

use crate::mmap::{MappedRegion, Memfd};

/// Default exec region size: 1 MiB.
pub const EXEC_REGION_SIZE: usize = 1 << 20;

/// Start of every installed fragment is a branch target.
const CODE_ALIGN: usize = 16;

/// One executable region: a memfd mapped twice, writable for
/// installing code and executable for running it. Neither view is
/// both writable and executable.
struct ExecRegion {
    writer: MappedRegion,
    exec: MappedRegion,
    offset: usize,
}

impl ExecRegion {
    fn new(size: usize) -> io::Result<Self> {
        let memfd = Memfd::new(c"xlat-code", size)?;
        let writer = MappedRegion::map_shared(
            &memfd,
            libc::PROT_READ | libc::PROT_WRITE,
        )?;
        let exec =
            MappedRegion::map_shared(&memfd, libc::PROT_READ | libc::PROT_EXEC)?;
        Ok(Self {
            writer,
            exec,
            offset: 0,
        })
    }

    fn remaining(&self) -> usize {
        self.writer.len() - self.offset
    }
}

/// Arena for generated code fragments.
///
/// Fragments are never freed: superseded or invalidated code stays
/// mapped so threads still running it are unaffected.
pub struct CodePool {
    regions: Mutex<Vec<ExecRegion>>,
    region_size: usize,
}

impl CodePool {
    pub fn new() -> Self {
        Self::with_region_size(EXEC_REGION_SIZE)
    }

    pub fn with_region_size(region_size: usize) -> Self {
        Self {
            regions: Mutex::new(Vec::new()),
            region_size,
        }
    }

    /// Copy `code` into executable memory and return its location.
    pub fn add(&self, code: &[u8]) -> io::Result<HostCodePiece> {
        let size = u32::try_from(code.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "code fragment too large")
        })?;
        let mut regions = self.regions.lock();

        let fits = regions.last().is_some_and(|r| {
            align_up(r.offset, CODE_ALIGN)
                .checked_add(code.len())
                .is_some_and(|end| end <= r.writer.len())
        });
        if !fits {
            let region = ExecRegion::new(self.region_size.max(code.len()))?;
            tracing::debug!(
                size = region.writer.len(),
                count = regions.len() + 1,
                "new exec region"
            );
            regions.push(region);
        }
        let region = regions
            .last_mut()
            .ok_or_else(|| io::Error::other("no exec region"))?;

        let start = align_up(region.offset, CODE_ALIGN).min(region.writer.len());
        // SAFETY: start + len <= writer.len() (checked above or fresh
        // region sized to fit).
        unsafe {
            ptr::copy_nonoverlapping(
                code.as_ptr(),
                region.writer.as_ptr().add(start),
                code.len(),
            );
        }
        region.offset = start + code.len();

        // SAFETY: start is within the exec view, same length as writer.
        let entry = unsafe { region.exec.as_ptr().add(start) };
        Ok(HostCodePiece::new(HostCode::from_ptr(entry), size))
    }

    /// Whether `code` points into memory owned by this pool.
    pub fn contains(&self, code: HostCode) -> bool {
        self.regions
            .lock()
            .iter()
            .any(|r| r.exec.contains(code.addr()))
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    /// Free bytes in the current region.
    pub fn remaining(&self) -> usize {
        self.regions.lock().last().map_or(0, ExecRegion::remaining)
    }
}

impl Default for CodePool {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
