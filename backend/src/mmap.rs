use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};

/// Anonymous shared-memory file whose contents back one or more
/// mappings.
pub struct Memfd {
    fd: OwnedFd,
    len: usize,
}

impl Memfd {
    /// Create a memfd of `len` bytes (rounded up to page size).
    pub fn new(name: &CStr, len: usize) -> io::Result<Self> {
        let len = round_up_to_page(len);
        // SAFETY: name is a valid NUL-terminated string.
        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a freshly created fd we exclusively own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        // SAFETY: fd is valid.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd, len })
    }

    /// Create a memfd whose every machine word equals `word`.
    pub fn filled(name: &CStr, len: usize, word: usize) -> io::Result<Self> {
        let memfd = Self::new(name, len)?;
        let view = MappedRegion::map_shared(&memfd, libc::PROT_READ | libc::PROT_WRITE)?;
        let words = view.len() / std::mem::size_of::<usize>();
        let base = view.as_ptr() as *mut usize;
        for i in 0..words {
            // SAFETY: i < words, the view covers the whole file.
            unsafe { base.add(i).write(word) };
        }
        Ok(memfd)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// An owned mmap'd range, unmapped on drop.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: MappedRegion owns its mapping exclusively; access to the
// bytes is synchronised by the users (atomics or external locks).
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map the whole of `memfd` shared (writes reach the file).
    pub fn map_shared(memfd: &Memfd, prot: libc::c_int) -> io::Result<Self> {
        // SAFETY: mapping a valid fd at a kernel-chosen address.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                memfd.len,
                prot,
                libc::MAP_SHARED,
                memfd.fd.as_raw_fd(),
                0,
            )
        };
        Self::from_mmap_result(ptr, memfd.len)
    }

    /// Map `len` bytes as consecutive private copy-on-write tiles of
    /// `memfd`. Untouched pages share the file's pages, so a huge range
    /// pre-filled with the file's contents costs almost nothing until
    /// written.
    pub fn tile(memfd: &Memfd, len: usize, prot: libc::c_int) -> io::Result<Self> {
        let len = round_up_to_page(len);
        // SAFETY: reserving address space, no file backing.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        let region = Self::from_mmap_result(base, len)?;

        let mut offset = 0;
        while offset < len {
            let chunk = memfd.len.min(len - offset);
            // SAFETY: target lies inside the reservation owned by `region`.
            let ptr = unsafe {
                libc::mmap(
                    region.ptr.as_ptr().add(offset) as *mut libc::c_void,
                    chunk,
                    prot,
                    libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_NORESERVE,
                    memfd.fd.as_raw_fd(),
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                // `region` drop unmaps the whole range.
                return Err(io::Error::last_os_error());
            }
            offset += chunk;
        }
        Ok(region)
    }

    fn from_mmap_result(ptr: *mut libc::c_void, len: usize) -> io::Result<Self> {
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        match NonNull::new(ptr as *mut u8) {
            Some(ptr) => Ok(Self { ptr, len }),
            None => Err(io::Error::other("mmap returned null")),
        }
    }

    pub fn protect(&self, prot: libc::c_int) -> io::Result<()> {
        // SAFETY: the range is owned by self.
        let ret = unsafe {
            libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.len, prot)
        };
        if ret != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `addr` lies inside this mapping.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr.as_ptr() as usize;
        addr >= start && addr < start + self.len
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping the range we own.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

pub fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

pub fn round_up_to_page(len: usize) -> usize {
    let page = page_size();
    (len + page - 1) & !(page - 1)
}
