//! Two-level lazily populated table from guest address to dispatch cell.
//!
//! The high bits of a guest address select a root slot, the low bits a
//! cell in the leaf that slot points to. Every root slot starts out
//! pointing at one shared read-only default leaf, so a lookup is always
//! two dependent loads with no null check, which is what generated code
//! inlines into block exits.

use std::io;
use std::mem;
use std::slice;
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::Mutex;
use xlat_backend::mmap::{MappedRegion, Memfd};
use xlat_core::{AtomicHostCode, GuestAddr, HostCode};

/// Size of the memfd region tiled over leaves and the root.
const MEMFD_REGION_SIZE: usize = 1 << 21;

/// Split of significant guest address bits between root and leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableGeometry {
    pub root_bits: u32,
    pub leaf_bits: u32,
}

impl TableGeometry {
    /// 48-bit guest addresses on a 64-bit host.
    pub const LP64: Self = Self {
        root_bits: 24,
        leaf_bits: 24,
    };
    /// 32-bit guest addresses.
    pub const ILP32: Self = Self {
        root_bits: 16,
        leaf_bits: 16,
    };

    pub fn for_guest_addr_bits(bits: u32) -> Option<Self> {
        match bits {
            48 => Some(Self::LP64),
            32 => Some(Self::ILP32),
            _ => None,
        }
    }

    #[inline]
    pub fn addr_bits(&self) -> u32 {
        self.root_bits + self.leaf_bits
    }

    #[inline]
    pub fn root_len(&self) -> usize {
        1 << self.root_bits
    }

    #[inline]
    pub fn leaf_len(&self) -> usize {
        1 << self.leaf_bits
    }

    #[inline]
    pub fn leaf_mask(&self) -> u64 {
        (1u64 << self.leaf_bits) - 1
    }

    fn leaf_bytes(&self) -> usize {
        self.leaf_len() * mem::size_of::<AtomicHostCode>()
    }

    fn root_bytes(&self) -> usize {
        self.root_len() * mem::size_of::<AtomicPtr<AtomicHostCode>>()
    }
}

pub struct SparseAddressTable {
    root: MappedRegion,
    default_leaf: MappedRegion,
    leaf_memfd: Memfd,
    /// Installed leaves, owned for the table's lifetime.
    leaves: Mutex<Vec<MappedRegion>>,
    geometry: TableGeometry,
    default: HostCode,
}

impl SparseAddressTable {
    pub fn new(default: HostCode, geometry: TableGeometry) -> io::Result<Self> {
        let leaf_bytes = geometry.leaf_bytes();
        let leaf_memfd = Memfd::filled(
            c"xlat-leaf",
            leaf_bytes.min(MEMFD_REGION_SIZE),
            default.addr(),
        )?;
        let default_leaf =
            MappedRegion::tile(&leaf_memfd, leaf_bytes, libc::PROT_READ)?;

        let root_bytes = geometry.root_bytes();
        let root_memfd = Memfd::filled(
            c"xlat-root",
            root_bytes.min(MEMFD_REGION_SIZE),
            default_leaf.as_ptr() as usize,
        )?;
        let root = MappedRegion::tile(
            &root_memfd,
            root_bytes,
            libc::PROT_READ | libc::PROT_WRITE,
        )?;

        Ok(Self {
            root,
            default_leaf,
            leaf_memfd,
            leaves: Mutex::new(Vec::new()),
            geometry,
            default,
        })
    }

    #[inline]
    pub fn geometry(&self) -> TableGeometry {
        self.geometry
    }

    #[inline]
    pub fn default_value(&self) -> HostCode {
        self.default
    }

    /// Current value for `addr`. Never allocates.
    #[inline]
    pub fn read(&self, addr: GuestAddr) -> HostCode {
        let (high, low) = self.split(addr);
        let leaf = self.slot(high).load(Ordering::Acquire);
        // SAFETY: every slot points to a live leaf of leaf_len() cells
        // and low < leaf_len().
        unsafe { (*leaf.add(low)).load() }
    }

    /// Cell for `addr`, installing its leaf if needed.
    ///
    /// The returned cell stays valid and keeps its identity for the
    /// lifetime of the table.
    pub fn get_cell(&self, addr: GuestAddr) -> &AtomicHostCode {
        let (high, low) = self.split(addr);
        let leaf = self.writable_leaf(high);
        // SAFETY: leaf is an installed leaf of leaf_len() cells owned by
        // self; low < leaf_len().
        unsafe { &*leaf.add(low) }
    }

    /// Store `value` for `addr` and return its cell.
    pub fn put(&self, addr: GuestAddr, value: HostCode) -> &AtomicHostCode {
        let cell = self.get_cell(addr);
        cell.store(value);
        cell
    }

    /// Read-only view of the root for generated lookup sequences.
    pub fn root_snapshot(&self) -> RootSnapshot<'_> {
        // SAFETY: the root mapping holds root_len() initialised slots
        // and lives as long as self.
        let slots = unsafe {
            slice::from_raw_parts(
                self.root.as_ptr() as *const AtomicPtr<AtomicHostCode>,
                self.geometry.root_len(),
            )
        };
        RootSnapshot {
            slots,
            leaf_bits: self.geometry.leaf_bits,
        }
    }

    /// Number of leaves installed so far.
    pub fn leaf_count(&self) -> usize {
        self.leaves.lock().len()
    }

    #[inline]
    fn split(&self, addr: GuestAddr) -> (usize, usize) {
        let high = addr >> self.geometry.leaf_bits;
        assert!(
            high < self.geometry.root_len() as u64,
            "guest address {addr:#x} exceeds {} bits",
            self.geometry.addr_bits()
        );
        (high as usize, (addr & self.geometry.leaf_mask()) as usize)
    }

    #[inline]
    fn slot(&self, high: usize) -> &AtomicPtr<AtomicHostCode> {
        // SAFETY: high < root_len(), checked by split().
        unsafe {
            &*(self.root.as_ptr() as *const AtomicPtr<AtomicHostCode>).add(high)
        }
    }

    #[inline]
    fn default_leaf_ptr(&self) -> *mut AtomicHostCode {
        self.default_leaf.as_ptr() as *mut AtomicHostCode
    }

    fn writable_leaf(&self, high: usize) -> *mut AtomicHostCode {
        let slot = self.slot(high);
        let current = slot.load(Ordering::Acquire);
        if current != self.default_leaf_ptr() {
            return current;
        }

        let leaf = MappedRegion::tile(
            &self.leaf_memfd,
            self.geometry.leaf_bytes(),
            libc::PROT_READ | libc::PROT_WRITE,
        )
        .unwrap_or_else(|err| {
            panic!("failed to map address table leaf {high:#x}: {err}")
        });
        let fresh = leaf.as_ptr() as *mut AtomicHostCode;

        match slot.compare_exchange(
            current,
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::trace!(root_slot = high, "installed address table leaf");
                self.leaves.lock().push(leaf);
                fresh
            }
            // Lost the race: `leaf` is unmapped here, use the winner's.
            Err(winner) => winner,
        }
    }
}

/// Borrowed view of the root array.
#[derive(Clone, Copy)]
pub struct RootSnapshot<'a> {
    slots: &'a [AtomicPtr<AtomicHostCode>],
    leaf_bits: u32,
}

impl<'a> RootSnapshot<'a> {
    /// Base address of the root array, for embedding in generated code.
    pub fn as_ptr(&self) -> *const AtomicPtr<AtomicHostCode> {
        self.slots.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn leaf_bits(&self) -> u32 {
        self.leaf_bits
    }

    pub fn leaf_mask(&self) -> u64 {
        (1u64 << self.leaf_bits) - 1
    }

    /// The sequence generated code performs: shift, load leaf, mask,
    /// load cell.
    pub fn lookup(&self, addr: GuestAddr) -> HostCode {
        let leaf = self.slots[(addr >> self.leaf_bits) as usize].load(Ordering::Acquire);
        // SAFETY: slots always point to live leaves of 1 << leaf_bits cells.
        unsafe { (*leaf.add((addr & self.leaf_mask()) as usize)).load() }
    }
}
