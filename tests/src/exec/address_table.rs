use std::sync::Arc;
use std::thread;

use xlat_core::{HostCode, Sentinel};
use xlat_exec::{SparseAddressTable, TableGeometry};

fn default_code() -> HostCode {
    Sentinel::NotTranslated.host_code()
}

fn lp64() -> SparseAddressTable {
    SparseAddressTable::new(default_code(), TableGeometry::LP64).unwrap()
}

#[test]
fn test_geometry() {
    assert_eq!(TableGeometry::for_guest_addr_bits(48), Some(TableGeometry::LP64));
    assert_eq!(TableGeometry::for_guest_addr_bits(32), Some(TableGeometry::ILP32));
    assert_eq!(TableGeometry::for_guest_addr_bits(64), None);
    assert_eq!(TableGeometry::LP64.addr_bits(), 48);
    assert_eq!(TableGeometry::ILP32.leaf_len(), 1 << 16);
    assert_eq!(TableGeometry::ILP32.leaf_mask(), 0xffff);
}

#[test]
fn test_smoke() {
    let table = lp64();
    assert_eq!(table.geometry(), TableGeometry::LP64);
    let code = HostCode::from_addr(0xdead_beef);
    assert_eq!(table.read(0x1234_5678), default_code());
    table.put(0x1234_5678, code);
    assert_eq!(table.read(0x1234_5678), code);
    assert_eq!(table.read(0x1234_5679), default_code());
    assert_eq!(table.read(0), default_code());
    assert_eq!(table.read((1 << 48) - 1), default_code());
}

#[test]
fn test_read_does_not_allocate() {
    let table = lp64();
    for addr in [0, 0x1000, 0x7fff_ffff_f000, (1 << 48) - 1] {
        assert_eq!(table.read(addr), default_code());
    }
    assert_eq!(table.leaf_count(), 0);

    table.get_cell(0x1000);
    assert_eq!(table.leaf_count(), 1);
    // Same leaf.
    table.get_cell(0x2000);
    assert_eq!(table.leaf_count(), 1);
    table.get_cell(0x7fff_ffff_f000);
    assert_eq!(table.leaf_count(), 2);
}

#[test]
fn test_cell_identity_is_stable() {
    let table = lp64();
    let a = table.get_cell(0x4000_0000) as *const _;
    table.get_cell(0x4000_0004);
    table.put(0x9000_0000_0000, HostCode::from_addr(1));
    let b = table.get_cell(0x4000_0000) as *const _;
    assert_eq!(a, b);
}

#[test]
fn test_root_snapshot_lookup() {
    let table = lp64();
    let code = HostCode::from_addr(0xcafe_0000);
    table.put(0x1234_5678_9abc, code);

    let snapshot = table.root_snapshot();
    assert_eq!(snapshot.len(), TableGeometry::LP64.root_len());
    assert_eq!(snapshot.leaf_bits(), 24);
    assert_eq!(snapshot.lookup(0x1234_5678_9abc), code);
    assert_eq!(snapshot.lookup(0x1234_5678_9abd), default_code());
    assert_eq!(snapshot.lookup(0x42), default_code());
}

#[test]
fn test_ilp32_geometry() {
    let table = SparseAddressTable::new(default_code(), TableGeometry::ILP32).unwrap();
    let code = HostCode::from_addr(0xabcd);
    table.put(0xffff_fffe, code);
    assert_eq!(table.read(0xffff_fffe), code);
    assert_eq!(table.read(0xffff_ffff), default_code());
    assert_eq!(table.root_snapshot().len(), 1 << 16);
}

#[test]
#[should_panic(expected = "exceeds 32 bits")]
fn test_out_of_range_address() {
    let table = SparseAddressTable::new(default_code(), TableGeometry::ILP32).unwrap();
    table.read(1 << 32);
}

#[test]
fn test_custom_default() {
    let stop = Sentinel::Stop.host_code();
    let table = SparseAddressTable::new(stop, TableGeometry::ILP32).unwrap();
    assert_eq!(table.default_value(), stop);
    assert_eq!(table.read(0x1000), stop);
    assert_eq!(table.get_cell(0x1000).load(), stop);
}

/// Threads race to install the same leaves; every thread must end up
/// with the same cells and see every other thread's writes.
#[test]
fn test_concurrent_leaf_install() {
    const THREADS: u64 = 8;
    const LEAVES: u64 = 16;

    let table = Arc::new(lp64());
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for leaf in 0..LEAVES {
                    let addr = (leaf << 24) | (t * 8);
                    table.put(addr, HostCode::from_addr(0x1000 + addr as usize));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(table.leaf_count(), LEAVES as usize);
    for t in 0..THREADS {
        for leaf in 0..LEAVES {
            let addr = (leaf << 24) | (t * 8);
            assert_eq!(table.read(addr), HostCode::from_addr(0x1000 + addr as usize));
        }
    }
}
