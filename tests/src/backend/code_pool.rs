use xlat_backend::code_pool::EXEC_REGION_SIZE;
use xlat_backend::mmap::page_size;
use xlat_backend::CodePool;

#[test]
fn test_add_copies_code() {
    let pool = CodePool::new();
    let piece = pool.add(&[0x90, 0x90, 0xc3]).unwrap();
    assert_eq!(piece.size, 3);
    assert!(!piece.code.is_sentinel());
    // SAFETY: the exec view is readable.
    let bytes = unsafe { std::slice::from_raw_parts(piece.code.as_ptr(), 3) };
    assert_eq!(bytes, &[0x90, 0x90, 0xc3]);
    assert!(pool.contains(piece.code));
    assert_eq!(pool.region_count(), 1);
    assert_eq!(pool.remaining(), EXEC_REGION_SIZE - 3);
}

#[test]
fn test_fragments_are_aligned() {
    let pool = CodePool::new();
    let a = pool.add(&[0xc3]).unwrap();
    let b = pool.add(&[0xc3; 5]).unwrap();
    let c = pool.add(&[0xc3]).unwrap();
    assert_eq!(a.code.addr() % 16, 0);
    assert_eq!(b.code.addr(), a.code.addr() + 16);
    assert_eq!(c.code.addr(), b.code.addr() + 16);
}

#[test]
fn test_new_region_when_full() {
    let page = page_size();
    let pool = CodePool::with_region_size(page);
    assert_eq!(pool.region_count(), 0);
    assert_eq!(pool.remaining(), 0);

    let first = pool.add(&vec![0xcc; page - 8]).unwrap();
    let second = pool.add(&[0xc3; 16]).unwrap();
    assert_eq!(pool.region_count(), 2);
    assert!(pool.contains(first.code));
    assert!(pool.contains(second.code));

    // Oversized fragments get a region of their own.
    let big = pool.add(&vec![0xcc; 3 * page]).unwrap();
    assert_eq!(big.size as usize, 3 * page);
    assert_eq!(pool.region_count(), 3);
}

#[test]
fn test_foreign_code_not_contained() {
    let pool = CodePool::new();
    pool.add(&[0xc3]).unwrap();
    let local = 0u8;
    assert!(!pool.contains(xlat_core::HostCode::from_ptr(&local as *const u8)));
}

#[cfg(target_arch = "x86_64")]
#[test]
fn test_installed_code_runs() {
    // mov eax, 42; ret
    let pool = CodePool::new();
    let piece = pool.add(&[0xb8, 42, 0, 0, 0, 0xc3]).unwrap();
    // SAFETY: the fragment is a complete function in executable memory.
    let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(piece.code.as_ptr()) };
    assert_eq!(f(), 42);
}
