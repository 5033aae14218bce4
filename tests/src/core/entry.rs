use xlat_core::{CodeKind, EntryState, GuestCodeEntry, HostCode, LockKind, Sentinel};

const CODE: HostCode = HostCode::from_addr(0xdead_beef);

#[test]
fn new_entry_defaults() {
    let entry = GuestCodeEntry::new(EntryState::NotTranslated);
    assert_eq!(entry.guest_size, 1);
    assert_eq!(entry.host_size, 0);
    assert_eq!(entry.invocation_counter(), 0);
    assert_eq!(entry.kind(), CodeKind::Interpreted);
}

#[test]
fn cell_value_per_state() {
    let cases = [
        (EntryState::NotTranslated, Sentinel::NotTranslated.host_code()),
        (
            EntryState::Translating { serving: None },
            Sentinel::Translating.host_code(),
        ),
        (EntryState::Translating { serving: Some(CODE) }, CODE),
        (
            EntryState::Invalidating {
                abandoned: LockKind::Translation,
            },
            Sentinel::Invalidating.host_code(),
        ),
        (
            EntryState::Translated {
                kind: CodeKind::HeavyOptimized,
                code: CODE,
            },
            CODE,
        ),
        (EntryState::Wrapping, Sentinel::Wrapping.host_code()),
        (
            EntryState::Wrapped {
                host_function: true,
                code: CODE,
            },
            CODE,
        ),
    ];
    for (state, cell) in cases {
        assert_eq!(state.cell_value(), cell, "{state:?}");
    }
}

#[test]
fn kind_per_state() {
    assert_eq!(
        EntryState::Translating { serving: Some(CODE) }.kind(),
        CodeKind::UnderProcessing
    );
    assert_eq!(EntryState::Wrapping.kind(), CodeKind::UnderProcessing);
    assert_eq!(
        EntryState::Invalidating {
            abandoned: LockKind::Wrapping
        }
        .kind(),
        CodeKind::UnderProcessing
    );
    assert_eq!(
        EntryState::Wrapped {
            host_function: true,
            code: CODE
        }
        .kind(),
        CodeKind::HostWrapped
    );
    assert_eq!(
        EntryState::Wrapped {
            host_function: false,
            code: CODE
        }
        .kind(),
        CodeKind::GuestWrapped
    );
}

#[test]
fn locked_states() {
    assert!(EntryState::Wrapping.is_locked());
    assert!(EntryState::Translating { serving: None }.is_locked());
    assert!(!EntryState::NotTranslated.is_locked());
    assert!(!EntryState::Translated {
        kind: CodeKind::LightTranslated,
        code: CODE
    }
    .is_locked());
}

#[test]
fn publishable_kinds() {
    assert!(CodeKind::Interpreted.is_translated());
    assert!(CodeKind::LightTranslated.is_translated());
    assert!(CodeKind::HeavyOptimized.is_translated());
    assert!(CodeKind::SpecialHandler.is_translated());
    assert!(!CodeKind::GuestWrapped.is_translated());
    assert!(!CodeKind::HostWrapped.is_translated());
    assert!(!CodeKind::UnderProcessing.is_translated());
}

#[test]
fn counter_is_shared_between_clones() {
    let entry = GuestCodeEntry::new(EntryState::NotTranslated);
    let snapshot = entry.clone();
    entry
        .counter()
        .fetch_add(3, std::sync::atomic::Ordering::Relaxed);
    assert_eq!(snapshot.invocation_counter(), 3);
}
