use xlat_core::{CodeKind, Config, TranslationMode};
use xlat_exec::{run_guest, ExecEnv, ExitReason};

use super::{fake_env, FakeShadow, FakeThread, FakeTranslator, LiteBehavior, CODE_END, CODE_START};

#[test]
fn test_interpret_until_no_exec() {
    let env = fake_env(
        TranslationMode::InterpretOnly,
        FakeTranslator::new(LiteBehavior::Fail, None),
    );
    let mut thread = FakeThread::new(CODE_START);
    assert_eq!(run_guest(&env, &mut thread), ExitReason::NoExec(CODE_END));
    assert_eq!(thread.interpreted.len() as u64, (CODE_END - CODE_START) / 4);
    assert!(thread.executed.is_empty());

    // Second run reuses the Interpret entries.
    let stats = env.cache.stats();
    let mut thread = FakeThread::new(CODE_START);
    assert_eq!(run_guest(&env, &mut thread), ExitReason::NoExec(CODE_END));
    assert_eq!(env.cache.stats(), stats);
}

#[test]
fn test_runs_translated_regions() {
    let env = fake_env(
        TranslationMode::LiteTranslateOrFallbackToInterpret,
        FakeTranslator::new(LiteBehavior::Translate(0x40), None),
    );
    let mut thread = FakeThread::new(CODE_START);
    assert_eq!(run_guest(&env, &mut thread), ExitReason::NoExec(CODE_END));
    assert_eq!(
        thread.executed,
        vec![CODE_START, CODE_START + 0x40, CODE_START + 0x80, CODE_START + 0xc0]
    );
    assert!(thread.interpreted.is_empty());
}

#[test]
fn test_stop() {
    let env = fake_env(
        TranslationMode::LiteTranslateOrFallbackToInterpret,
        FakeTranslator::new(LiteBehavior::Translate(0x10), None),
    );
    assert!(env.cache.set_stop(CODE_START + 0x20));
    let mut thread = FakeThread::new(CODE_START);
    assert_eq!(run_guest(&env, &mut thread), ExitReason::Stop);
    assert_eq!(thread.pc, CODE_START + 0x20);
    assert_eq!(thread.executed, vec![CODE_START, CODE_START + 0x10]);
}

#[test]
fn test_pending_signals_exit() {
    let env = fake_env(
        TranslationMode::TwoGear,
        FakeTranslator::new(LiteBehavior::Translate(0x10), None),
    );
    let mut thread = FakeThread::new(CODE_START);
    thread.pending_signals = true;
    assert_eq!(run_guest(&env, &mut thread), ExitReason::ExitGeneratedCode);
    assert_eq!(thread.pc, CODE_START);
    assert_eq!(env.cache.stats().entries, 0);
}

#[test]
fn test_interprets_below_translation_threshold() {
    let config = Config {
        mode: TranslationMode::LiteTranslateOrFallbackToInterpret,
        translation_threshold: 2,
        ..Config::default()
    };
    let env = ExecEnv::new(
        config,
        FakeTranslator::new(LiteBehavior::Translate(4), None),
        FakeShadow::code(),
    )
    .unwrap();
    assert!(env.cache.set_stop(CODE_START + 4));

    for _ in 0..2 {
        let mut thread = FakeThread::new(CODE_START);
        assert_eq!(run_guest(&env, &mut thread), ExitReason::Stop);
        assert_eq!(thread.interpreted, vec![CODE_START]);
        assert!(thread.executed.is_empty());
    }

    let mut thread = FakeThread::new(CODE_START);
    assert_eq!(run_guest(&env, &mut thread), ExitReason::Stop);
    assert!(thread.interpreted.is_empty());
    assert_eq!(thread.executed, vec![CODE_START]);
}

/// Self-profiling light code gets hot and is replaced by heavy code.
#[test]
fn test_gear_up_when_hot() {
    let config = Config {
        gear_switch_threshold: 3,
        ..Config::default()
    };
    let env = ExecEnv::new(
        config,
        FakeTranslator::new(LiteBehavior::Translate(0x10), Some(0x10)),
        FakeShadow::code(),
    )
    .unwrap();
    assert!(env.cache.set_stop(CODE_START + 0x10));

    for _ in 0..2 {
        let mut thread = FakeThread::new(CODE_START);
        assert_eq!(run_guest(&env, &mut thread), ExitReason::Stop);
        assert_eq!(thread.executed, vec![CODE_START]);
    }
    assert_eq!(
        env.cache.entry(CODE_START).unwrap().kind(),
        CodeKind::LightTranslated
    );

    // Third run reaches the threshold, gears up and runs heavy code.
    let mut thread = FakeThread::new(CODE_START);
    assert_eq!(run_guest(&env, &mut thread), ExitReason::Stop);
    assert_eq!(thread.executed, vec![CODE_START]);
    assert_eq!(
        env.cache.entry(CODE_START).unwrap().kind(),
        CodeKind::HeavyOptimized
    );
    assert_eq!(
        env.translator
            .heavy_calls
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}
