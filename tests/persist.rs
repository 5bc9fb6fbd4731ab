//! Frozen per-module caches: freeze, reload, and identity validation.

mod common;

use common::{assert_exited, boot, run_thread};
use shepherd::prelude::*;
use shepherd::toy::ProgramImage;

const MAIN: u64 = 0x1000;
const FUNC: u64 = 0x2000;
const MODULE_BASE: u64 = 0x1000;
const MODULE_SIZE: u64 = 0x2000;

fn program() -> ProgramImage {
    let mut image = ProgramImage::new();
    image.label(FUNC).mov_reg(0, 1).add_imm(0, 3).ret();
    image
        .label(MAIN)
        .mov_imm(1, 4)
        .call(FUNC)
        .out_reg(0)
        .exit();
    image
}

fn module() -> ModuleInfo {
    ModuleInfo {
        path: "/app/toy-module".into(),
        base: MODULE_BASE,
        size: MODULE_SIZE,
    }
}

/// Freeze after a run, load into a fresh engine, and observe identical
/// behavior served from the frozen partition.
#[test]
fn freeze_and_reload_round_trip() {
    let out_dir = tempfile::tempdir().unwrap();

    // First engine: run, then freeze the module.
    let (engine, os) = boot(program(), EngineOptions::default().with_persistence());
    engine.register_module(module());
    let outcome = run_thread(&engine, &os, 1, MAIN);
    assert_exited(&outcome);
    assert_eq!(os.write_log(), vec![7]);

    let written = engine.freeze_modules(out_dir.path()).unwrap();
    assert_eq!(written.len(), 1, "one module cache file written");

    // Second engine over the same image: load the frozen cache.
    let (engine2, os2) = boot(program(), EngineOptions::default().with_persistence());
    engine2.load_persisted(&written[0]).unwrap();

    // The function is served by the frozen partition before any execution.
    let frozen = engine2.fragment_for(AppPc(FUNC)).expect("frozen lookup");
    assert!(engine2
        .fragment_flags(frozen)
        .unwrap()
        .contains(FragmentFlags::FROZEN));

    let outcome = run_thread(&engine2, &os2, 1, MAIN);
    assert_exited(&outcome);
    assert_eq!(os2.write_log(), vec![7], "identical observable behavior");
}

/// A frozen cache never attaches to a module whose bytes changed.
#[test]
fn identity_mismatch_is_rejected() {
    let out_dir = tempfile::tempdir().unwrap();

    let (engine, os) = boot(program(), EngineOptions::default().with_persistence());
    engine.register_module(module());
    let outcome = run_thread(&engine, &os, 1, MAIN);
    assert_exited(&outcome);
    let written = engine.freeze_modules(out_dir.path()).unwrap();

    // Same layout, different constant: the digest must not match.
    let mut altered = ProgramImage::new();
    altered.label(FUNC).mov_reg(0, 1).add_imm(0, 9).ret();
    altered
        .label(MAIN)
        .mov_imm(1, 4)
        .call(FUNC)
        .out_reg(0)
        .exit();

    let (engine2, _os2) = boot(altered, EngineOptions::default().with_persistence());
    assert!(matches!(
        engine2.load_persisted(&written[0]),
        Err(Error::PersistIdentity(_))
    ));
}

/// A corrupt file is rejected structurally, before any identity check.
#[test]
fn corrupt_file_is_rejected() {
    let out_dir = tempfile::tempdir().unwrap();

    let (engine, os) = boot(program(), EngineOptions::default().with_persistence());
    engine.register_module(module());
    let outcome = run_thread(&engine, &os, 1, MAIN);
    assert_exited(&outcome);
    let written = engine.freeze_modules(out_dir.path()).unwrap();

    let mut bytes = std::fs::read(&written[0]).unwrap();
    bytes.truncate(bytes.len() / 2);
    let clipped = out_dir.path().join("clipped.frz");
    std::fs::write(&clipped, bytes).unwrap();

    let (engine2, _os2) = boot(program(), EngineOptions::default().with_persistence());
    assert!(matches!(
        engine2.load_persisted(&clipped),
        Err(Error::PersistFormat(_))
    ));
}

/// Persistence entry points respect their option gates.
#[test]
fn persistence_is_gated_by_options() {
    let out_dir = tempfile::tempdir().unwrap();
    let (engine, _os) = boot(program(), EngineOptions::default());
    engine.register_module(module());
    assert!(matches!(
        engine.freeze_modules(out_dir.path()),
        Err(Error::Disabled(_))
    ));
    assert!(matches!(
        engine.load_persisted(&out_dir.path().join("missing.frz")),
        Err(Error::Disabled(_))
    ));
}
