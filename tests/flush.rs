//! Flush safety under concurrency, eviction pressure, and detach.

mod common;

use std::sync::Arc;

use common::{assert_exited, boot, run_thread};
use shepherd::prelude::*;
use shepherd::toy::ProgramImage;

const MAIN: u64 = 0x1000;
const LOOP_HEAD: u64 = 0x1100;

fn counted_loop(iterations: u32) -> ProgramImage {
    let mut image = ProgramImage::new();
    image
        .label(MAIN)
        .mov_imm(2, 0)
        .mov_imm(3, iterations)
        .jmp(LOOP_HEAD);
    image
        .label(LOOP_HEAD)
        .add_imm(2, 1)
        .sub_imm(3, 1)
        .jcc_nz(3, LOOP_HEAD)
        .out_reg(2)
        .exit();
    image
}

/// S5: thread A executes a fragment in a tight loop while thread B flushes
/// it. B returns only after A is observed outside; A never re-enters the
/// dead fragment and finishes with an intact result.
#[test]
fn concurrent_flush_is_safe() {
    let (engine, os) = boot(counted_loop(3_000_000), EngineOptions::default().without_traces());

    let worker = {
        let engine = engine.clone();
        let os = os.clone();
        std::thread::spawn(move || run_thread(&engine, &os, 1, MAIN))
    };
    while engine.fragment_for(AppPc(LOOP_HEAD)).is_none() {
        std::thread::yield_now();
    }
    let before = engine.fragment_for(AppPc(LOOP_HEAD)).unwrap();

    let flushed = engine.flush(AppPc(LOOP_HEAD)).unwrap();
    assert!(flushed, "the loop fragment existed and was flushed");
    assert!(
        engine.fragment_flags(before).is_none(),
        "the flushed fragment id must be dead"
    );

    let outcome = worker.join().unwrap();
    assert_exited(&outcome);
    assert_eq!(os.write_log(), vec![3_000_000]);

    // The loop kept running after the flush, so a fresh fragment exists
    // under a different id.
    if let Some(after) = engine.fragment_for(AppPc(LOOP_HEAD)) {
        assert_ne!(after, before);
    }
}

/// Flushing every fragment between two identical runs leaves observable
/// behavior identical to never flushing.
#[test]
fn flush_all_and_reexecute_is_identical() {
    let func = 0x2000u64;
    let mut image = ProgramImage::new();
    image.label(func).mov_reg(0, 1).add_imm(0, 5).ret();
    image
        .label(MAIN)
        .mov_imm(1, 10)
        .call(func)
        .out_reg(0)
        .mov_imm(1, 20)
        .call(func)
        .out_reg(0)
        .exit();

    let (engine, os) = boot(image, EngineOptions::default());
    let outcome = run_thread(&engine, &os, 1, MAIN);
    assert_exited(&outcome);
    let first = os.write_log();

    // Flush everything this program built.
    for tag in [MAIN, func] {
        engine.flush(AppPc(tag)).unwrap();
    }

    let outcome = run_thread(&engine, &os, 2, MAIN);
    assert_exited(&outcome);
    let log = os.write_log();
    assert_eq!(&log[first.len()..], first.as_slice());
}

/// A cache partition small enough to force eviction still executes
/// correctly: the oldest unit is reclaimed and rebuilt on demand.
#[test]
fn eviction_under_pressure_preserves_behavior() {
    // Many distinct blocks chained by direct jumps.
    let mut image = ProgramImage::new();
    let blocks = 64u64;
    for i in 0..blocks {
        let at = 0x4000 + i * 0x40;
        let next = 0x4000 + (i + 1) * 0x40;
        image.label(at).add_imm(2, 1).jmp(next);
    }
    image.label(0x4000 + blocks * 0x40).out_reg(2).exit();
    image.label(MAIN).mov_imm(2, 0).jmp(0x4000);

    let limits = CacheLimits {
        unit_size: 512,
        private_limit: 4 * 1024,
        shared_limit: 512, // a single unit: guaranteed pressure
        trace_limit: 4 * 1024,
    };
    let (engine, os) = boot(
        image,
        EngineOptions::default().without_traces().with_cache(limits),
    );
    let outcome = run_thread(&engine, &os, 1, MAIN);

    assert_exited(&outcome);
    assert_eq!(os.write_log(), vec![blocks]);
    assert!(
        engine.stats().shared_bytes <= 512,
        "eviction kept the partition inside its budget"
    );
}

/// Detach: a running thread leaves the cache at its next safe point and
/// hands back a translated native continuation context.
#[test]
fn detach_returns_translated_context() {
    let (engine, os) = boot(counted_loop(u32::MAX), EngineOptions::default().without_traces().with_detach());

    let worker = {
        let engine = engine.clone();
        let os = os.clone();
        std::thread::spawn(move || run_thread(&engine, &os, 1, MAIN))
    };
    while engine.fragment_for(AppPc(LOOP_HEAD)).is_none() {
        std::thread::yield_now();
    }

    engine.detach().unwrap();
    let outcome = worker.join().unwrap();

    match outcome {
        ThreadOutcome::Detached(mc) => {
            // The continuation PC is an application address inside the
            // program, never a cache address.
            assert!(
                mc.pc >= MAIN && mc.pc < 0x2000,
                "detached pc {:#x} must be an application address",
                mc.pc
            );
        }
        other => panic!("expected detach, got {other:?}"),
    }
}

/// Detach is refused when the options do not allow it.
#[test]
fn detach_requires_permission() {
    let (engine, _os) = boot(counted_loop(10), EngineOptions::default());
    assert!(matches!(engine.detach(), Err(Error::Disabled(_))));
}
