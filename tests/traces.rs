//! Trace building end to end: promotion, recording, emission, and limits.

mod common;

use common::{assert_exited, boot, run_thread};
use shepherd::prelude::*;
use shepherd::toy::ProgramImage;

const MAIN: u64 = 0x1000;
const LOOP_HEAD: u64 = 0x1100;

/// A hot self-loop becomes a trace and keeps producing the same result.
#[test]
fn hot_loop_forms_a_trace() {
    let iterations = 5_000u32;
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

    let (engine, os) = boot(image, EngineOptions::default().with_trace_threshold(8));
    let outcome = run_thread(&engine, &os, 1, MAIN);

    assert_exited(&outcome);
    assert_eq!(os.write_log(), vec![u64::from(iterations)]);

    let stats = engine.stats();
    assert!(stats.traces >= 1, "the loop head must have produced a trace");

    // The head's table entry is shadowed by the trace.
    let head = engine.fragment_for(AppPc(LOOP_HEAD)).unwrap();
    let flags = engine.fragment_flags(head).unwrap();
    assert!(flags.contains(FragmentFlags::IS_TRACE));
}

/// A multi-block loop body fuses into one trace spanning its blocks.
#[test]
fn multi_block_loop_traces_across_blocks() {
    let mid = 0x1200u64;
    let iterations = 4_000u32;
    let mut image = ProgramImage::new();
    image
        .label(MAIN)
        .mov_imm(2, 0)
        .mov_imm(3, iterations)
        .jmp(LOOP_HEAD);
    // head: bump the counter, jump to the middle block.
    image.label(LOOP_HEAD).add_imm(2, 1).jmp(mid);
    // mid: decrement, loop back while nonzero.
    image
        .label(mid)
        .sub_imm(3, 1)
        .jcc_nz(3, LOOP_HEAD)
        .out_reg(2)
        .exit();

    let (engine, os) = boot(image, EngineOptions::default().with_trace_threshold(8));
    let outcome = run_thread(&engine, &os, 1, MAIN);

    assert_exited(&outcome);
    assert_eq!(os.write_log(), vec![u64::from(iterations)]);
    assert!(engine.stats().traces >= 1);
}

/// The trace length cap ends recording cleanly at the boundary: execution
/// stays correct and nothing leaks.
#[test]
fn trace_length_cap_ends_cleanly() {
    // A loop whose body chains through more blocks than the cap allows.
    let blocks = 12u64;
    let iterations = 2_000u32;
    let mut image = ProgramImage::new();
    image
        .label(MAIN)
        .mov_imm(2, 0)
        .mov_imm(3, iterations)
        .jmp(LOOP_HEAD);
    image.label(LOOP_HEAD).add_imm(2, 1).jmp(0x2000);
    for i in 0..blocks {
        let at = 0x2000 + i * 0x40;
        let next = if i + 1 == blocks {
            0x3000
        } else {
            0x2000 + (i + 1) * 0x40
        };
        image.label(at).add_imm(4, 1).jmp(next);
    }
    image
        .label(0x3000)
        .sub_imm(3, 1)
        .jcc_nz(3, LOOP_HEAD)
        .out_reg(2)
        .exit();

    let mut options = EngineOptions::default().with_trace_threshold(8);
    options.trace_max_blocks = 4;
    let (engine, os) = boot(image, options);
    let outcome = run_thread(&engine, &os, 1, MAIN);

    assert_exited(&outcome);
    assert_eq!(os.write_log(), vec![u64::from(iterations)]);
}

/// Tracing disabled: the same program runs with zero traces.
#[test]
fn threshold_zero_disables_tracing() {
    let iterations = 3_000u32;
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

    let (engine, os) = boot(image, EngineOptions::default().without_traces());
    let outcome = run_thread(&engine, &os, 1, MAIN);

    assert_exited(&outcome);
    assert_eq!(os.write_log(), vec![u64::from(iterations)]);
    assert_eq!(engine.stats().traces, 0);
}

/// After a trace records the hot (taken) arm, flipping the condition makes
/// the guard exit to the cold path with intact state.
#[test]
fn trace_guard_exits_to_the_cold_path() {
    let taken_arm = 0x2000u64;
    let fall_arm = 0x2100u64;
    let mut image = ProgramImage::new();
    // Phase 1: 2000 hot iterations through the taken arm. Phase 2: clear the
    // condition and run 1000 more through the fall arm, which the recorded
    // trace guards out to.
    image
        .label(MAIN)
        .mov_imm(2, 0)
        .mov_imm(3, 2_000)
        .mov_imm(5, 1)
        .jmp(LOOP_HEAD);
    image
        .label(LOOP_HEAD)
        .add_imm(2, 1)
        .jcc_nz(5, taken_arm)
        .jmp(fall_arm);
    image
        .label(taken_arm)
        .sub_imm(3, 1)
        .jcc_nz(3, LOOP_HEAD)
        .mov_imm(5, 0)
        .mov_imm(3, 1_000)
        .jmp(LOOP_HEAD);
    image
        .label(fall_arm)
        .sub_imm(3, 1)
        .jcc_nz(3, LOOP_HEAD)
        .out_reg(2)
        .exit();

    let (engine, os) = boot(image, EngineOptions::default().with_trace_threshold(8));
    let outcome = run_thread(&engine, &os, 1, MAIN);

    assert_exited(&outcome);
    assert_eq!(os.write_log(), vec![3_000]);
}
