//! End-to-end wrap/replace semantics: pre/post pairing, argument and
//! return-value rewriting, skip_call, abnormal unwinds, and replacement.

mod common;

use std::sync::{Arc, Mutex};

use common::{assert_exited, boot, run_thread};
use shepherd::prelude::*;
use shepherd::toy::ProgramImage;
use shepherd::wrap::{PostFn, PreFn};

const MAIN: u64 = 0x1000;
const FOO: u64 = 0x2000;

fn event_log() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let log = log.clone();
        move |entry: &str| log.lock().unwrap().push(entry.to_string())
    };
    (log, sink)
}

/// S2: the pre callback rewrites the first argument, the post callback
/// rewrites the return value, and the caller observes both effects.
#[test]
fn wrap_rewrites_argument_and_retval() {
    let mut image = ProgramImage::new();
    // foo(x) = x
    image.label(FOO).mov_reg(0, 1).ret();
    // main: r1 = 37; call foo; emit r0
    image
        .label(MAIN)
        .mov_imm(1, 37)
        .call(FOO)
        .out_reg(0)
        .exit();

    let (engine, os) = boot(image, EngineOptions::default());
    engine
        .wrap(
            WrapRequest::new(AppPc(FOO))
                .pre(|ctx| {
                    assert_eq!(ctx.arg(0), 37, "application passed 37");
                    ctx.set_arg(0, 42);
                })
                .post(|ctx| {
                    assert_eq!(ctx.retval(), 42, "foo returned the rewritten arg");
                    ctx.set_retval((-4i64) as u64);
                }),
        )
        .unwrap();

    let outcome = run_thread(&engine, &os, 1, MAIN);
    assert_exited(&outcome);
    assert_eq!(os.write_log(), vec![(-4i64) as u64]);
}

/// S3: skip_call returns straight to the caller with the supplied value;
/// the body never runs and the post callback never fires.
#[test]
fn skip_call_bypasses_body_and_post() {
    let mut image = ProgramImage::new();
    // foo's body would write 0xbad to the log if it ever ran.
    image.label(FOO).mov_imm(0, 0xbad).out_reg(0).ret();
    image.label(MAIN).mov_imm(1, 5).call(FOO).out_reg(0).exit();

    let (log, sink) = event_log();
    let (engine, os) = boot(image, EngineOptions::default());
    let post_sink = sink.clone();
    engine
        .wrap(
            WrapRequest::new(AppPc(FOO))
                .pre(move |ctx| {
                    sink("pre");
                    ctx.skip_call(7, 0);
                })
                .post(move |_ctx| post_sink("post")),
        )
        .unwrap();

    let outcome = run_thread(&engine, &os, 1, MAIN);
    assert_exited(&outcome);
    assert_eq!(os.write_log(), vec![7], "caller sees the skip value only");
    assert_eq!(log.lock().unwrap().as_slice(), &["pre".to_string()]);
}

/// S4: a nonlocal exit unwinding several wrapped frames fires their post
/// callbacks in reverse order with the abnormal flag, preserving pre/post
/// pairing; the frames that were not bypassed complete normally.
#[test]
fn abnormal_unwind_fires_bypassed_posts() {
    const JMPBUF: u64 = 0x20000;
    let long0 = 0x2000u64;
    let long1 = 0x2100u64;
    let long2 = 0x2200u64;
    let long3 = 0x2300u64;
    let longdone = 0x2400u64;

    let mut image = ProgramImage::new();
    // long0: save sp, push a local, call long1; the longjmp lands at the
    // label after the call with sp restored; then call longdone and return.
    let landing = {
        let cursor = image
            .label(long0)
            .rd_sp(8)
            .store(8, JMPBUF)
            .push(9)
            .call(long1);
        let landing = cursor.pc();
        cursor.call(longdone).mov_imm(0, 0).ret();
        landing
    };
    image.label(long1).call(long2).ret();
    image.label(long2).call(long3).ret();
    // long3: longjmp — restore the saved sp and jump into long0's body.
    image.label(long3).load(9, JMPBUF).wr_sp(9).jmp(landing);
    image.label(longdone).mov_imm(0, 0).ret();
    image.label(MAIN).call(long0).exit();

    let (log, sink) = event_log();
    let (engine, os) = boot(image, EngineOptions::default());
    os.map_data(JMPBUF, 64);

    for (name, addr) in [
        ("long0", long0),
        ("long1", long1),
        ("long2", long2),
        ("long3", long3),
        ("longdone", longdone),
    ] {
        let pre_sink = sink.clone();
        let post_sink = sink.clone();
        engine
            .wrap(
                WrapRequest::new(AppPc(addr))
                    .pre(move |_ctx| pre_sink(&format!("pre-{name}")))
                    .post(move |ctx| {
                        let suffix = if ctx.is_abnormal() { "abnormal" } else { "normal" };
                        post_sink(&format!("post-{name}-{suffix}"));
                    }),
            )
            .unwrap();
    }

    let outcome = run_thread(&engine, &os, 1, MAIN);
    assert_exited(&outcome);

    let events = log.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "pre-long0",
            "pre-long1",
            "pre-long2",
            "pre-long3",
            "post-long3-abnormal",
            "post-long2-abnormal",
            "post-long1-abnormal",
            "pre-longdone",
            "post-longdone-normal",
            "post-long0-normal",
        ],
        "every pre pairs with exactly one post"
    );
}

/// wrap followed by unwrap of the same pair is observationally a no-op.
#[test]
fn wrap_unwrap_round_trip_is_a_noop() {
    let mut image = ProgramImage::new();
    image.label(FOO).mov_reg(0, 1).ret();
    image.label(MAIN).mov_imm(1, 11).call(FOO).out_reg(0).exit();

    let (engine, os) = boot(image, EngineOptions::default());
    let pre: PreFn = Arc::new(|ctx| ctx.set_arg(0, 99));
    let post: PostFn = Arc::new(|ctx| ctx.set_retval(0));

    engine
        .wrap(
            WrapRequest::new(AppPc(FOO))
                .pre_fn(pre.clone())
                .post_fn(post.clone()),
        )
        .unwrap();
    assert!(engine.is_wrapped(AppPc(FOO), Some(&pre), Some(&post)));
    engine.unwrap(AppPc(FOO), Some(&pre), Some(&post)).unwrap();
    assert!(!engine.is_wrapped(AppPc(FOO), Some(&pre), Some(&post)));

    let outcome = run_thread(&engine, &os, 1, MAIN);
    assert_exited(&outcome);
    assert_eq!(os.write_log(), vec![11], "unwrapped call is untouched");
}

/// replace(f, g) runs g's body under f's address; removal with override
/// restores native execution.
#[test]
fn replace_redirects_and_restores() {
    let repl = 0x3000u64;
    let mut image = ProgramImage::new();
    image.label(FOO).mov_imm(0, 1).ret();
    image.label(repl).mov_imm(0, 2).ret();
    image.label(MAIN).call(FOO).out_reg(0).exit();

    let (engine, os) = boot(image, EngineOptions::default());
    engine.replace(AppPc(FOO), Some(AppPc(repl)), false).unwrap();

    let outcome = run_thread(&engine, &os, 1, MAIN);
    assert_exited(&outcome);
    assert_eq!(os.write_log(), vec![2], "replacement body must run");

    // Second install without override fails; removal restores the original.
    assert!(matches!(
        engine.replace(AppPc(FOO), Some(AppPc(repl)), false),
        Err(Error::ReplaceExists(_))
    ));
    engine.replace(AppPc(FOO), None, true).unwrap();

    let outcome = run_thread(&engine, &os, 2, MAIN);
    assert_exited(&outcome);
    assert_eq!(os.write_log(), vec![2, 1], "native body restored");
}

/// Misusing a context accessor from the wrong phase is flagged and ignored,
/// never fatal.
#[test]
fn callback_misuse_is_flagged_not_fatal() {
    let mut image = ProgramImage::new();
    image.label(FOO).mov_reg(0, 1).ret();
    image.label(MAIN).mov_imm(1, 3).call(FOO).out_reg(0).exit();

    let (engine, os) = boot(image, EngineOptions::default());
    engine
        .wrap(
            WrapRequest::new(AppPc(FOO))
                .pre(|ctx| {
                    let _ = ctx.retval(); // retval in pre: misuse
                })
                .post(|ctx| {
                    ctx.set_arg(0, 1); // set_arg in post: misuse
                }),
        )
        .unwrap();

    let outcome = run_thread(&engine, &os, 1, MAIN);
    assert_exited(&outcome);
    assert_eq!(os.write_log(), vec![3], "call completes untouched");
    assert!(engine.wrap_manager().misuse_count() >= 2);
}

/// Post-call sites are discovered on first entry and reported through the
/// notify callback; pre-seeding is idempotent.
#[test]
fn post_call_sites_are_discovered_and_notified() {
    let mut image = ProgramImage::new();
    image.label(FOO).mov_reg(0, 1).ret();
    image.label(MAIN).mov_imm(1, 8).call(FOO).out_reg(0).exit();

    let (engine, os) = boot(image, EngineOptions::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        engine.register_post_call_notify(Arc::new(move |pc| {
            seen.lock().unwrap().push(pc);
        }));
    }
    engine
        .wrap(WrapRequest::new(AppPc(FOO)).pre(|_ctx| {}).post(|_ctx| {}))
        .unwrap();

    let outcome = run_thread(&engine, &os, 1, MAIN);
    assert_exited(&outcome);

    let sites = seen.lock().unwrap().clone();
    assert_eq!(sites.len(), 1, "exactly one post-call site discovered");
    assert!(engine.wrap_manager().is_post_wrap(sites[0]));
}
