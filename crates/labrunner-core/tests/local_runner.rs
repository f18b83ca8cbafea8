//! Integration tests for the in-process runner.
//!
//! Covers per-identifier mutual exclusion, namespace isolation and sharing,
//! cancellation and failure capture.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use labrunner_core::{
    AbortHandle, BufferedIo, Error, Identifier, LocalRunner, Namespace, ScriptIo,
};
use serde_json::json;

fn runner() -> (LocalRunner, Arc<BufferedIo>) {
    let io = Arc::new(BufferedIo::new());
    let runner =
        LocalRunner::new(Namespace::new(), io.clone()).with_idle_poll(Duration::from_millis(10));
    (runner, io)
}

/// Poll `condition` for up to five seconds.
fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn finished(runner: &LocalRunner, identifier: &Identifier) -> bool {
    runner
        .status()
        .get(identifier)
        .is_some_and(|status| !status.is_running)
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_simple_assignment_completes() {
    let (mut runner, _io) = runner();
    let t1 = Identifier::from("t1");

    runner.execute("x = 1 + 1", t1.clone(), "s1.txt").unwrap();
    assert!(wait_until(|| finished(&runner, &t1)));

    let status = &runner.status()[&t1];
    assert!(!status.failed);
    assert_eq!(status.filename, "s1.txt");
}

#[test]
fn test_infinite_loop_can_be_stopped() {
    let (mut runner, _io) = runner();
    let t2 = Identifier::from("t2");

    runner.execute("while True: pass", t2.clone(), "s2.txt").unwrap();
    assert!(runner.status()[&t2].is_running);

    runner.stop_execution(&t2);
    assert!(wait_until(|| finished(&runner, &t2)));
    assert!(!runner.status()[&t2].failed);
    assert!(runner.get_exception(&t2).is_none());
}

#[test]
fn test_raised_exception_is_captured() {
    let (mut runner, io) = runner();
    let t3 = Identifier::from("t3");

    runner
        .execute("raise ValueError('boom')", t3.clone(), "s3.txt")
        .unwrap();
    assert!(wait_until(|| runner.get_exception(&t3).is_some()));

    assert!(runner.status()[&t3].failed);
    let exception = runner.get_exception(&t3).unwrap();
    assert_eq!(exception.kind, "ValueError");
    assert!(exception.message.contains("boom"));

    let traceback = runner.get_traceback(&t3).unwrap();
    assert!(traceback.contains("s3.txt:1"));
    assert!(io.take_stderr().contains("ValueError: boom"));
}

// =============================================================================
// Properties
// =============================================================================

#[test]
fn test_busy_while_running_then_accepts() {
    let (mut runner, _io) = runner();
    let id = Identifier::from(1);

    runner
        .execute("sleep(0.3)", id.clone(), "slow.txt")
        .unwrap();
    let err = runner.execute("pass", id.clone(), "fast.txt").unwrap_err();
    assert!(matches!(err, Error::Busy(ref busy) if *busy == id));

    assert!(wait_until(|| finished(&runner, &id)));
    runner.execute("pass", id.clone(), "fast.txt").unwrap();
}

#[test]
fn test_locals_do_not_leak_across_identifiers() {
    let (mut runner, io) = runner();
    let a = Identifier::from("a");
    let b = Identifier::from("b");

    runner.execute("secret = 42", a.clone(), "a.txt").unwrap();
    assert!(wait_until(|| finished(&runner, &a)));

    runner
        .execute("print('secret' in keys(globals))\nsecret\n", b.clone(), "b.txt")
        .unwrap();
    assert!(wait_until(|| runner.get_exception(&b).is_some()));

    assert_eq!(runner.get_exception(&b).unwrap().kind, "NameError");
    assert!(io.take_stdout().contains("False"));
}

#[test]
fn test_globals_are_shared_across_identifiers() {
    let (mut runner, io) = runner();
    let writer = Identifier::from("writer");
    let reader = Identifier::from("reader");

    runner
        .execute("globals.setpoint = 21.5", writer.clone(), "w.txt")
        .unwrap();
    assert!(wait_until(|| finished(&runner, &writer)));

    runner
        .execute("print(setpoint)", reader.clone(), "r.txt")
        .unwrap();
    assert!(wait_until(|| finished(&runner, &reader)));

    assert_eq!(io.take_stdout(), "21.5\n");
    assert_eq!(runner.get_global("setpoint"), Some(json!(21.5)));
}

#[test]
fn test_status_is_idempotent() {
    let (mut runner, _io) = runner();
    runner.execute("x = 1", 1.into(), "a.txt").unwrap();
    runner.execute("raise KeyError('k')", 2.into(), "b.txt").unwrap();
    assert!(wait_until(|| runner.get_exception(&2.into()).is_some()
        && finished(&runner, &1.into())));

    assert_eq!(runner.status(), runner.status());
}

#[test]
fn test_stop_is_noop_when_not_running() {
    let (mut runner, _io) = runner();
    let idle = Identifier::from("idle");

    runner.execute("y = 2", idle.clone(), "y.txt").unwrap();
    assert!(wait_until(|| finished(&runner, &idle)));

    let before = runner.status();
    runner.stop_execution(&idle);
    runner.stop_execution(&Identifier::from("unknown"));
    assert_eq!(runner.status(), before);

    // The idle worker still accepts work and keeps its locals.
    runner.execute("globals.z = y * 2", idle.clone(), "z.txt").unwrap();
    assert!(wait_until(|| runner.get_global("z").is_some()));
    assert_eq!(runner.get_global("z"), Some(json!(4)));
}

#[test]
fn test_cancelled_identifier_can_run_again() {
    let (mut runner, _io) = runner();
    let id = Identifier::from("again");

    runner
        .execute("count = 0\nwhile True:\n    count += 1\n", id.clone(), "loop.txt")
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    runner.stop_execution(&id);
    assert!(wait_until(|| finished(&runner, &id)));

    runner
        .execute("globals.progress = count > 0", id.clone(), "next.txt")
        .unwrap();
    assert!(wait_until(|| runner.get_global("progress").is_some()));
    assert_eq!(runner.get_global("progress"), Some(json!(true)));
}

#[test]
fn test_delete_thread_forgets_identifier() {
    let (mut runner, _io) = runner();
    let id = Identifier::from(9);

    runner.execute("while True: sleep(0.01)", id.clone(), "bg.txt").unwrap();
    runner.delete_thread(&id);
    assert!(runner.status().is_empty());

    // A new worker replaces the deleted one.
    let worker_id = runner.execute("pass", id.clone(), "fg.txt").unwrap();
    assert_eq!(worker_id, 1);
}

/// Buffered output whose stderr writes take a while.
struct SlowStderr {
    inner: BufferedIo,
}

impl ScriptIo for SlowStderr {
    fn write_stdout(&self, text: &str) {
        self.inner.write_stdout(text);
    }

    fn write_stderr(&self, text: &str) {
        thread::sleep(Duration::from_millis(100));
        self.inner.write_stderr(text);
    }

    fn read_line(&self, abort: &AbortHandle) -> Option<String> {
        self.inner.read_line(abort)
    }
}

#[test]
fn test_resubmit_right_after_failure_runs() {
    let io = Arc::new(SlowStderr {
        inner: BufferedIo::new(),
    });
    let mut runner =
        LocalRunner::new(Namespace::new(), io.clone()).with_idle_poll(Duration::from_millis(10));
    let id = Identifier::from("x");

    runner
        .execute("raise ValueError('boom')", id.clone(), "a.txt")
        .unwrap();
    assert!(wait_until(|| finished(&runner, &id)));

    // The failed thread is still writing its traceback here.
    runner.execute("globals.done = 1", id.clone(), "b.txt").unwrap();
    assert!(!runner.status()[&id].failed);
    assert!(wait_until(|| runner.get_global("done").is_some()));

    let status = &runner.status()[&id];
    assert!(!status.failed);
    assert_eq!(status.filename, "b.txt");
}

#[test]
fn test_oversized_sleep_is_a_recorded_failure() {
    let (mut runner, _io) = runner();
    let id = Identifier::from("s");

    runner.execute("sleep(1e300)", id.clone(), "s.txt").unwrap();
    assert!(wait_until(|| runner.get_exception(&id).is_some()));

    assert_eq!(runner.get_exception(&id).unwrap().kind, "OverflowError");
    assert!(runner.status()[&id].failed);
}
