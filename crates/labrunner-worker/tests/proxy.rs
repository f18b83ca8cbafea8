//! Process-level tests: a real `labrunner-worker` behind `RunnerProxy`.

use std::thread;
use std::time::{Duration, Instant};

use labrunner_core::{Error, Identifier, RunnerConfig, RunnerProxy, Snapshot};
use serde_json::{Map, json};

fn config() -> RunnerConfig {
    let mut config = RunnerConfig::default()
        .with_worker_path(env!("CARGO_BIN_EXE_labrunner-worker"))
        .with_poll_interval(Duration::from_millis(20));
    config.idle_poll_ms = 10;
    config
}

fn proxy() -> RunnerProxy {
    RunnerProxy::with_config(Snapshot::new(), config()).unwrap()
}

/// Poll `condition` for up to five seconds.
fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

fn finished(proxy: &mut RunnerProxy, identifier: &str) -> bool {
    let identifier = Identifier::from(identifier);
    proxy
        .status()
        .unwrap()
        .and_then(|status| status.get(&identifier).cloned())
        .is_some_and(|status| !status.is_running)
}

// =============================================================================
// Commands through the proxy
// =============================================================================

#[test]
fn test_execute_and_status() {
    let mut proxy = proxy();

    let worker_id = proxy.execute("x = 1 + 1", "t1", "s1.txt").unwrap();
    assert_eq!(worker_id, Some(0));
    assert!(wait_until(|| finished(&mut proxy, "t1")));

    let status = proxy.status().unwrap().unwrap();
    let entry = &status[&Identifier::from("t1")];
    assert!(!entry.failed);
    assert_eq!(entry.filename, "s1.txt");
}

#[test]
fn test_busy_is_reported_through_proxy() {
    let mut proxy = proxy();

    proxy.execute("sleep(2)", 1, "slow.txt").unwrap();
    let err = proxy.execute("pass", 1, "fast.txt").unwrap_err();
    assert!(matches!(err, Error::Busy(ref id) if *id == Identifier::from(1)));

    assert!(proxy.stop_execution(1).unwrap());
}

#[test]
fn test_failure_is_visible_through_proxy() {
    let mut proxy = proxy();

    proxy
        .execute("raise ValueError('boom')", "t3", "s3.txt")
        .unwrap();
    assert!(wait_until(|| proxy.get_exception("t3").unwrap().is_some()));

    let exception = proxy.get_exception("t3").unwrap().unwrap();
    assert_eq!(exception.kind, "ValueError");
    assert!(exception.message.contains("boom"));
    assert!(proxy.get_traceback("t3").unwrap().unwrap().contains("s3.txt:1"));

    assert!(proxy.clear_exceptions().unwrap());
    assert!(proxy.get_exception("t3").unwrap().is_none());
}

#[test]
fn test_stop_execution_ends_infinite_loop() {
    let mut proxy = proxy();

    proxy.execute("while True: pass", "t2", "s2.txt").unwrap();
    assert!(proxy.stop_execution("t2").unwrap());
    assert!(wait_until(|| finished(&mut proxy, "t2")));
    assert!(proxy.get_exception("t2").unwrap().is_none());
}

#[test]
fn test_globals_round_trip() {
    let mut seed = Snapshot::new();
    seed.insert("gain".to_string(), json!(3));
    let mut proxy = RunnerProxy::with_config(seed, config()).unwrap();

    assert!(proxy.set_global("offset", json!(1)).unwrap());
    proxy
        .execute("globals.out = gain * 10 + offset", "calc", "calc.txt")
        .unwrap();
    assert!(wait_until(|| proxy.get_global("out").unwrap().is_some()));

    assert_eq!(proxy.get_global("out").unwrap(), Some(json!(31)));
    assert_eq!(proxy.get_global("missing").unwrap(), None);

    let snapshot = proxy.globals_snapshot().unwrap().unwrap();
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot["gain"], json!(3));
}

#[test]
fn test_reset_replaces_globals_and_workers() {
    let mut proxy = proxy();
    proxy.execute("globals.a = 1", "a", "a.txt").unwrap();
    assert!(wait_until(|| finished(&mut proxy, "a")));

    let mut fresh = Snapshot::new();
    fresh.insert("mode".to_string(), json!("dry"));
    assert!(proxy.reset(Some(fresh)).unwrap());

    assert_eq!(proxy.status().unwrap(), Some(Default::default()));
    assert_eq!(proxy.get_global("a").unwrap(), None);
    assert_eq!(proxy.get_global("mode").unwrap(), Some(json!("dry")));

    assert!(proxy.reset(None).unwrap());
    assert_eq!(proxy.globals_snapshot().unwrap(), Some(Snapshot::new()));
}

#[test]
fn test_delete_thread_through_proxy() {
    let mut proxy = proxy();
    proxy.execute("pass", 5, "p.txt").unwrap();
    assert!(proxy.delete_thread(5).unwrap());
    assert_eq!(proxy.status().unwrap(), Some(Default::default()));
}

#[test]
fn test_call_by_keyword_and_legacy_name() {
    let mut proxy = proxy();

    let mut kwargs = Map::new();
    kwargs.insert("code".to_string(), json!("pass"));
    kwargs.insert("identifier".to_string(), json!("kw"));
    let value = proxy.call("executeCode", Vec::new(), kwargs).unwrap();
    assert_eq!(value, Some(json!(0)));

    let value = proxy
        .call("get_global", vec![json!("nothing")], Map::new())
        .unwrap();
    assert_eq!(value, Some(json!(null)));
}

// =============================================================================
// Output and input
// =============================================================================

#[test]
fn test_stdout_and_stderr_are_relayed() {
    let mut proxy = proxy();

    proxy
        .execute("print('hello')\neprint('warning')", "out", "out.txt")
        .unwrap();
    assert!(proxy.stdout(Duration::from_secs(5)).contains("hello"));
    assert!(proxy.stderr(Duration::from_secs(5)).contains("warning"));
}

#[test]
fn test_input_reads_from_host() {
    let mut proxy = proxy();

    proxy
        .execute("name = input()\nprint('hi ' + name)", "ask", "ask.txt")
        .unwrap();
    proxy.write_stdin("ada").unwrap();
    assert!(proxy.stdout(Duration::from_secs(5)).contains("hi ada"));
}

// =============================================================================
// Supervision
// =============================================================================

#[test]
fn test_unknown_command_times_out() {
    let mut proxy = proxy();
    proxy.set_response_timeout(Duration::from_millis(300));

    let start = Instant::now();
    let value = proxy
        .call("no_such_command", Vec::new(), Map::new())
        .unwrap();
    assert_eq!(value, None);
    assert!(start.elapsed() >= Duration::from_millis(250));

    // The process is still usable afterwards.
    proxy.set_response_timeout(Duration::from_secs(2));
    assert_eq!(proxy.status().unwrap(), Some(Default::default()));
    assert_eq!(proxy.restart_count(), 0);
}

#[test]
fn test_restart_forgets_identifiers_and_reseeds_globals() {
    let mut seed = Snapshot::new();
    seed.insert("limit".to_string(), json!(10));
    let mut proxy = RunnerProxy::with_config(seed, config()).unwrap();

    proxy.set_global("limit", json!(99)).unwrap();
    proxy.execute("pass", "a", "a.txt").unwrap();
    assert!(!proxy.status().unwrap().unwrap().is_empty());

    proxy.restart().unwrap();
    assert_eq!(proxy.status().unwrap(), Some(Default::default()));
    assert_eq!(proxy.get_global("limit").unwrap(), Some(json!(10)));
    assert_eq!(proxy.restart_count(), 1);
}

#[test]
fn test_late_reply_is_not_taken_for_next_call() {
    let mut proxy = proxy();
    assert!(proxy.set_global("g", json!(7)).unwrap());

    proxy.set_response_timeout(Duration::from_millis(1));
    assert_eq!(proxy.status().unwrap(), None);

    // The status reply arrives while this call is waiting.
    proxy.set_response_timeout(Duration::from_secs(2));
    assert_eq!(proxy.get_global("g").unwrap(), Some(json!(7)));
    assert_eq!(proxy.get_global("g").unwrap(), Some(json!(7)));
}

#[test]
fn test_stop_then_call_restarts() {
    let mut proxy = proxy();
    proxy.execute("x = 1", "x", "x.txt").unwrap();

    proxy.stop().unwrap();
    assert!(wait_until(|| !proxy.is_alive()));

    assert_eq!(proxy.status().unwrap(), Some(Default::default()));
    assert_eq!(proxy.restart_count(), 1);
}

#[test]
fn test_restart_with_work_in_flight() {
    let mut proxy = proxy();
    proxy.execute("while True: pass", "spin", "spin.txt").unwrap();
    let status = proxy.status().unwrap().unwrap();
    assert!(status[&Identifier::from("spin")].is_running);

    proxy.restart().unwrap();
    assert_eq!(proxy.status().unwrap(), Some(Default::default()));
    proxy.execute("pass", "spin", "again.txt").unwrap();
}

#[cfg(unix)]
#[test]
fn test_killed_process_restarts_silently() {
    let mut proxy = proxy();
    proxy.execute("while True: sleep(0.01)", "bg", "bg.txt").unwrap();
    let before = proxy.process_id();

    proxy.kill_handle().unwrap().kill();
    thread::sleep(Duration::from_millis(300));

    assert_eq!(proxy.status().unwrap(), Some(Default::default()));
    assert_eq!(proxy.restart_count(), 1);
    assert_ne!(proxy.process_id(), before);
}

#[cfg(unix)]
#[test]
fn test_interrupted_process_restarts_on_next_call() {
    let mut proxy = proxy();
    proxy.execute("x = 1", "x", "x.txt").unwrap();

    proxy.kill_handle().unwrap().interrupt();
    assert!(wait_until(|| !proxy.is_alive()));

    assert_eq!(proxy.status().unwrap(), Some(Default::default()));
    assert_eq!(proxy.restart_count(), 1);
}

#[test]
fn test_closed_proxy_rejects_calls() {
    let mut proxy = proxy();
    proxy.close().unwrap();

    assert!(!proxy.is_alive());
    assert!(matches!(proxy.status(), Err(Error::Closed)));
    assert!(matches!(proxy.restart(), Err(Error::Closed)));
    proxy.close().unwrap();
}
