//! End-to-end dispatcher tests.
//!
//! Each test runs a real dispatcher loop on its own thread with millisecond
//! ticks and drives it through the public submission API.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;

use rtsched_core::{Classification, DispatchConfig, ResumePolicy, SchedError};
use rtsched_dispatch::{Dispatcher, EventKind};

const TIMEOUT: Duration = Duration::from_secs(20);

fn fast_config() -> DispatchConfig {
    DispatchConfig {
        tick_ms: 2,
        idle_poll_ms: 10,
        preempt_poll_ms: 1,
        ..DispatchConfig::default()
    }
}

struct Harness {
    dispatcher: Arc<Dispatcher>,
    handle: Option<JoinHandle<Result<(), SchedError>>>,
}

impl Harness {
    fn start(config: DispatchConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::with_defaults(config));
        let runner = Arc::clone(&dispatcher);
        let handle = thread::spawn(move || runner.run());
        Self {
            dispatcher,
            handle: Some(handle),
        }
    }

    fn wait_until(&self, mut cond: impl FnMut(&Dispatcher) -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < TIMEOUT {
            if cond(&self.dispatcher) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond(&self.dispatcher)
    }

    fn stop(mut self) -> Arc<Dispatcher> {
        self.dispatcher.shutdown();
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
        Arc::clone(&self.dispatcher)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}

fn deadline_in(ms: i64) -> i64 {
    Utc::now().timestamp_millis() + ms
}

#[test]
fn concurrent_producers_classify_every_task_once() {
    let harness = Harness::start(fast_config());
    let submitter = harness.dispatcher.submitter();

    let producers: Vec<_> = (0..10)
        .map(|t| {
            let submitter = submitter.clone();
            thread::spawn(move || {
                (0..10)
                    .map(|i| {
                        submitter
                            .submit(&format!("p{t}-{i}"), (i % 10) + 1, 3, deadline_in(60_000))
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let ids: Vec<_> = producers
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(ids.len(), 100);
    assert_eq!(submitter.submitted(), 100);

    assert!(harness.wait_until(|d| {
        d.results().total() == 100 && d.results().interrupted().is_empty()
    }));

    let dispatcher = harness.stop();
    let results = dispatcher.results();
    let metrics = dispatcher.metrics();
    assert_eq!(metrics.total, 100);
    assert_eq!(metrics.completed + metrics.missed, 100);

    for id in &ids {
        assert!(results.classification_of(*id).is_some(), "{id} was lost");
    }
    let mut seen = HashSet::new();
    for class in [Classification::Completed, Classification::Interrupted, Classification::Missed] {
        for record in results.records(class) {
            assert!(seen.insert(record.id), "{} filed twice", record.name);
        }
    }
    assert_eq!(seen.len(), 100);
}

#[test]
fn high_priority_arrival_runs_before_preempted_task_resumes() {
    let harness = Harness::start(fast_config());
    let submitter = harness.dispatcher.submitter();

    let a = submitter.submit("A", 2, 3000, deadline_in(60_000)).unwrap();
    assert!(harness.wait_until(|d| d.current().is_some_and(|c| c.name == "A")));

    submitter.submit("B", 8, 50, deadline_in(60_000)).unwrap();
    assert!(harness.wait_until(|d| d
        .results()
        .completed()
        .iter()
        .any(|s| s.name == "B")));
    assert!(harness.wait_until(|d| d.current().is_some_and(|c| c.name == "A")));

    // Re-running A is no longer reported as Interrupted.
    let dispatcher = &harness.dispatcher;
    assert_eq!(dispatcher.results().classification_of(a), None);
    assert!(dispatcher.results().interrupted().is_empty());
    assert_eq!(dispatcher.metrics().total, 1);

    let started: Vec<String> = dispatcher
        .event_log()
        .events()
        .into_iter()
        .filter(|e| e.kind == EventKind::Started)
        .filter_map(|e| e.task)
        .collect();
    assert_eq!(started, vec!["A", "B", "A"]);

    harness.stop();
}

#[test]
fn resume_policy_carries_elapsed_time() {
    let config = DispatchConfig {
        resume_policy: ResumePolicy::Resume,
        ..fast_config()
    };
    let harness = Harness::start(config);
    let submitter = harness.dispatcher.submitter();

    submitter.submit("slow", 1, 400, deadline_in(60_000)).unwrap();
    assert!(harness.wait_until(|d| d.current().is_some_and(|c| c.name == "slow")));
    thread::sleep(Duration::from_millis(200));
    submitter.submit("urgent", 9, 10, deadline_in(60_000)).unwrap();

    assert!(harness.wait_until(|d| d.results().completed().len() == 2));
    let dispatcher = harness.stop();
    let slow = dispatcher
        .results()
        .records(Classification::Completed)
        .into_iter()
        .find(|r| r.name == "slow")
        .unwrap();
    assert_eq!(slow.runs, 2);

    let resumed_at = dispatcher
        .event_log()
        .events_for("slow")
        .into_iter()
        .filter(|e| e.kind == EventKind::Started)
        .nth(1)
        .unwrap()
        .at;
    // First run's start stamp is kept and the second run only covers the remainder.
    assert!(slow.started_at.unwrap() < resumed_at);
    let second_run_ms = (slow.ended_at.unwrap() - resumed_at).num_milliseconds();
    assert!(second_run_ms < 350, "second run took {second_run_ms}ms");
}

#[test]
fn short_deadline_long_task_is_missed() {
    let harness = Harness::start(fast_config());
    harness
        .dispatcher
        .submitter()
        .submit("doomed", 5, 300, deadline_in(100))
        .unwrap();

    assert!(harness.wait_until(|d| d.results().total() == 1));
    let dispatcher = harness.stop();
    assert_eq!(dispatcher.results().missed().len(), 1);
    assert!(dispatcher.results().completed().is_empty());
    assert!(dispatcher
        .event_log()
        .lines()
        .iter()
        .any(|l| l.ends_with("doomed missed deadline!")));
}

#[test]
fn rejected_input_never_reaches_the_dispatcher() {
    let harness = Harness::start(fast_config());
    let submitter = harness.dispatcher.submitter();

    assert!(matches!(
        submitter.submit("bad", 42, 10, deadline_in(1_000)),
        Err(SchedError::InvalidInput(_))
    ));
    assert!(matches!(
        submitter.submit_form("worse", "5", "soon", "0"),
        Err(SchedError::InvalidInput(_))
    ));
    submitter.submit("good", 5, 5, deadline_in(10_000)).unwrap();

    assert!(harness.wait_until(|d| d.results().total() == 1));
    let dispatcher = harness.stop();
    assert_eq!(dispatcher.results().completed()[0].name, "good");
    let rejected = dispatcher
        .event_log()
        .events()
        .into_iter()
        .filter(|e| e.kind == EventKind::Rejected)
        .count();
    assert_eq!(rejected, 2);
}

#[test]
fn every_task_event_stream_is_causally_ordered() {
    let harness = Harness::start(fast_config());
    let submitter = harness.dispatcher.submitter();
    for (i, p) in [3, 7, 5, 7, 1].into_iter().enumerate() {
        submitter.submit(&format!("t{i}"), p, 20, deadline_in(60_000)).unwrap();
    }

    assert!(harness.wait_until(|d| {
        d.results().total() == 5 && d.results().interrupted().is_empty()
    }));
    let dispatcher = harness.stop();
    let log = dispatcher.event_log();

    for i in 0..5 {
        let kinds: Vec<EventKind> = log.events_for(&format!("t{i}")).iter().map(|e| e.kind).collect();
        assert_eq!(kinds.first(), Some(&EventKind::Submitted), "t{i}: {kinds:?}");
        assert!(
            matches!(kinds.last(), Some(EventKind::Completed | EventKind::DeadlineMissed)),
            "t{i}: {kinds:?}"
        );
        let first_start = kinds.iter().position(|k| *k == EventKind::Started).unwrap();
        assert_eq!(first_start, 1, "t{i}: {kinds:?}");
    }
}

#[tokio::test]
async fn event_subscribers_see_the_whole_lifecycle() {
    let harness = Harness::start(fast_config());
    let mut rx = harness.dispatcher.subscribe_events();
    harness
        .dispatcher
        .submitter()
        .submit("observed", 5, 10, deadline_in(10_000))
        .unwrap();

    let mut kinds = Vec::new();
    while !matches!(kinds.last(), Some(EventKind::Completed)) {
        let event = tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("no event before timeout")
            .unwrap();
        kinds.push(event.kind);
    }
    assert_eq!(
        kinds,
        vec![EventKind::Submitted, EventKind::Started, EventKind::Completed]
    );

    tokio::task::spawn_blocking(move || harness.stop()).await.unwrap();
}
