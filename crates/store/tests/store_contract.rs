//! Contract tests for the event store: durability across reopen, the
//! duplicate-step race, and replay faithfulness under interleaved writers.

use std::sync::Arc;
use std::thread;

use ps_domain::event::{EventPayload, TaskEvent, TextRole};
use ps_domain::task::NewTask;
use ps_store::{AppendOutcome, EventStore};

fn new_task(id: &str) -> NewTask {
    NewTask {
        task_id: id.into(),
        title: "investigation".into(),
        prompt: "why is the deploy failing?".into(),
        resource_context: Vec::new(),
        log_context: Vec::new(),
    }
}

fn text_event(step: u64, text: &str) -> TaskEvent {
    TaskEvent::new(
        step,
        EventPayload::TextDelta {
            text: text.into(),
            role: TextRole::Assistant,
        },
    )
}

#[test]
fn events_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("podscope.db");

    {
        let store = EventStore::open(&db_path).unwrap();
        store.create_task(&new_task("t1")).unwrap();
        for i in 0..4 {
            store
                .append_event("t1", &text_event(i, &format!("e{i}")))
                .unwrap();
        }
    }

    let store = EventStore::open(&db_path).unwrap();
    let events = store.read_events_since("t1", None).unwrap();
    let indices: Vec<u64> = events.iter().map(|e| e.step_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(store.last_step_index("t1").unwrap(), Some(3));
}

#[test]
fn duplicate_step_race_commits_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(EventStore::open(&dir.path().join("race.db")).unwrap());
    store.create_task(&new_task("t1")).unwrap();

    let mut handles = Vec::new();
    for writer in 0..2 {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            store
                .append_event("t1", &text_event(0, &format!("writer {writer}")))
                .unwrap()
        }));
    }

    let outcomes: Vec<AppendOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let appended = outcomes
        .iter()
        .filter(|o| **o == AppendOutcome::Appended)
        .count();
    let duplicate = outcomes
        .iter()
        .filter(|o| **o == AppendOutcome::DuplicateStep)
        .count();
    assert_eq!(appended, 1);
    assert_eq!(duplicate, 1);

    // Final event list has no duplicates.
    let events = store.read_events_since("t1", None).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].step_index, 0);
}

#[test]
fn interleaved_tasks_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(EventStore::open(&dir.path().join("multi.db")).unwrap());
    store.create_task(&new_task("a")).unwrap();
    store.create_task(&new_task("b")).unwrap();

    let mut handles = Vec::new();
    for task in ["a", "b"] {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            for i in 0..20 {
                store
                    .append_event(task, &text_event(i, &format!("{task}-{i}")))
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for task in ["a", "b"] {
        let events = store.read_events_since(task, None).unwrap();
        let indices: Vec<u64> = events.iter().map(|e| e.step_index).collect();
        assert_eq!(indices, (0..20).collect::<Vec<u64>>());
    }
}

#[test]
fn replay_suffix_matches_full_log() {
    let store = EventStore::open_in_memory().unwrap();
    store.create_task(&new_task("t1")).unwrap();
    for i in 0..10 {
        store
            .append_event("t1", &text_event(i, &format!("e{i}")))
            .unwrap();
    }

    let full = store.read_events_since("t1", None).unwrap();
    let head: Vec<_> = full.iter().take(3).collect();
    let tail = store.read_events_since("t1", Some(2)).unwrap();

    let mut recombined: Vec<u64> = head.iter().map(|e| e.step_index).collect();
    recombined.extend(tail.iter().map(|e| e.step_index));
    assert_eq!(recombined, (0..10).collect::<Vec<u64>>());
}
