//! End-to-end scenarios for the ready/blocked workflow against a file-backed
//! workspace.

use beads_core::graph::{self, ReadyFilters};
use beads_core::model::{Dependency, DependencyType, IssueType, Priority, Status};
use beads_core::storage::{IssueUpdate, NewIssue, SqliteStore};
use beads_core::util::Cancel;
use chrono::{Duration, Utc};
use tempfile::TempDir;

fn open_store() -> (TempDir, SqliteStore) {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&tmp.path().join("beads.db")).unwrap();
    (tmp, store)
}

fn ready_ids(store: &SqliteStore) -> Vec<String> {
    graph::ready_issues(store, &ReadyFilters::default())
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect()
}

#[test]
fn create_close_ready_cycle() {
    let (_tmp, store) = open_store();
    let cancel = Cancel::new();

    let a = store
        .create_issue(
            &NewIssue {
                title: "Fix the crash".to_string(),
                priority: Priority::HIGH,
                issue_type: IssueType::Bug,
                ..NewIssue::default()
            },
            "alice",
            &cancel,
        )
        .unwrap();
    let b = store
        .create_issue(
            &NewIssue {
                title: "Ship the release".to_string(),
                ..NewIssue::default()
            },
            "alice",
            &cancel,
        )
        .unwrap();

    // B is blocked by A.
    store
        .add_dependency(
            &Dependency::new(&b.id, &a.id, DependencyType::Blocks),
            "alice",
            &cancel,
        )
        .unwrap();
    assert_eq!(ready_ids(&store), vec![a.id.clone()]);

    store
        .close_issue(&a.id, Some("fixed"), None, false, "alice", &cancel)
        .unwrap();
    assert_eq!(ready_ids(&store), vec![b.id.clone()]);
}

#[test]
fn defer_hides_until_deadline_passes() {
    let (_tmp, store) = open_store();
    let cancel = Cancel::new();
    let issue = store
        .create_issue(
            &NewIssue {
                title: "Later".to_string(),
                ..NewIssue::default()
            },
            "alice",
            &cancel,
        )
        .unwrap();

    store
        .update_issue(
            &issue.id,
            &IssueUpdate {
                defer_until: Some(Some(Utc::now() + Duration::hours(1))),
                ..IssueUpdate::default()
            },
            "alice",
            &cancel,
        )
        .unwrap();
    assert!(ready_ids(&store).is_empty());

    // A deadline a moment away: once the clock passes it, the issue is
    // ready again without any further mutation.
    store
        .update_issue(
            &issue.id,
            &IssueUpdate {
                defer_until: Some(Some(Utc::now() + Duration::milliseconds(50))),
                ..IssueUpdate::default()
            },
            "alice",
            &cancel,
        )
        .unwrap();
    assert!(ready_ids(&store).is_empty());
    std::thread::sleep(std::time::Duration::from_millis(80));
    assert_eq!(ready_ids(&store), vec![issue.id]);
}

#[test]
fn status_change_invalidates_cache_without_explicit_rebuild() {
    let (_tmp, store) = open_store();
    let cancel = Cancel::new();
    let blocker = store
        .create_issue(
            &NewIssue {
                title: "Blocker".to_string(),
                ..NewIssue::default()
            },
            "a",
            &cancel,
        )
        .unwrap();
    let blocked = store
        .create_issue(
            &NewIssue {
                title: "Blocked".to_string(),
                ..NewIssue::default()
            },
            "a",
            &cancel,
        )
        .unwrap();
    store
        .add_dependency(
            &Dependency::new(&blocked.id, &blocker.id, DependencyType::Blocks),
            "a",
            &cancel,
        )
        .unwrap();
    assert!(graph::is_blocked(&store, &blocked.id).unwrap());

    // A manual status flip on the blocker is enough; the cache follows.
    store
        .update_issue(
            &blocker.id,
            &IssueUpdate {
                status: Some(Status::InProgress),
                ..IssueUpdate::default()
            },
            "a",
            &cancel,
        )
        .unwrap();
    assert!(graph::is_blocked(&store, &blocked.id).unwrap());

    store
        .close_issue(&blocker.id, None, None, false, "a", &cancel)
        .unwrap();
    assert!(!graph::is_blocked(&store, &blocked.id).unwrap());
}

#[test]
fn removing_blocking_edge_unblocks() {
    let (_tmp, store) = open_store();
    let cancel = Cancel::new();
    let a = store
        .create_issue(
            &NewIssue {
                title: "A".to_string(),
                ..NewIssue::default()
            },
            "t",
            &cancel,
        )
        .unwrap();
    let b = store
        .create_issue(
            &NewIssue {
                title: "B".to_string(),
                ..NewIssue::default()
            },
            "t",
            &cancel,
        )
        .unwrap();
    store
        .add_dependency(
            &Dependency::new(&b.id, &a.id, DependencyType::Blocks),
            "t",
            &cancel,
        )
        .unwrap();
    assert!(graph::is_blocked(&store, &b.id).unwrap());

    assert!(store.remove_dependency(&b.id, &a.id, "t", &cancel).unwrap());
    assert!(!graph::is_blocked(&store, &b.id).unwrap());
}

#[test]
fn boundary_values_for_title_and_priority() {
    let (_tmp, store) = open_store();
    let cancel = Cancel::new();

    for (title, ok) in [
        (String::new(), false),
        ("x".to_string(), true),
        ("x".repeat(500), true),
        ("x".repeat(501), false),
    ] {
        let result = store.create_issue(
            &NewIssue {
                title,
                ..NewIssue::default()
            },
            "t",
            &cancel,
        );
        assert_eq!(result.is_ok(), ok);
    }

    assert!(Priority::new(-1).is_err());
    assert!(Priority::new(0).is_ok());
    assert!(Priority::new(4).is_ok());
    assert!(Priority::new(5).is_err());
}

#[test]
fn persistent_workspace_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("beads.db");
    let cancel = Cancel::new();

    let issue_id = {
        let store = SqliteStore::open(&db).unwrap();
        let issue = store
            .create_issue(
                &NewIssue {
                    title: "Persistent".to_string(),
                    labels: vec!["keep".to_string()],
                    ..NewIssue::default()
                },
                "alice",
                &cancel,
            )
            .unwrap();
        store.add_comment(&issue.id, "alice", "note to self", &cancel).unwrap();
        issue.id
    };

    let store = SqliteStore::open(&db).unwrap();
    let issue = store.get_issue_full(&issue_id).unwrap().unwrap();
    assert_eq!(issue.title, "Persistent");
    assert_eq!(issue.labels, vec!["keep"]);
    assert_eq!(issue.comments.len(), 1);
    assert_eq!(store.events_for(&issue_id, 10).unwrap().len(), 2);
}
