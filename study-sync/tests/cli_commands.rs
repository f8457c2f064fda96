//! Integration tests for command execution against a coordinator backed by
//! the in-process document service.

use serde_json::json;
use std::sync::Arc;
use study_sync::{execute, Command, DomainArg};
use study_sync_core::{Coordinator, Identity, MemoryBackend, SyncConfig};

fn coordinator(dir: &tempfile::TempDir) -> Coordinator {
    let config = SyncConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..SyncConfig::default()
    };
    Coordinator::new(&config, None).expect("coordinator")
}

#[tokio::test]
async fn test_done_undo_and_list() {
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = coordinator(&dir);

    let out = execute(&coordinator, &Command::Done { id: "1_1".into() })
        .await
        .expect("done");
    assert_eq!(out, json!({ "id": "1_1", "done": true }));

    let listed = execute(
        &coordinator,
        &Command::List {
            domain: DomainArg::Completions,
        },
    )
    .await
    .expect("list");
    assert!(listed.get("1_1").is_some());

    let out = execute(&coordinator, &Command::Undo { id: "1_1".into() })
        .await
        .expect("undo");
    assert_eq!(out["changed"], true);
    assert!(coordinator.completions().is_empty());
}

#[tokio::test]
async fn test_flag_commands() {
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = coordinator(&dir);

    let out = execute(
        &coordinator,
        &Command::Flag {
            case_id: "2_4".into(),
            question: 3,
            text: "why?".into(),
        },
    )
    .await
    .expect("flag");
    assert_eq!(out["id"], "2_4_q3");

    let out = execute(
        &coordinator,
        &Command::FlagCase {
            case_id: "2_4".into(),
        },
    )
    .await
    .expect("flag case");
    assert_eq!(out["flagged"], true);

    let status = execute(&coordinator, &Command::Status)
        .await
        .expect("status");
    assert_eq!(status["flags"]["total"], 2);
    assert_eq!(status["remoteReady"], false);
}

#[tokio::test]
async fn test_state_persists_between_invocations() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let coordinator = coordinator(&dir);
        execute(&coordinator, &Command::Toggle { id: "x".into() })
            .await
            .expect("toggle");
    }
    let coordinator = coordinator(&dir);
    assert!(coordinator.completions().has("x"));
}

#[tokio::test]
async fn test_export_then_import_into_fresh_directory() {
    let source_dir = tempfile::tempdir().expect("tempdir");
    let source = coordinator(&source_dir);
    execute(&source, &Command::Done { id: "a".into() })
        .await
        .expect("done");
    let backup = source_dir.path().join("backup.json");
    execute(
        &source,
        &Command::Export {
            output: Some(backup.clone()),
        },
    )
    .await
    .expect("export");

    let target_dir = tempfile::tempdir().expect("tempdir");
    let target = coordinator(&target_dir);
    let summary = execute(&target, &Command::Import { file: backup })
        .await
        .expect("import");
    assert_eq!(summary["completions"]["imported"], 1);
    assert!(target.completions().has("a"));
}

#[tokio::test]
async fn test_import_of_garbage_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = coordinator(&dir);
    let file = dir.path().join("bad.json");
    std::fs::write(&file, "not json").expect("write");

    let err = execute(&coordinator, &Command::Import { file })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("importing backup"));
}

#[tokio::test]
async fn test_clear_requires_confirmation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = coordinator(&dir);
    coordinator
        .completions()
        .set_record("keep", study_sync_core::CompletionFields {});

    let err = execute(
        &coordinator,
        &Command::Clear {
            domain: None,
            yes: false,
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("--yes"));
    assert!(coordinator.completions().has("keep"));

    execute(
        &coordinator,
        &Command::Clear {
            domain: Some(DomainArg::Completions),
            yes: true,
        },
    )
    .await
    .expect("clear");
    assert!(coordinator.completions().is_empty());
}

#[tokio::test]
async fn test_progress_against_roster() {
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = coordinator(&dir);
    let roster = dir.path().join("roster.json");
    std::fs::write(&roster, r#"{"cardio": ["1_1", "1_2", "1_3"], "neuro": ["2_1"]}"#)
        .expect("write roster");
    coordinator
        .completions()
        .set_record("1_1", study_sync_core::CompletionFields {});

    let out = execute(
        &coordinator,
        &Command::Progress {
            roster: roster.clone(),
            category: Some("cardio".into()),
        },
    )
    .await
    .expect("progress");
    assert_eq!(out, json!({ "total": 3, "completed": 1, "percentage": 33 }));

    let out = execute(
        &coordinator,
        &Command::Progress {
            roster: roster.clone(),
            category: None,
        },
    )
    .await
    .expect("progress");
    assert_eq!(out["overall"]["percentage"], 25);
    assert_eq!(out["categories"]["neuro"]["completed"], 0);

    assert!(execute(
        &coordinator,
        &Command::Progress {
            roster,
            category: Some("missing".into()),
        },
    )
    .await
    .is_err());
}

#[tokio::test]
async fn test_sync_requires_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = coordinator(&dir);
    let err = execute(&coordinator, &Command::Sync).await.unwrap_err();
    assert!(err.to_string().contains("--user"));
}

#[tokio::test]
async fn test_sync_and_sign_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = SyncConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..SyncConfig::default()
    };
    let backend = Arc::new(MemoryBackend::new());
    backend.insert("u1", "progress", "remote", json!({ "createdAt": 1 }));
    let coordinator = Coordinator::new(&config, Some(backend.clone())).expect("coordinator");

    coordinator.sign_in(Identity::new("u1"));
    coordinator.flush().await;
    let out = execute(&coordinator, &Command::Sync).await.expect("sync");
    assert_eq!(out["completions"]["total"], 1);
    assert_eq!(out["flags"]["total"], 0);

    execute(&coordinator, &Command::SignOut)
        .await
        .expect("sign out");
    assert!(coordinator.completions().is_empty());
    assert!(coordinator.remote().current_identity().is_none());
}
