//! Cross-module seed scenarios from the testable-properties section:
//! happy-path full-development, user stop mid-session, and validation
//! retry. Mirrors the teacher's own `tests/integration_tests.rs` placement
//! (top-level `tests/` directory, one file per scenario family).

mod support;

use orchestration_core::config::CoreConfig;
use orchestration_core::procedure::Procedure;
use orchestration_core::session_manager::SessionManager;
use orchestration_core::session_store::SessionStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use support::{complete, text, FakeRenderer, FakeStorage, FakeTracker, ScriptedRunner};

fn test_config(home: &std::path::Path) -> Arc<CoreConfig> {
    Arc::new(CoreConfig {
        home_directory: home.to_path_buf(),
        max_concurrent_sessions: 1,
        stop_grace_period: Duration::from_millis(300),
        comment_batch_window: Duration::from_millis(50),
        ..CoreConfig::default()
    })
}

#[tokio::test]
async fn happy_path_full_development_completes_all_subroutines() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let tracker = Arc::new(FakeTracker::default());
    let storage = Arc::new(FakeStorage::default());
    let store = Arc::new(SessionStore::new(storage));
    let renderer = Arc::new(FakeRenderer::default());

    // full-development has 6 subroutines; coding-activity and verifications
    // are validated, everything else completes on the first attempt.
    let runner = Arc::new(ScriptedRunner::new(
        vec![
            vec![text("implementing the change"), complete(0)], // coding-activity
            vec![text("running tests"), complete(0)],           // verifications
            vec![complete(0)],                                  // changelog-update
            vec![complete(0)],                                  // git-commit
            vec![complete(0)],                                  // gh-pr
            vec![complete(0)],                                  // concise-summary
        ],
        false,
    ));

    let manager = SessionManager::new(config, store.clone(), tracker.clone(), renderer, runner);
    manager
        .start_session(
            "ISSUE-HAPPY".into(),
            "repo-1".into(),
            PathBuf::from(tmp.path()).join("work"),
            Procedure::FullDevelopment,
        )
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let report = manager.status_report();
        if report.sessions_completed >= 1 || report.sessions_failed >= 1 {
            assert_eq!(report.sessions_completed, 1, "expected session to complete, not fail");
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("session did not complete within deadline");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(!tracker.comments_posted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn user_stop_mid_session_transitions_to_canceled() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let tracker = Arc::new(FakeTracker::default());
    let storage = Arc::new(FakeStorage::default());
    let store = Arc::new(SessionStore::new(storage));
    let renderer = Arc::new(FakeRenderer::default());

    // Never completes on its own; the stop signal must preempt.
    let runner = Arc::new(ScriptedRunner::new(
        vec![vec![text("first"), text("second")]],
        false,
    ));

    let manager = SessionManager::new(config, store.clone(), tracker.clone(), renderer, runner);
    manager
        .start_session(
            "ISSUE-STOP".into(),
            "repo-1".into(),
            PathBuf::from(tmp.path()).join("work"),
            Procedure::SimpleQuestion,
        )
        .await
        .unwrap();

    // Give the supervisor a moment to start and emit the two text activities.
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.stop_session("ISSUE-STOP").await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if store.get_by_issue("ISSUE-STOP").is_none() {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("session did not terminate after stop");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn validation_retry_runs_four_iterations_before_advancing() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let tracker = Arc::new(FakeTracker::default());
    let storage = Arc::new(FakeStorage::default());
    let store = Arc::new(SessionStore::new(storage));
    let renderer = Arc::new(FakeRenderer::default());

    // doc-edit procedure's first subroutine is not validated, so exercise
    // the validated path directly via full-development's coding-activity:
    // fail 3 times (exit_code != 0), pass on the 4th attempt.
    let runner = Arc::new(ScriptedRunner::new(
        vec![
            vec![complete(1)], // coding-activity attempt 1: fail
            vec![complete(1)], // attempt 2: fail
            vec![complete(1)], // attempt 3: fail
            vec![complete(0)], // attempt 4: pass
            vec![complete(0)], // verifications
            vec![complete(0)], // changelog-update
            vec![complete(0)], // git-commit
            vec![complete(0)], // gh-pr
            vec![complete(0)], // concise-summary
        ],
        false,
    ));

    let manager = SessionManager::new(config, store.clone(), tracker.clone(), renderer, runner);
    manager
        .start_session(
            "ISSUE-RETRY".into(),
            "repo-1".into(),
            PathBuf::from(tmp.path()).join("work"),
            Procedure::FullDevelopment,
        )
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let report = manager.status_report();
        if report.sessions_completed >= 1 || report.sessions_failed >= 1 {
            assert_eq!(report.sessions_completed, 1, "expected session to complete after validation retries");
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("session did not complete within deadline");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
