use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pyroom_core::error::InstallFailureKind;
use pyroom_core::test_utils::{FakeEngineFactory, FakeInstaller};
use pyroom_core::{Error, SessionManager, SessionManagerConfig};
use tempfile::TempDir;
use tokio::time::Instant;

const BOOTSTRAP: &str = "import os\nbootstrapped = 1";

struct Harness {
    manager: Arc<SessionManager>,
    factory: FakeEngineFactory,
    installer: FakeInstaller,
    _root: TempDir,
}

fn fast_config(root: &Path) -> SessionManagerConfig {
    SessionManagerConfig::new(root)
        .with_bootstrap_code(BOOTSTRAP)
        .with_readiness(Duration::from_secs(2), Duration::from_millis(300))
        .with_poll_interval(Duration::from_millis(5))
        .with_message_timeout(Duration::from_millis(500))
        .with_drain_quiet(Duration::from_millis(5))
}

fn harness_with(factory: FakeEngineFactory, installer: FakeInstaller) -> Harness {
    harness_configured(factory, installer, |config| config)
}

fn harness_configured(
    factory: FakeEngineFactory,
    installer: FakeInstaller,
    tweak: impl FnOnce(SessionManagerConfig) -> SessionManagerConfig,
) -> Harness {
    let root = TempDir::new().unwrap();
    let manager = Arc::new(SessionManager::new(
        tweak(fast_config(root.path())),
        Arc::new(factory.clone()),
        Arc::new(installer.clone()),
    ));
    Harness {
        manager,
        factory,
        installer,
        _root: root,
    }
}

fn harness() -> Harness {
    harness_with(FakeEngineFactory::new(), FakeInstaller::new())
}

async fn workspace_of(h: &Harness, id: &str) -> std::path::PathBuf {
    h.manager
        .registry()
        .get(id)
        .await
        .unwrap()
        .workspace()
        .to_path_buf()
}

#[tokio::test]
async fn test_state_persists_until_reset() {
    let h = harness();

    assert_eq!(h.manager.run("s1", "x = 1", &[]).await.unwrap(), "");
    assert_eq!(h.manager.run("s1", "print(x + 1)", &[]).await.unwrap(), "2");

    h.manager.reset("s1").await.unwrap();

    let err = h.manager.run("s1", "print(x)", &[]).await.unwrap_err();
    match err {
        Error::ExecutionError(failure) => {
            assert_eq!(failure.ename, "NameError");
            assert_eq!(failure.evalue, "name 'x' is not defined");
        }
        other => panic!("expected execution error, got {other:?}"),
    }

    // bootstrap ran again after the reset
    assert_eq!(h.manager.run("s1", "bootstrapped", &[]).await.unwrap(), "1");
    assert_eq!(h.factory.created_count(), 1);
}

#[tokio::test]
async fn test_unknown_ids_are_not_found_for_reset_and_end() {
    let h = harness();

    assert!(matches!(
        h.manager.reset("nobody").await,
        Err(Error::SessionNotFound { .. })
    ));
    assert!(matches!(
        h.manager.end_session("nobody").await,
        Err(Error::SessionNotFound { .. })
    ));
    assert_eq!(h.manager.session_count().await, 0);
}

#[tokio::test]
async fn test_ended_session_is_not_recreated() {
    let h = harness();
    h.manager.run("gone", "y = 2", &[]).await.unwrap();
    let workspace = workspace_of(&h, "gone").await;
    assert!(workspace.exists());

    h.manager.end_session("gone").await.unwrap();

    assert!(!workspace.exists());
    assert!(matches!(
        h.manager.run("gone", "print(y)", &[]).await,
        Err(Error::SessionNotFound { .. })
    ));
    assert!(matches!(
        h.manager.reset("gone").await,
        Err(Error::SessionNotFound { .. })
    ));
    assert!(matches!(
        h.manager.end_session("gone").await,
        Err(Error::SessionNotFound { .. })
    ));
    let control = h.factory.control_for("gone").unwrap();
    assert!(!control.is_alive());
    assert_eq!(control.shutdown_count(), 1);
}

#[tokio::test]
async fn test_same_session_runs_are_serialized() {
    let h = harness();
    h.manager.run("shared", "n = 0", &[]).await.unwrap();

    let slow = {
        let manager = h.manager.clone();
        tokio::spawn(async move {
            manager
                .run("shared", "print('a1')\nsleep(100)\nprint('a2')", &[])
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fast = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.run("shared", "print('b')", &[]).await })
    };

    assert_eq!(slow.await.unwrap().unwrap(), "a1\na2");
    assert_eq!(fast.await.unwrap().unwrap(), "b");
    assert_eq!(h.factory.created_count(), 1);
}

#[tokio::test]
async fn test_concurrent_first_runs_create_one_session() {
    let h = harness();
    let mut handles = Vec::new();
    for i in 0..8 {
        let manager = h.manager.clone();
        handles.push(tokio::spawn(async move {
            manager.run("fresh", &format!("print({i})"), &[]).await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), i.to_string());
    }
    assert_eq!(h.factory.created_count(), 1);
    assert_eq!(h.manager.session_count().await, 1);
}

#[tokio::test]
async fn test_blocked_session_does_not_delay_another() {
    let h = harness();
    h.manager.run("slow", "z = 1", &[]).await.unwrap();

    let blocked = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.run("slow", "hang", &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    assert_eq!(h.manager.run("quick", "print('done')", &[]).await.unwrap(), "done");
    assert!(started.elapsed() < Duration::from_millis(400));
    assert!(!blocked.is_finished());

    assert!(matches!(
        blocked.await.unwrap(),
        Err(Error::ExecutionTimeout { .. })
    ));
}

#[tokio::test]
async fn test_timed_out_kernel_is_recovered_on_next_access() {
    let h = harness();
    h.manager.run("stuck", "v = 5", &[]).await.unwrap();

    assert!(matches!(
        h.manager.run("stuck", "hang", &[]).await,
        Err(Error::ExecutionTimeout { .. })
    ));

    // the readiness retry goes unanswered, so the kernel is restarted
    assert_eq!(h.manager.run("stuck", "print(1)", &[]).await.unwrap(), "1");
    let control = h.factory.control_for("stuck").unwrap();
    assert_eq!(control.start_count(), 2);
    assert!(matches!(
        h.manager.run("stuck", "v", &[]).await,
        Err(Error::ExecutionError(_))
    ));
}

#[tokio::test]
async fn test_dead_kernel_is_restarted_with_bootstrap() {
    let h = harness();
    h.manager.run("phoenix", "x = 1", &[]).await.unwrap();
    let control = h.factory.control_for("phoenix").unwrap();

    control.kill();

    assert_eq!(h.manager.run("phoenix", "bootstrapped + 1", &[]).await.unwrap(), "2");
    assert_eq!(control.start_count(), 2);
    let bootstraps = control
        .submitted()
        .iter()
        .filter(|code| code.as_str() == BOOTSTRAP)
        .count();
    assert_eq!(bootstraps, 2);
}

#[tokio::test]
async fn test_crash_mid_execution_then_recovery() {
    let h = harness();
    h.manager.run("crashy", "a = 1", &[]).await.unwrap();

    assert!(matches!(
        h.manager.run("crashy", "crash", &[]).await,
        Err(Error::EngineDead)
    ));
    assert_eq!(h.manager.run("crashy", "print('back')", &[]).await.unwrap(), "back");
}

#[tokio::test]
async fn test_failed_restart_destroys_session() {
    let h = harness();
    h.manager.run("doomed", "x = 1", &[]).await.unwrap();
    let workspace = workspace_of(&h, "doomed").await;
    let control = h.factory.control_for("doomed").unwrap();

    control.kill();
    control.fail_next_starts(1);

    assert!(matches!(
        h.manager.run("doomed", "print(x)", &[]).await,
        Err(Error::SessionUnrecoverable { .. })
    ));
    assert_eq!(h.manager.session_count().await, 0);
    assert!(!workspace.exists());

    // not an explicit end, so the id can start over
    assert_eq!(h.manager.run("doomed", "print('new')", &[]).await.unwrap(), "new");
    assert_eq!(h.factory.created_count(), 2);
}

#[tokio::test]
async fn test_bootstrap_failure_leaves_nothing_registered() {
    let h = harness_with(
        FakeEngineFactory::new().with_missing_module("os"),
        FakeInstaller::new(),
    );

    let err = h.manager.run("broken", "print(1)", &[]).await.unwrap_err();

    match err {
        Error::SessionInitFailure { source, .. } => {
            assert!(matches!(*source, Error::ExecutionError(ref f) if f.ename == "ModuleNotFoundError"));
        }
        other => panic!("expected init failure, got {other:?}"),
    }
    assert_eq!(h.manager.session_count().await, 0);
    let control = h.factory.control_for("broken").unwrap();
    assert!(!control.is_alive());
}

#[tokio::test]
async fn test_dependency_failures_keep_session_usable() {
    let h = harness_with(
        FakeEngineFactory::new().with_missing_module("ghost"),
        FakeInstaller::new().failing_on("broken-pkg"),
    );
    h.manager.run("deps", "k = 3", &[]).await.unwrap();

    let err = h
        .manager
        .run(
            "deps",
            "print(k)",
            &["fine".to_string(), "broken-pkg".to_string(), "later".to_string()],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::DependencyInstallFailure { ref package, kind: InstallFailureKind::ExitStatus, .. }
            if package == "broken-pkg"
    ));
    assert_eq!(h.installer.calls(), vec!["fine", "broken-pkg"]);

    let err = h
        .manager
        .run("deps", "print(k)", &["ghost".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DependencyImportFailure { ref package, .. } if package == "ghost"));

    assert_eq!(
        h.manager
            .run("deps", "print(k)", &["fine".to_string()])
            .await
            .unwrap(),
        "3"
    );
}

#[tokio::test]
async fn test_sweep_removes_only_sessions_past_threshold() {
    let h = harness();
    h.manager.run("old", "x = 1", &[]).await.unwrap();
    h.manager.run("older", "x = 2", &[]).await.unwrap();
    let workspace = workspace_of(&h, "old").await;
    let threshold = h.manager.config().idle_threshold;
    let now = Instant::now();

    let kept = h
        .manager
        .sweep_idle_at(now + threshold - Duration::from_secs(1))
        .await;
    assert!(kept.reclaimed.is_empty());
    assert_eq!(h.manager.session_count().await, 2);

    let swept = h
        .manager
        .sweep_idle_at(now + threshold + Duration::from_secs(1))
        .await;
    let mut reclaimed = swept.reclaimed.clone();
    reclaimed.sort();
    assert_eq!(reclaimed, vec!["old", "older"]);
    swept.join().await;

    assert_eq!(h.manager.session_count().await, 0);
    assert!(!workspace.exists());
    assert!(!h.factory.control_for("old").unwrap().is_alive());

    // reclaimed ids are free to start over
    assert!(matches!(
        h.manager.run("old", "print(x)", &[]).await,
        Err(Error::ExecutionError(_))
    ));
}

#[tokio::test]
async fn test_sweep_expires_ended_ids() {
    let h = harness();
    h.manager.run("again", "x = 1", &[]).await.unwrap();
    h.manager.end_session("again").await.unwrap();
    let threshold = h.manager.config().idle_threshold;

    let outcome = h
        .manager
        .sweep_idle_at(Instant::now() + threshold + Duration::from_secs(1))
        .await;
    assert_eq!(outcome.expired_tombstones, 1);

    assert_eq!(h.manager.run("again", "print('hi')", &[]).await.unwrap(), "hi");
}

#[tokio::test]
async fn test_list_and_shutdown_all() {
    let h = harness();
    h.manager.run("a", "x = 1", &[]).await.unwrap();
    h.manager.run("b", "x = 1", &[]).await.unwrap();

    let listed: Vec<String> = h
        .manager
        .list_sessions()
        .await
        .into_iter()
        .map(|s| s.conversation_id)
        .collect();
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&"a".to_string()));
    assert!(listed.contains(&"b".to_string()));

    h.manager.shutdown_all().await;

    assert_eq!(h.manager.session_count().await, 0);
    assert!(!h.factory.control_for("a").unwrap().is_alive());
    assert!(!h.factory.control_for("b").unwrap().is_alive());
}

fn short_readiness(config: SessionManagerConfig) -> SessionManagerConfig {
    config.with_readiness(Duration::from_millis(300), Duration::from_millis(100))
}

fn long_message_timeout(config: SessionManagerConfig) -> SessionManagerConfig {
    config.with_message_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn test_end_session_interrupts_running_execution() {
    let h = harness_configured(FakeEngineFactory::new(), FakeInstaller::new(), long_message_timeout);
    h.manager.run("busy", "w = 1", &[]).await.unwrap();
    let workspace = workspace_of(&h, "busy").await;
    let control = h.factory.control_for("busy").unwrap();

    let running = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.run("busy", "hang", &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    h.manager.end_session("busy").await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!control.is_alive());
    assert!(!workspace.exists());

    assert!(matches!(
        running.await.unwrap(),
        Err(Error::SessionNotFound { .. })
    ));
}

#[tokio::test]
async fn test_shutdown_all_interrupts_running_execution() {
    let h = harness_configured(FakeEngineFactory::new(), FakeInstaller::new(), long_message_timeout);
    h.manager.run("looping", "w = 1", &[]).await.unwrap();
    let control = h.factory.control_for("looping").unwrap();

    let running = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.run("looping", "hang", &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    h.manager.shutdown_all().await;
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!control.is_alive());
    assert!(running.await.unwrap().is_err());
}

#[tokio::test]
async fn test_sweep_leaves_running_execution_alone() {
    let h = harness_configured(FakeEngineFactory::new(), FakeInstaller::new(), long_message_timeout);
    h.manager.run("working", "w = 1", &[]).await.unwrap();
    let control = h.factory.control_for("working").unwrap();

    let running = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.run("working", "hang", &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let threshold = h.manager.config().idle_threshold;
    let outcome = h.manager.sweep_idle_at(Instant::now() + threshold * 2).await;
    assert!(outcome.reclaimed.is_empty());
    assert!(control.is_alive());
    assert_eq!(h.manager.session_count().await, 1);

    h.manager.end_session("working").await.unwrap();
    assert!(running.await.unwrap().is_err());
}

#[tokio::test]
async fn test_reset_with_failed_restart_destroys_session() {
    let h = harness();
    h.manager.run("rs", "x = 1", &[]).await.unwrap();
    let workspace = workspace_of(&h, "rs").await;
    let control = h.factory.control_for("rs").unwrap();

    control.fail_next_starts(1);

    assert!(matches!(
        h.manager.reset("rs").await,
        Err(Error::RestartFailure { .. })
    ));
    assert_eq!(h.manager.session_count().await, 0);
    assert!(!workspace.exists());
}

#[tokio::test]
async fn test_reset_with_unready_kernel_is_init_failure() {
    let h = harness_configured(FakeEngineFactory::new(), FakeInstaller::new(), short_readiness);
    h.manager.run("rr", "x = 1", &[]).await.unwrap();
    let workspace = workspace_of(&h, "rr").await;
    let control = h.factory.control_for("rr").unwrap();

    control.ignore_next_readiness_checks(1);

    match h.manager.reset("rr").await.unwrap_err() {
        Error::SessionInitFailure { source, .. } => {
            assert!(matches!(*source, Error::ReadinessTimeout { .. }));
        }
        other => panic!("expected init failure, got {other:?}"),
    }
    assert_eq!(h.manager.session_count().await, 0);
    assert!(!control.is_alive());
    assert!(!workspace.exists());
}

#[tokio::test]
async fn test_reset_with_failing_bootstrap_is_init_failure() {
    let h = harness();
    h.manager.run("rb", "x = 1", &[]).await.unwrap();
    let control = h.factory.control_for("rb").unwrap();

    control.mark_missing_module("os");

    match h.manager.reset("rb").await.unwrap_err() {
        Error::SessionInitFailure { source, .. } => {
            assert!(matches!(*source, Error::ExecutionError(ref f) if f.ename == "ModuleNotFoundError"));
        }
        other => panic!("expected init failure, got {other:?}"),
    }
    assert_eq!(h.manager.session_count().await, 0);
    assert!(matches!(
        h.manager.reset("rb").await,
        Err(Error::SessionNotFound { .. })
    ));
}

#[tokio::test]
async fn test_creation_readiness_timeout_leaves_nothing_registered() {
    let h = harness_configured(
        FakeEngineFactory::new().with_silent_readiness_checks(1),
        FakeInstaller::new(),
        short_readiness,
    );

    match h.manager.run("mute", "print(1)", &[]).await.unwrap_err() {
        Error::SessionInitFailure { source, .. } => {
            assert!(matches!(*source, Error::ReadinessTimeout { .. }));
        }
        other => panic!("expected init failure, got {other:?}"),
    }
    assert_eq!(h.manager.session_count().await, 0);
    let control = h.factory.control_for("mute").unwrap();
    assert!(!control.is_alive());
}
