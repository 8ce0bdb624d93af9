//! Script executor tests against real on-disk scripts (unix only)

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use updagent::errors::AgentError;
use updagent::scripts::executor::{
    execute_script, RetryLaterRecord, EXIT_RETRY_LATER, STDERR_CAP,
};
use updagent::scripts::{Launcher, ScriptExecutor, ScriptsConfig};
use updagent::storage::store::Store;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Fixture {
    _dir: tempfile::TempDir,
    scripts: PathBuf,
    store: Arc<Store>,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let scripts = dir.path().join("scripts");
    std::fs::create_dir_all(&scripts).unwrap();
    std::fs::write(scripts.join("version"), "3\n").unwrap();
    let store = Arc::new(Store::open(dir.path().join("store")).await.unwrap());
    Fixture {
        _dir: dir,
        scripts,
        store,
    }
}

fn launcher(fx: &Fixture, config: ScriptsConfig) -> Launcher {
    Launcher::new(
        fx.store.clone(),
        ScriptsConfig {
            rootfs_scripts_path: fx.scripts.clone(),
            artifact_scripts_path: fx.scripts.clone(),
            ..config
        },
    )
}

#[tokio::test]
async fn test_scripts_run_in_lexicographic_order() {
    let fx = fixture().await;
    let out = fx.scripts.join("out");

    write_script(
        &fx.scripts,
        "Download_Enter_10",
        &format!("#!/bin/sh\necho 10 >> {}\n", out.display()),
    );
    write_script(
        &fx.scripts,
        "Download_Enter_01",
        &format!("#!/bin/sh\necho 01 >> {}\n", out.display()),
    );
    write_script(
        &fx.scripts,
        "Download_Enter_02_extra",
        &format!("#!/bin/sh\necho 02 >> {}\n", out.display()),
    );
    // Malformed name: never runs.
    write_script(
        &fx.scripts,
        "Download_Enter_5",
        &format!("#!/bin/sh\necho bad >> {}\n", out.display()),
    );

    let launcher = launcher(&fx, ScriptsConfig::default());
    launcher.execute_all("Download", "Enter", false).await.unwrap();

    let output = std::fs::read_to_string(&out).unwrap();
    assert_eq!(output, "01\n02\n10\n");
}

#[tokio::test]
async fn test_nonzero_exit_is_hard_failure() {
    let fx = fixture().await;
    write_script(&fx.scripts, "Sync_Enter_01", "#!/bin/sh\nexit 1\n");

    let launcher = launcher(&fx, ScriptsConfig::default());
    let err = launcher.execute_all("Sync", "Enter", false).await;
    assert!(matches!(err, Err(AgentError::ScriptError(_))));

    // The same failure is tolerated with ignore_error.
    launcher.execute_all("Sync", "Enter", true).await.unwrap();
}

#[tokio::test]
async fn test_non_executable_script() {
    let fx = fixture().await;
    let path = fx.scripts.join("Sync_Enter_01");
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

    let launcher = launcher(&fx, ScriptsConfig::default());
    assert!(launcher.execute_all("Sync", "Enter", false).await.is_err());
    launcher.execute_all("Sync", "Enter", true).await.unwrap();
}

#[tokio::test]
async fn test_stderr_capped_at_10kib() {
    let fx = fixture().await;
    // Emit well past the cap on stderr.
    let path = write_script(
        &fx.scripts,
        "Sync_Enter_01",
        "#!/bin/sh\ni=0\nwhile [ $i -lt 2000 ]; do\n  echo 0123456789abcde 1>&2\n  i=$((i+1))\ndone\n",
    );

    let outcome = execute_script(&path, Duration::from_secs(30)).await;
    assert_eq!(outcome.code, 0);
    assert_eq!(outcome.stderr.len(), STDERR_CAP);
    assert!(outcome.truncated);
}

#[tokio::test]
async fn test_timeout_kills_script() {
    let fx = fixture().await;
    let path = write_script(&fx.scripts, "Sync_Enter_01", "#!/bin/sh\nsleep 30\n");

    let started = Instant::now();
    let outcome = execute_script(&path, Duration::from_millis(300)).await;
    assert_eq!(outcome.code, -1);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_retry_later_then_success() {
    let fx = fixture().await;
    let marker = fx.scripts.join("marker");
    write_script(
        &fx.scripts,
        "ArtifactInstall_Enter_67",
        &format!(
            "#!/bin/sh\nif [ -f {m} ]; then exit 0; fi\ntouch {m}\nexit 254\n",
            m = marker.display()
        ),
    );

    let launcher = launcher(
        &fx,
        ScriptsConfig {
            retry_interval: Duration::from_millis(20),
            retry_total_time: Duration::from_secs(60),
            ..Default::default()
        },
    );
    launcher
        .execute_all("ArtifactInstall", "Enter", false)
        .await
        .unwrap();

    // One retry-later cycle happened and the record was cleaned up.
    assert!(marker.exists());
    assert!(!fx
        .store
        .contains("script:ArtifactInstall_Enter_67")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_retry_later_exhaustion() {
    let fx = fixture().await;
    write_script(
        &fx.scripts,
        "ArtifactInstall_Enter_01",
        "#!/bin/sh\nsleep 0.2\nexit 254\n",
    );

    let launcher = launcher(
        &fx,
        ScriptsConfig {
            retry_interval: Duration::from_millis(20),
            retry_total_time: Duration::from_millis(300),
            ..Default::default()
        },
    );
    let err = launcher.execute_all("ArtifactInstall", "Enter", false).await;
    assert!(matches!(err, Err(AgentError::ScriptRetryExceeded(_))));

    // The accumulated record survives for diagnosis.
    let record: RetryLaterRecord = fx
        .store
        .get("script:ArtifactInstall_Enter_01")
        .await
        .unwrap();
    assert_eq!(record.state, "ArtifactInstall");
    assert!(record.total_duration_ms > 300);

    // With ignore_error the exhaustion is silent.
    launcher
        .execute_all("ArtifactInstall", "Enter", true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_retry_later_exit_code_mapping() {
    let fx = fixture().await;
    let path = write_script(&fx.scripts, "Sync_Enter_01", "#!/bin/sh\nexit 254\n");

    let outcome = execute_script(&path, Duration::from_secs(10)).await;
    assert_eq!(outcome.code, EXIT_RETRY_LATER);
}
