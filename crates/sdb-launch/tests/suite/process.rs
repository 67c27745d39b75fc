#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sdb_config::DebuggerConfig;
use sdb_launch::{spawn_target, LaunchResolver, OutputLine, OutputStream, PathLocator, ProjectHandle};
use tokio::sync::mpsc;

fn target_for(dir: &Path, script: &str) -> sdb_launch::LaunchTarget {
    std::fs::write(dir.join("project.godot"), "config_version=5\n").unwrap();
    let exe = dir.join("godot");
    std::fs::write(&exe, script).unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = DebuggerConfig::default();
    config.launch.godot_executable = Some(exe);
    LaunchResolver::new(Arc::new(PathLocator), &config)
        .resolve(&ProjectHandle::from(dir))
        .unwrap()
        .with_agent_address("127.0.0.1:41000".parse().unwrap())
}

#[tokio::test]
async fn forwards_output_lines_and_environment() {
    let dir = tempfile::tempdir().unwrap();
    let target = target_for(
        dir.path(),
        "#!/bin/sh\necho \"$GODOT_MONO_DEBUGGER_AGENT\"\necho \"$1\"\necho oops >&2\n",
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let mut process = spawn_target(&target, Arc::new(move |line| {
        let _ = tx.send(line);
    }))
    .unwrap();
    let status = process.wait().await.unwrap();
    assert!(status.success());

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while stdout.len() < 2 || stderr.is_empty() {
        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match line.stream {
            OutputStream::Stdout => stdout.push(line.line),
            OutputStream::Stderr => stderr.push(line.line),
        }
    }
    assert_eq!(
        stdout,
        [
            "--debugger-agent=transport=dt_socket,address=127.0.0.1:41000,server=n,suspend=y",
            "--path",
        ]
    );
    assert_eq!(stderr, ["oops"]);
}

#[tokio::test]
async fn terminate_stops_a_sleeping_game() {
    let dir = tempfile::tempdir().unwrap();
    let target = target_for(dir.path(), "#!/bin/sh\nsleep 30\n");
    let mut process = spawn_target(&target, Arc::new(|_| {})).unwrap();
    assert!(process.try_wait().unwrap().is_none());

    let status = tokio::time::timeout(
        Duration::from_secs(10),
        process.terminate(Duration::from_millis(100)),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(!status.success());
}
