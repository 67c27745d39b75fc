use std::path::{Path, PathBuf};
use std::sync::Arc;

use sdb_config::{DebuggerConfig, LaunchMode};
use sdb_launch::{
    LaunchError, LaunchResolver, PathLocator, ProjectHandle, ProjectLocator, AGENT_ENV_VAR,
};

fn godot_project(root: &Path) -> PathBuf {
    let project = root.join("game");
    std::fs::create_dir_all(project.join("scenes")).unwrap();
    std::fs::write(project.join("project.godot"), "config_version=5\n").unwrap();
    project
}

#[cfg(unix)]
fn fake_godot(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let exe = dir.join("godot-mono");
    std::fs::write(&exe, "#!/bin/sh\nexit 0\n").unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
    exe
}

fn resolver(config: &DebuggerConfig) -> LaunchResolver {
    LaunchResolver::new(Arc::new(PathLocator), config)
}

#[cfg(unix)]
#[test]
fn launch_target_carries_project_path_and_agent_env() {
    let dir = tempfile::tempdir().unwrap();
    let project = godot_project(dir.path());
    let mut config = DebuggerConfig::default();
    config.launch.godot_executable = Some(fake_godot(dir.path()));
    config.launch.extra_args = vec!["--verbose".to_owned()];

    let handle = ProjectHandle::from(project.join("scenes").as_path());
    let target = resolver(&config).resolve(&handle).unwrap();

    assert_eq!(target.mode(), LaunchMode::Launch);
    assert_eq!(target.working_directory(), project);
    assert_eq!(
        target.arguments(),
        ["--path".to_owned(), project.display().to_string(), "--verbose".to_owned()]
    );
    assert!(target.suspend_on_start());

    let target = target.with_agent_address("127.0.0.1:40123".parse().unwrap());
    assert_eq!(
        target.environment(),
        [(
            AGENT_ENV_VAR.to_owned(),
            "--debugger-agent=transport=dt_socket,address=127.0.0.1:40123,server=n,suspend=y"
                .to_owned()
        )]
    );
}

#[test]
fn missing_project_file_is_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = resolver(&DebuggerConfig::default())
        .resolve(&ProjectHandle::from(dir.path()))
        .unwrap_err();
    assert!(matches!(err, LaunchError::ProjectResolution(_)), "{err:?}");
}

#[test]
fn unknown_handle_is_resolution_error() {
    let locator = |_: &ProjectHandle| None;
    let locator: Arc<dyn ProjectLocator> = Arc::new(locator);
    let resolver = LaunchResolver::new(locator, &DebuggerConfig::default());
    let err = resolver.resolve(&ProjectHandle::new("startup")).unwrap_err();
    assert!(matches!(err, LaunchError::ProjectResolution(_)), "{err:?}");
}

#[test]
fn launch_without_executable_is_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    let project = godot_project(dir.path());

    let err = resolver(&DebuggerConfig::default())
        .resolve(&ProjectHandle::from(project.as_path()))
        .unwrap_err();
    assert!(matches!(err, LaunchError::ProjectResolution(_)), "{err:?}");

    let mut config = DebuggerConfig::default();
    config.launch.godot_executable = Some(dir.path().join("missing-godot"));
    let err = resolver(&config)
        .resolve(&ProjectHandle::from(project.as_path()))
        .unwrap_err();
    assert!(matches!(err, LaunchError::ProjectResolution(_)), "{err:?}");
}

#[test]
fn attach_requires_agent_port() {
    let dir = tempfile::tempdir().unwrap();
    let project = godot_project(dir.path());
    let mut config = DebuggerConfig::default();
    config.launch.mode = LaunchMode::Attach;

    let err = resolver(&config)
        .resolve(&ProjectHandle::from(project.as_path()))
        .unwrap_err();
    assert!(matches!(err, LaunchError::NoDebugAgentConfigured), "{err:?}");

    config.agent.port = 55_556;
    let target = resolver(&config)
        .resolve(&ProjectHandle::from(project.as_path()))
        .unwrap();
    assert_eq!(target.executable_path(), None);
    assert_eq!(target.debug_agent_address().port(), 55_556);
    assert!(target.environment().is_empty());
}
