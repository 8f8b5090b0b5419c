//! End-to-end run orchestration against a scratch repository and a fake
//! registry server.

use std::fs;
use std::time::Duration;

use registrar::error::Error;
use registrar::io::config::load_config;
use registrar::io::history::History;
use registrar::io::session::SessionCoordinator;
use registrar::io::staging::{StagingFilter, StagingIndex};
use registrar::run::{RunRequest, execute_run};
use registrar::test_support::{FakeServer, TestRepo};

const PORT: u16 = 8000;

fn setup() -> (TestRepo, FakeServer, SessionCoordinator<FakeServer>) {
    let repo = TestRepo::new().expect("repo");
    let server = FakeServer::new();
    let coordinator =
        SessionCoordinator::new(repo.sessions_dir(), server.clone(), Duration::from_secs(5));
    (repo, server, coordinator)
}

fn request(repo: &TestRepo) -> RunRequest {
    RunRequest {
        config_path: repo.layout().default_run_config(),
        script_override: None,
        token: None,
    }
}

fn marker_count(repo: &TestRepo) -> usize {
    match fs::read_dir(repo.sessions_dir()) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .count(),
        Err(_) => 0,
    }
}

#[test]
fn successful_run_records_history_and_stages_the_job() {
    let (repo, server, coordinator) = setup();
    repo.write_run_config("[run]\nscript = \"echo hello from the run\"\n")
        .expect("config");
    let layout = repo.layout();
    let config = load_config(&layout.config_path()).expect("cli config");

    let outcome = execute_run(&layout, &config, &coordinator, &request(&repo)).expect("run");
    assert_eq!(outcome.exit_code, 0);

    let history = History::new(layout.history_dir());
    let records = history.list().expect("list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].identifier, outcome.identifier);
    assert_eq!(records[0].exit_code, Some(0));
    assert_eq!(records[0].author, "Test User");

    let log = history.read_log(&records[0]).expect("log");
    assert!(log.contains("hello from the run"));

    let staging = StagingIndex::load(&layout.staging_path()).expect("staging");
    let staged = staging.list(StagingFilter::Staged);
    assert_eq!(staged.len(), 1);
    assert!(staged[0].starts_with(".registrar/jobs/"));

    assert!(!server.is_running(PORT), "session not released");
    assert_eq!(marker_count(&repo), 0);
}

#[test]
fn failing_run_is_recorded_and_still_releases_the_session() {
    let (repo, server, coordinator) = setup();
    repo.write_run_config("[run]\nscript = \"echo partial; exit 1\"\n")
        .expect("config");
    let layout = repo.layout();
    let config = load_config(&layout.config_path()).expect("cli config");

    let err = execute_run(&layout, &config, &coordinator, &request(&repo)).unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::ExecutionFailure { exit_code, .. }) => assert_eq!(*exit_code, Some(1)),
        other => panic!("unexpected error: {other:?}"),
    }

    let history = History::new(layout.history_dir());
    let records = history.list().expect("list");
    assert_eq!(records.len(), 1, "failed run must still be recorded");
    assert_eq!(records[0].exit_code, Some(1));
    assert!(history
        .read_log(&records[0])
        .expect("log")
        .contains("partial"));

    assert!(!server.is_running(PORT), "session leaked on failure");
    assert_eq!(marker_count(&repo), 0);
}

#[test]
fn template_tokens_are_resolved_into_the_working_config() {
    let (repo, _server, coordinator) = setup();
    repo.write_run_config(
        "[run]\nscript = \"echo run by ${{ USER }} on ${{ DATE }} in ${{ REPO_DIR }}\"\n",
    )
    .expect("config");
    let layout = repo.layout();
    let config = load_config(&layout.config_path()).expect("cli config");

    let outcome = execute_run(&layout, &config, &coordinator, &request(&repo)).expect("run");

    let working = fs::read_to_string(outcome.job_dir.join("run.toml")).expect("working config");
    assert!(!working.contains("${{"), "unresolved token in working config");
    assert!(working.contains("Test User"));

    let history = History::new(layout.history_dir());
    let record = history.find(&outcome.identifier[..6]).expect("find");
    let log = history.read_log(&record).expect("log");
    assert!(log.contains("run by Test User"));
}

#[test]
fn unknown_token_fails_before_any_session_exists() {
    let (repo, server, coordinator) = setup();
    repo.write_run_config("[run]\nscript = \"echo ${{ MYSTERY }}\"\n")
        .expect("config");
    let layout = repo.layout();
    let config = load_config(&layout.config_path()).expect("cli config");

    let err = execute_run(&layout, &config, &coordinator, &request(&repo)).unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::UnknownTemplateVariable { token }) => assert_eq!(token, "MYSTERY"),
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(server.start_count(PORT), 0, "server started for a doomed run");
    assert_eq!(marker_count(&repo), 0);

    let history = History::new(layout.history_dir());
    assert!(history.list().expect("list").is_empty());
}

#[test]
fn script_override_replaces_the_configured_script() {
    let (repo, _server, coordinator) = setup();
    repo.write_run_config("[run]\nscript = \"echo from config\"\n")
        .expect("config");
    let layout = repo.layout();
    let config = load_config(&layout.config_path()).expect("cli config");

    let mut request = request(&repo);
    request.script_override = Some("echo from override".to_string());
    let outcome = execute_run(&layout, &config, &coordinator, &request).expect("run");

    let history = History::new(layout.history_dir());
    let record = history.find(&outcome.identifier).expect("find");
    let log = history.read_log(&record).expect("log");
    assert!(log.contains("from override"));
    assert!(!log.contains("from config"));
}

#[test]
fn identical_output_collapses_to_one_record() {
    let (repo, _server, coordinator) = setup();
    repo.write_run_config("[run]\nscript = \"echo stable output\"\n")
        .expect("config");
    let layout = repo.layout();
    let config = load_config(&layout.config_path()).expect("cli config");

    let first = execute_run(&layout, &config, &coordinator, &request(&repo)).expect("first");
    let second = execute_run(&layout, &config, &coordinator, &request(&repo)).expect("second");
    assert_eq!(first.identifier, second.identifier);

    let history = History::new(layout.history_dir());
    assert_eq!(history.list().expect("list").len(), 1);
}

#[test]
fn config_without_a_script_fails_before_acquisition() {
    let (repo, server, coordinator) = setup();
    repo.write_run_config("[run]\nshell = \"sh\"\n").expect("config");
    let layout = repo.layout();
    let config = load_config(&layout.config_path()).expect("cli config");

    let err = execute_run(&layout, &config, &coordinator, &request(&repo)).unwrap_err();
    assert!(err.to_string().contains("script"));
    assert_eq!(server.start_count(PORT), 0);
    assert_eq!(marker_count(&repo), 0);
}

#[test]
fn launch_failure_releases_without_recording() {
    // "julia" sits in the shell table but is not installed in this
    // environment; skip rather than fail where it is.
    if std::process::Command::new("julia")
        .arg("--version")
        .output()
        .is_ok()
    {
        return;
    }

    let (repo, server, coordinator) = setup();
    repo.write_run_config("[run]\nscript = \"1 + 1\"\nshell = \"julia\"\n")
        .expect("config");
    let layout = repo.layout();
    let config = load_config(&layout.config_path()).expect("cli config");

    let err = execute_run(&layout, &config, &coordinator, &request(&repo)).unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::ExecutionFailure { exit_code: None, .. }) => {}
        other => panic!("unexpected error: {other:?}"),
    }

    let history = History::new(layout.history_dir());
    assert!(
        history.list().expect("list").is_empty(),
        "a run that never launched must not be recorded"
    );
    assert!(!server.is_running(PORT), "session leaked on launch failure");
    assert_eq!(marker_count(&repo), 0);
}
