//! Run-level tests: completion, iteration cap, fatal errors, cancellation,
//! resume numbering and the project lock.

use std::fs;

use autopilot::cancel::CancelToken;
use autopilot::core::types::StopReason;
use autopilot::exit_codes;
use autopilot::io::engine::EngineError;
use autopilot::io::init::ProjectPaths;
use autopilot::io::lock::{LockError, LockMetadata};
use autopilot::io::run_state::{RunState, load_run_state, write_run_state};
use autopilot::orchestrator::{RunOptions, RunOutcome, run};
use autopilot::test_support::{
    BrowserEvents, ScriptedEngine, ScriptedTurn, TempProject, task, tool_response,
    write_tasks_call,
};
use serde_json::Value;

fn quiet(max_sessions: Option<u32>) -> RunOptions {
    RunOptions {
        max_sessions,
        spec: None,
        echo: false,
    }
}

fn run_project(
    project: &TempProject,
    engine: &ScriptedEngine,
    options: &RunOptions,
    cancel: &CancelToken,
) -> anyhow::Result<RunOutcome> {
    let config = project.config().expect("config");
    let mut dispatcher = project.dispatcher(&BrowserEvents::default());
    run(&config, engine, &mut dispatcher, options, cancel)
}

fn read_json(path: &std::path::Path) -> Value {
    let raw = fs::read_to_string(path).expect("read json");
    serde_json::from_str(&raw).expect("parse json")
}

/// Verifies a run stops once every task passes.
///
/// Checks the session record, the run state and that the lock is released.
#[test]
fn run_completes_when_the_task_list_passes() {
    let project = TempProject::new().expect("project");
    project
        .write_tasks(&[task("login", false), task("logout", false)])
        .expect("tasks");
    let done = [task("login", true), task("logout", true)];
    let engine = ScriptedEngine::new(vec![ScriptedTurn::respond(tool_response(&[
        write_tasks_call(&done),
    ]))]);

    let outcome = run_project(&project, &engine, &quiet(Some(5)), &CancelToken::new())
        .expect("run");

    assert_eq!(outcome.stop, StopReason::Completed);
    assert_eq!(outcome.stop.exit_code(), exit_codes::OK);
    assert_eq!(outcome.sessions_run, 1);
    assert!(outcome.progress.is_complete());

    let paths = ProjectPaths::new(project.path());
    let state = load_run_state(&paths.run_state_path).expect("run state");
    assert_eq!(state.next_session, 2);
    let record = read_json(&paths.session_meta_path(1));
    assert_eq!(record["reason"], "completed");
    assert_eq!(record["kind"], "coding");
    assert_eq!(record["progress_before"]["passing_tasks"], 0);
    assert_eq!(record["progress_after"]["passing_tasks"], 2);
    assert_eq!(record["files_written"][0], "feature_list.json");
    assert!(paths.session_log_path(1).exists());
    assert!(!paths.lock_path.exists(), "lock released after the run");
}

/// Verifies a finished project starts no session.
#[test]
fn already_complete_project_runs_no_sessions() {
    let project = TempProject::new().expect("project");
    project.write_tasks(&[task("login", true)]).expect("tasks");
    let engine = ScriptedEngine::new(Vec::new());

    let outcome = run_project(&project, &engine, &quiet(None), &CancelToken::new())
        .expect("run");

    assert_eq!(outcome.stop, StopReason::Completed);
    assert_eq!(outcome.sessions_run, 0);
    assert_eq!(engine.calls(), 0);
}

/// Verifies `max_sessions` stops the run with the iteration-cap code.
#[test]
fn session_cap_stops_with_iteration_cap() {
    let project = TempProject::new().expect("project");
    project.write_tasks(&[task("login", false)]).expect("tasks");
    let engine = ScriptedEngine::new(Vec::new());

    let outcome = run_project(&project, &engine, &quiet(Some(2)), &CancelToken::new())
        .expect("run");

    assert_eq!(outcome.stop, StopReason::IterationCap);
    assert_eq!(outcome.stop.exit_code(), exit_codes::ITERATION_CAP);
    assert_eq!(outcome.sessions_run, 2);
    // two idle turns per session
    assert_eq!(engine.calls(), 4);

    let paths = ProjectPaths::new(project.path());
    let record = read_json(&paths.session_meta_path(2));
    assert_eq!(record["reason"], "idle_exhausted");
}

/// Verifies a fatal session ends the run without another session.
#[test]
fn fatal_session_stops_the_run() {
    let project = TempProject::new().expect("project");
    project.write_tasks(&[task("login", false)]).expect("tasks");
    let engine = ScriptedEngine::new(vec![ScriptedTurn::fail(EngineError::Auth(
        "invalid key".to_string(),
    ))]);

    let outcome = run_project(&project, &engine, &quiet(Some(5)), &CancelToken::new())
        .expect("run");

    assert_eq!(outcome.stop, StopReason::FatalError);
    assert_eq!(outcome.stop.exit_code(), exit_codes::FATAL);
    assert_eq!(outcome.sessions_run, 1);
    assert!(outcome.error.expect("error").contains("invalid key"));

    let paths = ProjectPaths::new(project.path());
    let record = read_json(&paths.session_meta_path(1));
    assert_eq!(record["reason"], "fatal_error");
    assert!(record["error"].as_str().is_some());
}

/// Verifies cancellation pauses the run and keeps resumable state.
#[test]
fn cancellation_mid_session_pauses_the_run() {
    let project = TempProject::new().expect("project");
    project.write_tasks(&[task("login", false)]).expect("tasks");
    let cancel = CancelToken::new();
    let engine = ScriptedEngine::new(vec![
        ScriptedTurn::respond(tool_response(&[(
            "list_directory",
            serde_json::json!({ "path": "." }),
        )]))
        .cancelling(&cancel),
    ]);

    let outcome = run_project(&project, &engine, &quiet(None), &cancel).expect("run");

    assert_eq!(outcome.stop, StopReason::Cancelled);
    assert_eq!(outcome.stop.exit_code(), exit_codes::OK);
    assert_eq!(outcome.sessions_run, 1);

    let paths = ProjectPaths::new(project.path());
    let state = load_run_state(&paths.run_state_path).expect("run state");
    assert_eq!(state.next_session, 2);
    assert!(!paths.lock_path.exists());
}

/// Verifies session numbers continue from the previous run.
#[test]
fn numbering_resumes_from_run_state() {
    let project = TempProject::new().expect("project");
    project.write_tasks(&[task("login", false)]).expect("tasks");
    let paths = ProjectPaths::new(project.path());
    fs::create_dir_all(&paths.state_dir).expect("state dir");
    write_run_state(
        &paths.run_state_path,
        &RunState {
            next_session: 5,
            ..RunState::default()
        },
    )
    .expect("write run state");
    let engine = ScriptedEngine::new(Vec::new());

    run_project(&project, &engine, &quiet(Some(1)), &CancelToken::new()).expect("run");

    assert!(paths.session_log_path(5).exists());
    assert!(paths.session_meta_path(5).exists());
    assert!(engine.openings()[0].starts_with("This is session 5."));
    let state = load_run_state(&paths.run_state_path).expect("run state");
    assert_eq!(state.next_session, 6);
}

/// Verifies a project without a task list starts with the initializer.
#[test]
fn first_session_initializes_from_the_spec() {
    let project = TempProject::new().expect("project");
    let spec_dir = tempfile::tempdir().expect("spec dir");
    let spec = spec_dir.path().join("todo_spec.txt");
    fs::write(&spec, "Build a todo list app with due dates.\n").expect("spec");
    let engine = ScriptedEngine::new(vec![ScriptedTurn::respond(tool_response(&[
        write_tasks_call(&[task("add todo", true)]),
    ]))]);
    let options = RunOptions {
        spec: Some(spec),
        ..quiet(Some(3))
    };

    let outcome = run_project(&project, &engine, &options, &CancelToken::new()).expect("run");

    assert_eq!(outcome.stop, StopReason::Completed);
    assert_eq!(
        project.read("app_spec.txt").expect("copied spec"),
        "Build a todo list app with due dates.\n"
    );
    assert!(engine.openings()[0].contains("Build a todo list app with due dates."));
    let record = read_json(&ProjectPaths::new(project.path()).session_meta_path(1));
    assert_eq!(record["kind"], "initializer");
}

/// Verifies a live lock from another supervisor aborts before any session.
#[test]
fn held_lock_fails_fast() {
    let project = TempProject::new().expect("project");
    let paths = ProjectPaths::new(project.path());
    let holder = LockMetadata {
        pid: 4242,
        host: "build-box".to_string(),
        created_at: chrono::Utc::now(),
    };
    fs::write(
        &paths.lock_path,
        serde_json::to_string(&holder).expect("serialize"),
    )
    .expect("write lock");
    let engine = ScriptedEngine::new(Vec::new());

    let err = run_project(&project, &engine, &quiet(None), &CancelToken::new())
        .expect_err("lock conflict");

    match err.downcast_ref::<LockError>() {
        Some(LockError::Conflict { holder, .. }) => assert!(holder.contains("pid 4242")),
        other => panic!("expected lock conflict, got {other:?}"),
    }
    assert_eq!(engine.calls(), 0);
    assert!(paths.lock_path.exists(), "foreign lock left in place");
}

/// Verifies a lock left behind by a dead supervisor on this host does not
/// block the next run.
#[cfg(unix)]
#[test]
fn lock_from_a_forced_exit_is_taken_over() {
    let project = TempProject::new().expect("project");
    project
        .write_tasks(&[task("login", false)])
        .expect("tasks");
    let paths = ProjectPaths::new(project.path());
    let leftover = LockMetadata {
        pid: 999_999_999,
        ..LockMetadata::current()
    };
    fs::write(
        &paths.lock_path,
        serde_json::to_string(&leftover).expect("serialize"),
    )
    .expect("write lock");
    let done = [task("login", true)];
    let engine = ScriptedEngine::new(vec![ScriptedTurn::respond(tool_response(&[
        write_tasks_call(&done),
    ]))]);

    let outcome = run_project(&project, &engine, &quiet(Some(2)), &CancelToken::new())
        .expect("run");

    assert_eq!(outcome.stop, StopReason::Completed);
    assert!(!paths.lock_path.exists());
}
