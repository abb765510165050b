//! Process dispatcher: child processes, exit mapping and the child path.

mod common;

use common::{DEAD_PID, ScriptedPerformer};
use serde_json::json;
use workq::engine::dispatch::{
    ChildExit, ChildProcess as _, CommandSpawner, Spawner, perform_job, process_exists,
};
use workq::engine::control::{Control, control_for_signal};
use workq::job::Job;
use workq::model::{FailureKind, JobPayload, JobStatus};
use workq::store::MemoryStore;

fn job(class: &str) -> Job {
    Job::new("emails", JobPayload::new(class, json!({"to": "someone"})))
}

#[tokio::test]
async fn command_spawner_maps_exit_status() {
    let ok = CommandSpawner::new("true", Vec::new());
    let exit = ok.spawn(&job("Deliver")).unwrap().wait().await.unwrap();
    assert!(exit.is_clean());

    let failed = CommandSpawner::new("false", Vec::new());
    let exit = failed.spawn(&job("Deliver")).unwrap().wait().await.unwrap();
    assert_eq!(exit, ChildExit::code(1));
    assert!(!exit.is_clean());

    let killed = CommandSpawner::new("sh", vec!["-c".to_string(), "kill -9 $$".to_string()]);
    let exit = killed.spawn(&job("Deliver")).unwrap().wait().await.unwrap();
    assert_eq!(exit.code, None);
    assert_eq!(exit.signal, Some(9));
}

#[tokio::test]
async fn child_receives_serialized_job() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("job.json");
    let spawner = CommandSpawner::new(
        "sh",
        vec![
            "-c".to_string(),
            format!("printf '%s' \"$WORKQ_JOB\" > {}", out.display()),
        ],
    );
    let job = job("Deliver");

    let exit = spawner.spawn(&job).unwrap().wait().await.unwrap();
    assert!(exit.is_clean());

    let written: Job = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(written, job);
}

#[tokio::test]
async fn spawning_a_missing_program_fails() {
    let spawner = CommandSpawner::new("/nonexistent/workq-child", Vec::new());
    assert!(spawner.spawn(&job("Deliver")).is_err());
}

#[tokio::test]
async fn perform_job_records_outcome() {
    let store = MemoryStore::new();
    let performer = ScriptedPerformer::default();

    let ok = job("Deliver");
    assert_eq!(
        perform_job(&store, &performer, &ok).await.unwrap(),
        JobStatus::Complete
    );
    assert_eq!(
        Job::status(&store, ok.id()).await.unwrap(),
        Some(JobStatus::Complete)
    );

    let boom = job("Boom");
    assert_eq!(
        perform_job(&store, &performer, &boom).await.unwrap(),
        JobStatus::Failed
    );
    let failure = Job::failure(&store, boom.id()).await.unwrap().unwrap();
    assert_eq!(failure.kind, FailureKind::JobExecution);
    assert!(failure.error.contains("boom"));
}

#[test]
fn process_exists_distinguishes_live_and_dead() {
    assert!(process_exists(std::process::id()));
    assert!(!process_exists(DEAD_PID));
    assert!(!process_exists(u32::MAX));
}

#[test]
fn signals_map_to_control_events() {
    use nix::sys::signal::Signal;

    assert_eq!(control_for_signal(Signal::SIGTERM), Some(Control::ShutdownNow));
    assert_eq!(control_for_signal(Signal::SIGINT), Some(Control::ShutdownNow));
    assert_eq!(control_for_signal(Signal::SIGQUIT), Some(Control::Shutdown));
    assert_eq!(control_for_signal(Signal::SIGUSR1), Some(Control::Pause));
    assert_eq!(control_for_signal(Signal::SIGCONT), Some(Control::Resume));
    assert_eq!(
        control_for_signal(Signal::SIGUSR2),
        Some(Control::WriteStatistics)
    );
    assert_eq!(control_for_signal(Signal::SIGHUP), None);
}
