#![cfg(unix)]

use std::time::Duration;

use flame_tunnel_core::prelude::ShutdownHandle;
use flame_tunnel_runner::prelude::{
    CommandSpec, ProcessSupervisor, Scenario, ScenarioError, ScenarioResult, ScenarioRunner,
};
use flame_tunnel_supervisor::{ManagedProcess, Role};
use pretty_assertions::assert_eq;

fn supervisor() -> ProcessSupervisor {
    ProcessSupervisor::new()
        .with_server_warmup(Duration::from_millis(100))
        .with_stop_grace(Duration::from_millis(500))
}

async fn ready_server(supervisor: &ProcessSupervisor) -> ManagedProcess {
    let server = supervisor
        .start(Role::Server, "sleep", &["30"])
        .await
        .unwrap();
    supervisor.await_ready(&server).await.unwrap()
}

fn shutdown_after(handle: &ShutdownHandle, delay: Duration) {
    let signaller = handle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        signaller.shutdown();
    });
}

fn kinds(results: &[ScenarioResult]) -> Vec<Option<&'static str>> {
    results
        .iter()
        .map(|r| r.outcome.as_ref().err().map(ScenarioError::kind))
        .collect()
}

fn roles(supervisor: &ProcessSupervisor) -> Vec<Role> {
    supervisor.registered().iter().map(|p| p.role()).collect()
}

#[tokio::test]
async fn shutdown_mid_profile_interrupts_the_rest_of_the_run() {
    let run_dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor();
    let server = ready_server(&supervisor).await;
    let load_generator = CommandSpec::new("sleep", &["30"]);
    let profiler = CommandSpec::new("sleep", &["30"]);
    let shutdown = ShutdownHandle::new();
    let mut runner = ScenarioRunner::new(
        &supervisor,
        &server,
        &load_generator,
        &profiler,
        run_dir.path(),
        shutdown.new_listener(),
    );
    shutdown_after(&shutdown, Duration::from_millis(300));

    let results = tokio::time::timeout(
        Duration::from_secs(10),
        runner.run_all(&[Scenario::new("light", 5), Scenario::new("burst", 5)]),
    )
    .await
    .unwrap();

    assert_eq!(kinds(&results), vec![Some("Interrupted"), Some("Interrupted")]);
    assert!(results[0].profiler_window.is_some());
    assert!(results[1].profiler_window.is_none());
    // The load generator and profiler of the interrupted scenario are gone, nothing else started.
    assert_eq!(roles(&supervisor), vec![Role::Server]);

    supervisor.cleanup_all().await;
}

#[tokio::test]
async fn shutdown_during_pre_load_delay_never_starts_the_profiler() {
    let run_dir = tempfile::tempdir().unwrap();
    let marker = run_dir.path().join("profiler_started");
    let supervisor = supervisor();
    let server = ready_server(&supervisor).await;
    let load_generator = CommandSpec::new("sleep", &["30"]);
    let profiler = CommandSpec::new(
        "sh",
        &["-c", r#"touch "$1""#, "profiler", marker.to_str().unwrap()],
    );
    let shutdown = ShutdownHandle::new();
    let mut runner = ScenarioRunner::new(
        &supervisor,
        &server,
        &load_generator,
        &profiler,
        run_dir.path(),
        shutdown.new_listener(),
    );
    shutdown_after(&shutdown, Duration::from_millis(200));

    let results = tokio::time::timeout(
        Duration::from_secs(10),
        runner.run_all(&[Scenario::new("light", 1).with_pre_load_delay_s(30)]),
    )
    .await
    .unwrap();

    assert_eq!(kinds(&results), vec![Some("Interrupted")]);
    assert!(results[0].profiler_window.is_none());
    assert!(!marker.exists());
    assert_eq!(roles(&supervisor), vec![Role::Server]);

    supervisor.cleanup_all().await;
}
