//! End-to-end tests against a real docker daemon
//! Run with: cargo test --test e2e -- --ignored
//! Needs docker with compose and LAB_E2E_COMPOSE_FILE pointing at a lab compose file.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use cyber_lab::models::EnvironmentState;
use cyber_lab::{DockerCli, ExecutionMode, LabConfig, LabManager, Roster};
use tempfile::TempDir;

fn compose_file() -> PathBuf {
    std::env::var("LAB_E2E_COMPOSE_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("docker-compose.yml"))
}

fn lab() -> LabManager<DockerCli> {
    let config = LabConfig::builder()
        .compose_file(compose_file())
        .use_sudo(std::env::var("LAB_E2E_SUDO").is_ok())
        .network_prefix("cyber-lab-e2e-")
        .command_timeout(Duration::from_secs(600))
        .build_validated()
        .unwrap();
    LabManager::new(DockerCli::new(config.clone()), config)
}

#[tokio::test]
#[ignore] // Run manually: cargo test --test e2e -- --ignored
async fn test_student_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("students.csv");
    fs::write(&path, "student_id,student_name\ne2e001,Smoke Test\n").unwrap();

    let lab = lab();
    let record = lab.student_add("e2e001", &path).await.unwrap();
    println!("Started e2e001 on port {} subnet {}", record.port, record.subnet_id);

    let status = lab.student_status("e2e001").await.unwrap();
    assert_eq!(status.state, EnvironmentState::Running);
    assert_eq!(status.subnet, record.subnet_id.value());

    lab.student_remove("e2e001").await.unwrap();
    let status = lab.student_status("e2e001").await.unwrap();
    assert_eq!(status.state, EnvironmentState::Absent);
}

#[tokio::test]
#[ignore]
async fn test_class_reconcile() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("students.csv");
    fs::write(&path, "student_id,student_name\ne2ea,A\ne2eb,B\n").unwrap();

    let lab = lab();
    let report = lab.class_up(&path, ExecutionMode::default()).await.unwrap();
    assert!(report.is_success(), "{}", report);

    // Drop e2ea, add e2ec.
    let mut roster = Roster::load(&path);
    let kept: Vec<_> = roster
        .records()
        .iter()
        .filter(|r| r.student_id != "e2ea")
        .cloned()
        .collect();
    roster = Roster::new(kept);
    roster.merge(&[cyber_lab::models::StudentRecord::new("e2ec", "C")]);
    fs::remove_file(&path).unwrap();
    roster.save(&path).unwrap();

    let report = lab
        .class_reconcile(&path, ExecutionMode::Sequential)
        .await
        .unwrap();
    assert_eq!(report.to_remove, vec!["e2ea"]);
    assert_eq!(report.to_add, vec!["e2ec"]);
    assert!(report.is_success());

    let down = lab.class_down(&path, ExecutionMode::default()).await.unwrap();
    assert!(down.is_success(), "{}", down);
}
