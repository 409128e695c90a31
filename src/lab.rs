//! Lab manager: roster-driven operations behind the CLI
//!
//! Every operation that reads a roster first runs the whole roster through
//! the assignment reconciler, so what reaches the runtime is conflict-free
//! and already persisted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::LabConfig;
use crate::models::{ContainerInfo, ContainerKind, StudentRecord};
use crate::orchestrator::{BatchReport, ExecutionMode, Orchestrator, ReconcileReport, StudentStatus};
use crate::reconciler::AssignmentService;
use crate::roster::Roster;
use crate::runtime::ContainerRuntime;
use crate::{Error, Result};

pub struct LabManager<R> {
    orchestrator: Orchestrator<R>,
    /// One service per roster path so concurrent calls share its lock
    services: Mutex<HashMap<PathBuf, Arc<AssignmentService>>>,
}

impl<R: ContainerRuntime> LabManager<R> {
    pub fn new(runtime: R, config: LabConfig) -> Self {
        Self {
            orchestrator: Orchestrator::new(runtime, config),
            services: Mutex::new(HashMap::new()),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator<R> {
        &self.orchestrator
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.orchestrator.interrupt_flag()
    }

    fn service(&self, path: &Path) -> Arc<AssignmentService> {
        self.services
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(AssignmentService::new(path)))
            .clone()
    }

    /// Reconcile assignments for the whole roster and return it as persisted.
    fn resolved_roster(&self, path: &Path) -> Result<Roster> {
        let roster = self.service(path).ensure_roster()?;
        if roster.is_empty() {
            return Err(Error::EmptyRoster(path.display().to_string()));
        }
        Ok(roster)
    }

    fn resolved_student(&self, student_id: &str, path: &Path) -> Result<StudentRecord> {
        self.resolved_roster(path)?
            .find(student_id)
            .cloned()
            .ok_or_else(|| Error::StudentNotFound(student_id.to_string()))
    }

    pub async fn build(&self) -> Result<()> {
        self.orchestrator.build().await
    }

    pub async fn class_up(&self, path: impl AsRef<Path>, mode: ExecutionMode) -> Result<BatchReport> {
        let roster = self.resolved_roster(path.as_ref())?;
        let records = unique_records(&roster);
        Ok(self.orchestrator.bring_up_all(&records, mode).await)
    }

    pub async fn class_down(&self, path: impl AsRef<Path>, mode: ExecutionMode) -> Result<BatchReport> {
        let roster = self.resolved_roster(path.as_ref())?;
        let ids: Vec<String> = unique_records(&roster)
            .into_iter()
            .map(|r| r.student_id)
            .collect();
        Ok(self.orchestrator.tear_down_all(&ids, mode).await)
    }

    pub async fn class_reconcile(
        &self,
        path: impl AsRef<Path>,
        mode: ExecutionMode,
    ) -> Result<ReconcileReport> {
        let roster = self.resolved_roster(path.as_ref())?;
        self.orchestrator.reconcile(&roster, mode).await
    }

    /// Start one student's environment; returns the record it was started with.
    pub async fn student_add(&self, student_id: &str, path: impl AsRef<Path>) -> Result<StudentRecord> {
        let record = self.resolved_student(student_id, path.as_ref())?;
        self.orchestrator.bring_up(&record).await?;
        Ok(record)
    }

    pub async fn student_remove(&self, student_id: &str) -> Result<()> {
        self.orchestrator.tear_down(student_id).await
    }

    pub async fn student_recreate(
        &self,
        student_id: &str,
        path: impl AsRef<Path>,
    ) -> Result<StudentRecord> {
        let record = self.resolved_student(student_id, path.as_ref())?;
        tracing::info!(student = %student_id, name = %record.student_name, "Recreating environment");
        self.orchestrator.recreate(&record).await?;
        Ok(record)
    }

    pub async fn student_status(&self, student_id: &str) -> Result<StudentStatus> {
        self.orchestrator.status(student_id).await
    }

    pub async fn list(&self) -> Result<BTreeMap<String, Vec<ContainerInfo>>> {
        self.orchestrator.list_all().await
    }

    pub async fn student_exec(&self, student_id: &str, kind: ContainerKind) -> Result<()> {
        let result = self.orchestrator.exec(student_id, kind).await;
        if matches!(&result, Err(e) if e.is_runtime_failure()) {
            // Point the operator at what does exist.
            if let Ok(status) = self.orchestrator.status(student_id).await {
                for container in &status.containers {
                    tracing::warn!(student = %student_id, container = %container.names, state = %container.state, "Available container");
                }
            }
        }
        result
    }
}

/// First record per student id, in roster order
fn unique_records(roster: &Roster) -> Vec<StudentRecord> {
    let mut seen = HashSet::new();
    roster
        .records()
        .iter()
        .filter(|r| seen.insert(r.student_id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockContainerRuntime;
    use tempfile::TempDir;

    fn write_roster(dir: &TempDir, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join("students.csv");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_unique_records_keeps_first() {
        let roster = Roster::new(vec![
            StudentRecord::new("a", "First"),
            StudentRecord::new("b", "B"),
            StudentRecord::new("a", "Second"),
        ]);
        let records = unique_records(&roster);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].student_name, "First");
    }

    #[test]
    fn test_service_is_shared_per_path() {
        let lab = LabManager::new(MockContainerRuntime::new(), LabConfig::default());
        let first = lab.service(Path::new("a.csv"));
        assert!(Arc::ptr_eq(&first, &lab.service(Path::new("a.csv"))));
        assert!(!Arc::ptr_eq(&first, &lab.service(Path::new("b.csv"))));
    }

    #[tokio::test]
    async fn test_empty_roster_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_roster(&dir, "student_id,student_name\n");
        let lab = LabManager::new(MockContainerRuntime::new(), LabConfig::default());

        let result = lab.class_up(&path, ExecutionMode::Sequential).await;
        assert!(matches!(result, Err(Error::EmptyRoster(_))));
    }

    #[tokio::test]
    async fn test_unknown_student() {
        let dir = TempDir::new().unwrap();
        let path = write_roster(&dir, "student_id,student_name\ns1,Alice\n");
        let lab = LabManager::new(MockContainerRuntime::new(), LabConfig::default());

        let result = lab.student_add("s9", &path).await;
        assert!(matches!(result, Err(Error::StudentNotFound(id)) if id == "s9"));
    }

    #[tokio::test]
    async fn test_student_add_persists_assignment() {
        let dir = TempDir::new().unwrap();
        let path = write_roster(&dir, "student_id,student_name\ns1,Alice\n");

        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_compose_up()
            .withf(|project, env| {
                project == "cyber-lab-s1" && env.get("SSH_PORT").map(String::as_str) == Some("2222")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let lab = LabManager::new(runtime, LabConfig::default());

        let record = lab.student_add("s1", &path).await.unwrap();
        assert_eq!(record.port.value(), Some(2222));

        let on_disk = Roster::load(&path);
        assert_eq!(on_disk.find("s1"), Some(&record));
    }
}
