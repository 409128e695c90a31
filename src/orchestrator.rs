//! Environment orchestrator: drives per-student compose projects
//!
//! Every student gets one compose project named `<prefix><student_id>`, which
//! also names its network. The orchestrator only reads resolved assignments;
//! it never writes the roster.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};

use crate::config::{LabConfig, DEFAULT_WORKERS};
use crate::models::{ContainerInfo, ContainerKind, EnvironmentState, StudentRecord};
use crate::roster::Roster;
use crate::runtime::{subnet_id_from_cidr, ComposeEnv, ContainerRuntime};
use crate::{Error, Result};

/// How a batch of per-student operations is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    Parallel { workers: usize },
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Parallel {
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Outcome of a batch, one entry per student
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    /// `(student_id, reason)`
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    fn record(&mut self, student_id: String, outcome: std::result::Result<(), String>) {
        match outcome {
            Ok(()) => self.succeeded.push(student_id),
            Err(reason) => self.failed.push((student_id, reason)),
        }
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} succeeded", self.succeeded.len(), self.total())?;
        for (student_id, reason) in &self.failed {
            write!(f, "\n  {}: {}", student_id, reason)?;
        }
        Ok(())
    }
}

/// Outcome of reconciling the roster against the live runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub to_add: Vec<String>,
    pub to_remove: Vec<String>,
    pub removals: BatchReport,
    pub additions: BatchReport,
}

impl ReconcileReport {
    pub fn is_success(&self) -> bool {
        self.removals.is_success() && self.additions.is_success()
    }

    /// Nothing had to be added or removed
    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Live view of one student's environment
#[derive(Debug, Clone)]
pub struct StudentStatus {
    pub student_id: String,
    pub state: EnvironmentState,
    pub containers: Vec<ContainerInfo>,
    /// Subnet id read back from the student's network, if it exists
    pub subnet: Option<u8>,
}

/// Applies resolved assignments to a container runtime
pub struct Orchestrator<R> {
    runtime: R,
    config: LabConfig,
    interrupted: Arc<AtomicBool>,
}

impl<R: ContainerRuntime> Orchestrator<R> {
    pub fn new(runtime: R, config: LabConfig) -> Self {
        Self {
            runtime,
            config,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Shared flag; once set, batches skip every student not yet started.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Default scheduling for this configuration
    pub fn parallel(&self) -> ExecutionMode {
        ExecutionMode::Parallel {
            workers: self.config.workers,
        }
    }

    /// Variables the compose file interpolates for one student.
    pub fn student_env(&self, record: &StudentRecord) -> Result<ComposeEnv> {
        let (port, subnet) = match (record.port.valid_port(), record.subnet_id.valid_subnet()) {
            (Some(port), Some(subnet)) => (port, subnet),
            _ => return Err(Error::Unresolved(record.student_id.clone())),
        };

        let mut env = self.teardown_env(&record.student_id);
        env.insert("STUDENT_NAME".to_string(), record.student_name.clone());
        env.insert("SSH_PORT".to_string(), port.to_string());
        env.insert("SUBNET_ID".to_string(), subnet.to_string());
        Ok(env)
    }

    fn teardown_env(&self, student_id: &str) -> ComposeEnv {
        ComposeEnv::from([
            ("STUDENT_ID".to_string(), student_id.to_string()),
            (
                "NETWORK_NAME".to_string(),
                self.config.project_name(student_id),
            ),
        ])
    }

    pub async fn build(&self) -> Result<()> {
        tracing::info!(compose_file = %self.config.compose_file.display(), "Building images");
        self.runtime.build().await
    }

    /// Start one student's environment. Failures are logged and returned,
    /// never retried.
    pub async fn bring_up(&self, record: &StudentRecord) -> Result<()> {
        let env = self.student_env(record)?;
        let project = self.config.project_name(&record.student_id);

        tracing::info!(
            student = %record.student_id,
            port = %record.port,
            subnet = %record.subnet_id,
            "Starting environment"
        );
        match self.runtime.compose_up(&project, &env).await {
            Ok(()) => {
                tracing::info!(student = %record.student_id, "Environment started");
                Ok(())
            }
            Err(e) => {
                tracing::error!(student = %record.student_id, error = %e, "Failed to start environment");
                Err(e)
            }
        }
    }

    /// Stop and remove one student's environment. Needs only the id.
    pub async fn tear_down(&self, student_id: &str) -> Result<()> {
        let env = self.teardown_env(student_id);
        let project = self.config.project_name(student_id);

        tracing::info!(student = %student_id, "Removing environment");
        match self.runtime.compose_down(&project, &env).await {
            Ok(()) => {
                tracing::info!(student = %student_id, "Environment removed");
                Ok(())
            }
            Err(e) => {
                tracing::error!(student = %student_id, error = %e, "Failed to remove environment");
                Err(e)
            }
        }
    }

    /// Tear down (ignoring failure), then bring up.
    pub async fn recreate(&self, record: &StudentRecord) -> Result<()> {
        if let Err(e) = self.tear_down(&record.student_id).await {
            tracing::warn!(student = %record.student_id, error = %e, "Teardown before recreate failed, continuing");
        }
        self.bring_up(record).await
    }

    /// Lab containers grouped by owning student
    pub async fn list_all(&self) -> Result<BTreeMap<String, Vec<ContainerInfo>>> {
        let prefix = &self.config.network_prefix;
        let mut grouped: BTreeMap<String, Vec<ContainerInfo>> = BTreeMap::new();

        for container in self.runtime.list_containers(prefix).await? {
            match container.student_id(prefix) {
                Some(student_id) => grouped.entry(student_id).or_default().push(container),
                None => tracing::debug!(names = %container.names, "Ignoring non-lab container"),
            }
        }
        Ok(grouped)
    }

    /// Students with any container resources, running or not
    pub async fn list_running(&self) -> Result<BTreeSet<String>> {
        Ok(self.list_all().await?.into_keys().collect())
    }

    pub async fn status(&self, student_id: &str) -> Result<StudentStatus> {
        let project = self.config.project_name(student_id);
        let filter = format!("{}-", project);
        let prefix = &self.config.network_prefix;

        // The name filter is a substring match; keep only this student's.
        let containers: Vec<ContainerInfo> = self
            .runtime
            .list_containers(&filter)
            .await?
            .into_iter()
            .filter(|c| c.student_id(prefix).as_deref() == Some(student_id))
            .collect();

        let subnet = if containers.is_empty() {
            None
        } else {
            match self.runtime.inspect_network(&project).await {
                Ok(cidr) => cidr.as_deref().and_then(subnet_id_from_cidr),
                Err(e) => {
                    tracing::debug!(student = %student_id, error = %e, "Network not inspectable");
                    None
                }
            }
        };

        Ok(StudentStatus {
            student_id: student_id.to_string(),
            state: EnvironmentState::infer(&containers),
            containers,
            subnet,
        })
    }

    /// Attach to a shell in one of the student's containers.
    pub async fn exec(&self, student_id: &str, kind: ContainerKind) -> Result<()> {
        let container = kind.container_name(&self.config.project_name(student_id));
        tracing::info!(student = %student_id, container = %container, "Executing into container");
        self.runtime.exec_interactive(&container, "/bin/bash").await
    }

    pub async fn bring_up_all(&self, records: &[StudentRecord], mode: ExecutionMode) -> BatchReport {
        tracing::info!(students = records.len(), mode = ?mode, "Starting environments");
        let units = records
            .iter()
            .map(|r| (r.student_id.clone(), self.bring_up(r)))
            .collect();
        self.run_batch(units, mode).await
    }

    pub async fn tear_down_all(&self, student_ids: &[String], mode: ExecutionMode) -> BatchReport {
        tracing::info!(students = student_ids.len(), mode = ?mode, "Removing environments");
        let units = student_ids
            .iter()
            .map(|id| (id.clone(), self.tear_down(id)))
            .collect();
        self.run_batch(units, mode).await
    }

    /// Remove environments whose student left the roster, then start those
    /// not running. Roster students with only exited or dead containers are
    /// started again; running ones are untouched.
    pub async fn reconcile(&self, roster: &Roster, mode: ExecutionMode) -> Result<ReconcileReport> {
        let present = self.list_all().await?;
        let expected = roster.ids();

        let to_remove: Vec<String> = present
            .keys()
            .filter(|id| !expected.contains(*id))
            .cloned()
            .collect();
        let to_add: Vec<String> = expected
            .iter()
            .filter(|id| {
                present.get(*id).map(|c| EnvironmentState::infer(c))
                    != Some(EnvironmentState::Running)
            })
            .cloned()
            .collect();

        tracing::info!(
            expected = expected.len(),
            present = present.len(),
            to_add = to_add.len(),
            to_remove = to_remove.len(),
            "Reconciling lab environment"
        );

        let removals = self.tear_down_all(&to_remove, mode).await;

        let records: Vec<StudentRecord> = to_add
            .iter()
            .filter_map(|id| roster.find(id).cloned())
            .collect();
        let additions = self.bring_up_all(&records, mode).await;

        Ok(ReconcileReport {
            to_add,
            to_remove,
            removals,
            additions,
        })
    }

    async fn run_batch<F>(&self, units: Vec<(String, F)>, mode: ExecutionMode) -> BatchReport
    where
        F: Future<Output = Result<()>>,
    {
        let interrupted = &self.interrupted;
        let guarded = units.into_iter().map(|(student_id, unit)| async move {
            if interrupted.load(Ordering::SeqCst) {
                tracing::warn!(student = %student_id, "Skipped after interrupt");
                return (student_id, Err("interrupted".to_string()));
            }
            let outcome = unit.await.map_err(|e| e.to_string());
            (student_id, outcome)
        });

        let outcomes: Vec<(String, std::result::Result<(), String>)> = match mode {
            ExecutionMode::Sequential => {
                let mut outcomes = Vec::new();
                for unit in guarded {
                    outcomes.push(unit.await);
                }
                outcomes
            }
            ExecutionMode::Parallel { workers } => {
                stream::iter(guarded)
                    .buffer_unordered(workers.max(1))
                    .collect()
                    .await
            }
        };

        let mut report = BatchReport::default();
        for (student_id, outcome) in outcomes {
            report.record(student_id, outcome);
        }
        report.succeeded.sort();
        report.failed.sort();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockContainerRuntime;

    fn container(name: &str, state: &str) -> ContainerInfo {
        ContainerInfo {
            names: name.to_string(),
            state: state.to_string(),
            ..Default::default()
        }
    }

    fn orchestrator(runtime: MockContainerRuntime) -> Orchestrator<MockContainerRuntime> {
        Orchestrator::new(runtime, LabConfig::default())
    }

    fn runtime_error() -> Error {
        Error::RuntimeCommand {
            command: "docker compose up".to_string(),
            code: Some(1),
            stdout: String::new(),
            stderr: "boom".to_string(),
        }
    }

    #[test]
    fn test_student_env() {
        let orch = orchestrator(MockContainerRuntime::new());
        let record = StudentRecord::new("student001", "Alice").with_port(2222).with_subnet(42);

        let env = orch.student_env(&record).unwrap();
        assert_eq!(env["STUDENT_ID"], "student001");
        assert_eq!(env["STUDENT_NAME"], "Alice");
        assert_eq!(env["SSH_PORT"], "2222");
        assert_eq!(env["SUBNET_ID"], "42");
        assert_eq!(env["NETWORK_NAME"], "cyber-lab-student001");
    }

    #[tokio::test]
    async fn test_bring_up_refuses_unresolved() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_compose_up().never();
        let orch = orchestrator(runtime);

        let record = StudentRecord::new("student001", "Alice").with_port(2222);
        let result = orch.bring_up(&record).await;
        assert!(matches!(result, Err(Error::Unresolved(id)) if id == "student001"));
    }

    #[tokio::test]
    async fn test_tear_down_needs_only_id() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_compose_down()
            .withf(|project, env| {
                project == "cyber-lab-ghost"
                    && env.len() == 2
                    && env.get("NETWORK_NAME").map(String::as_str) == Some("cyber-lab-ghost")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let orch = orchestrator(runtime);

        orch.tear_down("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_adds_and_removes() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_containers().returning(|_| {
            Ok(vec![
                container("cyber-lab-a-kali-jump-1", "running"),
                container("cyber-lab-b-kali-jump-1", "running"),
                container("cyber-lab-b-ubuntu-target1-1", "running"),
                container("cyber-lab-c-kali-jump-1", "running"),
                container("cyber-lab-c-ubuntu-target1-1", "exited"),
            ])
        });
        runtime
            .expect_compose_down()
            .withf(|project, _| project == "cyber-lab-a")
            .times(1)
            .returning(|_, _| Ok(()));
        runtime
            .expect_compose_up()
            .withf(|project, _| project == "cyber-lab-d")
            .times(1)
            .returning(|_, _| Ok(()));
        let orch = orchestrator(runtime);

        let roster = Roster::new(vec![
            StudentRecord::new("b", "B").with_port(2222).with_subnet(1),
            StudentRecord::new("c", "C").with_port(2223).with_subnet(2),
            StudentRecord::new("d", "D").with_port(2224).with_subnet(3),
        ]);

        let report = orch.reconcile(&roster, ExecutionMode::Sequential).await.unwrap();
        assert_eq!(report.to_remove, vec!["a"]);
        assert_eq!(report.to_add, vec!["d"]);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_reconcile_restarts_exited_environment() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_containers().returning(|_| {
            Ok(vec![
                container("cyber-lab-s1-kali-jump-1", "exited"),
                container("cyber-lab-gone-kali-jump-1", "dead"),
            ])
        });
        runtime
            .expect_compose_down()
            .withf(|project, _| project == "cyber-lab-gone")
            .times(1)
            .returning(|_, _| Ok(()));
        runtime
            .expect_compose_up()
            .withf(|project, _| project == "cyber-lab-s1")
            .times(1)
            .returning(|_, _| Ok(()));
        let orch = orchestrator(runtime);

        let roster = Roster::new(vec![StudentRecord::new("s1", "Sam").with_port(2222).with_subnet(5)]);

        let report = orch.reconcile(&roster, ExecutionMode::Sequential).await.unwrap();
        assert_eq!(report.to_add, vec!["s1"]);
        assert_eq!(report.to_remove, vec!["gone"]);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_compose_up()
            .times(3)
            .returning(|project, _| {
                if project == "cyber-lab-s2" {
                    Err(runtime_error())
                } else {
                    Ok(())
                }
            });
        let orch = orchestrator(runtime);

        let records: Vec<StudentRecord> = (1..=3u8)
            .map(|i| {
                StudentRecord::new(format!("s{}", i), "x")
                    .with_port(2221 + i as u32)
                    .with_subnet(i)
            })
            .collect();

        let report = orch
            .bring_up_all(&records, ExecutionMode::Parallel { workers: 2 })
            .await;
        assert_eq!(report.succeeded, vec!["s1", "s3"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "s2");
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_interrupt_skips_remaining() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_compose_down().never();
        let orch = orchestrator(runtime);
        orch.interrupt_flag().store(true, Ordering::SeqCst);

        let ids = vec!["s1".to_string(), "s2".to_string()];
        let report = orch.tear_down_all(&ids, ExecutionMode::Sequential).await;
        assert!(report.succeeded.is_empty());
        assert_eq!(report.failed[0], ("s1".to_string(), "interrupted".to_string()));
        assert_eq!(report.failed.len(), 2);
    }

    #[tokio::test]
    async fn test_recreate_ignores_teardown_failure() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_compose_down()
            .times(1)
            .returning(|_, _| Err(runtime_error()));
        runtime.expect_compose_up().times(1).returning(|_, _| Ok(()));
        let orch = orchestrator(runtime);

        let record = StudentRecord::new("s1", "S").with_port(2222).with_subnet(9);
        orch.recreate(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_filters_other_students() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_containers()
            .withf(|filter| filter == "cyber-lab-s-")
            .returning(|_| {
                Ok(vec![
                    ContainerInfo {
                        labels: "com.docker.compose.project=cyber-lab-s".to_string(),
                        ..container("cyber-lab-s-kali-jump-1", "running")
                    },
                    ContainerInfo {
                        labels: "com.docker.compose.project=cyber-lab-s-42".to_string(),
                        ..container("cyber-lab-s-42-kali-jump-1", "running")
                    },
                ])
            });
        runtime
            .expect_inspect_network()
            .withf(|name| name == "cyber-lab-s")
            .returning(|_| Ok(Some("172.20.17.0/24".to_string())));
        let orch = orchestrator(runtime);

        let status = orch.status("s").await.unwrap();
        assert_eq!(status.containers.len(), 1);
        assert_eq!(status.state, EnvironmentState::Running);
        assert_eq!(status.subnet, Some(17));
    }

    #[tokio::test]
    async fn test_status_absent() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_containers().returning(|_| Ok(vec![]));
        runtime.expect_inspect_network().never();
        let orch = orchestrator(runtime);

        let status = orch.status("nobody").await.unwrap();
        assert_eq!(status.state, EnvironmentState::Absent);
        assert_eq!(status.subnet, None);
    }

    #[tokio::test]
    async fn test_exec_targets_compose_container() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_exec_interactive()
            .withf(|container, shell| {
                container == "cyber-lab-s1-ubuntu-target2-1" && shell == "/bin/bash"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let orch = orchestrator(runtime);

        orch.exec("s1", ContainerKind::Ubuntu2).await.unwrap();
    }
}
