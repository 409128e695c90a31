//! Live environment model: containers reported by the runtime

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Compose label carrying the project a container belongs to
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// State of a student's environment, inferred from the runtime on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentState {
    /// No containers, or only exited leftovers of a failed start
    Absent,
    /// Containers created but not yet running
    Starting,
    /// At least one container running
    Running,
    /// Containers being removed
    Stopping,
}

impl std::fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentState::Absent => write!(f, "Absent"),
            EnvironmentState::Starting => write!(f, "Starting"),
            EnvironmentState::Running => write!(f, "Running"),
            EnvironmentState::Stopping => write!(f, "Stopping"),
        }
    }
}

impl EnvironmentState {
    pub fn infer(containers: &[ContainerInfo]) -> Self {
        if any_in_state(containers, &["running"]) {
            EnvironmentState::Running
        } else if any_in_state(containers, &["created", "restarting"]) {
            EnvironmentState::Starting
        } else if any_in_state(containers, &["removing"]) {
            EnvironmentState::Stopping
        } else {
            EnvironmentState::Absent
        }
    }
}

fn any_in_state(containers: &[ContainerInfo], states: &[&str]) -> bool {
    containers
        .iter()
        .any(|c| states.iter().any(|s| c.state.eq_ignore_ascii_case(s)))
}

/// One line of `docker ps --format json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInfo {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(default)]
    pub names: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub ports: String,
    /// Comma separated `key=value` pairs
    #[serde(default)]
    pub labels: String,
}

impl ContainerInfo {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| k.trim() == key)
            .map(|(_, v)| v.trim())
    }

    /// Recover the owning student from the compose project label, falling
    /// back to the `<prefix><student_id>-<service>-<n>` container name.
    pub fn student_id(&self, prefix: &str) -> Option<String> {
        if let Some(id) = self
            .label(COMPOSE_PROJECT_LABEL)
            .and_then(|project| project.strip_prefix(prefix))
            .filter(|id| !id.is_empty())
        {
            return Some(id.to_string());
        }

        self.names.split(',').find_map(|name| {
            let rest = name.trim().trim_start_matches('/').strip_prefix(prefix)?;
            let id = rest.split('-').next().unwrap_or_default();
            (!id.is_empty()).then(|| id.to_string())
        })
    }
}

/// Containers of a student environment that can be entered with `exec`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Kali,
    Ubuntu1,
    Ubuntu2,
}

impl ContainerKind {
    /// Compose service name
    pub fn service(&self) -> &'static str {
        match self {
            ContainerKind::Kali => "kali-jump",
            ContainerKind::Ubuntu1 => "ubuntu-target1",
            ContainerKind::Ubuntu2 => "ubuntu-target2",
        }
    }

    /// Name compose gives the first replica of this service
    pub fn container_name(&self, project: &str) -> String {
        format!("{}-{}-1", project, self.service())
    }
}

impl FromStr for ContainerKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kali" => Ok(ContainerKind::Kali),
            "ubuntu1" => Ok(ContainerKind::Ubuntu1),
            "ubuntu2" => Ok(ContainerKind::Ubuntu2),
            other => Err(crate::Error::InvalidContainerKind(other.to_string())),
        }
    }
}
