//! Lab configuration with builder pattern

use std::path::PathBuf;
use std::time::Duration;

/// Prefix shared by every compose project, network and container of the lab
pub const DEFAULT_NETWORK_PREFIX: &str = "cyber-lab-";

/// Worker count used for parallel class operations
pub const DEFAULT_WORKERS: usize = 5;

#[derive(Debug, Clone)]
pub struct LabConfig {
    pub compose_file: PathBuf,
    pub runtime_binary: String,
    pub use_sudo: bool,
    pub network_prefix: String,
    pub workers: usize,
    pub command_timeout: Duration,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            compose_file: PathBuf::from("docker-compose.yml"),
            runtime_binary: "docker".to_string(),
            use_sudo: true,
            network_prefix: DEFAULT_NETWORK_PREFIX.to_string(),
            workers: DEFAULT_WORKERS,
            command_timeout: Duration::from_secs(300),
        }
    }
}

impl LabConfig {
    pub fn builder() -> LabConfigBuilder {
        LabConfigBuilder::default()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.runtime_binary.trim().is_empty() {
            return Err(crate::Error::Config("runtime binary cannot be empty".into()));
        }
        if self.network_prefix.is_empty() {
            return Err(crate::Error::Config("network prefix cannot be empty".into()));
        }
        if self.workers < 1 {
            return Err(crate::Error::Config("workers must be at least 1".into()));
        }
        if self.command_timeout.is_zero() {
            return Err(crate::Error::Config("command timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Compose project name for a student. Also used as the network name.
    pub fn project_name(&self, student_id: &str) -> String {
        format!("{}{}", self.network_prefix, student_id)
    }
}

#[derive(Default)]
pub struct LabConfigBuilder {
    config: LabConfig,
}

impl LabConfigBuilder {
    pub fn compose_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.compose_file = path.into();
        self
    }

    pub fn runtime_binary(mut self, binary: impl Into<String>) -> Self {
        self.config.runtime_binary = binary.into();
        self
    }

    pub fn use_sudo(mut self, enabled: bool) -> Self {
        self.config.use_sudo = enabled;
        self
    }

    pub fn network_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.network_prefix = prefix.into();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    pub fn build(self) -> LabConfig {
        self.config
    }

    pub fn build_validated(self) -> crate::Result<LabConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}
