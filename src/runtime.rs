//! Container runtime collaborator
//!
//! [`ContainerRuntime`] is the narrow contract the orchestrator needs from
//! the container engine. [`DockerCli`] fulfils it by shelling out to the
//! `docker` CLI (optionally through `sudo`), one process per call, each bounded
//! by the configured timeout.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::LabConfig;
use crate::models::ContainerInfo;
use crate::{Error, Result};

/// Variables handed to `docker compose`
pub type ComposeEnv = BTreeMap<String, String>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build every image of the compose file
    async fn build(&self) -> Result<()>;

    /// Start a compose project in the background
    async fn compose_up(&self, project: &str, env: &ComposeEnv) -> Result<()>;

    /// Stop and remove a compose project, including orphans
    async fn compose_down(&self, project: &str, env: &ComposeEnv) -> Result<()>;

    /// All containers, running or not, whose name matches the filter
    async fn list_containers(&self, name_filter: &str) -> Result<Vec<ContainerInfo>>;

    /// First IPAM subnet (CIDR) of a network, if it has one
    async fn inspect_network(&self, name: &str) -> Result<Option<String>>;

    /// Attach the terminal to a shell inside a container
    async fn exec_interactive(&self, container: &str, shell: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Capture,
    Inherit,
}

/// `docker` CLI implementation of [`ContainerRuntime`]
pub struct DockerCli {
    config: LabConfig,
}

impl DockerCli {
    pub fn new(config: LabConfig) -> Self {
        Self { config }
    }

    fn compose_args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            self.config.compose_file.to_string_lossy().into_owned(),
        ];
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }

    /// With sudo the variables are inlined as `sudo env K=V docker ...`
    /// because sudo drops the caller's environment.
    fn command(&self, args: &[String], env: &ComposeEnv) -> (Command, String) {
        let binary = &self.config.runtime_binary;
        let mut argv: Vec<String> = Vec::new();

        if self.config.use_sudo {
            argv.push("sudo".to_string());
            if !env.is_empty() {
                argv.push("env".to_string());
                argv.extend(env.iter().map(|(k, v)| format!("{}={}", k, v)));
            }
        }
        argv.push(binary.clone());
        argv.extend(args.iter().cloned());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if !self.config.use_sudo {
            cmd.envs(env);
        }
        (cmd, argv.join(" "))
    }

    async fn run(
        &self,
        args: &[String],
        env: &ComposeEnv,
        output: Output,
        limit: Option<Duration>,
    ) -> Result<String> {
        let (mut cmd, cmdline) = self.command(args, env);
        cmd.kill_on_drop(true).stdin(Stdio::null());
        if output == Output::Inherit {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }

        tracing::info!(command = %cmdline, "Running");
        let result = match limit {
            Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::error!(command = %cmdline, timeout = ?limit, "Command timed out");
                    return Err(Error::Timeout {
                        command: cmdline,
                        elapsed: limit,
                    });
                }
            },
            None => cmd.output().await?,
        };

        let stdout = String::from_utf8_lossy(&result.stdout).into_owned();
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).into_owned();
            tracing::error!(
                command = %cmdline,
                code = ?result.status.code(),
                stdout = %stdout.trim(),
                stderr = %stderr.trim(),
                "Command failed"
            );
            return Err(Error::RuntimeCommand {
                command: cmdline,
                code: result.status.code(),
                stdout,
                stderr,
            });
        }

        Ok(stdout)
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build(&self) -> Result<()> {
        let args = self.compose_args(&["build"]);
        self.run(&args, &ComposeEnv::new(), Output::Inherit, None).await?;
        Ok(())
    }

    async fn compose_up(&self, project: &str, env: &ComposeEnv) -> Result<()> {
        let args = self.compose_args(&["-p", project, "up", "-d"]);
        self.run(&args, env, Output::Capture, Some(self.config.command_timeout))
            .await?;
        Ok(())
    }

    async fn compose_down(&self, project: &str, env: &ComposeEnv) -> Result<()> {
        let args = self.compose_args(&["-p", project, "down", "--remove-orphans"]);
        self.run(&args, env, Output::Capture, Some(self.config.command_timeout))
            .await?;
        Ok(())
    }

    async fn list_containers(&self, name_filter: &str) -> Result<Vec<ContainerInfo>> {
        let args: Vec<String> = ["ps", "-a", "--format", "json", "--filter"]
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(format!("name={}", name_filter)))
            .collect();
        let stdout = self
            .run(&args, &ComposeEnv::new(), Output::Capture, Some(self.config.command_timeout))
            .await?;
        Ok(parse_ps_output(&stdout))
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<String>> {
        let args = vec!["network".to_string(), "inspect".to_string(), name.to_string()];
        let stdout = self
            .run(&args, &ComposeEnv::new(), Output::Capture, Some(self.config.command_timeout))
            .await?;
        parse_network_subnet(&stdout)
    }

    async fn exec_interactive(&self, container: &str, shell: &str) -> Result<()> {
        let args: Vec<String> = ["exec", "-it", container, shell]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (mut cmd, cmdline) = self.command(&args, &ComposeEnv::new());

        tracing::info!(command = %cmdline, "Attaching");
        let status = cmd.status().await?;
        if !status.success() {
            return Err(Error::RuntimeCommand {
                command: cmdline,
                code: status.code(),
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        Ok(())
    }
}

/// Parse `docker ps --format json`: one object per line, or a single array
/// on engines that emit one. Unparsable lines are skipped.
pub fn parse_ps_output(stdout: &str) -> Vec<ContainerInfo> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if trimmed.starts_with('[') {
        return match serde_json::from_str(trimmed) {
            Ok(containers) => containers,
            Err(e) => {
                tracing::warn!(error = %e, "Unparsable container listing");
                Vec::new()
            }
        };
    }

    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<ContainerInfo>(line) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(error = %e, line = %line, "Skipping unparsable container entry");
                None
            }
        })
        .collect()
}

/// Extract `IPAM.Config[0].Subnet` from `docker network inspect` output.
pub fn parse_network_subnet(stdout: &str) -> Result<Option<String>> {
    let value: serde_json::Value = serde_json::from_str(stdout)?;
    let network = if value.is_array() { &value[0] } else { &value };
    Ok(network["IPAM"]["Config"][0]["Subnet"]
        .as_str()
        .map(str::to_string))
}

/// Subnet id of a `172.20.X.0/24` student network.
pub fn subnet_id_from_cidr(cidr: &str) -> Option<u8> {
    let network = cidr.strip_prefix("172.20.")?.strip_suffix(".0/24")?;
    network.parse().ok()
}
