//! Cyber Lab Manager
//!
//! Provisions per-student container environments for a security training
//! lab. Each student gets a jump host and target containers in a compose
//! project of their own, reachable on a unique SSH port and isolated on a
//! `172.20.X.0/24` subnet of their own.
//!
//! The roster CSV is the source of truth. Before anything reaches the
//! container runtime, the assignment reconciler makes every port and subnet
//! in the roster unique and persists the result.
//!
//! # Example
//!
//! ```no_run
//! use cyber_lab::{DockerCli, ExecutionMode, LabConfig, LabManager};
//!
//! # async fn run() -> cyber_lab::Result<()> {
//! let config = LabConfig::builder()
//!     .compose_file("docker-compose.yml")
//!     .use_sudo(false)
//!     .build_validated()?;
//!
//! let lab = LabManager::new(DockerCli::new(config.clone()), config);
//! let report = lab.class_up("students.csv", ExecutionMode::default()).await?;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod config;
pub mod error;
pub mod lab;
pub mod models;
pub mod orchestrator;
pub mod reconciler;
pub mod roster;
pub mod runtime;

pub use config::LabConfig;
pub use error::{Error, Result};
pub use lab::LabManager;
pub use orchestrator::{BatchReport, ExecutionMode, Orchestrator, ReconcileReport};
pub use reconciler::{ensure_assignments, resolve_assignments, AssignmentService};
pub use roster::Roster;
pub use runtime::{ContainerRuntime, DockerCli};
