//! cyber-lab CLI - per-student lab environments from a roster CSV

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::{Parser, Subcommand};
use cyber_lab::config::DEFAULT_WORKERS;
use cyber_lab::models::{ContainerInfo, ContainerKind};
use cyber_lab::orchestrator::{BatchReport, ReconcileReport};
use cyber_lab::{DockerCli, ExecutionMode, LabConfig, LabManager, Result};
use tabled::{Table, Tabled};

#[derive(Parser)]
#[command(name = "cyber-lab")]
#[command(about = "Cybersecurity lab environment manager")]
#[command(version)]
struct Cli {
    /// Path to the docker compose file
    #[arg(long, global = true, env = "LAB_COMPOSE_FILE", default_value = "docker-compose.yml")]
    compose_file: PathBuf,

    /// Run class operations one student at a time
    #[arg(long, global = true)]
    sequential: bool,

    /// Don't prefix runtime commands with sudo (when running as root)
    #[arg(long, global = true, env = "LAB_NO_SUDO")]
    no_sudo: bool,

    /// Concurrent students for parallel class operations
    #[arg(long, global = true, env = "LAB_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Per-command timeout in seconds
    #[arg(long, global = true, env = "LAB_COMMAND_TIMEOUT", default_value_t = 300)]
    timeout: u64,

    /// Container runtime binary
    #[arg(long, global = true, env = "LAB_RUNTIME", default_value = "docker")]
    runtime: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the lab images
    Build,
    /// Manage the entire class
    Class {
        #[command(subcommand)]
        action: ClassAction,
    },
    /// Manage a single student
    Student {
        #[command(subcommand)]
        action: StudentAction,
    },
    /// List all lab containers grouped by student
    List,
}

#[derive(Subcommand)]
enum ClassAction {
    /// Start environments for every student in the roster
    Up {
        /// Roster CSV
        csv: PathBuf,
    },
    /// Remove environments for every student in the roster
    Down {
        /// Roster CSV
        csv: PathBuf,
    },
    /// Add missing and remove extra environments to match the roster
    Reconcile {
        /// Roster CSV
        csv: PathBuf,
    },
}

#[derive(Subcommand)]
enum StudentAction {
    /// Start one student's environment
    Add {
        student_id: String,
        /// Roster CSV
        csv: PathBuf,
    },
    /// Remove one student's environment
    Remove { student_id: String },
    /// Tear down and start one student's environment again
    Recreate {
        student_id: String,
        /// Roster CSV
        csv: PathBuf,
    },
    /// Show a student's containers
    Status { student_id: String },
    /// Open a shell in one of a student's containers
    Exec {
        student_id: String,
        /// kali, ubuntu1 or ubuntu2
        #[arg(short, long, default_value = "kali")]
        container: ContainerKind,
    },
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "Student")]
    student: String,
    #[tabled(rename = "Container")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Ports")]
    ports: String,
}

impl ContainerRow {
    fn new(student: &str, container: &ContainerInfo) -> Self {
        Self {
            student: student.to_string(),
            name: container.names.clone(),
            state: container.state.clone(),
            ports: if container.ports.is_empty() {
                "None".to_string()
            } else {
                container.ports.clone()
            },
        }
    }
}

#[derive(Tabled)]
struct FailureRow {
    #[tabled(rename = "Student")]
    student: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cyber_lab=info")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = LabConfig::builder()
        .compose_file(&cli.compose_file)
        .runtime_binary(&cli.runtime)
        .use_sudo(!cli.no_sudo)
        .workers(cli.workers)
        .command_timeout(Duration::from_secs(cli.timeout))
        .build_validated()?;

    let lab = LabManager::new(DockerCli::new(config.clone()), config);
    let mode = if cli.sequential {
        ExecutionMode::Sequential
    } else {
        lab.orchestrator().parallel()
    };

    let interrupted = lab.interrupt_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, skipping students not yet started");
            interrupted.store(true, Ordering::SeqCst);
        }
    });

    match cli.command {
        Commands::Build => {
            println!("Building lab images...");
            lab.build().await?;
            println!("Images built.");
            Ok(true)
        }
        Commands::Class { action } => {
            let ok = handle_class(&lab, action, mode).await?;
            if lab.orchestrator().is_interrupted() {
                println!("Interrupted: remaining students were skipped.");
            }
            Ok(ok)
        }
        Commands::Student { action } => handle_student(&lab, action).await,
        Commands::List => {
            let grouped = lab.list().await?;
            if grouped.is_empty() {
                println!("No lab containers found.");
                return Ok(true);
            }

            let rows: Vec<ContainerRow> = grouped
                .iter()
                .flat_map(|(student, containers)| {
                    containers.iter().map(move |c| ContainerRow::new(student, c))
                })
                .collect();
            println!("{}", Table::new(rows));
            Ok(true)
        }
    }
}

async fn handle_class(
    lab: &LabManager<DockerCli>,
    action: ClassAction,
    mode: ExecutionMode,
) -> Result<bool> {
    match action {
        ClassAction::Up { csv } => {
            println!("Starting class from {}...", csv.display());
            let report = lab.class_up(&csv, mode).await?;
            print_batch("Started", &report);
            Ok(report.is_success())
        }
        ClassAction::Down { csv } => {
            println!("Removing class from {}...", csv.display());
            let report = lab.class_down(&csv, mode).await?;
            print_batch("Removed", &report);
            Ok(report.is_success())
        }
        ClassAction::Reconcile { csv } => {
            let report = lab.class_reconcile(&csv, mode).await?;
            print_reconcile(&report);
            Ok(report.is_success())
        }
    }
}

async fn handle_student(lab: &LabManager<DockerCli>, action: StudentAction) -> Result<bool> {
    match action {
        StudentAction::Add { student_id, csv } => {
            let record = lab.student_add(&student_id, &csv).await?;
            println!(
                "Started {} ({}): SSH port {}, subnet 172.20.{}.0/24",
                record.student_id, record.student_name, record.port, record.subnet_id
            );
        }
        StudentAction::Remove { student_id } => {
            lab.student_remove(&student_id).await?;
            println!("Removed environment for {}", student_id);
        }
        StudentAction::Recreate { student_id, csv } => {
            let record = lab.student_recreate(&student_id, &csv).await?;
            println!(
                "Recreated {} ({}): SSH port {}",
                record.student_id, record.student_name, record.port
            );
        }
        StudentAction::Status { student_id } => {
            let status = lab.student_status(&student_id).await?;
            println!("Student {}: {}", student_id, status.state);
            if let Some(subnet) = status.subnet {
                println!("Subnet: 172.20.{}.0/24", subnet);
            }
            if status.containers.is_empty() {
                println!("No containers found.");
            } else {
                let rows: Vec<ContainerRow> = status
                    .containers
                    .iter()
                    .map(|c| ContainerRow::new(&student_id, c))
                    .collect();
                println!("{}", Table::new(rows));
            }
        }
        StudentAction::Exec {
            student_id,
            container,
        } => {
            lab.student_exec(&student_id, container).await?;
        }
    }
    Ok(true)
}

fn print_batch(verb: &str, report: &BatchReport) {
    println!(
        "{} {}/{} students",
        verb,
        report.succeeded.len(),
        report.total()
    );
    if !report.failed.is_empty() {
        let rows: Vec<FailureRow> = report
            .failed
            .iter()
            .map(|(student, reason)| FailureRow {
                student: student.clone(),
                reason: reason.clone(),
            })
            .collect();
        println!("{}", Table::new(rows));
    }
}

fn print_reconcile(report: &ReconcileReport) {
    println!("To add: {}", report.to_add.len());
    println!("To remove: {}", report.to_remove.len());

    if report.is_noop() {
        println!("Environment already matches the roster.");
        return;
    }
    if !report.to_remove.is_empty() {
        print_batch("Removed", &report.removals);
    }
    if !report.to_add.is_empty() {
        print_batch("Added", &report.additions);
    }
    if report.is_success() {
        println!("Reconciliation completed.");
    } else {
        println!("Reconciliation completed with errors.");
    }
}
