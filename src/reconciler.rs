//! Assignment reconciliation
//!
//! Resolves port and subnet conflicts for a batch of students against the
//! whole roster on disk, then writes the result back.
//!
//! # Invariants
//!
//! After a run, no two students in the roster share a port or a subnet, every
//! student holds a port >= 2222 and a subnet in 1..=254, and an assignment that
//! was already valid and uniquely owned is left untouched.
//!
//! [`ensure_assignments`] is a load-modify-write sequence on a plain file and
//! must not run concurrently for the same roster. [`AssignmentService`] wraps
//! it in a lock for callers within one process.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::allocator::{PortAllocator, SubnetAllocator};
use crate::models::{Slot, StudentRecord};
use crate::roster::Roster;
use crate::Result;

/// Which half of an assignment changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentKind {
    Port,
    Subnet,
}

impl fmt::Display for AssignmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignmentKind::Port => write!(f, "port"),
            AssignmentKind::Subnet => write!(f, "subnet"),
        }
    }
}

/// A value the reconciler replaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentChange {
    pub student_id: String,
    pub kind: AssignmentKind,
    /// Previous value, empty when there was none
    pub previous: String,
    pub assigned: u32,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// The batch with every slot resolved, in input order
    pub records: Vec<StudentRecord>,
    pub changes: Vec<AssignmentChange>,
    /// Whether the roster file was rewritten
    pub persisted: bool,
}

impl Resolution {
    pub fn changed(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Ownership of values already recorded on disk
struct Ledger<T> {
    used: HashSet<T>,
    owners: HashMap<T, String>,
    duplicates: HashSet<T>,
    claimed: HashSet<T>,
}

impl<T: Copy + Eq + std::hash::Hash> Ledger<T> {
    fn scan<'a>(entries: impl Iterator<Item = (T, &'a str)>) -> Self {
        let mut owners: HashMap<T, String> = HashMap::new();
        let mut duplicates = HashSet::new();

        for (value, student_id) in entries {
            match owners.get(&value) {
                Some(owner) if owner != student_id => {
                    duplicates.insert(value);
                }
                Some(_) => {}
                None => {
                    owners.insert(value, student_id.to_string());
                }
            }
        }
        for value in &duplicates {
            owners.remove(value);
        }

        Self {
            used: owners.keys().chain(duplicates.iter()).copied().collect(),
            owners,
            duplicates,
            claimed: HashSet::new(),
        }
    }

    /// A requested value survives only if nobody earlier in the batch took
    /// it, it is not shared on disk, and any on-disk owner is this student.
    fn can_keep(&self, value: T, student_id: &str) -> bool {
        !self.claimed.contains(&value)
            && !self.duplicates.contains(&value)
            && (!self.used.contains(&value)
                || self.owners.get(&value).map(String::as_str) == Some(student_id))
    }

    fn excluded(&self) -> HashSet<T> {
        self.used.union(&self.claimed).copied().collect()
    }

    fn claim(&mut self, value: T) {
        self.used.insert(value);
        self.claimed.insert(value);
    }
}

/// Resolve every slot of `batch` against a roster snapshot. Pure: touches
/// neither the file system nor the runtime.
pub fn resolve_assignments(batch: &[StudentRecord], roster: &Roster) -> Resolution {
    let records = roster.records();
    let mut ports = Ledger::scan(
        records
            .iter()
            .filter_map(|r| r.port.valid_port().map(|p| (p, r.student_id.as_str()))),
    );
    let mut subnets = Ledger::scan(
        records
            .iter()
            .filter_map(|r| r.subnet_id.valid_subnet().map(|s| (s, r.student_id.as_str()))),
    );

    let mut resolution = Resolution::default();
    for original in batch {
        let mut record = original.clone();
        let id = record.student_id.clone();

        let port = match record.port.valid_port() {
            Some(p) if ports.can_keep(p, &id) => p,
            _ => {
                let p = PortAllocator::allocate(&ports.excluded());
                tracing::info!(student = %id, previous = %record.port, port = p, "Assigned port");
                resolution.changes.push(AssignmentChange {
                    student_id: id.clone(),
                    kind: AssignmentKind::Port,
                    previous: record.port.to_string(),
                    assigned: p,
                });
                record.port = Slot::Assigned(p);
                p
            }
        };
        ports.claim(port);

        let subnet = match record.subnet_id.valid_subnet() {
            Some(s) if subnets.can_keep(s, &id) => s,
            _ => {
                let s = SubnetAllocator::allocate(&id, &subnets.excluded());
                tracing::info!(student = %id, previous = %record.subnet_id, subnet = s, "Assigned subnet");
                resolution.changes.push(AssignmentChange {
                    student_id: id.clone(),
                    kind: AssignmentKind::Subnet,
                    previous: record.subnet_id.to_string(),
                    assigned: s as u32,
                });
                record.subnet_id = Slot::Assigned(s);
                s
            }
        };
        subnets.claim(subnet);

        resolution.records.push(record);
    }

    resolution
}

/// Load the roster at `path`, resolve `batch` against it and persist the
/// merged result when anything changed.
///
/// Bad rows never cause an error; they are treated as unassigned and fixed.
/// Only the final write can fail. Not safe to call concurrently for the same
/// file.
pub fn ensure_assignments(batch: &[StudentRecord], path: impl AsRef<Path>) -> Result<Resolution> {
    let path = path.as_ref();
    let mut roster = Roster::load(path);

    let batch = dedup_batch(batch);
    let mut resolution = resolve_assignments(&batch, &roster);

    if resolution.changed() {
        roster.merge(&resolution.records);
        roster.save(path)?;
        resolution.persisted = true;
        tracing::info!(
            path = %path.display(),
            changes = resolution.changes.len(),
            "Roster assignments updated"
        );
    } else {
        tracing::debug!(path = %path.display(), "Assignments already consistent");
    }

    Ok(resolution)
}

fn dedup_batch(batch: &[StudentRecord]) -> Vec<StudentRecord> {
    let mut seen = HashSet::new();
    batch
        .iter()
        .filter(|r| {
            let first = seen.insert(r.student_id.clone());
            if !first {
                tracing::warn!(student = %r.student_id, "Duplicate student in batch, keeping first entry");
            }
            first
        })
        .cloned()
        .collect()
}

/// Serializes reconciliation runs against one roster file.
pub struct AssignmentService {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AssignmentService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve and persist `batch` while holding the service lock.
    pub fn ensure(&self, batch: &[StudentRecord]) -> Result<Resolution> {
        let _guard = self.lock.lock();
        ensure_assignments(batch, &self.path)
    }

    /// Run the whole roster through the reconciler and return it resolved.
    pub fn ensure_roster(&self) -> Result<Roster> {
        let _guard = self.lock.lock();
        let roster = Roster::load(&self.path);
        if roster.is_empty() {
            return Ok(roster);
        }
        ensure_assignments(roster.records(), &self.path)?;
        Ok(Roster::load(&self.path))
    }
}
