//! Roster store: the CSV file listing every student and their assignment
//!
//! The file is always read whole and rewritten whole. Writes go through a
//! temporary file in the same directory that is renamed over the target.
//! Nothing here serializes concurrent writers; see [`crate::reconciler`].

use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::models::{Slot, StudentRecord};
use crate::{Error, Result};

pub const COL_STUDENT_ID: &str = "student_id";
pub const COL_STUDENT_NAME: &str = "student_name";
pub const COL_PORT: &str = "port";
pub const COL_SUBNET_ID: &str = "subnet_id";

/// Header written when the target file has none
pub const DEFAULT_COLUMNS: [&str; 4] = [COL_STUDENT_ID, COL_STUDENT_NAME, COL_PORT, COL_SUBNET_ID];

fn is_core_column(name: &str) -> bool {
    DEFAULT_COLUMNS.contains(&name)
}

/// Ordered list of students plus the header they were read with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    columns: Vec<String>,
    records: Vec<StudentRecord>,
}

impl Roster {
    pub fn new(records: Vec<StudentRecord>) -> Self {
        Self {
            columns: Vec::new(),
            records,
        }
    }

    /// Load a roster, degrading to an empty one when the file is missing or
    /// unparsable. Failures are logged, never returned.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::try_load(path) {
            Ok(roster) => {
                tracing::debug!(path = %path.display(), students = roster.len(), "Roster loaded");
                roster
            }
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Roster file not found");
                Self::default()
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to read roster");
                Self::default()
            }
        }
    }

    /// Load a roster, returning I/O and CSV errors to the caller.
    pub fn try_load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(file);

        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let position = |name: &str| columns.iter().position(|c| c == name);
        let (id_col, name_col, port_col, subnet_col) = (
            position(COL_STUDENT_ID),
            position(COL_STUDENT_NAME),
            position(COL_PORT),
            position(COL_SUBNET_ID),
        );

        let mut records = Vec::new();
        for (line, row) in reader.records().enumerate() {
            let row = row?;
            let cell = |idx: Option<usize>| idx.and_then(|i| row.get(i)).unwrap_or("");

            // Extra columns are kept verbatim; only the core cells are trimmed.
            let student_id = cell(id_col).trim();
            if student_id.is_empty() {
                tracing::warn!(row = line + 1, "Skipping roster row without student_id");
                continue;
            }

            let mut record = StudentRecord::new(student_id, cell(name_col).trim());
            record.port = Slot::parse_port(cell(port_col));
            record.subnet_id = Slot::parse_subnet(cell(subnet_col));
            for (i, column) in columns.iter().enumerate() {
                if !is_core_column(column) {
                    record
                        .extra
                        .insert(column.clone(), row.get(i).unwrap_or("").to_string());
                }
            }
            records.push(record);
        }

        Ok(Self { columns, records })
    }

    /// Rewrite the whole file. Column order follows the header already on
    /// disk, then this roster's header, then the default one.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let columns = self.output_columns(path);

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        if let Ok(meta) = fs::metadata(path) {
            tmp.as_file().set_permissions(meta.permissions())?;
        }

        {
            let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
            writer.write_record(&columns)?;
            for record in &self.records {
                writer.write_record(columns.iter().map(|c| cell_value(record, c)))?;
            }
            writer.flush()?;
        }

        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        tracing::info!(path = %path.display(), students = self.records.len(), "Roster saved");
        Ok(())
    }

    fn output_columns(&self, path: &Path) -> Vec<String> {
        let existing = read_header(path).unwrap_or_default();
        let mut columns = if !existing.is_empty() {
            existing
        } else if !self.columns.is_empty() {
            self.columns.clone()
        } else {
            DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect()
        };

        for (i, required) in [COL_STUDENT_ID, COL_STUDENT_NAME].iter().enumerate() {
            if !columns.iter().any(|c| c == required) {
                columns.insert(i, required.to_string());
            }
        }
        for required in [COL_PORT, COL_SUBNET_ID] {
            if !columns.iter().any(|c| c == required) {
                columns.push(required.to_string());
            }
        }
        for record in &self.records {
            for key in record.extra.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn records(&self) -> &[StudentRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<StudentRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// First record carrying this id
    pub fn find(&self, student_id: &str) -> Option<&StudentRecord> {
        self.records.iter().find(|r| r.student_id == student_id)
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.records.iter().map(|r| r.student_id.clone()).collect()
    }

    pub fn used_ports(&self) -> HashSet<u32> {
        self.records.iter().filter_map(|r| r.port.valid_port()).collect()
    }

    pub fn used_subnets(&self) -> HashSet<u8> {
        self.records
            .iter()
            .filter_map(|r| r.subnet_id.valid_subnet())
            .collect()
    }

    /// Fold updated records back in. Every row carrying a batch id takes the
    /// batch values; ids not yet present are appended in batch order.
    pub fn merge(&mut self, batch: &[StudentRecord]) {
        for update in batch {
            let mut matched = false;
            for record in self
                .records
                .iter_mut()
                .filter(|r| r.student_id == update.student_id)
            {
                record.student_name = update.student_name.clone();
                record.port = update.port;
                record.subnet_id = update.subnet_id;
                record
                    .extra
                    .extend(update.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
                matched = true;
            }
            if !matched {
                self.records.push(update.clone());
            }
        }
    }
}

fn read_header(path: &Path) -> Option<Vec<String>> {
    let file = File::open(path).ok()?;
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(file);
    let headers = reader.headers().ok()?;
    Some(
        headers
            .iter()
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

fn cell_value(record: &StudentRecord, column: &str) -> String {
    match column {
        COL_STUDENT_ID => record.student_id.clone(),
        COL_STUDENT_NAME => record.student_name.clone(),
        COL_PORT => record.port.to_string(),
        COL_SUBNET_ID => record.subnet_id.to_string(),
        other => record.extra.get(other).cloned().unwrap_or_default(),
    }
}
