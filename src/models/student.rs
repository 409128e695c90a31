//! Student record model

use std::collections::BTreeMap;
use std::fmt;

/// Lowest SSH port handed out to a student
pub const PORT_FLOOR: u32 = 2222;
/// Smallest usable subnet id (third octet of the student network)
pub const SUBNET_MIN: u8 = 1;
/// Largest usable subnet id
pub const SUBNET_MAX: u8 = 254;

/// An assignment slot: either a concrete value or nothing yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot<T> {
    Assigned(T),
    Unassigned,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot::Unassigned
    }
}

impl<T: Copy> Slot<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            Slot::Assigned(v) => Some(*v),
            Slot::Unassigned => None,
        }
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self, Slot::Assigned(_))
    }
}

impl<T> From<Option<T>> for Slot<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Slot::Assigned(v),
            None => Slot::Unassigned,
        }
    }
}

/// Unassigned renders as the empty string, which is also its CSV form.
impl<T: fmt::Display> fmt::Display for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Assigned(v) => write!(f, "{}", v),
            Slot::Unassigned => Ok(()),
        }
    }
}

impl Slot<u32> {
    /// Parse a roster `port` cell. Blank, non-numeric and non-positive
    /// values are unassigned.
    pub fn parse_port(raw: &str) -> Self {
        match raw.trim().parse::<u32>() {
            Ok(port) if port > 0 => Slot::Assigned(port),
            _ => Slot::Unassigned,
        }
    }

    /// A port the reconciler may keep: assigned and at or above the floor.
    pub fn valid_port(&self) -> Option<u32> {
        self.value().filter(|p| *p >= PORT_FLOOR)
    }
}

impl Slot<u8> {
    /// Parse a roster `subnet_id` cell. Anything outside 1..=254 is unassigned.
    pub fn parse_subnet(raw: &str) -> Self {
        match raw.trim().parse::<u32>() {
            Ok(id) if (SUBNET_MIN as u32..=SUBNET_MAX as u32).contains(&id) => {
                Slot::Assigned(id as u8)
            }
            _ => Slot::Unassigned,
        }
    }

    /// A subnet the reconciler may keep: assigned and within 1..=254.
    pub fn valid_subnet(&self) -> Option<u8> {
        self.value().filter(|s| (SUBNET_MIN..=SUBNET_MAX).contains(s))
    }
}

/// One roster row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentRecord {
    /// Unique key (uniqueness is not enforced on disk)
    pub student_id: String,
    /// Display name
    pub student_name: String,
    /// Host SSH port of the jump box
    pub port: Slot<u32>,
    /// Third octet of the student's 172.20.X.0/24 network
    pub subnet_id: Slot<u8>,
    /// Values of any other roster columns, keyed by header
    pub extra: BTreeMap<String, String>,
}

impl StudentRecord {
    pub fn new(student_id: impl Into<String>, student_name: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            student_name: student_name.into(),
            port: Slot::Unassigned,
            subnet_id: Slot::Unassigned,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_port(mut self, port: u32) -> Self {
        self.port = Slot::Assigned(port);
        self
    }

    pub fn with_subnet(mut self, subnet_id: u8) -> Self {
        self.subnet_id = Slot::Assigned(subnet_id);
        self
    }

    pub fn with_extra(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(column.into(), value.into());
        self
    }

    /// Both slots hold values the orchestrator can use.
    pub fn is_resolved(&self) -> bool {
        self.port.valid_port().is_some() && self.subnet_id.valid_subnet().is_some()
    }
}
