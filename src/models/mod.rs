//! Data models

mod environment;
mod student;

pub use environment::*;
pub use student::*;
