use std::io;
use thiserror::Error;

use crate::value::FieldType;

pub type Result<T> = std::result::Result<T, RszError>;

#[derive(Error, Debug)]
pub enum RszError {
    #[error("Not a valid RSZ container (magic {0:#010x})")]
    InvalidMagic(u32),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Instance index {index} out of range (table has {len} entries)")]
    InvalidIndex { index: i32, len: usize },
    #[error("Reference cycle through instance of class {class}")]
    CycleDetected { class: String },
    #[error("Field {class}.{field} still holds an instance reference; flatten before writing")]
    NotFlattened { class: String, field: String },
    #[error("Field {class}.{field} expects a {expected:?} value")]
    ValueMismatch { class: String, field: String, expected: FieldType },
    #[error("Instance descriptors ({infos}) do not match the instance table ({instances}); rebuild descriptors before writing")]
    StaleDescriptors { infos: usize, instances: usize },
    #[error("Unknown class: {0}")]
    UnknownClass(String),
    #[error("Userdata link does not match this container's userdata shape")]
    UserdataShapeMismatch,
    #[error("Negative {section} offset {offset}")]
    InvalidOffset { section: &'static str, offset: i64 },
    #[error("Instance handle {0} does not belong to this container")]
    UnknownInstance(usize),
    #[error("Embedded container slot {0} is missing")]
    MissingEmbedded(usize),
}
