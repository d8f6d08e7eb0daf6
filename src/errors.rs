//! This module contains all the specific error implementation for the crate
//!
//! Every layer raises its own error kind, and [`FieldError`] wraps all of them so that
//! field operations can be chained with `?` from another crate.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AxesError {
    #[error("Invalid axis token {0:?}: expected a label [a-zA-Z][a-zA-Z0-9_]* followed by optional '!' markers and an optional '+'")]
    InvalidAxisToken(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LatticeError {
    #[error("The lattice has been frozen and {0:?} cannot be changed. Use copy() to get an unfrozen lattice")]
    Frozen(String),
    #[error("Cyclic definition found while expanding {key:?}: {path}")]
    CyclicProperty { key: String, path: String },
    #[error("Unknown lattice key {0:?}")]
    UnknownKey(String),
    #[error("Invalid key {0:?}")]
    InvalidKey(String),
    #[error("{0:?} is already in use")]
    KeyInUse(String),
    #[error("{key} = {value} not allowed. The value must be a positive integer")]
    NonPositive { key: String, value: usize },
    #[error("{0:?} contains repeated values")]
    RepeatedLabels(String),
    #[error("Labels {0:?} are already in use")]
    LabelsInUse(Vec<String>),
    #[error("{0:?} is not a lattice axis")]
    NotAnAxis(String),
    #[error("Unknown theory {0:?}")]
    UnknownTheory(String),
    #[error("Invalid coordinate for {axis:?}: {reason}")]
    InvalidCoordinate { axis: String, reason: String },
    #[error("{0}")]
    InvalidValue(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldTypeError {
    #[error("A field type named {0:?} is already registered")]
    DuplicateTypeName(String),
    #[error("{name} axes {axes} are not compatible with the parent {parent} axes {parent_axes}")]
    IncompatibleAxes {
        name: String,
        parent: String,
        axes: String,
        parent_axes: String,
    },
    #[error("Unknown field type {0:?}")]
    UnknownType(String),
    #[error(transparent)]
    Axes(#[from] AxesError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TuneError {
    #[error("Value {value} is not compatible with option {option:?}")]
    IncompatibleValue { option: String, value: String },
    #[error("Option {0:?} has already been tuned to a different value")]
    AlreadyTuned(String),
    #[error("Options {0:?} still need to be tuned")]
    NotTuned(Vec<String>),
    #[error("Unknown option {0:?}")]
    UnknownOption(String),
    #[error("Option {0:?} is already defined")]
    DuplicateOption(String),
    #[error("Invalid resolver: {0}")]
    InvalidResolver(String),
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error("Unknown format {0:?}")]
    UnknownFormat(String),
    #[error("Cannot deduce the format of {0:?}")]
    CannotDeduce(PathBuf),
    #[error("Invalid file {path:?}: {reason}")]
    InvalidFile { path: PathBuf, reason: String },
    #[error("File content is not compatible with the field: {0}")]
    Incompatible(String),
    #[error("Chunk plan error: {0}")]
    InvalidChunks(String),
    #[error(transparent)]
    Header(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FieldError {
    #[error("Unknown axis {0:?}")]
    UnknownAxis(String),
    #[error("Unknown key {0:?}")]
    UnknownKey(String),
    #[error("Shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("{0}")]
    InvalidValue(String),
    #[error("{0}")]
    InvalidType(String),
    #[error("Field of type {field_type:?} does not support {capability}")]
    MissingCapability {
        field_type: Option<String>,
        capability: String,
    },
    #[error("No lattice given and the session has no default lattice")]
    NoLattice,
    #[error(transparent)]
    Axes(#[from] AxesError),
    #[error(transparent)]
    Lattice(#[from] LatticeError),
    #[error(transparent)]
    FieldType(#[from] FieldTypeError),
    #[error(transparent)]
    Tune(#[from] TuneError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoggingError {
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),
    #[error("Invalid log format: {0}")]
    InvalidLogFormat(String),
    #[error("Failed to install the subscriber: {0}")]
    Install(String),
}
