//! Element types and the in-memory buffer of a field
//!
//! Every realized field is an [`ndarray::ArrayD`] of complex numbers whose axes follow the
//! physical layout chosen for the field. Real fields keep a zero imaginary part, the
//! [`DType`] only tells how many bytes an element takes when stored.

use std::fmt::{self, Display};
use std::str::FromStr;

use ndarray::ArrayD;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

pub type Buffer = ArrayD<Complex64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    Complex128,
    Float64,
}

impl DType {
    /// Bytes per element
    pub fn itemsize(&self) -> usize {
        match self {
            DType::Complex128 => 16,
            DType::Float64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::Complex128 => "complex128",
            DType::Float64 => "float64",
        }
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, DType::Complex128)
    }

    /// Brings a value into the domain of this type
    pub fn cast(&self, value: Complex64) -> Complex64 {
        match self {
            DType::Complex128 => value,
            DType::Float64 => Complex64::new(value.re, 0.0),
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complex128" | "complex" | "c16" => Ok(DType::Complex128),
            "float64" | "float" | "f8" | "double" => Ok(DType::Float64),
            other => Err(format!("unknown dtype {other:?}")),
        }
    }
}
