use num_complex::Complex64;

use crate::buffer::DType;
use crate::errors::FieldError;
use crate::graph::{BinaryOp, Delayed, IndexOrder, Op, UnaryOp};
use crate::tunable::same_multiset;
use crate::types::Capability;

use super::Field;

#[allow(clippy::should_implement_trait)]
impl Field {
    /// Binds the field to a generated value, cast to the dtype of the field
    fn generated(&self, op: Op<IndexOrder>) -> Field {
        let mut node = Delayed::new(op, Vec::new());
        if !self.dtype.is_complex() {
            node = Delayed::new(Op::Map(UnaryOp::Cast(self.dtype)), vec![node]);
        }
        self.with_value(node)
    }

    /// Same field with every value set to `value`
    pub fn fill(&self, value: impl Into<Complex64>) -> Field {
        self.generated(Op::Fill {
            shape: self.named_shape(),
            order: self.order.clone(),
            value: value.into(),
        })
    }

    pub fn zeros(&self) -> Field {
        self.fill(0.0)
    }

    pub fn ones(&self) -> Field {
        self.fill(1.0)
    }

    /// Uniform values in `[0, 1)`, for both parts of complex fields
    ///
    /// The values only depend on the seed and on the shape, not on the layout.
    pub fn random(&self, seed: u64) -> Field {
        self.generated(Op::Random {
            shape: self.named_shape(),
            order: self.order.clone(),
            seed,
        })
    }

    fn map(&self, op: UnaryOp) -> Field {
        self.with_value(Delayed::new(Op::Map(op), vec![self.node()]))
    }

    pub fn conj(&self) -> Field {
        self.map(UnaryOp::Conj)
    }

    pub fn neg(&self) -> Field {
        self.map(UnaryOp::Neg)
    }

    pub fn real(&self) -> Field {
        self.map(UnaryOp::Real).with_dtype(DType::Float64)
    }

    pub fn imag(&self) -> Field {
        self.map(UnaryOp::Imag).with_dtype(DType::Float64)
    }

    /// Multiplies every value by `factor`
    pub fn scale(&self, factor: impl Into<Complex64>) -> Field {
        let factor = factor.into();
        let field = self.map(UnaryOp::Scale(factor));
        if factor.im == 0.0 {
            field
        } else {
            field.with_dtype(DType::Complex128)
        }
    }

    fn zip(&self, other: &Field, op: BinaryOp) -> Result<Field, FieldError> {
        self.check_lattice(other)?;
        if !same_multiset(&self.indexes, &other.indexes) {
            return Err(FieldError::InvalidValue(format!(
                "cannot combine fields with indexes {:?} and {:?}",
                self.indexes, other.indexes
            )));
        }
        for index in &self.indexes {
            if self.coords.get(index) != other.coords.get(index) {
                return Err(FieldError::InvalidValue(format!(
                    "the fields have different coordinates along {index:?}"
                )));
            }
        }
        let value = Delayed::new(
            Op::Zip {
                left: self.order.clone(),
                right: other.order.clone(),
                op,
            },
            vec![self.node(), other.node()],
        );
        let dtype = match (self.dtype, other.dtype) {
            (DType::Float64, DType::Float64) => DType::Float64,
            _ => DType::Complex128,
        };
        Ok(self.with_value(value).with_dtype(dtype))
    }

    /// Element-wise sum of fields with the same indexes and coordinates
    pub fn add(&self, other: &Field) -> Result<Field, FieldError> {
        self.zip(other, BinaryOp::Add)
    }

    pub fn sub(&self, other: &Field) -> Result<Field, FieldError> {
        self.zip(other, BinaryOp::Sub)
    }

    pub fn mul(&self, other: &Field) -> Result<Field, FieldError> {
        self.zip(other, BinaryOp::Mul)
    }

    pub fn div(&self, other: &Field) -> Result<Field, FieldError> {
        self.zip(other, BinaryOp::Div)
    }

    fn reduce<S: AsRef<str>>(&self, keys: &[S], mean: bool) -> Result<Field, FieldError> {
        let remove = if keys.is_empty() {
            self.indexes.clone()
        } else {
            self.get_indexes(keys)?
        };
        let (axes, rename, coords) = self.without(&remove);
        let order = IndexOrder::tunable(&axes);
        let value = Delayed::new(
            Op::Reduce {
                from: self.order.clone(),
                to: order.clone(),
                remove,
                mean,
                rename,
            },
            vec![self.node()],
        );
        self.derive(axes, coords, order, Some(value))
    }

    /// Sums over the indexes named by `keys`, all of them when empty
    pub fn sum<S: AsRef<str>>(&self, keys: &[S]) -> Result<Field, FieldError> {
        self.reduce(keys, false)
    }

    /// Averages over the indexes named by `keys`, all of them when empty
    pub fn mean<S: AsRef<str>>(&self, keys: &[S]) -> Result<Field, FieldError> {
        self.reduce(keys, true)
    }

    /// Sum over the lattice sites
    pub fn volume_sum(&self) -> Result<Field, FieldError> {
        self.require(Capability::VolumeReduction, "volume_sum")?;
        self.reduce(&["dims"], false)
    }

    /// Average over the lattice sites
    pub fn volume_mean(&self) -> Result<Field, FieldError> {
        self.require(Capability::VolumeReduction, "volume_mean")?;
        self.reduce(&["dims"], true)
    }

    /// Shifts the values by `shift` positions along the indexes named by `keys`
    ///
    /// Values leaving one end come back on the other. Restricted indexes cannot be rolled.
    pub fn roll<S: AsRef<str>>(&self, shift: isize, keys: &[S]) -> Result<Field, FieldError> {
        let indexes = self.get_indexes(keys)?;
        if let Some(index) = indexes.iter().find(|index| self.coords.get(index).is_some()) {
            return Err(FieldError::InvalidValue(format!(
                "cannot roll the restricted index {index:?}"
            )));
        }
        if self.value.is_none() {
            return Ok(self.clone());
        }
        let shifts = indexes.into_iter().map(|index| (index, shift)).collect();
        Ok(self.with_value(Delayed::new(
            Op::Roll {
                order: self.order.clone(),
                shifts,
            },
            vec![self.node()],
        )))
    }
}
