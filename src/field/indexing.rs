use indexmap::IndexMap;
use num_complex::Complex64;

use crate::axes::index_axis;
use crate::buffer::Buffer;
use crate::coordinates::{Filters, Selection};
use crate::errors::{FieldError, LatticeError};
use crate::graph::{Delayed, IndexOrder, Op};
use crate::tunable::same_multiset;

use super::Field;

/// Value written by [`Field::set`]
#[derive(Debug, Clone)]
pub enum SetValue {
    Scalar(Complex64),
    /// Array in the canonical order of the selection
    Array(Buffer),
    /// Field with the same indexes as the selection
    Field(Field),
}

impl From<f64> for SetValue {
    fn from(value: f64) -> Self {
        SetValue::Scalar(Complex64::new(value, 0.0))
    }
}

impl From<Complex64> for SetValue {
    fn from(value: Complex64) -> Self {
        SetValue::Scalar(value)
    }
}

impl From<Buffer> for SetValue {
    fn from(value: Buffer) -> Self {
        SetValue::Array(value)
    }
}

impl From<Field> for SetValue {
    fn from(value: Field) -> Self {
        SetValue::Field(value)
    }
}

impl From<&Field> for SetValue {
    fn from(value: &Field) -> Self {
        SetValue::Field(value.clone())
    }
}

type Picks = Vec<(String, Vec<usize>)>;

impl Field {
    /// Indexes named by the keys
    ///
    /// A key can be an index, an axis, or any lattice key expanding to axes of the field.
    pub fn get_indexes<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<String>, FieldError> {
        let mut indexes: Vec<String> = Vec::new();
        for key in keys {
            let key = key.as_ref();
            let found: Vec<String> = if self.indexes.iter().any(|index| index == key) {
                vec![key.to_string()]
            } else {
                let axes = self.lattice.expand([key]).map_err(|error| match error {
                    LatticeError::UnknownKey(key) => FieldError::UnknownKey(key),
                    other => other.into(),
                })?;
                self.indexes
                    .iter()
                    .filter(|index| axes.iter().any(|axis| axis == index_axis(index)))
                    .cloned()
                    .collect()
            };
            if found.is_empty() {
                return Err(FieldError::UnknownKey(key.to_string()));
            }
            for index in found {
                if !indexes.contains(&index) {
                    indexes.push(index);
                }
            }
        }
        Ok(indexes)
    }

    /// Size of the indexes named by `key`, which must all have the same size
    pub fn get_size(&self, key: &str) -> Result<usize, FieldError> {
        let mut sizes: Vec<usize> = self
            .get_indexes(&[key])?
            .iter()
            .filter_map(|index| self.indexes.iter().position(|i| i == index))
            .map(|position| self.shape[position])
            .collect();
        sizes.dedup();
        match sizes.as_slice() {
            [size] => Ok(*size),
            _ => Err(FieldError::InvalidValue(format!(
                "{key:?} refers to indexes of different sizes {sizes:?}"
            ))),
        }
    }

    pub(super) fn extent(&self, index: &str) -> Result<usize, FieldError> {
        Ok(self.lattice.get_axis_size(index_axis(index))?)
    }

    /// Selections of the indexes restricted by `filters`
    ///
    /// Filters on the same index are united, and the result must lie within the current
    /// coordinates of the field.
    pub(crate) fn resolve_filters(
        &self,
        filters: &Filters,
    ) -> Result<IndexMap<String, Selection>, FieldError> {
        let mut selected: IndexMap<String, Selection> = IndexMap::new();
        let mut merge = |index: String, selection: Selection| {
            let merged = match selected.get(&index) {
                Some(current) => current.union(&selection),
                None => selection,
            };
            selected.insert(index, merged);
        };
        for (key, coord) in filters.keys() {
            for index in self.get_indexes(&[key])? {
                let axis = index_axis(&index);
                let selection = self.lattice.get_axis_range(axis)?.resolve(axis, coord)?;
                merge(index, selection);
            }
        }
        for name in filters.names() {
            let coords = self.lattice.deduce(name).map_err(|error| match error {
                LatticeError::UnknownKey(key) => FieldError::UnknownKey(key),
                other => other.into(),
            })?;
            for (axis, selection) in coords.iter() {
                for index in self.get_indexes(&[axis])? {
                    merge(index, selection.clone());
                }
            }
        }
        for (index, selection) in &selected {
            let extent = self.extent(index)?;
            let current = self.coords.selection(index);
            if !selection.is_subset(&current, extent) {
                return Err(FieldError::InvalidValue(format!(
                    "coordinates {selection:?} of {index:?} are outside the field coordinates {current:?}"
                )));
            }
        }
        Ok(selected)
    }

    /// Positions to keep along each restricted index, relative to the current coordinates
    fn picks(&self, selected: &IndexMap<String, Selection>) -> Result<Picks, FieldError> {
        let mut picks = Picks::new();
        for (index, selection) in selected {
            let extent = self.extent(index)?;
            let current = self.coords.selection(index).positions(extent);
            let wanted = selection.positions(extent);
            if wanted == current {
                continue;
            }
            let local = wanted
                .iter()
                .filter_map(|position| current.binary_search(position).ok())
                .collect();
            picks.push((index.clone(), local));
        }
        Ok(picks)
    }

    /// Field restricted to the coordinates given by `filters`
    ///
    /// ```
    /// use latfield::coordinates::Filters;
    /// use latfield::lattice::Lattice;
    /// use latfield::session::Session;
    ///
    /// let session = Session::builder().lattice(Lattice::default()).build();
    /// let field = session.field(&["spin", "color"]).build().unwrap();
    /// let sub = field.get(&Filters::new().with("spin", [0, 1])).unwrap();
    /// assert_eq!(sub.shape(), &[2, 3]);
    /// ```
    pub fn get(&self, filters: &Filters) -> Result<Field, FieldError> {
        let selected = self.resolve_filters(filters)?;
        let picks = self.picks(&selected)?;
        if picks.is_empty() {
            return Ok(self.clone());
        }
        let mut coords = self.coords.clone();
        for (index, selection) in selected {
            let extent = self.extent(&index)?;
            coords.insert(index, selection.normalized(extent));
        }
        let value = self.value.as_ref().map(|value| {
            Delayed::new(
                Op::Select {
                    order: self.order.clone(),
                    picks: picks.clone(),
                },
                vec![value.clone()],
            )
        });
        self.derive(
            self.axes.clone(),
            coords.finalized(),
            self.order.clone(),
            value,
        )
    }

    /// Field with `value` written at the coordinates given by `filters`
    pub fn set(&self, value: impl Into<SetValue>, filters: &Filters) -> Result<Field, FieldError> {
        let selected = self.resolve_filters(filters)?;
        let picks = self.picks(&selected)?;
        let shape: Vec<usize> = self
            .indexes
            .iter()
            .zip(&self.shape)
            .map(|(index, size)| {
                picks
                    .iter()
                    .find(|(name, _)| name == index)
                    .map_or(*size, |(_, positions)| positions.len())
            })
            .collect();
        let (node, order) = match value.into() {
            SetValue::Scalar(value) => {
                let fill = Op::Fill {
                    shape: self.indexes.iter().cloned().zip(shape).collect(),
                    order: IndexOrder::fixed(&self.indexes)?,
                    value,
                };
                (Delayed::new(fill, Vec::new()), IndexOrder::fixed(&self.indexes)?)
            }
            SetValue::Array(buffer) => {
                if buffer.shape() != shape.as_slice() {
                    return Err(FieldError::InvalidValue(format!(
                        "cannot assign an array of shape {:?} to a view of shape {shape:?}",
                        buffer.shape()
                    )));
                }
                (Delayed::source(buffer), IndexOrder::fixed(&self.indexes)?)
            }
            SetValue::Field(field) => {
                self.check_lattice(&field)?;
                if !same_multiset(&field.indexes, &self.indexes) {
                    return Err(FieldError::InvalidValue(format!(
                        "cannot assign a field with indexes {:?} to one with indexes {:?}",
                        field.indexes, self.indexes
                    )));
                }
                let found: Vec<usize> = self
                    .indexes
                    .iter()
                    .filter_map(|index| field.indexes.iter().position(|i| i == index))
                    .map(|position| field.shape[position])
                    .collect();
                if found != shape {
                    return Err(FieldError::InvalidValue(format!(
                        "cannot assign a field of shape {found:?} to a view of shape {shape:?}"
                    )));
                }
                (field.node(), field.order.clone())
            }
        };
        let assign = Op::Assign {
            target: self.order.clone(),
            value: order,
            picks,
        };
        Ok(self.with_value(Delayed::new(assign, vec![self.node(), node])))
    }
}

#[cfg(test)]
mod indexing_test {
    use super::*;
    use crate::lattice::{Lattice, LatticeValue};
    use crate::session::Session;
    use ndarray::{ArrayD, IxDyn};
    use std::sync::Arc;

    fn session() -> Arc<Session> {
        let mut lattice = Lattice::default();
        lattice.set("space", LatticeValue::Size(2)).unwrap();
        lattice.set("time", LatticeValue::Size(4)).unwrap();
        Session::builder().lattice(lattice).build()
    }

    fn c(re: f64) -> Complex64 {
        Complex64::new(re, 0.0)
    }

    #[test]
    fn indexes_and_sizes() {
        let field = session().field(&["dims", "color", "color"]).build().unwrap();
        assert_eq!(field.get_indexes(&["color"]).unwrap(), vec!["color_0", "color_1"]);
        assert_eq!(field.get_indexes(&["space"]).unwrap(), vec!["x", "y", "z"]);
        assert_eq!(field.get_indexes(&["color_1", "t"]).unwrap(), vec!["color_1", "t"]);
        assert_eq!(field.get_size("color").unwrap(), 3);
        assert_eq!(field.get_size("t").unwrap(), 4);
        assert!(matches!(field.get_size("dims"), Err(FieldError::InvalidValue(_))));
        assert!(matches!(field.get_size("spin"), Err(FieldError::UnknownKey(_))));
        assert!(matches!(field.get_size("flavor"), Err(FieldError::UnknownKey(_))));
    }

    #[test]
    fn restrictions() {
        let field = session().field(&["dims", "color", "color"]).build().unwrap();
        let sub = field
            .get(&Filters::new().with("color_0", 0).with("color_0", 2).with("space", 1))
            .unwrap();
        assert_eq!(sub.shape(), &[4, 1, 1, 1, 2, 3]);
        assert_eq!(
            sub.coords().get("color_0"),
            Some(&Selection::Positions(vec![0, 2]))
        );
        let point = sub.get(&Filters::new().with("color_0", 2)).unwrap();
        assert_eq!(point.get_size("color_0").unwrap(), 1);
        assert!(matches!(
            sub.get(&Filters::new().with("color_0", 1)),
            Err(FieldError::InvalidValue(_))
        ));
        assert!(matches!(
            field.get(&Filters::new().with("flavor", 0)),
            Err(FieldError::UnknownKey(_))
        ));
    }

    #[test]
    fn get_values() {
        let values: Vec<Complex64> = (0..12).map(|v| c(v as f64)).collect();
        let buffer = ArrayD::from_shape_vec(IxDyn(&[4, 3]), values).unwrap();
        let field = session()
            .field(&["spin", "color"])
            .source(buffer)
            .build()
            .unwrap();
        let sub = field.get(&Filters::new().with("spin", 2).with("color", [0, 2])).unwrap();
        let result = sub.compute().unwrap();
        assert_eq!(result.shape(), &[1, 2]);
        assert_eq!(result.iter().copied().collect::<Vec<_>>(), vec![c(6.), c(8.)]);
    }

    #[test]
    fn set_values() {
        let field = session().field(&["spin", "color"]).build().unwrap();
        let filters = Filters::new().with("spin", 1);
        let set = field.set(2.0, &filters).unwrap();
        let result = set.compute().unwrap();
        assert_eq!(result[[1, 0]], c(2.));
        assert_eq!(result[[0, 0]], c(0.));

        let row = ArrayD::from_elem(IxDyn(&[1, 3]), c(5.));
        let result = set.set(row, &Filters::new().with("spin", 3)).unwrap().compute().unwrap();
        assert_eq!(result[[3, 2]], c(5.));
        assert_eq!(result[[1, 2]], c(2.));

        let wrong = ArrayD::from_elem(IxDyn(&[3]), c(5.));
        assert!(matches!(
            field.set(wrong, &filters),
            Err(FieldError::InvalidValue(_))
        ));
    }

    #[test]
    fn set_from_field() {
        let session = session();
        let field = session.field(&["spin", "color"]).build().unwrap();
        let ones = field.get(&Filters::new().with("spin", 0)).unwrap().ones();
        let result = field
            .set(&ones, &Filters::new().with("spin", 0))
            .unwrap()
            .compute()
            .unwrap();
        assert_eq!(result.iter().filter(|v| **v == c(1.)).count(), 3);
        assert!(matches!(
            field.set(&ones, &Filters::new().with("spin", [0, 1])),
            Err(FieldError::InvalidValue(_))
        ));
    }
}
