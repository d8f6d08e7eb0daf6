use crate::axes::{index_name, indexes_of};
use crate::errors::FieldError;
use crate::graph::{Delayed, IndexOrder, Op, Rename};
use crate::lattice::Lattice;
use crate::tunable::{same_multiset, OptionValue, Resolver, TunableOption};

use super::{layout, Field};

/// Permutation of the indexes of a repeated axis, given to [`Field::transpose`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisPermutation {
    /// A single position, which is not a permutation
    Single(usize),
    Sequence(Vec<usize>),
}

impl From<usize> for AxisPermutation {
    fn from(value: usize) -> Self {
        AxisPermutation::Single(value)
    }
}

impl From<Vec<usize>> for AxisPermutation {
    fn from(value: Vec<usize>) -> Self {
        AxisPermutation::Sequence(value)
    }
}

impl<const N: usize> From<[usize; N]> for AxisPermutation {
    fn from(value: [usize; N]) -> Self {
        AxisPermutation::Sequence(value.to_vec())
    }
}

fn is_permutation(order: &[usize], count: usize) -> bool {
    same_multiset(order, &(0..count).collect::<Vec<_>>())
}

/// Axes of the lattice a key stands for
fn axes_of(lattice: &Lattice, key: &str) -> Result<Vec<String>, FieldError> {
    lattice.expand([key]).map_err(|_| FieldError::UnknownKey(key.to_string()))
}

impl Field {
    fn count(&self, axis: &str) -> usize {
        self.axes.iter().filter(|a| *a == axis).count()
    }

    /// Same values laid out as `order`
    fn relayout(&self, order: IndexOrder) -> Field {
        let value = self.value.as_ref().map(|value| {
            Delayed::new(
                Op::Permute {
                    from: self.order.clone(),
                    to: order.clone(),
                    rename: Rename::new(),
                },
                vec![value.clone()],
            )
        });
        Field {
            order,
            value,
            realized: Default::default(),
            ..self.clone()
        }
    }

    /// Lays the data out in the given order of axes or indexes
    ///
    /// Giving the axes leaves the order of repeated indexes as it was.
    pub fn reorder<S: AsRef<str>>(&self, order: &[S]) -> Result<Field, FieldError> {
        let order = layout(&self.order, &self.axes, &self.indexes, order)?;
        Ok(self.relayout(order))
    }

    /// Leaves the order of the axes to be tuned again
    pub fn reorder_tunable(&self) -> Field {
        let option = TunableOption::new("axes_order", Resolver::permutation(&self.axes));
        self.relayout(self.order.with_axes(option))
    }

    fn repeated(&self, axis: &str) -> Result<usize, FieldError> {
        match self.count(axis) {
            count if count > 1 => Ok(count),
            _ => Err(FieldError::UnknownKey(format!(
                "{axis:?} is not a repeated axis of the field"
            ))),
        }
    }

    /// Lays out the indexes of a repeated axis in the given order
    pub fn reorder_label(&self, axis: &str, order: &[usize]) -> Result<Field, FieldError> {
        let count = self.repeated(axis)?;
        if !is_permutation(order, count) {
            return Err(FieldError::InvalidValue(format!(
                "{order:?} is not a permutation of the {count} indexes of {axis:?}"
            )));
        }
        let option = TunableOption::tuned(
            format!("{axis}_order"),
            Resolver::permutation_of(count),
            OptionValue::Indices(order.to_vec()),
        )?;
        Ok(self.relayout(self.order.with_label(axis, option)))
    }

    /// Leaves the order of the indexes of a repeated axis to be tuned again
    pub fn reorder_label_tunable(&self, axis: &str) -> Result<Field, FieldError> {
        let count = self.repeated(axis)?;
        let option = TunableOption::new(format!("{axis}_order"), Resolver::permutation_of(count));
        Ok(self.relayout(self.order.with_label(axis, option)))
    }

    fn drop_indexes(&self, remove: Vec<String>) -> Result<Field, FieldError> {
        if remove.is_empty() {
            return Ok(self.clone());
        }
        let (axes, rename, coords) = self.without(&remove);
        let order = IndexOrder::tunable(&axes);
        let value = self.value.as_ref().map(|value| {
            Delayed::new(
                Op::Squeeze {
                    from: self.order.clone(),
                    to: order.clone(),
                    remove,
                    rename,
                },
                vec![value.clone()],
            )
        });
        self.derive(axes, coords, order, value)
    }

    /// Removes every index of size one
    pub fn squeeze(&self) -> Result<Field, FieldError> {
        let remove = self
            .indexes
            .iter()
            .zip(&self.shape)
            .filter(|(_, size)| **size == 1)
            .map(|(index, _)| index.clone())
            .collect();
        self.drop_indexes(remove)
    }

    /// Removes the indexes named by `keys`, which must have size one
    pub fn squeeze_axes<S: AsRef<str>>(&self, keys: &[S]) -> Result<Field, FieldError> {
        let remove = self.get_indexes(keys)?;
        for index in &remove {
            let size = self.get_size(index)?;
            if size != 1 {
                return Err(FieldError::InvalidValue(format!(
                    "cannot squeeze {index:?} of size {size}"
                )));
            }
        }
        self.drop_indexes(remove)
    }

    /// Adds the axes named by `keys`, spanning their whole range
    ///
    /// Axes the field already has get one more index.
    pub fn extend<S: AsRef<str>>(&self, keys: &[S]) -> Result<Field, FieldError> {
        let mut added = Vec::new();
        for key in keys {
            for axis in axes_of(&self.lattice, key.as_ref())? {
                if !self.lattice.is_axis(&axis) {
                    return Err(FieldError::UnknownAxis(axis));
                }
                added.push(axis);
            }
        }
        if added.is_empty() {
            return Ok(self.clone());
        }
        let axes: Vec<String> = self.axes.iter().cloned().chain(added).collect();
        let indexes = indexes_of(&axes);
        let (kept, new) = indexes.split_at(self.indexes.len());
        let mut rename = Rename::new();
        let mut coords = self.coords.clone();
        for (old, renamed) in self.indexes.iter().zip(kept) {
            if old != renamed {
                rename.push((old.clone(), renamed.clone()));
            }
        }
        // simultaneous renames: collect the selections first
        let moved: Vec<_> = rename
            .iter()
            .map(|(old, renamed)| (renamed.clone(), coords.remove(old)))
            .collect();
        for (renamed, selection) in moved {
            if let Some(selection) = selection {
                coords.insert(renamed, selection);
            }
        }
        let new = new
            .iter()
            .map(|index| Ok((index.clone(), self.extent(index)?)))
            .collect::<Result<Vec<_>, FieldError>>()?;
        let order = IndexOrder::tunable(&axes);
        let value = Delayed::new(
            Op::Extend {
                from: self.order.clone(),
                to: order.clone(),
                new,
                rename,
            },
            vec![self.node()],
        );
        self.derive(axes, coords, order, Some(value))
    }

    /// Permutes the indexes of repeated axes
    ///
    /// With `color = [1, 0]` the new `color_0` is the old `color_1` and vice versa. Keys
    /// can be axes or lattice keys expanding to repeated axes of the field.
    pub fn transpose<S: AsRef<str>>(
        &self,
        permutations: &[(S, AxisPermutation)],
    ) -> Result<Field, FieldError> {
        let mut rename = Rename::new();
        for (key, permutation) in permutations {
            let key = key.as_ref();
            let order = match permutation {
                AxisPermutation::Sequence(order) => order,
                AxisPermutation::Single(position) => {
                    return Err(FieldError::InvalidType(format!(
                        "the permutation of {key:?} must be a sequence, not {position}"
                    )))
                }
            };
            let axes: Vec<String> = axes_of(&self.lattice, key)?
                .into_iter()
                .filter(|axis| self.count(axis) > 0)
                .collect();
            if axes.is_empty() {
                return Err(FieldError::UnknownKey(key.to_string()));
            }
            for axis in axes {
                let count = self.count(&axis);
                if order.len() != count || !is_permutation(order, count) {
                    return Err(FieldError::InvalidValue(format!(
                        "{order:?} is not a permutation of the {count} indexes of {axis:?}"
                    )));
                }
                for (k, from) in order.iter().enumerate() {
                    if *from != k {
                        rename.push((index_name(&axis, *from, count), index_name(&axis, k, count)));
                    }
                }
            }
        }
        if rename.is_empty() {
            return Ok(self.clone());
        }
        let mut coords = self.coords.clone();
        for (old, _) in &rename {
            coords.remove(old);
        }
        for (old, new) in &rename {
            if let Some(selection) = self.coords.get(old) {
                coords.insert(new.clone(), selection.clone());
            }
        }
        let value = Delayed::new(
            Op::Permute {
                from: self.order.clone(),
                to: self.order.clone(),
                rename,
            },
            vec![self.node()],
        );
        self.derive(self.axes.clone(), coords, self.order.clone(), Some(value))
    }

    /// Reverses the indexes of every repeated axis
    pub fn transpose_all(&self) -> Result<Field, FieldError> {
        let permutations: Vec<(String, AxisPermutation)> = self
            .axis_counts()
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(axis, count)| (axis, AxisPermutation::Sequence((0..count).rev().collect())))
            .collect();
        self.transpose(&permutations)
    }

    /// Conjugate transpose
    pub fn dagger(&self) -> Result<Field, FieldError> {
        self.conj().transpose_all()
    }
}
