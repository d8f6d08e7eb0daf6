//! Coordinates on lattice axes
//!
//! A [`Coord`] is what the user writes to restrict an axis, a [`Selection`] is the resolved
//! set of positions along that axis and [`Coordinates`] maps axis (or index) names to their
//! selections.

use std::collections::BTreeSet;
use std::ops::{Range, RangeFrom, RangeFull};

use indexmap::IndexMap;

use crate::errors::LatticeError;

/// Unresolved coordinate value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coord {
    Index(usize),
    Label(String),
    Range {
        start: usize,
        stop: Option<usize>,
        step: usize,
    },
    Many(Vec<Coord>),
    All,
}

impl From<usize> for Coord {
    fn from(value: usize) -> Self {
        Coord::Index(value)
    }
}

impl From<&str> for Coord {
    fn from(value: &str) -> Self {
        Coord::Label(value.to_string())
    }
}

impl From<String> for Coord {
    fn from(value: String) -> Self {
        Coord::Label(value)
    }
}

impl From<Vec<usize>> for Coord {
    fn from(value: Vec<usize>) -> Self {
        Coord::Many(value.into_iter().map(Coord::Index).collect())
    }
}

impl<const N: usize> From<[usize; N]> for Coord {
    fn from(value: [usize; N]) -> Self {
        Coord::Many(value.into_iter().map(Coord::Index).collect())
    }
}

impl From<Vec<&str>> for Coord {
    fn from(value: Vec<&str>) -> Self {
        Coord::Many(value.into_iter().map(Coord::from).collect())
    }
}

impl From<Range<usize>> for Coord {
    fn from(value: Range<usize>) -> Self {
        Coord::Range {
            start: value.start,
            stop: Some(value.end),
            step: 1,
        }
    }
}

impl From<RangeFrom<usize>> for Coord {
    fn from(value: RangeFrom<usize>) -> Self {
        Coord::Range {
            start: value.start,
            stop: None,
            step: 1,
        }
    }
}

impl From<RangeFull> for Coord {
    fn from(_: RangeFull) -> Self {
        Coord::All
    }
}

/// Resolved positions along one axis
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    /// Sorted, without repetitions
    Positions(Vec<usize>),
}

impl Selection {
    pub fn positions(&self, extent: usize) -> Vec<usize> {
        match self {
            Selection::All => (0..extent).collect(),
            Selection::Positions(positions) => positions.clone(),
        }
    }

    pub fn len(&self, extent: usize) -> usize {
        match self {
            Selection::All => extent,
            Selection::Positions(positions) => positions.len(),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Selection::All)
    }

    /// Turns a selection covering the whole axis into [`Selection::All`]
    pub fn normalized(self, extent: usize) -> Selection {
        match self {
            Selection::Positions(positions)
                if positions.len() == extent && positions.iter().copied().eq(0..extent) =>
            {
                Selection::All
            }
            other => other,
        }
    }

    pub fn intersection(&self, other: &Selection) -> Selection {
        match (self, other) {
            (Selection::All, other) | (other, Selection::All) => other.clone(),
            (Selection::Positions(ours), Selection::Positions(theirs)) => {
                let theirs: BTreeSet<_> = theirs.iter().collect();
                Selection::Positions(
                    ours.iter().filter(|p| theirs.contains(p)).copied().collect(),
                )
            }
        }
    }

    pub fn union(&self, other: &Selection) -> Selection {
        match (self, other) {
            (Selection::All, _) | (_, Selection::All) => Selection::All,
            (Selection::Positions(ours), Selection::Positions(theirs)) => {
                let merged: BTreeSet<_> = ours.iter().chain(theirs).copied().collect();
                Selection::Positions(merged.into_iter().collect())
            }
        }
    }

    pub fn is_subset(&self, other: &Selection, extent: usize) -> bool {
        match (self, other) {
            (_, Selection::All) => true,
            (Selection::All, Selection::Positions(theirs)) => theirs.len() == extent,
            (Selection::Positions(ours), Selection::Positions(theirs)) => {
                ours.iter().all(|p| theirs.binary_search(p).is_ok())
            }
        }
    }
}

/// Domain of an axis: a plain range or a tuple of labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisRange {
    Range(usize),
    Labels(Vec<String>),
}

impl AxisRange {
    pub fn len(&self) -> usize {
        match self {
            AxisRange::Range(size) => *size,
            AxisRange::Labels(labels) => labels.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves a coordinate on this range into a selection
    pub fn resolve(&self, axis: &str, coord: &Coord) -> Result<Selection, LatticeError> {
        if let Coord::All = coord {
            return Ok(Selection::All);
        }
        let mut positions = BTreeSet::new();
        self.collect(axis, coord, &mut positions)?;
        Ok(Selection::Positions(positions.into_iter().collect()).normalized(self.len()))
    }

    fn collect(
        &self,
        axis: &str,
        coord: &Coord,
        positions: &mut BTreeSet<usize>,
    ) -> Result<(), LatticeError> {
        let invalid = |reason: String| LatticeError::InvalidCoordinate {
            axis: axis.to_string(),
            reason,
        };
        match coord {
            Coord::Index(index) => {
                if *index >= self.len() {
                    return Err(invalid(format!(
                        "index {index} out of range 0..{}",
                        self.len()
                    )));
                }
                positions.insert(*index);
            }
            Coord::Label(label) => match self {
                AxisRange::Labels(labels) => {
                    let position = labels
                        .iter()
                        .position(|l| l == label)
                        .ok_or_else(|| invalid(format!("{label:?} is not one of {labels:?}")))?;
                    positions.insert(position);
                }
                AxisRange::Range(_) => {
                    return Err(invalid(format!("{label:?} given to an axis without labels")))
                }
            },
            Coord::Range { start, stop, step } => {
                if *step == 0 {
                    return Err(invalid("range step cannot be zero".to_string()));
                }
                let stop = stop.unwrap_or(self.len()).min(self.len());
                positions.extend((*start..stop).step_by(*step));
            }
            Coord::Many(coords) => {
                for coord in coords {
                    self.collect(axis, coord, positions)?;
                }
            }
            Coord::All => positions.extend(0..self.len()),
        }
        Ok(())
    }
}

/// Ordered mapping from axis or index names to selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coordinates {
    entries: IndexMap<String, Selection>,
}

impl Coordinates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, selection: Selection) {
        self.entries.insert(key.into(), selection);
    }

    pub fn get(&self, key: &str) -> Option<&Selection> {
        self.entries.get(key)
    }

    /// Selection of a key, everything when the key is not restricted
    pub fn selection(&self, key: &str) -> Selection {
        self.entries.get(key).cloned().unwrap_or(Selection::All)
    }

    pub fn remove(&mut self, key: &str) -> Option<Selection> {
        self.entries.shift_remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Selection)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops the entries selecting everything
    pub fn finalized(mut self) -> Self {
        self.entries.retain(|_, selection| !selection.is_all());
        self
    }

    pub fn intersection(&self, other: &Coordinates) -> Coordinates {
        let mut result = self.clone();
        for (key, theirs) in &other.entries {
            let merged = self.selection(key).intersection(theirs);
            result.entries.insert(key.clone(), merged);
        }
        result.finalized()
    }

    pub fn union(&self, other: &Coordinates) -> Coordinates {
        let mut result = Coordinates::new();
        for (key, ours) in &self.entries {
            if let Some(theirs) = other.entries.get(key) {
                result.entries.insert(key.clone(), ours.union(theirs));
            }
        }
        result.finalized()
    }

    pub(crate) fn rename(&mut self, old: &str, new: &str) {
        if let Some(index) = self.entries.get_index_of(old) {
            if let Some((_, selection)) = self.entries.shift_remove_index(index) {
                self.entries.shift_insert(index, new.to_string(), selection);
            }
        }
    }
}

impl FromIterator<(String, Selection)> for Coordinates {
    fn from_iter<T: IntoIterator<Item = (String, Selection)>>(iter: T) -> Self {
        Coordinates {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Coordinate filters given to lattices and fields
///
/// ```
/// use latfield::coordinates::Filters;
///
/// let filters = Filters::new().with("x", 0).with("color", [0, 1]).named("source");
/// assert!(!filters.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    keys: Vec<(String, Coord)>,
    names: Vec<String>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts `key` (an axis, an index or a lattice group) to `coord`
    pub fn with(mut self, key: impl Into<String>, coord: impl Into<Coord>) -> Self {
        self.keys.push((key.into(), coord.into()));
        self
    }

    /// Applies a named lattice coordinate or a label value
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    pub fn keys(&self) -> &[(String, Coord)] {
        &self.keys
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.names.is_empty()
    }
}

#[cfg(test)]
mod coordinates_test {
    use super::*;

    #[test]
    fn resolve_ranges() {
        let range = AxisRange::Range(4);
        assert_eq!(
            range.resolve("x", &Coord::from(1..3)).unwrap(),
            Selection::Positions(vec![1, 2])
        );
        assert_eq!(range.resolve("x", &Coord::from(0..4)).unwrap(), Selection::All);
        assert_eq!(
            range.resolve("x", &Coord::from([3, 1, 3])).unwrap(),
            Selection::Positions(vec![1, 3])
        );
        assert!(range.resolve("x", &Coord::Index(4)).is_err());
        assert!(range.resolve("x", &Coord::from("a")).is_err());
    }

    #[test]
    fn resolve_labels() {
        let range = AxisRange::Labels(vec!["t".into(), "x".into(), "y".into()]);
        assert_eq!(
            range.resolve("dirs", &Coord::from("y")).unwrap(),
            Selection::Positions(vec![2])
        );
        assert!(range.resolve("dirs", &Coord::from("z")).is_err());
    }

    #[test]
    fn set_algebra() {
        let mut a = Coordinates::new();
        a.insert("x", Selection::Positions(vec![0, 1, 2]));
        a.insert("y", Selection::Positions(vec![3]));
        let mut b = Coordinates::new();
        b.insert("x", Selection::Positions(vec![2, 3]));

        let both = a.intersection(&b);
        assert_eq!(both.get("x"), Some(&Selection::Positions(vec![2])));
        assert_eq!(both.get("y"), Some(&Selection::Positions(vec![3])));

        let any = a.union(&b);
        assert_eq!(any.get("x"), Some(&Selection::Positions(vec![0, 1, 2, 3])));
        assert_eq!(any.get("y"), None);
    }
}
