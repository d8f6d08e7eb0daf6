//! The lattice registry
//!
//! A [`Lattice`] describes the universe of named axes a field can live on: the physical
//! dimensions, the internal degrees of freedom, axes enumerated by labels and the names
//! grouping them together. Lattices are mutable until frozen. Fields always hold a frozen
//! lattice, so that their shape can not change behind their back.
//!
//! ```
//! use latfield::lattice::{AxesSpec, Lattice};
//!
//! let mut lattice = Lattice::default();
//! lattice.set_dims(AxesSpec::Sizes(vec![8, 4, 4, 4])).unwrap();
//! assert_eq!(lattice.expand(["space"]).unwrap(), vec!["x", "y", "z"]);
//! assert_eq!(lattice.get_axis_size("t").unwrap(), 8);
//! ```

use std::fmt::{self, Display};
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::{Lazy, OnceCell};
use rand::Rng;
use regex::Regex;
use tracing::debug;

use crate::coordinates::{AxisRange, Coordinates, Filters, Selection};
use crate::errors::LatticeError;

static AXIS_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z]([a-zA-Z0-9]|_[0-9]*[a-zA-Z])*$").expect("axis key pattern is valid")
});

static COORD_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("coord key pattern is valid"));

/// Keys expanding to a whole category
pub const RESERVED: [&str; 3] = ["dims", "dofs", "labels"];

/// Names given to the first four dimensions
pub const DEFAULT_DIMS: [&str; 4] = ["t", "x", "y", "z"];

/// Theories known by [`AxesSpec::Theory`]
pub const THEORIES: [&str; 1] = ["QCD"];

struct Theory {
    dofs: &'static [(&'static str, usize)],
    groups: &'static [(&'static str, &'static [&'static str])],
}

fn theory(name: &str) -> Option<Theory> {
    match name {
        "QCD" => Some(Theory {
            dofs: &[("spin", 4), ("color", 3)],
            groups: &[("gauge", &["color"])],
        }),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Dims,
    Dofs,
    Labels,
    Groups,
    Properties,
    Coords,
}

/// Value stored under a lattice key, tagged by its category
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatticeEntry {
    /// One of the reserved keys, listing the members of the category
    Category(Vec<String>),
    Dim(usize),
    Dof(usize),
    Label(Vec<String>),
    Group(Vec<String>),
    Property(Vec<String>),
    Coord(Coordinates),
}

/// Value accepted by [`Lattice::set`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatticeValue {
    Size(usize),
    Names(Vec<String>),
    Coords(Filters),
}

/// Ways of specifying dimensions or degrees of freedom
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxesSpec {
    /// Number of axes with default names and size one
    Count(usize),
    /// Sizes of axes with default names
    Sizes(Vec<usize>),
    /// Names of axes with size one
    Names(Vec<String>),
    Named(Vec<(String, usize)>),
    Theory(String),
}

impl From<usize> for AxesSpec {
    fn from(value: usize) -> Self {
        AxesSpec::Count(value)
    }
}

impl From<Vec<usize>> for AxesSpec {
    fn from(value: Vec<usize>) -> Self {
        AxesSpec::Sizes(value)
    }
}

impl From<Vec<(&str, usize)>> for AxesSpec {
    fn from(value: Vec<(&str, usize)>) -> Self {
        AxesSpec::Named(value.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

impl<const N: usize> From<[(&str, usize); N]> for AxesSpec {
    fn from(value: [(&str, usize); N]) -> Self {
        AxesSpec::Named(value.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

impl AxesSpec {
    pub fn theory(name: &str) -> Self {
        AxesSpec::Theory(name.to_string())
    }
}

#[derive(Debug, Clone, Default)]
struct LatticeData {
    dims: IndexMap<String, usize>,
    dofs: IndexMap<String, usize>,
    labels: IndexMap<String, Vec<String>>,
    groups: IndexMap<String, Vec<String>>,
    properties: IndexMap<String, Vec<String>>,
    coords: IndexMap<String, Coordinates>,
    frozen: bool,
    frozen_copy: OnceCell<Lattice>,
}

impl LatticeData {
    fn category(&self, key: &str) -> Option<Category> {
        if self.dims.contains_key(key) {
            Some(Category::Dims)
        } else if self.dofs.contains_key(key) {
            Some(Category::Dofs)
        } else if self.labels.contains_key(key) {
            Some(Category::Labels)
        } else if self.groups.contains_key(key) {
            Some(Category::Groups)
        } else if self.properties.contains_key(key) {
            Some(Category::Properties)
        } else if self.coords.contains_key(key) {
            Some(Category::Coords)
        } else {
            None
        }
    }

    fn is_free(&self, key: &str) -> bool {
        !RESERVED.contains(&key) && self.category(key).is_none()
    }

    fn label_in_use(&self, value: &str) -> bool {
        self.labels.values().any(|values| values.iter().any(|v| v == value))
    }

    /// Installs `dirs`, `time` and `space`, replacing the ones derived from `old` dims
    fn install_dims_defaults(&mut self, old: &[String]) {
        let names: Vec<String> = self.dims.keys().cloned().collect();
        let defaults: [(&str, Vec<String>, Vec<String>, bool); 3] = [
            ("dirs", names.clone(), old.to_vec(), true),
            (
                "time",
                names.iter().take(1).cloned().collect(),
                old.iter().take(1).cloned().collect(),
                false,
            ),
            (
                "space",
                names.iter().skip(1).cloned().collect(),
                old.iter().skip(1).cloned().collect(),
                false,
            ),
        ];
        for (key, value, previous, is_label) in defaults {
            let map = if is_label {
                &mut self.labels
            } else {
                &mut self.groups
            };
            let stale = map.get(key).map_or(false, |current| *current == previous);
            if stale {
                if value.is_empty() {
                    map.shift_remove(key);
                } else {
                    map.insert(key.to_string(), value);
                }
            } else if !value.is_empty() && self.is_free(key) {
                let map = if is_label {
                    &mut self.labels
                } else {
                    &mut self.groups
                };
                map.insert(key.to_string(), value);
            }
        }
    }

    fn install_theory(&mut self, theory: &Theory) {
        self.dofs = theory
            .dofs
            .iter()
            .map(|(name, size)| (name.to_string(), *size))
            .collect();
        for (group, members) in theory.groups {
            if self.is_free(group) {
                self.groups.insert(
                    group.to_string(),
                    members.iter().map(|m| m.to_string()).collect(),
                );
            }
        }
    }
}

/// Lattice registry
///
/// Cloning a lattice is cheap and shares the data. Mutations on a clone copy the data
/// first, so clones never observe each other changes.
#[derive(Debug, Clone)]
pub struct Lattice {
    data: Arc<LatticeData>,
}

impl Default for Lattice {
    /// Four dimensions of size one with the QCD degrees of freedom
    fn default() -> Self {
        let mut data = LatticeData::default();
        for name in DEFAULT_DIMS {
            data.dims.insert(name.to_string(), 1);
        }
        data.install_dims_defaults(&[]);
        if let Some(qcd) = theory("QCD") {
            data.install_theory(&qcd);
        }
        Lattice {
            data: Arc::new(data),
        }
    }
}

impl Lattice {
    /// Empty lattice, without dimensions nor degrees of freedom
    pub fn empty() -> Self {
        Lattice {
            data: Arc::new(LatticeData::default()),
        }
    }

    pub fn new(dims: impl Into<AxesSpec>, dofs: impl Into<AxesSpec>) -> Result<Self, LatticeError> {
        let mut lattice = Lattice::empty();
        lattice.set_dims(dims.into())?;
        lattice.set_dofs(dofs.into())?;
        Ok(lattice)
    }

    fn data_mut(&mut self, what: &str) -> Result<&mut LatticeData, LatticeError> {
        if self.data.frozen {
            return Err(LatticeError::Frozen(what.to_string()));
        }
        let data = Arc::make_mut(&mut self.data);
        data.frozen_copy = OnceCell::new();
        Ok(data)
    }

    fn ensure_unfrozen(&self, what: &str) -> Result<(), LatticeError> {
        if self.data.frozen {
            return Err(LatticeError::Frozen(what.to_string()));
        }
        Ok(())
    }

    /// Checks that `key` is well formed and, unless it already belongs to `category`, unused
    fn check_key(
        &self,
        key: &str,
        category: Category,
        pattern: &Regex,
    ) -> Result<(), LatticeError> {
        if !pattern.is_match(key) {
            return Err(LatticeError::InvalidKey(key.to_string()));
        }
        if RESERVED.contains(&key) {
            return Err(LatticeError::KeyInUse(key.to_string()));
        }
        match self.data.category(key) {
            Some(found) if found != category => Err(LatticeError::KeyInUse(key.to_string())),
            _ => Ok(()),
        }
    }

    fn sizes_of(
        &self,
        spec: AxesSpec,
        category: Category,
    ) -> Result<IndexMap<String, usize>, LatticeError> {
        let default_name = |i: usize, n: usize| match category {
            Category::Dims if n <= DEFAULT_DIMS.len() => DEFAULT_DIMS[i].to_string(),
            Category::Dims => format!("dim{i}"),
            _ => format!("dof{i}"),
        };
        let pairs: Vec<(String, usize)> = match spec {
            AxesSpec::Count(n) => (0..n).map(|i| (default_name(i, n), 1)).collect(),
            AxesSpec::Sizes(sizes) => {
                let n = sizes.len();
                sizes
                    .into_iter()
                    .enumerate()
                    .map(|(i, size)| (default_name(i, n), size))
                    .collect()
            }
            AxesSpec::Names(names) => names.into_iter().map(|name| (name, 1)).collect(),
            AxesSpec::Named(pairs) => pairs,
            AxesSpec::Theory(name) => {
                return Err(LatticeError::InvalidValue(format!(
                    "theory {name:?} can only define degrees of freedom"
                )))
            }
        };
        let mut sizes = IndexMap::new();
        for (name, size) in pairs {
            self.check_key(&name, category, &AXIS_KEY)?;
            if size == 0 {
                return Err(LatticeError::NonPositive {
                    key: name,
                    value: size,
                });
            }
            if sizes.insert(name.clone(), size).is_some() {
                return Err(LatticeError::KeyInUse(name));
            }
        }
        Ok(sizes)
    }

    /// Replaces the dimensions
    ///
    /// Also defines the label `dirs` and the groups `time` and `space` if they are not in use.
    pub fn set_dims(&mut self, spec: AxesSpec) -> Result<(), LatticeError> {
        self.ensure_unfrozen("dims")?;
        let dims = self.sizes_of(spec, Category::Dims)?;
        let data = self.data_mut("dims")?;
        let old: Vec<String> = data.dims.keys().cloned().collect();
        data.dims = dims;
        data.install_dims_defaults(&old);
        Ok(())
    }

    /// Replaces the degrees of freedom, either explicitly or from a theory name
    pub fn set_dofs(&mut self, spec: AxesSpec) -> Result<(), LatticeError> {
        self.ensure_unfrozen("dofs")?;
        if let AxesSpec::Theory(name) = spec {
            let theory = theory(&name).ok_or(LatticeError::UnknownTheory(name))?;
            for (dof, _) in theory.dofs {
                self.check_key(dof, Category::Dofs, &AXIS_KEY)?;
            }
            self.data_mut("dofs")?.install_theory(&theory);
            return Ok(());
        }
        let dofs = self.sizes_of(spec, Category::Dofs)?;
        self.data_mut("dofs")?.dofs = dofs;
        Ok(())
    }

    /// Defines (or replaces) a label axis enumerating `values`
    pub fn add_label<S: AsRef<str>>(&mut self, key: &str, values: &[S]) -> Result<(), LatticeError> {
        self.ensure_unfrozen(key)?;
        self.check_key(key, Category::Labels, &AXIS_KEY)?;
        let values: Vec<String> = values.iter().map(|v| v.as_ref().to_string()).collect();
        for (i, value) in values.iter().enumerate() {
            if values[..i].contains(value) {
                return Err(LatticeError::RepeatedLabels(key.to_string()));
            }
        }
        let used: Vec<String> = values
            .iter()
            .filter(|value| {
                self.data
                    .labels
                    .iter()
                    .any(|(other, vals)| other != key && vals.contains(value))
            })
            .cloned()
            .collect();
        if !used.is_empty() {
            return Err(LatticeError::LabelsInUse(used));
        }
        self.data_mut(key)?.labels.insert(key.to_string(), values);
        Ok(())
    }

    /// Defines (or replaces) a group of existing keys
    pub fn add_group<S: AsRef<str>>(&mut self, key: &str, members: &[S]) -> Result<(), LatticeError> {
        self.ensure_unfrozen(key)?;
        self.check_key(key, Category::Groups, &AXIS_KEY)?;
        let members: Vec<String> = members.iter().map(|m| m.as_ref().to_string()).collect();
        for member in &members {
            if member == key || !self.contains(member) {
                return Err(LatticeError::UnknownKey(member.clone()));
            }
        }
        self.data_mut(key)?.groups.insert(key.to_string(), members);
        Ok(())
    }

    /// Defines (or replaces) a property expanding to other keys
    ///
    /// Members may refer to keys defined later; cycles are detected by [`Lattice::expand`].
    pub fn add_property<S: AsRef<str>>(
        &mut self,
        key: &str,
        members: &[S],
    ) -> Result<(), LatticeError> {
        self.ensure_unfrozen(key)?;
        self.check_key(key, Category::Properties, &AXIS_KEY)?;
        let members: Vec<String> = members.iter().map(|m| m.as_ref().to_string()).collect();
        for member in &members {
            if !AXIS_KEY.is_match(member) {
                return Err(LatticeError::InvalidKey(member.clone()));
            }
        }
        self.data_mut(key)?
            .properties
            .insert(key.to_string(), members);
        Ok(())
    }

    /// Stores the coordinates resolved from `filters` under `key`
    pub fn add_coord(&mut self, key: &str, filters: &Filters) -> Result<(), LatticeError> {
        self.ensure_unfrozen(key)?;
        let coords = self.resolve(filters)?;
        self.add_coords(key, coords)
    }

    fn add_coords(&mut self, key: &str, coords: Coordinates) -> Result<(), LatticeError> {
        self.check_key(key, Category::Coords, &COORD_KEY)?;
        if self.data.label_in_use(key) {
            return Err(LatticeError::KeyInUse(key.to_string()));
        }
        self.data_mut(key)?.coords.insert(key.to_string(), coords);
        Ok(())
    }

    pub fn dims(&self) -> &IndexMap<String, usize> {
        &self.data.dims
    }

    pub fn dofs(&self) -> &IndexMap<String, usize> {
        &self.data.dofs
    }

    pub fn labels(&self) -> &IndexMap<String, Vec<String>> {
        &self.data.labels
    }

    pub fn groups(&self) -> &IndexMap<String, Vec<String>> {
        &self.data.groups
    }

    pub fn properties(&self) -> &IndexMap<String, Vec<String>> {
        &self.data.properties
    }

    pub fn coords(&self) -> &IndexMap<String, Coordinates> {
        &self.data.coords
    }

    pub fn category(&self, key: &str) -> Option<Category> {
        self.data.category(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        RESERVED.contains(&key) || self.data.category(key).is_some()
    }

    /// All the keys, reserved ones included
    pub fn keys(&self) -> Vec<String> {
        let data = &self.data;
        RESERVED
            .iter()
            .map(|k| k.to_string())
            .chain(data.dims.keys().cloned())
            .chain(data.dofs.keys().cloned())
            .chain(data.labels.keys().cloned())
            .chain(data.groups.keys().cloned())
            .chain(data.properties.keys().cloned())
            .chain(data.coords.keys().cloned())
            .collect()
    }

    /// Names of the axes: dimensions, degrees of freedom and labels
    pub fn axes(&self) -> Vec<String> {
        let data = &self.data;
        data.dims
            .keys()
            .chain(data.dofs.keys())
            .chain(data.labels.keys())
            .cloned()
            .collect()
    }

    pub fn is_axis(&self, key: &str) -> bool {
        matches!(
            self.data.category(key),
            Some(Category::Dims | Category::Dofs | Category::Labels)
        )
    }

    pub fn get(&self, key: &str) -> Option<LatticeEntry> {
        let data = &self.data;
        match key {
            "dims" => return Some(LatticeEntry::Category(data.dims.keys().cloned().collect())),
            "dofs" => return Some(LatticeEntry::Category(data.dofs.keys().cloned().collect())),
            "labels" => {
                return Some(LatticeEntry::Category(data.labels.keys().cloned().collect()))
            }
            _ => {}
        }
        Some(match data.category(key)? {
            Category::Dims => LatticeEntry::Dim(data.dims[key]),
            Category::Dofs => LatticeEntry::Dof(data.dofs[key]),
            Category::Labels => LatticeEntry::Label(data.labels[key].clone()),
            Category::Groups => LatticeEntry::Group(data.groups[key].clone()),
            Category::Properties => LatticeEntry::Property(data.properties[key].clone()),
            Category::Coords => LatticeEntry::Coord(data.coords[key].clone()),
        })
    }

    /// Updates an existing key
    ///
    /// Setting a size on a group or property sets it on every dimension or degree of
    /// freedom the key expands to.
    pub fn set(&mut self, key: &str, value: LatticeValue) -> Result<(), LatticeError> {
        self.ensure_unfrozen(key)?;
        if RESERVED.contains(&key) {
            return Err(LatticeError::InvalidValue(format!(
                "{key:?} is replaced with set_dims or set_dofs"
            )));
        }
        let category = self
            .data
            .category(key)
            .ok_or_else(|| LatticeError::UnknownKey(key.to_string()))?;
        match (category, value) {
            (Category::Dims | Category::Dofs | Category::Groups | Category::Properties, LatticeValue::Size(size)) => {
                if size == 0 {
                    return Err(LatticeError::NonPositive {
                        key: key.to_string(),
                        value: size,
                    });
                }
                let axes = self.expand([key])?;
                if let Some(label) = axes.iter().find(|a| self.data.labels.contains_key(*a)) {
                    return Err(LatticeError::InvalidValue(format!(
                        "the size of label {label:?} is given by its values"
                    )));
                }
                let data = self.data_mut(key)?;
                for axis in axes {
                    if let Some(current) = data.dims.get_mut(&axis) {
                        *current = size;
                    } else if let Some(current) = data.dofs.get_mut(&axis) {
                        *current = size;
                    }
                }
                Ok(())
            }
            (Category::Labels, LatticeValue::Names(values)) => self.add_label(key, &values),
            (Category::Groups, LatticeValue::Names(members)) => self.add_group(key, &members),
            (Category::Properties, LatticeValue::Names(members)) => {
                self.add_property(key, &members)
            }
            (Category::Coords, LatticeValue::Coords(filters)) => self.add_coord(key, &filters),
            (category, value) => Err(LatticeError::InvalidValue(format!(
                "{value:?} can not be assigned to {key:?} of category {category:?}"
            ))),
        }
    }

    /// Resolves names to the list of axes they stand for
    ///
    /// Axes expand to themselves, reserved keys to all the members of their category,
    /// groups and properties recursively to their members and coordinates to the axes
    /// they restrict.
    pub fn expand<I, S>(&self, keys: I) -> Result<Vec<String>, LatticeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Vec::new();
        let mut stack = Vec::new();
        for key in keys {
            self.expand_into(key.as_ref(), &mut stack, &mut out)?;
        }
        Ok(out)
    }

    fn expand_into(
        &self,
        key: &str,
        stack: &mut Vec<String>,
        out: &mut Vec<String>,
    ) -> Result<(), LatticeError> {
        let data = &self.data;
        match key {
            "dims" => out.extend(data.dims.keys().cloned()),
            "dofs" => out.extend(data.dofs.keys().cloned()),
            "labels" => out.extend(data.labels.keys().cloned()),
            _ => match data.category(key) {
                Some(Category::Dims | Category::Dofs | Category::Labels) => {
                    out.push(key.to_string())
                }
                Some(Category::Coords) => out.extend(data.coords[key].keys().map(String::from)),
                Some(category) => {
                    if stack.iter().any(|k| k == key) {
                        let mut path = stack.clone();
                        path.push(key.to_string());
                        return Err(LatticeError::CyclicProperty {
                            key: key.to_string(),
                            path: path.join(" -> "),
                        });
                    }
                    let members = if category == Category::Groups {
                        &data.groups[key]
                    } else {
                        &data.properties[key]
                    };
                    stack.push(key.to_string());
                    for member in members {
                        self.expand_into(member, stack, out)?;
                    }
                    stack.pop();
                }
                None => return Err(LatticeError::UnknownKey(key.to_string())),
            },
        }
        Ok(())
    }

    pub fn get_axis_size(&self, axis: &str) -> Result<usize, LatticeError> {
        Ok(self.get_axis_range(axis)?.len())
    }

    /// Label values of a label axis, `0..size` otherwise
    pub fn get_axis_range(&self, axis: &str) -> Result<AxisRange, LatticeError> {
        let data = &self.data;
        if let Some(size) = data.dims.get(axis).or_else(|| data.dofs.get(axis)) {
            return Ok(AxisRange::Range(*size));
        }
        if let Some(labels) = data.labels.get(axis) {
            return Ok(AxisRange::Labels(labels.clone()));
        }
        if self.contains(axis) {
            Err(LatticeError::NotAnAxis(axis.to_string()))
        } else {
            Err(LatticeError::UnknownKey(axis.to_string()))
        }
    }

    /// Number of sites
    pub fn volume(&self) -> usize {
        self.data.dims.values().product()
    }

    /// Resolves coordinate filters against the lattice axes
    ///
    /// Keys are expanded, so that `space = 0` restricts every spatial dimension. Multiple
    /// filters on the same axis are united.
    pub fn resolve(&self, filters: &Filters) -> Result<Coordinates, LatticeError> {
        let mut coords = Coordinates::new();
        let mut merge = |axis: &str, selection: Selection| {
            let merged = match coords.get(axis) {
                Some(current) => current.union(&selection),
                None => selection,
            };
            coords.insert(axis, merged);
        };
        for (key, coord) in filters.keys() {
            for axis in self.expand([key])? {
                let range = self.get_axis_range(&axis)?;
                merge(&axis, range.resolve(&axis, coord)?);
            }
        }
        for name in filters.names() {
            for (axis, selection) in self.deduce(name)?.iter() {
                merge(axis, selection.clone());
            }
        }
        Ok(coords.finalized())
    }

    /// Coordinates stored under `name`, or the coordinate of a label value
    pub fn deduce(&self, name: &str) -> Result<Coordinates, LatticeError> {
        if let Some(coords) = self.data.coords.get(name) {
            return Ok(coords.clone());
        }
        for (label, values) in &self.data.labels {
            if let Some(position) = values.iter().position(|v| v == name) {
                let mut coords = Coordinates::new();
                coords.insert(label.clone(), Selection::Positions(vec![position]));
                return Ok(coords);
            }
        }
        Err(LatticeError::UnknownKey(name.to_string()))
    }

    /// One random position on each of the axes `keys` expand to
    pub fn random_coords<S, R>(&self, keys: &[S], rng: &mut R) -> Result<Coordinates, LatticeError>
    where
        S: AsRef<str>,
        R: Rng + ?Sized,
    {
        let mut coords = Coordinates::new();
        for axis in self.expand(keys)? {
            let size = self.get_axis_size(&axis)?;
            coords.insert(axis, Selection::Positions(vec![rng.gen_range(0..size)]));
        }
        Ok(coords)
    }

    /// Random site stored as the coordinate `label`
    pub fn random_source<R: Rng + ?Sized>(
        &mut self,
        label: &str,
        rng: &mut R,
    ) -> Result<Coordinates, LatticeError> {
        self.ensure_unfrozen(label)?;
        let coords = self.random_coords(&["dims"], rng)?;
        self.add_coords(label, coords.clone())?;
        Ok(coords)
    }

    /// Renames a key, updating the groups, properties and coordinates referring to it
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), LatticeError> {
        self.ensure_unfrozen(old)?;
        let category = self
            .data
            .category(old)
            .ok_or_else(|| LatticeError::UnknownKey(old.to_string()))?;
        let pattern = if category == Category::Coords {
            &*COORD_KEY
        } else {
            &*AXIS_KEY
        };
        if !pattern.is_match(new) {
            return Err(LatticeError::InvalidKey(new.to_string()));
        }
        if !self.data.is_free(new) {
            return Err(LatticeError::KeyInUse(new.to_string()));
        }
        let data = self.data_mut(old)?;
        match category {
            Category::Dims => rename_key(&mut data.dims, old, new),
            Category::Dofs => rename_key(&mut data.dofs, old, new),
            Category::Labels => rename_key(&mut data.labels, old, new),
            Category::Groups => rename_key(&mut data.groups, old, new),
            Category::Properties => rename_key(&mut data.properties, old, new),
            Category::Coords => rename_key(&mut data.coords, old, new),
        }
        if category != Category::Coords {
            for members in data.groups.values_mut().chain(data.properties.values_mut()) {
                for member in members.iter_mut().filter(|m| m.as_str() == old) {
                    *member = new.to_string();
                }
            }
            for coords in data.coords.values_mut() {
                coords.rename(old, new);
            }
        }
        Ok(())
    }

    /// Copy with an even dimension halved and a `parity` label axis
    ///
    /// Without an axis the first even dimension is used.
    pub fn even_odd(&self, axis: Option<&str>) -> Result<Lattice, LatticeError> {
        let axis = match axis {
            Some(axis) => {
                let size = *self
                    .data
                    .dims
                    .get(axis)
                    .ok_or_else(|| LatticeError::UnknownKey(axis.to_string()))?;
                if size % 2 != 0 {
                    return Err(LatticeError::InvalidValue(format!(
                        "dimension {axis:?} has odd size {size}"
                    )));
                }
                axis.to_string()
            }
            None => self
                .data
                .dims
                .iter()
                .find(|(_, size)| *size % 2 == 0)
                .map(|(name, _)| name.clone())
                .ok_or_else(|| {
                    LatticeError::InvalidValue("no dimension has an even size".to_string())
                })?,
        };
        let mut lattice = self.copy();
        let size = lattice.get_axis_size(&axis)?;
        lattice.set(&axis, LatticeValue::Size(size / 2))?;
        lattice.add_label("parity", &["even", "odd"])?;
        Ok(lattice)
    }

    /// Frozen version of the lattice
    ///
    /// The frozen copy is cached until the next mutation, and a frozen lattice returns
    /// itself.
    pub fn freeze(&self) -> Lattice {
        if self.data.frozen {
            return self.clone();
        }
        self.data
            .frozen_copy
            .get_or_init(|| {
                let mut data = (*self.data).clone();
                data.frozen = true;
                data.frozen_copy = OnceCell::new();
                debug!(dims = ?data.dims, dofs = ?data.dofs, "freezing lattice");
                Lattice {
                    data: Arc::new(data),
                }
            })
            .clone()
    }

    pub fn is_frozen(&self) -> bool {
        self.data.frozen
    }

    /// Unfrozen copy of the lattice
    pub fn copy(&self) -> Lattice {
        let mut data = (*self.data).clone();
        data.frozen = false;
        data.frozen_copy = OnceCell::new();
        Lattice {
            data: Arc::new(data),
        }
    }

    /// Whether two handles refer to the same lattice instance
    pub fn ptr_eq(&self, other: &Lattice) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

fn rename_key<V>(map: &mut IndexMap<String, V>, old: &str, new: &str) {
    if let Some(index) = map.get_index_of(old) {
        if let Some((_, value)) = map.shift_remove_index(index) {
            map.shift_insert(index, new.to_string(), value);
        }
    }
}

impl PartialEq for Lattice {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let (a, b) = (&self.data, &other.data);
        a.dims == b.dims
            && a.dofs == b.dofs
            && a.labels == b.labels
            && a.groups == b.groups
            && a.properties == b.properties
    }
}

impl Display for Lattice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sizes = |map: &IndexMap<String, usize>| {
            map.iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "Lattice(dims={{{}}}, dofs={{{}}})",
            sizes(&self.data.dims),
            sizes(&self.data.dofs)
        )
    }
}

#[cfg(test)]
mod lattice_test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn default_lattice() {
        let lattice = Lattice::default();
        assert_eq!(lattice.dims().len(), 4);
        assert_eq!(lattice.get_axis_size("spin").unwrap(), 4);
        assert_eq!(lattice.get_axis_size("color").unwrap(), 3);
        assert_eq!(lattice.expand(["gauge"]).unwrap(), vec!["color"]);
        assert_eq!(lattice.expand(["time"]).unwrap(), vec!["t"]);
        assert_eq!(
            lattice.get_axis_range("dirs").unwrap(),
            AxisRange::Labels(vec!["t".into(), "x".into(), "y".into(), "z".into()])
        );
    }

    #[test]
    fn default_names() {
        let lattice = Lattice::new(AxesSpec::Count(5), AxesSpec::Sizes(vec![2, 3])).unwrap();
        assert_eq!(lattice.expand(["dims"]).unwrap()[4], "dim4");
        assert_eq!(lattice.expand(["dofs"]).unwrap(), vec!["dof0", "dof1"]);
    }

    #[test]
    fn invalid_values() {
        let mut lattice = Lattice::default();
        assert!(matches!(
            lattice.set_dims(AxesSpec::Sizes(vec![0, 1])),
            Err(LatticeError::NonPositive { .. })
        ));
        assert!(matches!(
            lattice.set_dims(AxesSpec::Names(vec!["x_0".into()])),
            Err(LatticeError::InvalidKey(_))
        ));
        assert!(matches!(
            lattice.add_label("spin", &["a"]),
            Err(LatticeError::KeyInUse(_))
        ));
        assert!(matches!(
            lattice.add_label("flavor", &["u", "u"]),
            Err(LatticeError::RepeatedLabels(_))
        ));
        assert!(matches!(
            lattice.add_label("other", &["x"]),
            Err(LatticeError::LabelsInUse(_))
        ));
        assert!(matches!(
            lattice.add_group("pair", &["x", "missing"]),
            Err(LatticeError::UnknownKey(_))
        ));
        // nothing was applied
        assert!(!lattice.contains("flavor"));
        assert_eq!(lattice.dims().len(), 4);
    }

    #[test]
    fn group_sizes() {
        let mut lattice = Lattice::default();
        lattice.set("space", LatticeValue::Size(4)).unwrap();
        lattice.set("time", LatticeValue::Size(8)).unwrap();
        assert_eq!(lattice.volume(), 8 * 4 * 4 * 4);
        assert!(lattice.set("dirs", LatticeValue::Size(2)).is_err());
    }

    #[test]
    fn cyclic_properties() {
        let mut lattice = Lattice::default();
        lattice.add_property("a", &["b"]).unwrap();
        lattice.add_property("b", &["a"]).unwrap();
        assert!(matches!(
            lattice.expand(["a"]),
            Err(LatticeError::CyclicProperty { .. })
        ));
    }

    #[test]
    fn freezing() {
        let lattice = Lattice::default();
        let frozen = lattice.freeze();
        assert!(frozen.is_frozen());
        assert!(frozen.ptr_eq(&lattice.freeze()));
        assert!(frozen.ptr_eq(&frozen.freeze()));

        let mut frozen = frozen;
        assert!(matches!(
            frozen.set("x", LatticeValue::Size(2)),
            Err(LatticeError::Frozen(_))
        ));
        assert!(matches!(frozen.rename("x", "w"), Err(LatticeError::Frozen(_))));

        let mut copy = frozen.copy();
        copy.set("x", LatticeValue::Size(2)).unwrap();
        assert_eq!(copy.get("x"), Some(LatticeEntry::Dim(2)));
    }

    #[test]
    fn renaming() {
        let mut lattice = Lattice::default();
        lattice
            .add_coord("origin", &Filters::new().with("x", 0))
            .unwrap();
        lattice.rename("x", "w").unwrap();
        assert_eq!(lattice.expand(["space"]).unwrap(), vec!["w", "y", "z"]);
        assert!(lattice.coords()["origin"].get("w").is_some());
        assert!(matches!(lattice.rename("w", "y"), Err(LatticeError::KeyInUse(_))));
    }

    #[test]
    fn coordinates() {
        let mut lattice = Lattice::default();
        lattice.set("space", LatticeValue::Size(4)).unwrap();
        let coords = lattice
            .resolve(&Filters::new().with("space", 1).named("y"))
            .unwrap();
        assert_eq!(coords.get("x"), Some(&Selection::Positions(vec![1])));
        assert_eq!(coords.get("dirs"), Some(&Selection::Positions(vec![2])));

        let mut rng = StdRng::seed_from_u64(7);
        let source = lattice.random_source("source", &mut rng).unwrap();
        assert_eq!(source.len(), 4);
        assert_eq!(lattice.deduce("source").unwrap(), source);
    }

    #[test]
    fn even_odd() {
        let mut lattice = Lattice::default();
        lattice.set_dims(AxesSpec::Sizes(vec![8, 4, 4, 4])).unwrap();
        let eo = lattice.even_odd(None).unwrap();
        assert_eq!(eo.get_axis_size("t").unwrap(), 4);
        assert_eq!(eo.get_axis_size("parity").unwrap(), 2);
        assert_eq!(eo.volume() * 2, lattice.volume());
    }
}
