//! Fields
//!
//! A [`Field`] is an array over named axes of a [`Lattice`]. Repeated axes get numbered
//! indexes (`color_0`, `color_1`), and every operation addresses the data by index names,
//! never by position. The physical layout of the data is an open parameter, an
//! [`IndexOrder`], decided when the field is tuned.
//!
//! Operations never touch data: they return a new field whose value is a node of the
//! delayed graph. [`Field::compute`] tunes what is left and realizes the value through the
//! engine of the session, returning it in the canonical order of [`Field::indexes`].
//!
//! ```
//! use latfield::lattice::Lattice;
//! use latfield::session::Session;
//!
//! let session = Session::builder().lattice(Lattice::default()).build();
//! let vector = session.field(&["color"]).build().unwrap().ones();
//! let norm = vector.dot(&[&vector], &Default::default()).unwrap();
//! assert_eq!(norm.compute().unwrap().sum().re, 3.0);
//! ```

mod contract;
mod indexing;
mod io;
mod math;
mod shape;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use num_complex::Complex64;
use once_cell::sync::OnceCell;

use crate::axes::{index_axis, indexes_of, Axes};
use crate::buffer::{Buffer, DType};
use crate::coordinates::Coordinates;
use crate::engine::realize_async;
use crate::errors::{FieldError, LatticeError, TuneError};
use crate::graph::{Delayed, IndexOrder, Op, Plan, Rename, Shape, UnaryOp};
use crate::io::ChunkPlan;
use crate::lattice::Lattice;
use crate::session::Session;
use crate::tunable::{same_multiset, OptionValue, Resolver, Tunable, TunableOption, TuneCallback};
use crate::types::Capability;

pub use contract::{DotOptions, Indices};
pub use indexing::SetValue;
pub use shape::AxisPermutation;

/// Progress of the value of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldState {
    /// No value, the field computes to zeros
    Unbound,
    /// Some options are still to be tuned
    Tunable,
    /// Every option is tuned, the value can be realized
    Tuned,
    Realized,
}

#[derive(Clone)]
pub struct Field {
    session: Arc<Session>,
    lattice: Lattice,
    axes: Vec<String>,
    indexes: Vec<String>,
    shape: Vec<usize>,
    coords: Coordinates,
    dtype: DType,
    order: IndexOrder,
    chunks: Arc<TunableOption>,
    value: Option<Delayed>,
    realized: Arc<OnceCell<Arc<Buffer>>>,
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("indexes", &self.indexes)
            .field("shape", &self.shape)
            .field("coords", &self.coords)
            .field("dtype", &self.dtype)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Field {
    /// Same lattice, indexes, coordinates and value, laid out with the same options
    fn eq(&self, other: &Field) -> bool {
        let uids = |order: &IndexOrder| order.options().map(|o| o.uid()).collect::<Vec<_>>();
        self.lattice == other.lattice
            && self.indexes == other.indexes
            && self.coords == other.coords
            && self.dtype == other.dtype
            && self.value.as_ref().map(Delayed::key) == other.value.as_ref().map(Delayed::key)
            && uids(&self.order) == uids(&other.order)
    }
}

fn shape_of(
    lattice: &Lattice,
    indexes: &[String],
    coords: &Coordinates,
) -> Result<Vec<usize>, FieldError> {
    indexes
        .iter()
        .map(|index| {
            let extent = lattice.get_axis_size(index_axis(index))?;
            Ok(coords.selection(index).len(extent))
        })
        .collect()
}

fn chunks_option(indexes: &[String], shape: &[usize]) -> Arc<TunableOption> {
    let full: IndexMap<String, usize> = indexes.iter().cloned().zip(shape.iter().copied()).collect();
    TunableOption::new("chunks", Resolver::ChunksOf(full))
}

/// Layout given by a permutation of the indexes, or of the axes on top of `base`
fn layout<S: AsRef<str>>(
    base: &IndexOrder,
    axes: &[String],
    indexes: &[String],
    order: &[S],
) -> Result<IndexOrder, FieldError> {
    let order: Vec<String> = order.iter().map(|s| s.as_ref().to_string()).collect();
    if same_multiset(&order, indexes) {
        return Ok(IndexOrder::fixed(&order)?);
    }
    if same_multiset(&order, axes) {
        let option = TunableOption::tuned(
            "axes_order",
            Resolver::permutation(axes),
            OptionValue::Names(order),
        )?;
        return Ok(base.with_axes(option));
    }
    Err(FieldError::InvalidValue(format!(
        "{order:?} is neither a permutation of the axes {axes:?} nor of the indexes {indexes:?}"
    )))
}

impl Field {
    /// Field on the same lattice with other axes, coordinates, layout and value
    pub(crate) fn derive(
        &self,
        axes: Vec<String>,
        coords: Coordinates,
        order: IndexOrder,
        value: Option<Delayed>,
    ) -> Result<Field, FieldError> {
        let indexes = indexes_of(&axes);
        let shape = shape_of(&self.lattice, &indexes, &coords)?;
        Ok(Field {
            session: Arc::clone(&self.session),
            lattice: self.lattice.clone(),
            chunks: chunks_option(&indexes, &shape),
            axes,
            indexes,
            shape,
            coords,
            dtype: self.dtype,
            order,
            value,
            realized: Arc::default(),
        })
    }

    /// Same field with a new value laid out like the current one
    pub(crate) fn with_value(&self, value: Delayed) -> Field {
        Field {
            value: Some(value),
            chunks: self.chunks.fork(),
            realized: Arc::default(),
            ..self.clone()
        }
    }

    pub(crate) fn with_dtype(mut self, dtype: DType) -> Field {
        self.dtype = dtype;
        self
    }

    /// Node computing the value, zeros for an unbound field
    pub fn node(&self) -> Delayed {
        match &self.value {
            Some(value) => value.clone(),
            None => Delayed::new(
                Op::Fill {
                    shape: self.named_shape(),
                    order: self.order.clone(),
                    value: Complex64::new(0.0, 0.0),
                },
                Vec::new(),
            ),
        }
    }

    /// Index names with their sizes, in canonical order
    pub fn named_shape(&self) -> Shape {
        self.indexes
            .iter()
            .cloned()
            .zip(self.shape.iter().copied())
            .collect()
    }

    /// Rewrites the index names after `remove` are dropped from the field
    ///
    /// Returns the remaining axes, the renaming of the indexes whose numbering changed and
    /// the coordinates under the new names.
    pub(crate) fn without(&self, remove: &[String]) -> (Vec<String>, Rename, Coordinates) {
        let kept: Vec<&String> = self.indexes.iter().filter(|i| !remove.contains(i)).collect();
        let axes: Vec<String> = kept.iter().map(|i| index_axis(i).to_string()).collect();
        let renamed = indexes_of(&axes);
        let mut rename = Rename::new();
        let mut coords = Coordinates::new();
        for (old, new) in kept.iter().zip(&renamed) {
            if let Some(selection) = self.coords.get(old) {
                coords.insert(new.clone(), selection.clone());
            }
            if *old != new {
                rename.push(((*old).clone(), new.clone()));
            }
        }
        (axes, rename, coords)
    }

    pub(crate) fn require(&self, capability: Capability, operation: &str) -> Result<(), FieldError> {
        if self.capabilities().contains(&capability) {
            return Ok(());
        }
        Err(FieldError::MissingCapability {
            field_type: self.field_type(),
            capability: operation.to_string(),
        })
    }

    pub(crate) fn check_lattice(&self, other: &Field) -> Result<(), FieldError> {
        if self.lattice != other.lattice {
            return Err(FieldError::InvalidValue(format!(
                "fields live on different lattices: {} and {}",
                self.lattice, other.lattice
            )));
        }
        Ok(())
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Frozen lattice of the field
    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    pub fn axes(&self) -> &[String] {
        &self.axes
    }

    pub fn indexes(&self) -> &[String] {
        &self.indexes
    }

    /// Sizes of the indexes, in canonical order
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn bytes(&self) -> usize {
        self.size() * self.dtype.itemsize()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Coordinates restricting the indexes of the field
    pub fn coords(&self) -> &Coordinates {
        &self.coords
    }

    /// Distinct axes with their number of occurrences
    pub fn axis_counts(&self) -> Vec<(String, usize)> {
        let mut counts: IndexMap<&str, usize> = IndexMap::new();
        for axis in &self.axes {
            *counts.entry(axis.as_str()).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|(axis, count)| (axis.to_string(), count))
            .collect()
    }

    fn axes_in(&self, members: &IndexMap<String, impl Sized>) -> Vec<String> {
        let mut seen = HashSet::new();
        self.axes
            .iter()
            .filter(|axis| members.contains_key(*axis) && seen.insert(axis.as_str()))
            .cloned()
            .collect()
    }

    /// Lattice dimensions among the axes
    pub fn dims(&self) -> Vec<String> {
        self.axes_in(self.lattice.dims())
    }

    /// Degrees of freedom among the axes
    pub fn dofs(&self) -> Vec<String> {
        self.axes_in(self.lattice.dofs())
    }

    /// Label axes among the axes
    pub fn labels(&self) -> Vec<String> {
        self.axes_in(self.lattice.labels())
    }

    /// Field types the field is an instance of, the most specific first
    pub fn types(&self) -> Vec<String> {
        self.session
            .registry()
            .classify(&self.lattice, &self.axes)
            .into_iter()
            .map(String::from)
            .collect()
    }

    pub fn field_type(&self) -> Option<String> {
        self.types().into_iter().next()
    }

    pub fn is_instance(&self, name: &str) -> Result<bool, FieldError> {
        Ok(self
            .session
            .registry()
            .is_instance(&self.lattice, &self.axes, name)?)
    }

    pub fn capabilities(&self) -> BTreeSet<Capability> {
        self.session.registry().capabilities(&self.lattice, &self.axes)
    }

    pub fn state(&self) -> FieldState {
        if self.realized.get().is_some() {
            FieldState::Realized
        } else if self.value.is_none() {
            FieldState::Unbound
        } else if self.is_tunable() {
            FieldState::Tunable
        } else {
            FieldState::Tuned
        }
    }

    fn own_options(&self) -> impl Iterator<Item = &Arc<TunableOption>> {
        self.order.options().chain(std::iter::once(&self.chunks))
    }

    /// Options of the field: its layout and its chunks
    pub fn options(&self) -> Tunable {
        self.own_options()
            .map(|option| (option.name().to_string(), Arc::clone(option)))
            .collect()
    }

    pub fn set_option(&self, name: &str, value: impl Into<OptionValue>) -> Result<(), FieldError> {
        Ok(self.options().set(name, value.into())?)
    }

    /// Names of the options still to be tuned, the ones of the inputs included
    pub fn pending(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let graph = self.value.iter().flat_map(Delayed::options);
        self.own_options()
            .cloned()
            .chain(graph)
            .filter(|option| seen.insert(option.uid()) && !option.is_tuned())
            .map(|option| option.name().to_string())
            .collect()
    }

    pub fn is_tunable(&self) -> bool {
        !self.pending().is_empty()
    }

    /// Tunes the option `name` of the field, or every pending option when `None`
    pub fn tune(&self, name: Option<&str>, callback: Option<&TuneCallback>) -> Result<(), FieldError> {
        self.options().tune(name, callback)?;
        if name.is_none() {
            if let Some(value) = &self.value {
                value.tune(callback)?;
            }
        }
        Ok(())
    }

    /// Index names in physical order, once the layout is tuned
    pub fn ordered_indexes(&self) -> Result<Vec<String>, FieldError> {
        Ok(self.order.resolve()?)
    }

    /// Number of chunks the field is split in
    pub fn num_workers(&self) -> Result<usize, FieldError> {
        let chunks = match self.chunks.value().cloned() {
            Some(value) => value,
            None => self.chunks.resolver().default_value().unwrap_or_else(|| {
                OptionValue::Chunks(IndexMap::new())
            }),
        };
        let sizes: Vec<usize> = match &chunks {
            OptionValue::Chunks(map) => self
                .named_shape()
                .iter()
                .map(|(index, size)| map.get(index).copied().unwrap_or(*size))
                .collect(),
            other => {
                return Err(TuneError::IncompatibleValue {
                    option: "chunks".to_string(),
                    value: other.to_string(),
                }
                .into())
            }
        };
        Ok(ChunkPlan::new(self.shape.clone(), sizes)?.len())
    }

    /// Same field split in chunks of the given sizes, keyed by axes or indexes
    ///
    /// Indexes not mentioned stay in one chunk. The chunks of `self` are left untouched, and a
    /// field read from a file reads with the new chunks.
    pub fn rechunk<K: AsRef<str>>(&self, chunks: &[(K, usize)]) -> Result<Field, FieldError> {
        let mut sizes: IndexMap<String, usize> = self.named_shape().into_iter().collect();
        for (key, size) in chunks {
            for index in self.get_indexes(&[key.as_ref()])? {
                sizes.insert(index, *size);
            }
        }
        let option = TunableOption::tuned(
            "chunks",
            self.chunks.resolver().clone(),
            OptionValue::Chunks(sizes),
        )?;
        let field = match self.value.as_ref().map(Delayed::op) {
            Some(Op::Load {
                format,
                path,
                layout,
                to,
                ..
            }) => {
                let load = Op::Load {
                    format: Arc::clone(format),
                    path: path.clone(),
                    layout: layout.clone(),
                    chunks: Arc::clone(&option),
                    to: to.clone(),
                };
                self.with_value(Delayed::new(load, Vec::new()))
            }
            _ => self.clone(),
        };
        Ok(Field {
            chunks: option,
            ..field
        })
    }

    /// Independent copy of the field
    ///
    /// The layout options stay shared with the value. The chunks are copied.
    pub fn copy(&self) -> Field {
        Field {
            chunks: self.chunks.fork(),
            realized: Arc::new(self.realized.as_ref().clone()),
            ..self.clone()
        }
    }

    /// Copy with some options overridden
    ///
    /// `axes_order` and `<axis>_order` change the layout, `chunks` fixes the chunks.
    pub fn copy_with(&self, overrides: &[(&str, OptionValue)]) -> Result<Field, FieldError> {
        let mut field = self.copy();
        for (name, value) in overrides {
            field = match (*name, value) {
                ("axes_order", OptionValue::Names(order)) => field.reorder(order)?,
                ("chunks", OptionValue::Chunks(chunks)) => {
                    let chunks: Vec<(&String, usize)> = chunks.iter().map(|(k, v)| (k, *v)).collect();
                    field.rechunk(&chunks)?
                }
                (name, OptionValue::Indices(order)) if name.ends_with("_order") => {
                    let axis = name.trim_end_matches("_order");
                    field.reorder_label(axis, order)?
                }
                (name, value) if field.options().get(name).is_some() => {
                    return Err(TuneError::IncompatibleValue {
                        option: name.to_string(),
                        value: value.to_string(),
                    }
                    .into())
                }
                (name, _) => return Err(TuneError::UnknownOption(name.to_string()).into()),
            };
        }
        Ok(field)
    }

    /// Converts the values to `dtype`
    pub fn astype(&self, dtype: DType) -> Field {
        self.with_value(Delayed::new(Op::Map(UnaryOp::Cast(dtype)), vec![self.node()]))
            .with_dtype(dtype)
    }

    fn plan(&self, tune: bool, callback: Option<&TuneCallback>) -> Result<Arc<Plan>, FieldError> {
        if tune {
            self.tune(None, callback)?;
        } else {
            let pending = self.pending();
            if !pending.is_empty() {
                return Err(TuneError::NotTuned(pending).into());
            }
        }
        let canonical = IndexOrder::fixed(&self.indexes)?;
        let root = Delayed::new(
            Op::Permute {
                from: self.order.clone(),
                to: canonical,
                rename: Rename::new(),
            },
            vec![self.node()],
        );
        Ok(Arc::new(root.close()?))
    }

    fn store(&self, buffer: Buffer) -> Buffer {
        self.realized
            .get_or_init(|| Arc::new(buffer))
            .as_ref()
            .clone()
    }

    /// Tunes the pending options and realizes the value in canonical index order
    pub fn compute(&self) -> Result<Buffer, FieldError> {
        self.compute_with(true, None)
    }

    /// Realizes the value, tuning first when `tune` is set
    ///
    /// Without tuning, pending options make it fail with [`TuneError::NotTuned`].
    pub fn compute_with(
        &self,
        tune: bool,
        callback: Option<&TuneCallback>,
    ) -> Result<Buffer, FieldError> {
        if let Some(buffer) = self.realized.get() {
            return Ok(buffer.as_ref().clone());
        }
        let plan = self.plan(tune, callback)?;
        let buffer = self.session.engine().realize(plan)?;
        Ok(self.store(buffer))
    }

    /// Same as [`Field::compute`], evaluating on the current tokio runtime
    pub async fn compute_async(&self) -> Result<Buffer, FieldError> {
        if let Some(buffer) = self.realized.get() {
            return Ok(buffer.as_ref().clone());
        }
        let plan = self.plan(true, None)?;
        let buffer = realize_async(plan).await?;
        Ok(self.store(buffer))
    }
}

/// Builder of new fields, see [`Session::field`]
#[derive(Debug)]
pub struct FieldBuilder {
    session: Arc<Session>,
    axes: Vec<String>,
    lattice: Option<Lattice>,
    source: Option<Buffer>,
    dtype: DType,
    order: Option<Vec<String>>,
    chunks: Vec<(String, usize)>,
}

impl FieldBuilder {
    pub(crate) fn new<S: AsRef<str>>(session: Arc<Session>, axes: &[S]) -> Self {
        FieldBuilder {
            session,
            axes: axes.iter().map(|a| a.as_ref().to_string()).collect(),
            lattice: None,
            source: None,
            dtype: DType::default(),
            order: None,
            chunks: Vec::new(),
        }
    }

    /// Lattice of the field, the session one by default
    pub fn lattice(mut self, lattice: &Lattice) -> Self {
        self.lattice = Some(lattice.clone());
        self
    }

    /// Initial value, in canonical index order
    pub fn source(mut self, buffer: Buffer) -> Self {
        self.source = Some(buffer);
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Layout, as a permutation of the axes or of the indexes
    pub fn order<S: AsRef<str>>(mut self, order: &[S]) -> Self {
        self.order = Some(order.iter().map(|s| s.as_ref().to_string()).collect());
        self
    }

    pub fn chunks<K: AsRef<str>>(mut self, chunks: &[(K, usize)]) -> Self {
        self.chunks = chunks
            .iter()
            .map(|(key, size)| (key.as_ref().to_string(), *size))
            .collect();
        self
    }

    pub fn build(self) -> Result<Field, FieldError> {
        let lattice = match self.lattice.as_ref().or_else(|| self.session.lattice()) {
            Some(lattice) => lattice.freeze(),
            None => return Err(FieldError::NoLattice),
        };
        let axes = expand_axes(&lattice, &self.axes)?;
        let indexes = indexes_of(&axes);
        let coords = Coordinates::new();
        let shape = shape_of(&lattice, &indexes, &coords)?;
        let tunable = IndexOrder::tunable(&axes);
        let order = match &self.order {
            Some(order) => layout(&tunable, &axes, &indexes, order)?,
            None => tunable,
        };
        let value = match self.source {
            Some(buffer) => {
                if buffer.shape() != shape.as_slice() {
                    return Err(FieldError::ShapeMismatch {
                        expected: shape,
                        found: buffer.shape().to_vec(),
                    });
                }
                let mut node = Delayed::source(buffer);
                if !self.dtype.is_complex() {
                    node = Delayed::new(Op::Map(UnaryOp::Cast(self.dtype)), vec![node]);
                }
                Some(Delayed::new(
                    Op::Permute {
                        from: IndexOrder::fixed(&indexes)?,
                        to: order.clone(),
                        rename: Rename::new(),
                    },
                    vec![node],
                ))
            }
            None => None,
        };
        let field = Field {
            session: self.session,
            chunks: chunks_option(&indexes, &shape),
            lattice,
            axes,
            indexes,
            shape,
            coords,
            dtype: self.dtype,
            order,
            value,
            realized: Arc::default(),
        };
        if self.chunks.is_empty() {
            Ok(field)
        } else {
            field.rechunk(&self.chunks)
        }
    }
}

/// Axes named by the tokens, in order
fn expand_axes(lattice: &Lattice, tokens: &[String]) -> Result<Vec<String>, FieldError> {
    let unknown = |error: LatticeError| match error {
        LatticeError::UnknownKey(key) => FieldError::UnknownAxis(key),
        other => other.into(),
    };
    let mut axes = Vec::new();
    for token in tokens {
        for label in Axes::parse([token.as_str()])?.expand() {
            for axis in lattice.expand([&label]).map_err(unknown)? {
                if !lattice.is_axis(&axis) {
                    return Err(FieldError::UnknownAxis(axis));
                }
                axes.push(axis);
            }
        }
    }
    Ok(axes)
}

#[cfg(test)]
mod field_test {
    use super::*;
    use crate::lattice::LatticeValue;
    use ndarray::{ArrayD, IxDyn};

    fn session() -> Arc<Session> {
        let mut lattice = Lattice::default();
        lattice.set("space", LatticeValue::Size(2)).unwrap();
        lattice.set("time", LatticeValue::Size(3)).unwrap();
        Session::builder().lattice(lattice).build()
    }

    #[test]
    fn construction() {
        let field = session().field(&["dims", "dofs", "dofs"]).build().unwrap();
        assert_eq!(field.axes().len(), 8);
        assert_eq!(
            field.indexes(),
            &["t", "x", "y", "z", "spin_0", "color_0", "spin_1", "color_1"]
        );
        assert_eq!(field.size(), 3 * 2 * 2 * 2 * 12 * 12);
        assert_eq!(field.bytes(), field.size() * 16);
        assert_eq!(field.state(), FieldState::Unbound);
        assert_eq!(field.dims(), vec!["t", "x", "y", "z"]);
        assert_eq!(field.dofs(), vec!["spin", "color"]);
    }

    #[test]
    fn unknown_axes_and_sources() {
        let session = session();
        assert!(matches!(
            session.field(&["flavor"]).build(),
            Err(FieldError::UnknownAxis(axis)) if axis == "flavor"
        ));
        assert!(matches!(
            session.field(&["color!"]).source(ArrayD::zeros(IxDyn(&[4]))).build(),
            Err(FieldError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            Session::new().field(&["color"]).build(),
            Err(FieldError::NoLattice)
        ));
    }

    #[test]
    fn states() {
        let field = session().field(&["color"]).build().unwrap().ones();
        assert_eq!(field.state(), FieldState::Tunable);
        assert_eq!(field.pending(), vec!["axes_order", "chunks"]);
        field.tune(None, None).unwrap();
        assert_eq!(field.state(), FieldState::Tuned);
        field.compute().unwrap();
        assert_eq!(field.state(), FieldState::Realized);
        assert_eq!(field.copy().state(), FieldState::Realized);
    }

    #[test]
    fn compute_without_tuning() {
        let field = session().field(&["spin"]).build().unwrap().ones();
        assert!(matches!(
            field.compute_with(false, None),
            Err(FieldError::Tune(TuneError::NotTuned(_)))
        ));
        let callback = |_: &str, value: &OptionValue| value.clone();
        assert_eq!(field.compute_with(true, Some(&callback)).unwrap().len(), 4);
    }

    #[test]
    fn chunks_and_workers() {
        let field = session().field(&["dims"]).build().unwrap();
        assert_eq!(field.num_workers().unwrap(), 1);
        let chunked = field.rechunk(&[("space", 1)]).unwrap();
        assert_eq!(chunked.num_workers().unwrap(), 8);
        assert_eq!(field.num_workers().unwrap(), 1);
        assert!(field.options().value("chunks").unwrap().is_none());

        let by_time = field.ones().rechunk(&[("t", 1)]).unwrap();
        assert_eq!(by_time.num_workers().unwrap(), 3);
        assert_eq!(field.rechunk(&[("t", 2)]).unwrap().num_workers().unwrap(), 2);
        assert!(field.rechunk(&[("t", 0)]).is_err());
    }

    #[test]
    fn copies() {
        let field = session().field(&["dims", "color"]).build().unwrap();
        let copy = field.copy();
        assert_eq!(copy.axes(), field.axes());
        assert_eq!(copy, field);

        let reordered = field
            .copy_with(&[("axes_order", vec!["color", "t", "x", "y", "z"].into())])
            .unwrap();
        assert_eq!(reordered.ordered_indexes().unwrap()[0], "color");
        assert!(matches!(
            field.copy_with(&[("flavor_order", OptionValue::Int(1))]),
            Err(FieldError::Tune(TuneError::UnknownOption(_)))
        ));
    }

    #[test]
    fn sources_are_kept_in_canonical_order() {
        let session = session();
        let values: Vec<Complex64> = (0..12).map(|v| Complex64::new(v as f64, 0.0)).collect();
        let buffer = ArrayD::from_shape_vec(IxDyn(&[4, 3]), values).unwrap();
        let field = session
            .field(&["spin", "color"])
            .source(buffer.clone())
            .order(&["color", "spin"])
            .build()
            .unwrap();
        assert_eq!(field.ordered_indexes().unwrap(), vec!["color", "spin"]);
        assert_eq!(field.compute().unwrap(), buffer);
    }
}
