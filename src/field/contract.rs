use std::collections::HashMap;

use indexmap::IndexMap;

use crate::axes::{index_axis, index_name, indexes_of};
use crate::buffer::DType;
use crate::coordinates::{Coordinates, Selection};
use crate::errors::FieldError;
use crate::graph::{Delayed, IndexOrder, Op};
use crate::types::Capability;

use super::Field;

/// Contraction symbols of every occurrence of each axis, for [`Field::einsum`]
pub type Indices = IndexMap<String, Vec<usize>>;

/// Which axes [`Field::dot`] contracts
///
/// With neither `closed` nor `open` given the degrees of freedom are contracted. Axes
/// that are neither closed, open nor reduced are free: shared by every field and kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DotOptions {
    pub closed: Option<Vec<String>>,
    pub open: Vec<String>,
    pub reduced: Vec<String>,
    pub trace: bool,
    pub average: bool,
}

impl DotOptions {
    pub fn new() -> Self {
        DotOptions::default()
    }

    /// Axes contracted between consecutive fields
    pub fn closed<S: AsRef<str>>(mut self, keys: &[S]) -> Self {
        self.closed = Some(keys.iter().map(|k| k.as_ref().to_string()).collect());
        self
    }

    /// Axes kept from every field, as an outer product
    pub fn open<S: AsRef<str>>(mut self, keys: &[S]) -> Self {
        self.open = keys.iter().map(|k| k.as_ref().to_string()).collect();
        self
    }

    /// Axes shared by every field and summed over, missing from the result
    pub fn reduced<S: AsRef<str>>(mut self, keys: &[S]) -> Self {
        self.reduced = keys.iter().map(|k| k.as_ref().to_string()).collect();
        self
    }

    /// Also contracts the closed axes left twice in the result
    pub fn trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Averages over the reduced axes instead of summing
    pub fn average(mut self, average: bool) -> Self {
        self.average = average;
        self
    }
}

fn expand_keys(field: &Field, keys: &[String]) -> Result<Vec<String>, FieldError> {
    let mut axes = Vec::new();
    for key in keys {
        let expanded = field
            .lattice
            .expand([key])
            .map_err(|_| FieldError::UnknownKey(key.clone()))?;
        for axis in expanded {
            if !axes.contains(&axis) {
                axes.push(axis);
            }
        }
    }
    Ok(axes)
}

/// Hands out fresh contraction symbols
#[derive(Default)]
struct Symbols(usize);

impl Symbols {
    fn take(&mut self, count: usize) -> Vec<usize> {
        let symbols = (self.0..self.0 + count).collect();
        self.0 += count;
        symbols
    }
}

/// Contracts the closed axes left twice in `output`
///
/// The last symbol of the axis is tied to the first one. Fields are rewritten from the
/// last one, so the contraction closes the chain of products.
fn close_traces(indices: &mut [Indices], output: &mut Indices, closed: &[String]) {
    for axis in closed {
        let symbols = match output.get(axis) {
            Some(symbols) if symbols.len() > 1 => symbols.clone(),
            _ => continue,
        };
        let (first, last) = (symbols[0], symbols[symbols.len() - 1]);
        if symbols.len() == 2 {
            output.shift_remove(axis);
        } else {
            output.insert(axis.clone(), symbols[1..symbols.len() - 1].to_vec());
        }
        for field in indices.iter_mut().rev() {
            if let Some(symbols) = field.get_mut(axis) {
                if symbols.last() == Some(&last) {
                    if let Some(symbol) = symbols.last_mut() {
                        *symbol = first;
                    }
                    break;
                }
            }
        }
    }
}

impl Field {
    fn operands<'a>(&'a self, others: &[&'a Field]) -> Result<Vec<&'a Field>, FieldError> {
        let fields: Vec<&Field> = std::iter::once(self).chain(others.iter().copied()).collect();
        for other in others {
            self.check_lattice(other)?;
        }
        Ok(fields)
    }

    /// Contracts the field with `others`, from left to right
    ///
    /// For every closed axis, the outermost index of the left operand is summed with the
    /// innermost index of the right one, like a matrix product. Free axes must have the
    /// same number of indexes in every field that has them.
    ///
    /// ```
    /// use latfield::field::DotOptions;
    /// use latfield::lattice::Lattice;
    /// use latfield::session::Session;
    ///
    /// let session = Session::builder().lattice(Lattice::default()).build();
    /// let gauge = session.field(&["color", "color"]).build().unwrap().ones();
    /// let product = gauge.dot(&[&gauge], &DotOptions::new().closed(&["color"])).unwrap();
    /// assert_eq!(product.indexes(), &["color_0", "color_1"]);
    /// assert_eq!(product.compute().unwrap()[[0, 0]].re, 3.0);
    /// ```
    pub fn dot(&self, others: &[&Field], options: &DotOptions) -> Result<Field, FieldError> {
        let fields = self.operands(others)?;
        let reduced = expand_keys(self, &options.reduced)?;
        let closed = match (&options.closed, options.open.is_empty()) {
            (Some(closed), _) => expand_keys(self, closed)?,
            (None, true) => expand_keys(self, &["dofs".to_string()])?
                .into_iter()
                .filter(|axis| !reduced.contains(axis))
                .collect(),
            (None, false) => Vec::new(),
        };
        let open = expand_keys(self, &options.open)?;
        if let Some(axis) = open.iter().find(|axis| closed.contains(axis)) {
            return Err(FieldError::InvalidValue(format!(
                "{axis:?} cannot be both closed and open"
            )));
        }
        if let Some(axis) = reduced
            .iter()
            .find(|axis| closed.contains(axis) || open.contains(axis))
        {
            return Err(FieldError::InvalidValue(format!(
                "{axis:?} cannot be reduced and also closed or open"
            )));
        }

        let mut free: IndexMap<String, usize> = IndexMap::new();
        for field in &fields {
            for (axis, count) in field.axis_counts() {
                if closed.contains(&axis) || open.contains(&axis) {
                    continue;
                }
                let known = *free.entry(axis.clone()).or_insert(count);
                if known != count {
                    return Err(FieldError::InvalidValue(format!(
                        "free axis {axis:?} has {known} indexes in one field and {count} in another"
                    )));
                }
            }
        }

        let mut symbols = Symbols::default();
        let mut shared: HashMap<String, Vec<usize>> = HashMap::new();
        let mut output = Indices::new();
        let mut indices = Vec::with_capacity(fields.len());
        for field in &fields {
            let mut these = Indices::new();
            for (axis, count) in field.axis_counts() {
                let assigned = if free.contains_key(&axis) {
                    match shared.get(&axis) {
                        Some(assigned) => assigned.clone(),
                        None => {
                            let assigned = symbols.take(count);
                            shared.insert(axis.clone(), assigned.clone());
                            if !reduced.contains(&axis) {
                                output.insert(axis.clone(), assigned.clone());
                            }
                            assigned
                        }
                    }
                } else if open.contains(&axis) {
                    let assigned = symbols.take(count);
                    output.entry(axis.clone()).or_default().extend(&assigned);
                    assigned
                } else {
                    match output.get(&axis).and_then(|current| current.last().copied()) {
                        None => {
                            let assigned = symbols.take(count);
                            output.insert(axis.clone(), assigned.clone());
                            assigned
                        }
                        Some(outer) => {
                            let fresh = symbols.take(count - 1);
                            let mut empty = false;
                            if let Some(current) = output.get_mut(&axis) {
                                current.pop();
                                current.extend(&fresh);
                                empty = current.is_empty();
                            }
                            if empty {
                                output.shift_remove(&axis);
                            }
                            std::iter::once(outer).chain(fresh).collect()
                        }
                    }
                };
                these.insert(axis, assigned);
            }
            indices.push(these);
        }
        if options.trace {
            close_traces(&mut indices, &mut output, &closed);
        }
        let result = self.einsum(others, &indices, &output)?;
        if !options.average {
            return Ok(result);
        }
        let mut volume = 1usize;
        for axis in &reduced {
            if let Some(field) = fields.iter().find(|field| field.axes.contains(axis)) {
                volume *= field
                    .indexes
                    .iter()
                    .zip(&field.shape)
                    .filter(|(index, _)| index_axis(index) == axis.as_str())
                    .map(|(_, size)| *size)
                    .product::<usize>();
            }
        }
        Ok(result.scale(1.0 / volume as f64))
    }

    /// Contracts the given axes, the degrees of freedom when none are given
    ///
    /// Each axis must be repeated: its first and last indexes are summed together.
    pub fn trace<S: AsRef<str>>(&self, keys: &[S]) -> Result<Field, FieldError> {
        self.require(Capability::DofContraction, "trace")?;
        let options = if keys.is_empty() {
            DotOptions::new().trace(true)
        } else {
            DotOptions::new().closed(keys).trace(true)
        };
        let closed = match &options.closed {
            Some(keys) => expand_keys(self, keys)?,
            None => expand_keys(self, &["dofs".to_string()])?,
        };
        for (axis, count) in self.axis_counts() {
            if closed.contains(&axis) && count < 2 {
                return Err(FieldError::InvalidValue(format!(
                    "cannot trace {axis:?} with {count} index"
                )));
            }
        }
        self.dot(&[], &options)
    }

    /// Sum of products with explicit contraction symbols
    ///
    /// `indices` gives the symbols of every occurrence of each axis of the field and of
    /// `others`, in this order, and `output` the symbols of the result. Symbols missing
    /// from `output` are summed over.
    pub fn einsum(
        &self,
        others: &[&Field],
        indices: &[Indices],
        output: &Indices,
    ) -> Result<Field, FieldError> {
        let fields = self.operands(others)?;
        if indices.len() != fields.len() {
            return Err(FieldError::InvalidValue(format!(
                "got symbols for {} fields, expected {}",
                indices.len(),
                fields.len()
            )));
        }

        // symbol -> (axis, selection) it is bound to
        let mut bound: HashMap<usize, (String, Selection)> = HashMap::new();
        let mut inputs = Vec::with_capacity(fields.len());
        for (field, symbols) in fields.iter().zip(indices) {
            let counts = field.axis_counts();
            if counts.len() != symbols.len() {
                return Err(FieldError::InvalidValue(format!(
                    "symbols {symbols:?} do not cover the axes {:?}",
                    field.axes
                )));
            }
            let mut tagged = Vec::with_capacity(field.indexes.len());
            for (axis, count) in counts {
                let assigned = match symbols.get(&axis) {
                    Some(assigned) if assigned.len() == count => assigned,
                    _ => {
                        return Err(FieldError::InvalidValue(format!(
                            "axis {axis:?} needs {count} symbols, got {:?}",
                            symbols.get(&axis)
                        )))
                    }
                };
                for (k, symbol) in assigned.iter().enumerate() {
                    let index = index_name(&axis, k, count);
                    let extent = field.extent(&index)?;
                    let selection = field.coords.selection(&index).normalized(extent);
                    match bound.get(symbol) {
                        Some((other, known)) if *other != axis || *known != selection => {
                            return Err(FieldError::InvalidValue(format!(
                                "symbol {symbol} joins {index:?} with a different index of {other:?}"
                            )))
                        }
                        Some(_) => {}
                        None => {
                            bound.insert(*symbol, (axis.clone(), selection));
                        }
                    }
                    tagged.push((index, *symbol));
                }
            }
            inputs.push((field.order.clone(), tagged));
        }

        let mut axes = Vec::new();
        let mut used = Vec::new();
        for (axis, symbols) in output {
            for symbol in symbols {
                match bound.get(symbol) {
                    Some((other, _)) if other == axis && !used.contains(symbol) => {
                        used.push(*symbol)
                    }
                    _ => {
                        return Err(FieldError::InvalidValue(format!(
                            "output symbol {symbol} of {axis:?} is not an input index of that axis, or is repeated"
                        )))
                    }
                }
                axes.push(axis.clone());
            }
        }
        let indexes = indexes_of(&axes);
        let mut coords = Coordinates::new();
        let mut tagged = Vec::with_capacity(indexes.len());
        for (index, symbol) in indexes.iter().zip(&used) {
            if let Some((_, selection)) = bound.get(symbol) {
                if !selection.is_all() {
                    coords.insert(index.clone(), selection.clone());
                }
            }
            tagged.push((index.clone(), *symbol));
        }

        let order = IndexOrder::tunable(&axes);
        let value = Delayed::new(
            Op::Contract {
                inputs,
                output: tagged,
                to: order.clone(),
            },
            fields.iter().map(|field| field.node()).collect(),
        );
        let dtype = if fields.iter().all(|field| field.dtype == DType::Float64) {
            DType::Float64
        } else {
            DType::Complex128
        };
        Ok(self
            .derive(axes, coords, order, Some(value))?
            .with_dtype(dtype))
    }
}

#[cfg(test)]
mod contract_test {
    use super::*;
    use crate::lattice::{Lattice, LatticeValue};
    use crate::session::Session;
    use crate::types::TypeRegistry;
    use ndarray::{array, ArrayD, Ix2};
    use num_complex::Complex64;
    use std::sync::Arc;

    fn lattice() -> Lattice {
        let mut lattice = Lattice::default();
        lattice.set("space", LatticeValue::Size(2)).unwrap();
        lattice.set("time", LatticeValue::Size(2)).unwrap();
        lattice
    }

    fn session() -> Arc<Session> {
        Session::builder().lattice(lattice()).build()
    }

    fn c(re: f64) -> Complex64 {
        Complex64::new(re, 0.0)
    }

    fn matrix(values: [[f64; 3]; 3]) -> ArrayD<Complex64> {
        ndarray::Array2::from_shape_fn((3, 3), |(i, j)| c(values[i][j])).into_dyn()
    }

    fn gauge(session: &Arc<Session>, values: [[f64; 3]; 3]) -> Field {
        session
            .field(&["color", "color"])
            .source(matrix(values))
            .build()
            .unwrap()
    }

    const A: [[f64; 3]; 3] = [[1., 2., 0.], [0., 1., 3.], [4., 0., 1.]];
    const B: [[f64; 3]; 3] = [[2., 0., 1.], [1., 1., 0.], [0., 5., 1.]];

    #[test]
    fn vector_dot_product() {
        let session = session();
        let a = session.field(&["color"]).source(array![c(1.), c(2.), c(3.)].into_dyn()).build().unwrap();
        let b = session.field(&["color"]).source(array![c(4.), c(5.), c(6.)].into_dyn()).build().unwrap();
        let dot = a.dot(&[&b], &DotOptions::new().closed(&["color"])).unwrap();
        assert!(dot.indexes().is_empty());
        assert_eq!(dot.compute().unwrap().sum(), c(32.));

        let outer = a.dot(&[&b], &DotOptions::new().open(&["color"])).unwrap();
        assert_eq!(outer.indexes(), &["color_0", "color_1"]);
        assert_eq!(outer.compute().unwrap()[[2, 0]], c(12.));
    }

    #[test]
    fn matrix_products() {
        let session = session();
        let (a, b) = (gauge(&session, A), gauge(&session, B));
        let expected = matrix(A).into_dimensionality::<Ix2>().unwrap()
            .dot(&matrix(B).into_dimensionality::<Ix2>().unwrap());

        let product = a.dot(&[&b], &DotOptions::new().closed(&["color"])).unwrap();
        assert_eq!(product.compute().unwrap(), expected.clone().into_dyn());

        let trace = a.dot(&[&b], &DotOptions::new().closed(&["color"]).trace(true)).unwrap();
        assert!(trace.indexes().is_empty());
        assert_eq!(trace.compute().unwrap().sum(), expected.diag().sum());
    }

    #[test]
    fn free_axes_are_shared() {
        let session = session();
        let sites = session.field(&["dims", "color"]).build().unwrap().ones();
        let links = session.field(&["dims", "color", "color"]).build().unwrap().ones();
        let result = links.dot(&[&sites], &DotOptions::new().closed(&["color"])).unwrap();
        assert_eq!(result.indexes(), &["t", "x", "y", "z", "color"]);
        assert!(result.compute().unwrap().iter().all(|v| *v == c(3.)));

        let spins = session.field(&["spin", "spin"]).build().unwrap();
        let vector = session.field(&["spin", "color"]).build().unwrap();
        assert!(matches!(
            spins.dot(&[&vector], &DotOptions::new().closed(&["color"])),
            Err(FieldError::InvalidValue(_))
        ));
        assert!(matches!(
            sites.dot(&[&sites], &DotOptions::new().closed(&["color"]).open(&["color"])),
            Err(FieldError::InvalidValue(_))
        ));
    }

    #[test]
    fn reduced_axes_are_summed_or_averaged() {
        let session = session();
        let quark = session.field(&["dims", "spin", "color"]).build().unwrap().random(8);
        let options = DotOptions::new().closed(&["color"]).reduced(&["space"]);
        let reduced = quark.dot(&[&quark.conj()], &options).unwrap();
        assert_eq!(reduced.indexes(), &["t", "spin"]);

        let two_steps = quark
            .dot(&[&quark.conj()], &DotOptions::new().closed(&["color"]))
            .unwrap()
            .sum(&["space"])
            .unwrap()
            .compute()
            .unwrap();
        let summed = reduced.compute().unwrap();
        assert!(summed.iter().zip(&two_steps).all(|(a, b)| (*a - *b).norm() < 1e-12));

        let averaged = quark
            .dot(&[&quark.conj()], &options.clone().average(true))
            .unwrap()
            .compute()
            .unwrap();
        assert!(averaged
            .iter()
            .zip(&summed)
            .all(|(a, b)| (*a * 8.0 - *b).norm() < 1e-12));

        assert!(matches!(
            quark.dot(&[&quark], &DotOptions::new().closed(&["color"]).reduced(&["color"])),
            Err(FieldError::InvalidValue(_))
        ));
    }

    #[test]
    fn single_field_trace() {
        let session = session();
        let a = gauge(&session, A);
        assert_eq!(a.trace(&["color"]).unwrap().compute().unwrap().sum(), c(3.));
        assert_eq!(a.trace::<&str>(&[]).unwrap().compute().unwrap().sum(), c(3.));
        let vector = session.field(&["color"]).build().unwrap();
        assert!(matches!(vector.trace(&["color"]), Err(FieldError::InvalidValue(_))));

        let bare = Session::builder()
            .registry(TypeRegistry::empty())
            .lattice(lattice())
            .build();
        let untyped = gauge(&bare, A);
        assert!(matches!(
            untyped.trace(&["color"]),
            Err(FieldError::MissingCapability { .. })
        ));
    }

    #[test]
    fn explicit_symbols() {
        let session = session();
        let a = gauge(&session, A);
        let indices: Vec<Indices> = vec![[("color".to_string(), vec![0, 1])].into_iter().collect()];
        let output: Indices = [("color".to_string(), vec![1, 0])].into_iter().collect();
        let transposed = a.einsum(&[], &indices, &output).unwrap();
        assert_eq!(transposed.compute().unwrap(), matrix(A).t().to_owned());

        let wrong: Vec<Indices> = vec![[("color".to_string(), vec![0])].into_iter().collect()];
        assert!(matches!(
            a.einsum(&[], &wrong, &Indices::new()),
            Err(FieldError::InvalidValue(_))
        ));
        let unknown: Indices = [("color".to_string(), vec![7])].into_iter().collect();
        assert!(matches!(
            a.einsum(&[], &indices, &unknown),
            Err(FieldError::InvalidValue(_))
        ));
    }

    #[test]
    fn restricted_operands_keep_coordinates() {
        let session = session();
        let a = gauge(&session, A)
            .get(&crate::coordinates::Filters::new().with("color_0", [0, 2]))
            .unwrap();
        let b = gauge(&session, B);
        let product = a.dot(&[&b], &DotOptions::new().closed(&["color"])).unwrap();
        assert_eq!(product.shape(), &[2, 3]);
        assert!(product.coords().get("color_0").is_some());
        let full = gauge(&session, A).dot(&[&b], &DotOptions::new().closed(&["color"])).unwrap();
        let expected = full.compute().unwrap();
        assert_eq!(product.compute().unwrap()[[1, 2]], expected[[2, 2]]);
    }
}
