//! Delayed computations
//!
//! Field operations do not touch any data: they append a node to a [`Delayed`] graph. The
//! nodes refer to the physical layout of their operands through [`IndexOrder`]s, which stay
//! open parameters until every option they depend on has been tuned. [`Delayed::close`]
//! then binds all of them and produces a [`Plan`], a topologically ordered list of steps
//! that an [`Engine`](crate::engine::Engine) evaluates.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use indexmap::IndexMap;
use num_complex::Complex64;
use tracing::debug;

use crate::axes::{index_axis, index_name};
use crate::buffer::{Buffer, DType};
use crate::errors::{FieldError, TuneError};
use crate::io::{ChunkPlan, Format};
use crate::kernels;
use crate::tunable::{OptionValue, Resolver, TunableOption, TuneCallback};

static NEXT_NODE: AtomicU64 = AtomicU64::new(0);

/// Index names with their sizes
pub type Shape = Vec<(String, usize)>;

/// Pairs of (old, new) index names, applied simultaneously
pub type Rename = Vec<(String, String)>;

/// Physical layout of a buffer
///
/// The layout is decided by an `axes_order` permutation of the axes and, for every
/// repeated axis, an `<axis>_order` permutation telling which index each occurrence is.
/// With axes `[x, color, color]`, `axes_order = [color, x, color]` and
/// `color_order = [1, 0]` the buffer is laid out as `[color_1, x, color_0]`.
#[derive(Debug, Clone)]
pub struct IndexOrder {
    axes: Arc<TunableOption>,
    labels: Vec<(String, Arc<TunableOption>)>,
}

impl IndexOrder {
    /// Order with every option still to be tuned
    pub fn tunable<S: AsRef<str>>(axes: &[S]) -> IndexOrder {
        let names: Vec<String> = axes.iter().map(|a| a.as_ref().to_string()).collect();
        let labels = repeated(&names)
            .into_iter()
            .map(|(axis, count)| {
                let option =
                    TunableOption::new(format!("{axis}_order"), Resolver::permutation_of(count));
                (axis, option)
            })
            .collect();
        IndexOrder {
            axes: TunableOption::new("axes_order", Resolver::permutation(&names)),
            labels,
        }
    }

    /// Order fixed to the given sequence of index names
    pub fn fixed<S: AsRef<str>>(indexes: &[S]) -> Result<IndexOrder, TuneError> {
        let axes: Vec<String> = indexes
            .iter()
            .map(|index| index_axis(index.as_ref()).to_string())
            .collect();
        let axes_option = TunableOption::tuned(
            "axes_order",
            Resolver::permutation(&axes),
            OptionValue::Names(axes.clone()),
        )?;
        let mut labels = Vec::new();
        for (axis, count) in repeated(&axes) {
            let positions = indexes
                .iter()
                .map(|index| index.as_ref())
                .filter(|index| index_axis(index) == axis)
                .map(index_position)
                .collect::<Result<Vec<_>, _>>()?;
            let option = TunableOption::tuned(
                format!("{axis}_order"),
                Resolver::permutation_of(count),
                OptionValue::Indices(positions),
            )?;
            labels.push((axis, option));
        }
        Ok(IndexOrder {
            axes: axes_option,
            labels,
        })
    }

    pub fn axes_option(&self) -> &Arc<TunableOption> {
        &self.axes
    }

    pub fn label_option(&self, axis: &str) -> Option<&Arc<TunableOption>> {
        self.labels
            .iter()
            .find(|(label, _)| label == axis)
            .map(|(_, option)| option)
    }

    /// Same order with a different `axes_order` option
    pub fn with_axes(&self, option: Arc<TunableOption>) -> IndexOrder {
        IndexOrder {
            axes: option,
            labels: self.labels.clone(),
        }
    }

    /// Same order with a different `<axis>_order` option
    pub fn with_label(&self, axis: &str, option: Arc<TunableOption>) -> IndexOrder {
        let mut order = self.clone();
        match order.labels.iter_mut().find(|(label, _)| label == axis) {
            Some((_, current)) => *current = option,
            None => order.labels.push((axis.to_string(), option)),
        }
        order
    }

    pub fn options(&self) -> impl Iterator<Item = &Arc<TunableOption>> {
        std::iter::once(&self.axes).chain(self.labels.iter().map(|(_, option)| option))
    }

    pub fn is_tuned(&self) -> bool {
        self.options().all(|option| option.is_tuned())
    }

    /// Index names in physical order
    pub fn resolve(&self) -> Result<Vec<String>, TuneError> {
        let axes = match self.axes.value() {
            Some(OptionValue::Names(axes)) => axes,
            Some(other) => return Err(incompatible(&self.axes, other)),
            None => return Err(TuneError::NotTuned(vec![self.axes.name().to_string()])),
        };
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut indexes = Vec::with_capacity(axes.len());
        for axis in axes {
            let k = seen.entry(axis.as_str()).or_default();
            match self.label_option(axis) {
                None => indexes.push(axis.clone()),
                Some(option) => {
                    let order = match option.value() {
                        Some(OptionValue::Indices(order)) => order,
                        Some(other) => return Err(incompatible(option, other)),
                        None => return Err(TuneError::NotTuned(vec![option.name().to_string()])),
                    };
                    let position = order
                        .get(*k)
                        .copied()
                        .ok_or_else(|| incompatible(option, &OptionValue::Indices(order.clone())))?;
                    indexes.push(index_name(axis, position, order.len()));
                }
            }
            *k += 1;
        }
        Ok(indexes)
    }
}

fn incompatible(option: &TunableOption, value: &OptionValue) -> TuneError {
    TuneError::IncompatibleValue {
        option: option.name().to_string(),
        value: value.to_string(),
    }
}

fn repeated(axes: &[String]) -> Vec<(String, usize)> {
    let mut counts: IndexMap<&str, usize> = IndexMap::new();
    for axis in axes {
        *counts.entry(axis.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(axis, count)| (axis.to_string(), count))
        .collect()
}

fn index_position(index: &str) -> Result<usize, TuneError> {
    index
        .rsplit_once('_')
        .and_then(|(_, position)| position.parse().ok())
        .ok_or_else(|| TuneError::IncompatibleValue {
            option: "indexes_order".to_string(),
            value: index.to_string(),
        })
}

/// Element-wise operation on a single buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Conj,
    Neg,
    Real,
    Imag,
    Scale(Complex64),
    Cast(DType),
}

impl UnaryOp {
    pub fn apply(&self, value: Complex64) -> Complex64 {
        match self {
            UnaryOp::Conj => value.conj(),
            UnaryOp::Neg => -value,
            UnaryOp::Real => Complex64::new(value.re, 0.0),
            UnaryOp::Imag => Complex64::new(value.im, 0.0),
            UnaryOp::Scale(factor) => value * factor,
            UnaryOp::Cast(dtype) => dtype.cast(value),
        }
    }
}

/// Element-wise operation between two buffers with the same indexes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn apply(&self, left: Complex64, right: Complex64) -> Complex64 {
        match self {
            BinaryOp::Add => left + right,
            BinaryOp::Sub => left - right,
            BinaryOp::Mul => left * right,
            BinaryOp::Div => left / right,
        }
    }
}

type KernelFn = dyn Fn(&[&Buffer]) -> anyhow::Result<Buffer> + Send + Sync;

/// Caller supplied function evaluated on the buffers of its dependencies
#[derive(Clone)]
pub struct Kernel(Arc<KernelFn>);

impl Kernel {
    pub fn call(&self, inputs: &[&Buffer]) -> anyhow::Result<Buffer> {
        (self.0)(inputs)
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Kernel")
    }
}

/// Operation of a graph node
///
/// `O` describes the layouts the operation works with: an open [`IndexOrder`] in the
/// symbolic graph, the resolved index names once closed. Inputs are the dependencies of
/// the node, in order.
#[derive(Debug, Clone)]
pub enum Op<O> {
    Source(Arc<Buffer>),
    Fill {
        shape: Shape,
        order: O,
        value: Complex64,
    },
    /// Uniform values generated in the order of `shape`
    Random {
        shape: Shape,
        order: O,
        seed: u64,
    },
    Permute {
        from: O,
        to: O,
        rename: Rename,
    },
    /// Keeps the given local positions of some indexes
    Select {
        order: O,
        picks: Vec<(String, Vec<usize>)>,
    },
    /// Writes the second input into the given positions of the first
    Assign {
        target: O,
        value: O,
        picks: Vec<(String, Vec<usize>)>,
    },
    Squeeze {
        from: O,
        to: O,
        remove: Vec<String>,
        rename: Rename,
    },
    Extend {
        from: O,
        to: O,
        new: Shape,
        rename: Rename,
    },
    /// Sum of products, every index tagged by a contraction symbol
    Contract {
        inputs: Vec<(O, Vec<(String, usize)>)>,
        output: Vec<(String, usize)>,
        to: O,
    },
    Map(UnaryOp),
    Zip {
        left: O,
        right: O,
        op: BinaryOp,
    },
    Reduce {
        from: O,
        to: O,
        remove: Vec<String>,
        mean: bool,
        rename: Rename,
    },
    Roll {
        order: O,
        shifts: Vec<(String, isize)>,
    },
    /// Reads a stored field, expanded into chunk reads when closing
    Load {
        format: Arc<dyn Format>,
        path: PathBuf,
        layout: Shape,
        chunks: Arc<TunableOption>,
        to: O,
    },
    Read {
        format: Arc<dyn Format>,
        path: PathBuf,
        shape: Vec<usize>,
        chunks: Vec<usize>,
        chunk: usize,
    },
    /// Stitches the chunks read from `layout` and lays them out as `to`
    Assemble {
        layout: Shape,
        chunks: Vec<usize>,
        to: O,
    },
    Apply(String, Kernel),
}

impl<O> Op<O> {
    pub fn name(&self) -> &str {
        match self {
            Op::Source(_) => "source",
            Op::Fill { .. } => "fill",
            Op::Random { .. } => "random",
            Op::Permute { .. } => "permute",
            Op::Select { .. } => "select",
            Op::Assign { .. } => "assign",
            Op::Squeeze { .. } => "squeeze",
            Op::Extend { .. } => "extend",
            Op::Contract { .. } => "contract",
            Op::Map(_) => "map",
            Op::Zip { .. } => "zip",
            Op::Reduce { .. } => "reduce",
            Op::Roll { .. } => "roll",
            Op::Load { .. } => "load",
            Op::Read { .. } => "read",
            Op::Assemble { .. } => "assemble",
            Op::Apply(label, _) => label.as_str(),
        }
    }

    /// Layouts the operation depends on
    pub fn orders(&self) -> Vec<&O> {
        match self {
            Op::Source(_) | Op::Map(_) | Op::Read { .. } | Op::Apply(..) => vec![],
            Op::Fill { order, .. }
            | Op::Random { order, .. }
            | Op::Select { order, .. }
            | Op::Roll { order, .. } => vec![order],
            Op::Permute { from, to, .. }
            | Op::Squeeze { from, to, .. }
            | Op::Extend { from, to, .. }
            | Op::Reduce { from, to, .. } => vec![from, to],
            Op::Assign { target, value, .. } => vec![target, value],
            Op::Zip { left, right, .. } => vec![left, right],
            Op::Contract { inputs, to, .. } => {
                let mut orders: Vec<&O> = inputs.iter().map(|(order, _)| order).collect();
                orders.push(to);
                orders
            }
            Op::Load { to, .. } | Op::Assemble { to, .. } => vec![to],
        }
    }

    /// Same operation with every layout mapped through `f`
    pub fn map_orders<P, E>(&self, mut f: impl FnMut(&O) -> Result<P, E>) -> Result<Op<P>, E> {
        Ok(match self {
            Op::Source(buffer) => Op::Source(Arc::clone(buffer)),
            Op::Fill { shape, order, value } => Op::Fill {
                shape: shape.clone(),
                order: f(order)?,
                value: *value,
            },
            Op::Random { shape, order, seed } => Op::Random {
                shape: shape.clone(),
                order: f(order)?,
                seed: *seed,
            },
            Op::Permute { from, to, rename } => Op::Permute {
                from: f(from)?,
                to: f(to)?,
                rename: rename.clone(),
            },
            Op::Select { order, picks } => Op::Select {
                order: f(order)?,
                picks: picks.clone(),
            },
            Op::Assign {
                target,
                value,
                picks,
            } => Op::Assign {
                target: f(target)?,
                value: f(value)?,
                picks: picks.clone(),
            },
            Op::Squeeze {
                from,
                to,
                remove,
                rename,
            } => Op::Squeeze {
                from: f(from)?,
                to: f(to)?,
                remove: remove.clone(),
                rename: rename.clone(),
            },
            Op::Extend {
                from,
                to,
                new,
                rename,
            } => Op::Extend {
                from: f(from)?,
                to: f(to)?,
                new: new.clone(),
                rename: rename.clone(),
            },
            Op::Contract { inputs, output, to } => {
                let mut mapped = Vec::with_capacity(inputs.len());
                for (order, symbols) in inputs {
                    mapped.push((f(order)?, symbols.clone()));
                }
                Op::Contract {
                    inputs: mapped,
                    output: output.clone(),
                    to: f(to)?,
                }
            }
            Op::Map(op) => Op::Map(*op),
            Op::Zip { left, right, op } => Op::Zip {
                left: f(left)?,
                right: f(right)?,
                op: *op,
            },
            Op::Reduce {
                from,
                to,
                remove,
                mean,
                rename,
            } => Op::Reduce {
                from: f(from)?,
                to: f(to)?,
                remove: remove.clone(),
                mean: *mean,
                rename: rename.clone(),
            },
            Op::Roll { order, shifts } => Op::Roll {
                order: f(order)?,
                shifts: shifts.clone(),
            },
            Op::Load {
                format,
                path,
                layout,
                chunks,
                to,
            } => Op::Load {
                format: Arc::clone(format),
                path: path.clone(),
                layout: layout.clone(),
                chunks: Arc::clone(chunks),
                to: f(to)?,
            },
            Op::Read {
                format,
                path,
                shape,
                chunks,
                chunk,
            } => Op::Read {
                format: Arc::clone(format),
                path: path.clone(),
                shape: shape.clone(),
                chunks: chunks.clone(),
                chunk: *chunk,
            },
            Op::Assemble { layout, chunks, to } => Op::Assemble {
                layout: layout.clone(),
                chunks: chunks.clone(),
                to: f(to)?,
            },
            Op::Apply(label, kernel) => Op::Apply(label.clone(), kernel.clone()),
        })
    }
}

struct Node {
    key: u64,
    op: Op<IndexOrder>,
    deps: Vec<Delayed>,
}

/// Handle on a node of the symbolic graph
///
/// Cloning is cheap and shares the node.
#[derive(Clone)]
pub struct Delayed {
    node: Arc<Node>,
}

impl fmt::Debug for Delayed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delayed")
            .field("key", &self.node.key)
            .field("op", &self.name())
            .field(
                "deps",
                &self.node.deps.iter().map(Delayed::key).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Delayed {
    pub fn new(op: Op<IndexOrder>, deps: Vec<Delayed>) -> Delayed {
        Delayed {
            node: Arc::new(Node {
                key: NEXT_NODE.fetch_add(1, Ordering::Relaxed),
                op,
                deps,
            }),
        }
    }

    pub fn source(buffer: Buffer) -> Delayed {
        Delayed::new(Op::Source(Arc::new(buffer)), Vec::new())
    }

    /// Node evaluating `function` on the buffers of `deps`
    ///
    /// ```
    /// use latfield::graph::Delayed;
    /// use ndarray::{ArrayD, IxDyn};
    /// use num_complex::Complex64;
    ///
    /// let one = Delayed::source(ArrayD::from_elem(IxDyn(&[2]), Complex64::new(1.0, 0.0)));
    /// let twice = Delayed::submit("twice", &[&one], |inputs| Ok(inputs[0] * Complex64::new(2.0, 0.0)));
    /// assert_eq!(twice.deps().len(), 1);
    /// ```
    pub fn submit<F>(label: impl Into<String>, deps: &[&Delayed], function: F) -> Delayed
    where
        F: Fn(&[&Buffer]) -> anyhow::Result<Buffer> + Send + Sync + 'static,
    {
        Delayed::new(
            Op::Apply(label.into(), Kernel(Arc::new(function))),
            deps.iter().map(|dep| (*dep).clone()).collect(),
        )
    }

    pub fn key(&self) -> u64 {
        self.node.key
    }

    pub fn name(&self) -> &str {
        self.node.op.name()
    }

    pub fn op(&self) -> &Op<IndexOrder> {
        &self.node.op
    }

    pub fn deps(&self) -> &[Delayed] {
        &self.node.deps
    }

    /// Nodes of the graph, every node after its dependencies
    pub fn nodes(&self) -> Vec<Delayed> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        self.visit(&mut seen, &mut nodes);
        nodes
    }

    fn visit(&self, seen: &mut HashSet<u64>, nodes: &mut Vec<Delayed>) {
        if !seen.insert(self.key()) {
            return;
        }
        for dep in self.deps() {
            dep.visit(seen, nodes);
        }
        nodes.push(self.clone());
    }

    /// Options the graph depends on, without repetitions
    pub fn options(&self) -> Vec<Arc<TunableOption>> {
        let mut seen = HashSet::new();
        let mut options = Vec::new();
        for node in self.nodes() {
            let op = node.op();
            let extra = match op {
                Op::Load { chunks, .. } => Some(chunks),
                _ => None,
            };
            for option in op.orders().into_iter().flat_map(IndexOrder::options).chain(extra) {
                if seen.insert(option.uid()) {
                    options.push(Arc::clone(option));
                }
            }
        }
        options
    }

    /// Names of the options still to be tuned
    pub fn pending(&self) -> Vec<String> {
        self.options()
            .iter()
            .filter(|option| !option.is_tuned())
            .map(|option| option.name().to_string())
            .collect()
    }

    pub fn is_tunable(&self) -> bool {
        self.options().iter().any(|option| !option.is_tuned())
    }

    /// Tunes every pending option of the graph, inputs first
    pub fn tune(&self, callback: Option<&TuneCallback>) -> Result<(), TuneError> {
        for option in self.options() {
            option.tune(callback)?;
        }
        Ok(())
    }

    /// Binds every open parameter and returns the plan computing this node
    pub fn close(&self) -> Result<Plan, FieldError> {
        let pending = self.pending();
        if !pending.is_empty() {
            return Err(TuneError::NotTuned(pending).into());
        }
        let mut steps: Vec<Step> = Vec::new();
        let mut positions: HashMap<u64, usize> = HashMap::new();
        for node in self.nodes() {
            let deps = node
                .deps()
                .iter()
                .map(|dep| {
                    positions
                        .get(&dep.key())
                        .copied()
                        .ok_or_else(|| anyhow!("dependency {} of {} not closed", dep.key(), node.key()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            match node.op() {
                Op::Load {
                    format,
                    path,
                    layout,
                    chunks,
                    to,
                } => {
                    let sizes = chunk_sizes(layout, chunks)?;
                    let shape: Vec<usize> = layout.iter().map(|(_, size)| *size).collect();
                    let plan = ChunkPlan::new(shape.clone(), sizes.clone())?;
                    let mut reads = Vec::with_capacity(plan.len());
                    for chunk in 0..plan.len() {
                        reads.push(steps.len());
                        steps.push(Step {
                            key: node.key(),
                            op: Op::Read {
                                format: Arc::clone(format),
                                path: path.clone(),
                                shape: shape.clone(),
                                chunks: sizes.clone(),
                                chunk,
                            },
                            deps: Vec::new(),
                        });
                    }
                    steps.push(Step {
                        key: node.key(),
                        op: Op::Assemble {
                            layout: layout.clone(),
                            chunks: sizes,
                            to: to.resolve()?,
                        },
                        deps: reads,
                    });
                }
                op => steps.push(Step {
                    key: node.key(),
                    op: op.map_orders(IndexOrder::resolve)?,
                    deps,
                }),
            }
            positions.insert(node.key(), steps.len() - 1);
        }
        debug!(root = self.key(), steps = steps.len(), "closed graph");
        Ok(Plan { steps })
    }
}

fn chunk_sizes(layout: &Shape, chunks: &TunableOption) -> Result<Vec<usize>, TuneError> {
    match chunks.value() {
        Some(OptionValue::Chunks(map)) => Ok(layout
            .iter()
            .map(|(index, size)| map.get(index).copied().unwrap_or(*size))
            .collect()),
        Some(other) => Err(incompatible(chunks, other)),
        None => Err(TuneError::NotTuned(vec![chunks.name().to_string()])),
    }
}

/// A closed operation with the positions of its inputs in the plan
#[derive(Debug, Clone)]
pub struct Step {
    key: u64,
    op: Op<Vec<String>>,
    deps: Vec<usize>,
}

impl Step {
    /// Key of the graph node the step comes from
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn name(&self) -> &str {
        self.op.name()
    }

    pub fn op(&self) -> &Op<Vec<String>> {
        &self.op
    }

    pub fn deps(&self) -> &[usize] {
        &self.deps
    }

    pub fn evaluate(&self, inputs: &[Arc<Buffer>]) -> anyhow::Result<Buffer> {
        kernels::evaluate(&self.op, inputs)
    }
}

/// Closed graph: every step comes after its dependencies, the last one is the result
#[derive(Debug, Clone)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn root(&self) -> Option<usize> {
        self.steps.len().checked_sub(1)
    }

    /// Steps grouped by depth, so that the steps of a group only need earlier groups
    pub fn wavefronts(&self) -> Vec<Vec<usize>> {
        let mut depths = vec![0usize; self.steps.len()];
        let mut fronts: Vec<Vec<usize>> = Vec::new();
        for (position, step) in self.steps.iter().enumerate() {
            let depth = step
                .deps
                .iter()
                .map(|dep| depths[*dep] + 1)
                .max()
                .unwrap_or(0);
            depths[position] = depth;
            if fronts.len() <= depth {
                fronts.resize_with(depth + 1, Vec::new);
            }
            fronts[depth].push(position);
        }
        fronts
    }
}
