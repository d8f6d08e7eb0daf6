//! Buffer kernels
//!
//! Evaluation of a closed [`Op`] on the buffers of its inputs. Every layout is given as the
//! list of index names in physical order, so kernels only move axes around by name.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Result};
use ndarray::{ArrayD, Axis, Dimension, IxDyn, Slice, Zip};
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::Buffer;
use crate::graph::{Op, Rename};
use crate::io::ChunkPlan;

pub(crate) fn evaluate(op: &Op<Vec<String>>, inputs: &[Arc<Buffer>]) -> Result<Buffer> {
    let input = |i: usize| -> Result<&Buffer> {
        inputs
            .get(i)
            .map(|buffer| buffer.as_ref())
            .ok_or_else(|| anyhow!("{} expects at least {} inputs", op.name(), i + 1))
    };
    match op {
        Op::Source(buffer) => Ok(buffer.as_ref().clone()),
        Op::Fill {
            shape,
            order,
            value,
        } => {
            let names = names_of(shape);
            let buffer = ArrayD::from_elem(IxDyn(&sizes_of(shape)), *value);
            permute(buffer, &names, order)
        }
        Op::Random {
            shape,
            order,
            seed,
        } => {
            let mut rng = StdRng::seed_from_u64(*seed);
            let buffer = ArrayD::from_shape_simple_fn(IxDyn(&sizes_of(shape)), || {
                Complex64::new(rng.gen(), rng.gen())
            });
            permute(buffer, &names_of(shape), order)
        }
        Op::Permute { from, to, rename } => permute(input(0)?.clone(), &renamed(from, rename), to),
        Op::Select { order, picks } => select(input(0)?, order, picks),
        Op::Assign {
            target,
            value,
            picks,
        } => assign(input(0)?, target, input(1)?, value, picks),
        Op::Squeeze {
            from,
            to,
            remove,
            rename,
        } => squeeze(input(0)?, from, to, remove, rename),
        Op::Extend {
            from,
            to,
            new,
            rename,
        } => extend(input(0)?, from, to, new, rename),
        Op::Contract {
            inputs: operands,
            output,
            to,
        } => {
            let buffers = (0..operands.len())
                .map(input)
                .collect::<Result<Vec<_>>>()?;
            contract(&buffers, operands, output, to)
        }
        Op::Map(unary) => Ok(input(0)?.mapv(|value| unary.apply(value))),
        Op::Zip { left, right, op } => {
            let mut result = input(0)?.clone();
            let other = permute(input(1)?.clone(), right, left)?;
            ensure!(
                result.shape() == other.shape(),
                "cannot combine buffers of shapes {:?} and {:?}",
                result.shape(),
                other.shape()
            );
            Zip::from(&mut result)
                .and(&other)
                .for_each(|a, &b| *a = op.apply(*a, b));
            Ok(result)
        }
        Op::Reduce {
            from,
            to,
            remove,
            mean,
            rename,
        } => reduce(input(0)?, from, to, remove, *mean, rename),
        Op::Roll { order, shifts } => roll(input(0)?, order, shifts),
        Op::Load { path, .. } => bail!(
            "load of {:?} has to be expanded into chunk reads before evaluation",
            path
        ),
        Op::Read {
            format,
            path,
            shape,
            chunks,
            chunk,
        } => format.read(path, shape, chunks, *chunk),
        Op::Assemble { layout, chunks, to } => assemble(inputs, layout, chunks, to),
        Op::Apply(_, kernel) => {
            let buffers: Vec<&Buffer> = inputs.iter().map(|buffer| buffer.as_ref()).collect();
            kernel.call(&buffers)
        }
    }
}

fn names_of(shape: &[(String, usize)]) -> Vec<String> {
    shape.iter().map(|(name, _)| name.clone()).collect()
}

fn sizes_of(shape: &[(String, usize)]) -> Vec<usize> {
    shape.iter().map(|(_, size)| *size).collect()
}

fn renamed(names: &[String], rename: &Rename) -> Vec<String> {
    names
        .iter()
        .map(|name| {
            rename
                .iter()
                .find(|(old, _)| old == name)
                .map_or_else(|| name.clone(), |(_, new)| new.clone())
        })
        .collect()
}

fn position(names: &[String], name: &str) -> Result<usize> {
    names
        .iter()
        .position(|n| n == name)
        .ok_or_else(|| anyhow!("index {name:?} not found in layout {names:?}"))
}

/// Moves the axes of `buffer`, laid out as `from`, into the layout `to`
pub(crate) fn permute(buffer: Buffer, from: &[String], to: &[String]) -> Result<Buffer> {
    ensure!(
        buffer.ndim() == from.len(),
        "buffer with {} axes cannot have layout {:?}",
        buffer.ndim(),
        from
    );
    if from == to {
        return Ok(buffer);
    }
    ensure!(
        from.len() == to.len(),
        "layouts {from:?} and {to:?} have different lengths"
    );
    let axes = to
        .iter()
        .map(|name| position(from, name))
        .collect::<Result<Vec<_>>>()?;
    let unique: BTreeSet<_> = axes.iter().collect();
    ensure!(
        unique.len() == axes.len(),
        "layout {to:?} repeats an index"
    );
    Ok(buffer
        .permuted_axes(IxDyn(&axes))
        .as_standard_layout()
        .into_owned())
}

fn select(buffer: &Buffer, order: &[String], picks: &[(String, Vec<usize>)]) -> Result<Buffer> {
    let mut result = buffer.clone();
    for (name, positions) in picks {
        let axis = Axis(position(order, name)?);
        let extent = result.len_of(axis);
        ensure!(
            positions.iter().all(|p| *p < extent),
            "positions {positions:?} out of range for {name:?} of size {extent}"
        );
        result = result.select(axis, positions);
    }
    Ok(result)
}

fn assign(
    target: &Buffer,
    target_order: &[String],
    value: &Buffer,
    value_order: &[String],
    picks: &[(String, Vec<usize>)],
) -> Result<Buffer> {
    let value = permute(value.clone(), value_order, target_order)?;
    let maps: Vec<Vec<usize>> = target_order
        .iter()
        .enumerate()
        .map(|(k, name)| match picks.iter().find(|(n, _)| n == name) {
            Some((_, positions)) => positions.clone(),
            None => (0..target.len_of(Axis(k))).collect(),
        })
        .collect();
    let expected: Vec<usize> = maps.iter().map(Vec::len).collect();
    ensure!(
        value.shape() == expected.as_slice(),
        "cannot assign a buffer of shape {:?} to a selection of shape {:?}",
        value.shape(),
        expected
    );
    let mut result = target.clone();
    let mut at = vec![0usize; maps.len()];
    for (index, element) in value.indexed_iter() {
        for (k, map) in maps.iter().enumerate() {
            at[k] = map[index[k]];
        }
        let slot = result
            .get_mut(at.as_slice())
            .ok_or_else(|| anyhow!("position {at:?} out of the target buffer"))?;
        *slot = *element;
    }
    Ok(result)
}

fn squeeze(
    buffer: &Buffer,
    from: &[String],
    to: &[String],
    remove: &[String],
    rename: &Rename,
) -> Result<Buffer> {
    let mut result = buffer.clone();
    let mut names = from.to_vec();
    let mut axes = remove
        .iter()
        .map(|name| position(from, name))
        .collect::<Result<Vec<_>>>()?;
    axes.sort_unstable();
    for &k in axes.iter().rev() {
        ensure!(
            result.len_of(Axis(k)) == 1,
            "cannot squeeze {:?} of size {}",
            names[k],
            result.len_of(Axis(k))
        );
        result = result.index_axis_move(Axis(k), 0);
        names.remove(k);
    }
    permute(result, &renamed(&names, rename), to)
}

fn extend(
    buffer: &Buffer,
    from: &[String],
    to: &[String],
    new: &[(String, usize)],
    rename: &Rename,
) -> Result<Buffer> {
    let mut result = buffer.clone();
    let mut names = renamed(from, rename);
    let mut shape = result.shape().to_vec();
    for (name, size) in new {
        let last = result.ndim();
        result = result.insert_axis(Axis(last));
        names.push(name.clone());
        shape.push(*size);
    }
    let broadcast = result
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| anyhow!("cannot broadcast to {shape:?}"))?
        .to_owned();
    permute(broadcast, &names, to)
}

fn contract(
    buffers: &[&Buffer],
    operands: &[(Vec<String>, Vec<(String, usize)>)],
    output: &[(String, usize)],
    to: &[String],
) -> Result<Buffer> {
    let symbol_of = |symbols: &[(String, usize)], name: &str| -> Result<usize> {
        symbols
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, symbol)| *symbol)
            .ok_or_else(|| anyhow!("no contraction symbol for {name:?}"))
    };
    let mut sizes: Vec<Option<usize>> = Vec::new();
    let mut operand_symbols = Vec::with_capacity(operands.len());
    for (buffer, (order, symbols)) in buffers.iter().zip(operands) {
        ensure!(
            buffer.ndim() == order.len(),
            "buffer with {} axes cannot have layout {:?}",
            buffer.ndim(),
            order
        );
        let mut these = Vec::with_capacity(order.len());
        for (k, name) in order.iter().enumerate() {
            let symbol = symbol_of(symbols, name)?;
            if sizes.len() <= symbol {
                sizes.resize(symbol + 1, None);
            }
            let size = buffer.len_of(Axis(k));
            match sizes[symbol] {
                Some(known) => ensure!(
                    known == size,
                    "index {name:?} has size {size} but its symbol was bound to {known}"
                ),
                None => sizes[symbol] = Some(size),
            }
            these.push(symbol);
        }
        operand_symbols.push(these);
    }
    let out_symbols = to
        .iter()
        .map(|name| symbol_of(output, name))
        .collect::<Result<Vec<_>>>()?;
    let out_shape = out_symbols
        .iter()
        .map(|s| {
            sizes
                .get(*s)
                .copied()
                .flatten()
                .ok_or_else(|| anyhow!("output symbol {s} does not appear in the inputs"))
        })
        .collect::<Result<Vec<_>>>()?;
    let summed: Vec<usize> = (0..sizes.len())
        .filter(|s| sizes[*s].is_some() && !out_symbols.contains(s))
        .collect();
    let summed_sizes: Vec<usize> = summed.iter().filter_map(|s| sizes[*s]).collect();

    let mut values = vec![0usize; sizes.len()];
    let mut positions: Vec<Vec<usize>> = operand_symbols
        .iter()
        .map(|symbols| vec![0; symbols.len()])
        .collect();
    let mut counter = vec![0usize; summed.len()];
    let mut result = ArrayD::zeros(IxDyn(&out_shape));
    for (index, slot) in result.indexed_iter_mut() {
        for (k, symbol) in out_symbols.iter().enumerate() {
            values[*symbol] = index[k];
        }
        counter.iter_mut().for_each(|c| *c = 0);
        let mut total = Complex64::new(0.0, 0.0);
        'sum: loop {
            for (j, symbol) in summed.iter().enumerate() {
                values[*symbol] = counter[j];
            }
            let mut product = Complex64::new(1.0, 0.0);
            for ((buffer, symbols), at) in buffers.iter().zip(&operand_symbols).zip(&mut positions) {
                for (k, symbol) in symbols.iter().enumerate() {
                    at[k] = values[*symbol];
                }
                product *= buffer[at.as_slice()];
            }
            total += product;

            let mut j = summed.len();
            loop {
                if j == 0 {
                    break 'sum;
                }
                j -= 1;
                counter[j] += 1;
                if counter[j] < summed_sizes[j] {
                    break;
                }
                counter[j] = 0;
            }
        }
        *slot = total;
    }
    Ok(result)
}

fn reduce(
    buffer: &Buffer,
    from: &[String],
    to: &[String],
    remove: &[String],
    mean: bool,
    rename: &Rename,
) -> Result<Buffer> {
    let mut result = buffer.clone();
    let mut names = from.to_vec();
    let mut axes = remove
        .iter()
        .map(|name| position(from, name))
        .collect::<Result<Vec<_>>>()?;
    axes.sort_unstable();
    let mut count = 1usize;
    for &k in axes.iter().rev() {
        count *= result.len_of(Axis(k));
        result = result.sum_axis(Axis(k));
        names.remove(k);
    }
    if mean && count > 0 {
        let count = count as f64;
        result.mapv_inplace(|value| value / count);
    }
    permute(result, &renamed(&names, rename), to)
}

fn roll(buffer: &Buffer, order: &[String], shifts: &[(String, isize)]) -> Result<Buffer> {
    let mut result = buffer.clone();
    for (name, shift) in shifts {
        let k = position(order, name)?;
        let extent = result.len_of(Axis(k));
        if extent == 0 {
            continue;
        }
        let shift = shift.rem_euclid(extent as isize) as usize;
        if shift == 0 {
            continue;
        }
        let mut rolled = result.clone();
        let mut at = vec![0usize; result.ndim()];
        for (index, element) in result.indexed_iter() {
            at.copy_from_slice(index.slice());
            at[k] = (at[k] + shift) % extent;
            rolled[at.as_slice()] = *element;
        }
        result = rolled;
    }
    Ok(result)
}

fn assemble(
    chunks: &[Arc<Buffer>],
    layout: &[(String, usize)],
    sizes: &[usize],
    to: &[String],
) -> Result<Buffer> {
    let shape = sizes_of(layout);
    let plan = ChunkPlan::new(shape.clone(), sizes.to_vec())?;
    ensure!(
        chunks.len() == plan.len(),
        "expected {} chunks, found {}",
        plan.len(),
        chunks.len()
    );
    let mut result = ArrayD::zeros(IxDyn(&shape));
    for (id, chunk) in chunks.iter().enumerate() {
        let ranges = plan.ranges(id);
        ensure!(
            chunk.shape() == plan.chunk_shape(id).as_slice(),
            "chunk {id} has shape {:?}, expected {:?}",
            chunk.shape(),
            plan.chunk_shape(id)
        );
        result
            .slice_each_axis_mut(|axis| Slice::from(ranges[axis.axis.index()].clone()))
            .assign(chunk.as_ref());
    }
    permute(result, &names_of(layout), to)
}

#[cfg(test)]
mod kernels_test {
    use super::*;
    use ndarray::{array, Array};

    fn c(re: f64) -> Complex64 {
        Complex64::new(re, 0.0)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn permute_axes() {
        let buffer = array![[c(1.), c(2.), c(3.)], [c(4.), c(5.), c(6.)]].into_dyn();
        let result = permute(buffer.clone(), &names(&["x", "y"]), &names(&["y", "x"])).unwrap();
        assert_eq!(result, buffer.t().to_owned());
        assert!(permute(buffer, &names(&["x", "y"]), &names(&["x", "z"])).is_err());
    }

    #[test]
    fn contraction_is_a_matrix_product() {
        let a = array![[c(1.), c(2.)], [c(3.), c(4.)]].into_dyn();
        let b = array![[c(0.), c(1.)], [c(1.), c(0.)]].into_dyn();
        let operands = vec![
            (names(&["i", "j"]), vec![("i".into(), 0), ("j".into(), 1)]),
            (names(&["i", "j"]), vec![("i".into(), 1), ("j".into(), 2)]),
        ];
        let output = vec![("i".into(), 0), ("j".into(), 2)];
        let result = contract(&[&a, &b], &operands, &output, &names(&["i", "j"])).unwrap();
        assert_eq!(result, array![[c(2.), c(1.)], [c(4.), c(3.)]].into_dyn());
    }

    #[test]
    fn full_trace() {
        let a = array![[c(1.), c(2.)], [c(3.), c(4.)]].into_dyn();
        let operands = vec![(names(&["i", "j"]), vec![("i".into(), 0), ("j".into(), 0)])];
        let result = contract(&[&a], &operands, &[], &[]).unwrap();
        assert_eq!(result.ndim(), 0);
        assert_eq!(result.iter().next().copied(), Some(c(5.)));
    }

    #[test]
    fn roll_and_select() {
        let buffer = Array::from_vec(vec![c(0.), c(1.), c(2.), c(3.)]).into_dyn();
        let order = names(&["t"]);
        let rolled = roll(&buffer, &order, &[("t".into(), 1)]).unwrap();
        assert_eq!(rolled.as_slice().unwrap(), &[c(3.), c(0.), c(1.), c(2.)]);
        let picked = select(&buffer, &order, &[("t".into(), vec![1, 3])]).unwrap();
        assert_eq!(picked.as_slice().unwrap(), &[c(1.), c(3.)]);
    }

    #[test]
    fn assign_into_selection() {
        let target = ArrayD::<Complex64>::zeros(IxDyn(&[2, 3]));
        let value = array![[c(7.)], [c(8.)]].into_dyn();
        let order = names(&["x", "y"]);
        let result = assign(&target, &order, &value, &order, &[("y".into(), vec![2])]).unwrap();
        assert_eq!(result[[0, 2]], c(7.));
        assert_eq!(result[[1, 2]], c(8.));
        assert_eq!(result[[1, 1]], c(0.));
    }

    #[test]
    fn squeeze_and_extend() {
        let buffer = ArrayD::from_elem(IxDyn(&[1, 3]), c(2.));
        let squeezed = squeeze(
            &buffer,
            &names(&["x", "y"]),
            &names(&["y"]),
            &names(&["x"]),
            &vec![],
        )
        .unwrap();
        assert_eq!(squeezed.shape(), &[3]);
        let extended = extend(
            &squeezed,
            &names(&["y"]),
            &names(&["z", "y"]),
            &[("z".into(), 2)],
            &vec![],
        )
        .unwrap();
        assert_eq!(extended.shape(), &[2, 3]);
        assert!(extended.iter().all(|v| *v == c(2.)));
    }

    #[test]
    fn mean_over_axis() {
        let buffer = array![[c(1.), c(3.)], [c(5.), c(7.)]].into_dyn();
        let order = names(&["x", "y"]);
        let result = reduce(&buffer, &order, &names(&["x"]), &names(&["y"]), true, &vec![]).unwrap();
        assert_eq!(result.as_slice().unwrap(), &[c(2.), c(6.)]);
    }
}
