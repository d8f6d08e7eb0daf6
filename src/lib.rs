/*!
This crate models lattice QCD fields as arrays over named axes.

A [`lattice::Lattice`] is the registry of the axes: the dimensions of the space-time grid
(`x`, `y`, `z`, `t`), the internal degrees of freedom (`spin`, `color`) and the labels,
groups and properties naming sets of them. Fields are built against a lattice from axis
specifications like `["dims", "dofs!!"]`, parsed by [`axes::Axes`], and classified into
[`types::FieldType`]s such as `Vector` or `Propagator`.

Operations on a [`field::Field`] are lazy: they build a [`graph::Delayed`] graph whose layouts
are open [`tunable::TunableOption`]s. Computing a field first tunes every option once, then
closes the graph into a [`graph::Plan`] and hands it to the [`engine::Engine`] of its
[`session::Session`]. Nothing is global: the session carries the field types, the engine,
the file formats and the default lattice.

```
use latfield::field::DotOptions;
use latfield::lattice::Lattice;
use latfield::session::Session;

let session = Session::builder().lattice(Lattice::default()).build();
let gauge = session.field(&["color", "color"]).build().unwrap().ones();
let trace = gauge
    .dot(&[&gauge], &DotOptions::new().closed(&["color"]).trace(true))
    .unwrap();
assert_eq!(trace.compute().unwrap().sum().re, 9.0);
```
*/

pub mod axes;
pub mod buffer;
pub mod config;
pub mod coordinates;
pub mod engine;
pub mod errors;
pub mod field;
pub mod graph;
pub mod io;
pub mod lattice;
pub mod logging;
pub mod session;
pub mod tunable;
pub mod types;

mod kernels;

pub use crate::field::{Field, FieldState};
pub use crate::lattice::Lattice;
pub use crate::session::Session;

#[cfg(test)]
mod tests;
