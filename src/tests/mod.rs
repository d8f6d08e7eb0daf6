use std::sync::Arc;

use num_complex::Complex64;

use crate::buffer::DType;
use crate::config::EngineConfig;
use crate::coordinates::Filters;
use crate::errors::{FieldError, TuneError};
use crate::field::{DotOptions, FieldState};
use crate::lattice::{AxesSpec, Lattice};
use crate::session::Session;
use crate::tunable::OptionValue;

fn qcd() -> Lattice {
    Lattice::new(
        [("t", 8), ("x", 4), ("y", 4), ("z", 4)],
        [("spin", 4), ("color", 3)],
    )
    .unwrap()
}

fn small() -> Lattice {
    Lattice::new(
        [("t", 2), ("x", 2), ("y", 2), ("z", 2)],
        [("spin", 4), ("color", 3)],
    )
    .unwrap()
}

#[test]
fn propagator_size() {
    let session = Session::builder().lattice(qcd()).build();
    let field = session.field(&["dims", "dofs", "dofs"]).build().unwrap();
    assert_eq!(field.size(), 8 * 4 * 4 * 4 * (4 * 3) * (4 * 3));
    assert_eq!(field.field_type().as_deref(), Some("Propagator"));
}

#[test]
fn propagator_on_spin_only_lattice() {
    let mut lattice = Lattice::empty();
    lattice.set_dims(AxesSpec::Sizes(vec![2, 2])).unwrap();
    lattice
        .set_dofs(AxesSpec::Named(vec![("spin".into(), 4)]))
        .unwrap();
    let session = Session::builder().lattice(lattice).build();
    let field = session.field(&["dims", "dofs!!"]).build().unwrap();
    assert!(field.is_instance("Propagator").unwrap());
    assert!(!field.is_instance("Vector").unwrap());
}

#[test]
fn tuning_is_idempotent() {
    let session = Session::builder().lattice(small()).build();
    let field = session.field(&["dims", "color"]).build().unwrap().ones();
    field.tune(None, None).unwrap();
    let order = field.ordered_indexes().unwrap();
    field.tune(None, None).unwrap();
    assert_eq!(field.ordered_indexes().unwrap(), order);
    assert_eq!(field.state(), FieldState::Tuned);

    field.set_option("axes_order", order.clone()).unwrap();
    assert!(matches!(
        field.set_option("axes_order", vec!["color"]),
        Err(FieldError::Tune(TuneError::IncompatibleValue { .. }))
    ));
    let mut reversed = order;
    reversed.reverse();
    assert!(matches!(
        field.set_option("axes_order", reversed),
        Err(FieldError::Tune(TuneError::AlreadyTuned(_)))
    ));
}

#[test]
fn callbacks_choose_the_layout() {
    let session = Session::builder().lattice(small()).build();
    let build = || session.field(&["dims", "spin"]).build().unwrap().random(5);
    let reference = build().compute().unwrap();
    let field = build();

    let reverse = |name: &str, value: &OptionValue| match (name, value) {
        ("axes_order", OptionValue::Names(axes)) => {
            OptionValue::Names(axes.iter().rev().cloned().collect())
        }
        _ => value.clone(),
    };
    let values = field.compute_with(true, Some(&reverse)).unwrap();
    assert_eq!(
        field.ordered_indexes().unwrap(),
        vec!["spin", "z", "y", "x", "t"]
    );
    assert_eq!(values, reference);
}

#[test]
fn lazy_pipeline() {
    let session = Session::builder().lattice(small()).build();
    let propagator = session.field(&["dims", "dofs", "dofs"]).build().unwrap().random(1);
    let source = session
        .field(&["dims", "dofs"])
        .build()
        .unwrap()
        .zeros()
        .set(1.0, &Filters::new().with("dims", 0).with("spin", 0).with("color", 0))
        .unwrap();
    let solution = propagator.dot(&[&source], &DotOptions::new()).unwrap();
    assert_eq!(solution.indexes(), &["t", "x", "y", "z", "spin", "color"]);
    assert_eq!(solution.state(), FieldState::Tunable);

    let at_origin = solution
        .get(&Filters::new().with("dims", 0))
        .unwrap()
        .squeeze()
        .unwrap();
    let expected = propagator
        .get(&Filters::new().with("dims", 0).with("spin_1", 0).with("color_1", 0))
        .unwrap()
        .squeeze()
        .unwrap();
    assert_eq!(at_origin.compute().unwrap(), expected.compute().unwrap());

    let norm = solution.dot(&[&solution.conj()], &DotOptions::new()).unwrap();
    let total = norm.volume_sum().unwrap().compute().unwrap().sum();
    assert!(total.re > 0.0);
    assert!(total.im.abs() < 1e-12);
}

#[test]
fn engines_agree() {
    let threaded = EngineConfig::Threaded { workers: 3 }.build().unwrap();
    let local = Session::builder().lattice(small()).build();
    let pooled = Session::builder().lattice(small()).engine(threaded).build();
    let compute = |session: &Arc<Session>| {
        let field = session
            .field(&["dims", "color", "color"])
            .chunks(&[("t", 1)])
            .build()
            .unwrap()
            .random(9);
        field
            .dot(&[&field.dagger().unwrap()], &DotOptions::new().closed(&["color"]))
            .unwrap()
            .trace(&["color"])
            .unwrap()
            .compute()
            .unwrap()
    };
    assert_eq!(compute(&local), compute(&pooled));
}

#[test]
fn real_parts() {
    let session = Session::builder().lattice(small()).build();
    let field = session
        .field(&["spin"])
        .build()
        .unwrap()
        .fill(Complex64::new(1.5, -2.0));
    let real = field.real();
    assert_eq!(real.dtype(), DType::Float64);
    assert_eq!(real.bytes(), 4 * 8);
    assert!(real.add(&field).unwrap().dtype().is_complex());
    assert!(real
        .compute()
        .unwrap()
        .iter()
        .all(|v| *v == Complex64::new(1.5, 0.0)));
}
