use std::sync::Arc;

use indexmap::IndexMap;
use latfield::errors::TuneError;
use latfield::tunable::{OptionValue, Resolver, Tunable};

fn chunks(entries: &[(&str, usize)]) -> IndexMap<String, usize> {
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[test]
fn defaults_and_callbacks() {
    let mut tunable = Tunable::new();
    tunable
        .add_option("order", Resolver::permutation(&["x", "y", "z"]))
        .unwrap();
    tunable
        .add_option(
            "method",
            Resolver::choice(vec!["fast".into(), "exact".into()]).unwrap(),
        )
        .unwrap();
    tunable.add_tuned("seed", OptionValue::Int(7)).unwrap();
    assert_eq!(tunable.tunable_options(), vec!["order", "method"]);
    assert!(tunable.is_tunable());

    let exact = |name: &str, value: &OptionValue| match name {
        "method" => OptionValue::from("exact"),
        _ => value.clone(),
    };
    tunable.tune(None, Some(&exact)).unwrap();
    assert!(!tunable.is_tunable());
    assert_eq!(
        tunable.tuned_options(),
        vec![
            ("order", OptionValue::from(vec!["x", "y", "z"])),
            ("method", OptionValue::from("exact")),
            ("seed", OptionValue::Int(7)),
        ]
    );

    tunable.tune(None, None).unwrap();
    assert_eq!(tunable.value("method").unwrap(), Some(OptionValue::from("exact")));
}

#[test]
fn values_are_checked_by_the_resolver() {
    let mut tunable = Tunable::new();
    tunable
        .add_option("chunks", Resolver::ChunksOf(chunks(&[("x", 4), ("y", 2)])))
        .unwrap();
    assert!(matches!(
        tunable.set("chunks", chunks(&[("x", 8), ("y", 2)]).into()),
        Err(TuneError::IncompatibleValue { .. })
    ));
    assert!(matches!(
        tunable.set("chunks", chunks(&[("x", 2)]).into()),
        Err(TuneError::IncompatibleValue { .. })
    ));
    tunable
        .set("chunks", chunks(&[("x", 2), ("y", 1)]).into())
        .unwrap();
    tunable
        .set("chunks", chunks(&[("x", 2), ("y", 1)]).into())
        .unwrap();
    assert!(matches!(
        tunable.set("chunks", chunks(&[("x", 4), ("y", 2)]).into()),
        Err(TuneError::AlreadyTuned(_))
    ));
}

#[test]
fn names_are_unique() {
    let mut tunable = Tunable::new();
    tunable.add_option("order", Resolver::permutation_of(3)).unwrap();
    assert!(matches!(
        tunable.add_option("order", Resolver::permutation_of(2)),
        Err(TuneError::DuplicateOption(name)) if name == "order"
    ));
    assert!(matches!(
        tunable.tune(Some("layout"), None),
        Err(TuneError::UnknownOption(name)) if name == "layout"
    ));
    assert!(matches!(
        Resolver::choice(Vec::new()),
        Err(TuneError::InvalidResolver(_))
    ));
}

#[test]
fn shared_options_are_tuned_once() {
    let mut first = Tunable::new();
    let option = first
        .add_option("order", Resolver::permutation_of(3))
        .unwrap();
    let mut second = Tunable::new();
    second.attach("layout", Arc::clone(&option)).unwrap();

    let reversed = |_: &str, _: &OptionValue| OptionValue::Indices(vec![2, 1, 0]);
    second.tune(Some("layout"), Some(&reversed)).unwrap();
    assert!(!first.is_tunable());
    assert_eq!(
        first.value("order").unwrap(),
        Some(OptionValue::Indices(vec![2, 1, 0]))
    );
}
