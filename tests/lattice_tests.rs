use latfield::config::LatticeConfig;
use latfield::errors::LatticeError;
use latfield::lattice::{Lattice, LatticeEntry, LatticeValue};

fn lattice() -> Lattice {
    Lattice::new(
        [("t", 8), ("x", 4), ("y", 4), ("z", 4)],
        [("spin", 4), ("color", 3)],
    )
    .unwrap()
}

#[test]
fn cyclic_properties_are_detected() {
    let mut lattice = lattice();
    lattice.add_property("a", &["b"]).unwrap();
    lattice.add_property("b", &["a"]).unwrap();
    assert!(matches!(
        lattice.expand(["a"]),
        Err(LatticeError::CyclicProperty { key, .. }) if key == "a"
    ));

    lattice.add_property("c", &["spin", "d"]).unwrap();
    lattice.add_property("d", &["color"]).unwrap();
    assert_eq!(lattice.expand(["c"]).unwrap(), vec!["spin", "color"]);
}

#[test]
fn freezing() {
    let lattice = lattice();
    let frozen = lattice.freeze();
    assert!(frozen.ptr_eq(&lattice.freeze()));
    assert!(frozen.ptr_eq(&frozen.freeze()));

    let mut frozen = frozen;
    assert!(matches!(
        frozen.set("x", LatticeValue::Size(2)),
        Err(LatticeError::Frozen(_))
    ));
    assert!(matches!(
        frozen.add_label("parity", &["even", "odd"]),
        Err(LatticeError::Frozen(_))
    ));

    let mut copy = frozen.copy();
    copy.set("x", LatticeValue::Size(2)).unwrap();
    assert_eq!(copy.get("x"), Some(LatticeEntry::Dim(2)));
    assert_eq!(frozen.get("x"), Some(LatticeEntry::Dim(4)));
}

#[test]
fn mutations_drop_the_frozen_cache() {
    let mut lattice = lattice();
    let frozen = lattice.freeze();
    lattice.set("t", LatticeValue::Size(16)).unwrap();
    let refrozen = lattice.freeze();
    assert!(!frozen.ptr_eq(&refrozen));
    assert_eq!(refrozen.get_axis_size("t").unwrap(), 16);
}

#[test]
fn groups_and_default_keys() {
    let lattice = lattice();
    assert_eq!(lattice.expand(["space"]).unwrap(), vec!["x", "y", "z"]);
    assert_eq!(lattice.expand(["time"]).unwrap(), vec!["t"]);
    assert_eq!(lattice.volume(), 4 * 4 * 4 * 8);
    assert!(matches!(
        lattice.expand(["flavor"]),
        Err(LatticeError::UnknownKey(_))
    ));
}

#[test]
fn configuration_round_trip() {
    let json = r#"{
        "dims": {"t": 8, "x": 4},
        "theory": "QCD",
        "dofs": {"color": 2},
        "labels": {"parity": ["even", "odd"]},
        "properties": {"internal": ["dofs"]}
    }"#;
    let config: LatticeConfig = serde_json::from_str(json).unwrap();
    let lattice = Lattice::from_config(&config).unwrap();
    assert_eq!(lattice.get_axis_size("color").unwrap(), 2);
    assert_eq!(lattice.get_axis_size("parity").unwrap(), 2);
    assert_eq!(lattice.expand(["internal"]).unwrap(), vec!["spin", "color"]);
    assert_eq!(Lattice::from_config(&lattice.to_config()).unwrap(), lattice);
}
