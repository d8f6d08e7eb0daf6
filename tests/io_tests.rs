use latfield::buffer::DType;
use latfield::errors::{FieldError, IoError};
use latfield::lattice::Lattice;
use latfield::Session;

fn session() -> std::sync::Arc<Session> {
    let lattice = Lattice::new(
        [("t", 4), ("x", 4), ("y", 2), ("z", 2)],
        [("spin", 4), ("color", 3)],
    )
    .unwrap();
    Session::builder().lattice(lattice).build()
}

#[test]
fn propagators_survive_a_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("propagator.lat");
    let session = session();
    let propagator = session
        .field(&["dims", "spin", "spin"])
        .build()
        .unwrap()
        .random(21)
        .reorder(&["spin_1", "z", "y", "x", "t", "spin_0"])
        .unwrap();
    propagator.save(&path, None).unwrap();

    let loaded = Session::new().load(&path, None).unwrap();
    assert_eq!(loaded.indexes(), propagator.indexes());
    assert_eq!(loaded.dtype(), DType::Complex128);
    assert_eq!(loaded.compute().unwrap(), propagator.compute().unwrap());
}

#[test]
fn chunked_loads_match_whole_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sites.raw");
    let session = session();
    let field = session.field(&["dims"]).build().unwrap().random(5).real();
    field.save(&path, None).unwrap();

    let whole = session.load(&path, None).unwrap();
    let chunked = session
        .field(&["dims"])
        .build()
        .unwrap()
        .rechunk(&[("t", 1), ("x", 2)])
        .unwrap()
        .load(&path, None)
        .unwrap();
    assert_eq!(chunked.num_workers().unwrap(), 8);
    assert_eq!(chunked.dtype(), DType::Float64);
    assert_eq!(chunked.compute().unwrap(), whole.compute().unwrap());
    assert_eq!(whole.compute().unwrap(), field.compute().unwrap());
}

#[test]
fn formats_are_deduced_from_the_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gauge.dat");
    let session = session();
    let field = session.field(&["color", "color"]).build().unwrap().ones();
    field.save(&path, Some("RAW")).unwrap();
    let loaded = session.load(&path, None).unwrap();
    assert_eq!(loaded.compute().unwrap(), field.compute().unwrap());

    assert!(matches!(
        field.save(dir.path().join("gauge.h5"), Some("hdf5")),
        Err(FieldError::Io(IoError::UnknownFormat(_)))
    ));

    let text = dir.path().join("notes.txt");
    std::fs::write(&text, "not a field").unwrap();
    assert!(matches!(
        session.load(&text, None),
        Err(FieldError::Io(IoError::CannotDeduce(_)))
    ));
}
