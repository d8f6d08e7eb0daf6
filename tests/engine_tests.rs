use std::sync::Arc;

use latfield::config::{EngineConfig, SessionConfig};
use latfield::errors::FieldError;
use latfield::field::DotOptions;
use latfield::lattice::Lattice;
use latfield::{Field, Session};

fn lattice() -> Lattice {
    Lattice::new(
        [("t", 4), ("x", 2), ("y", 2), ("z", 2)],
        [("spin", 4), ("color", 3)],
    )
    .unwrap()
}

fn correlator(session: &Arc<Session>) -> Field {
    let quark = session
        .field(&["dims", "spin", "color"])
        .chunks(&[("t", 1)])
        .build()
        .unwrap()
        .random(11);
    quark
        .dot(&[&quark.conj()], &DotOptions::new())
        .unwrap()
        .sum(&["space"])
        .unwrap()
}

#[tokio::test]
async fn async_and_blocking_realizations_agree() {
    let session = Session::builder().lattice(lattice()).build();
    let blocking = correlator(&session).compute().unwrap();
    let field = correlator(&session);
    let awaited = field.compute_async().await.unwrap();
    assert_eq!(awaited, blocking);
    assert_eq!(awaited.shape(), &[4]);
}

#[test]
fn threaded_engine_from_configuration() {
    let config = SessionConfig::from_json(r#"{"engine": {"kind": "threaded", "workers": 2}}"#)
        .unwrap();
    let threaded = Session::from_config(&config).unwrap();
    assert_eq!(threaded.engine().name(), "threaded");
    assert_eq!(threaded.engine().workers(), 2);

    let threaded = Session::builder()
        .lattice(lattice())
        .engine(config.engine.build().unwrap())
        .build();
    let local = Session::builder().lattice(lattice()).build();
    assert_eq!(
        correlator(&threaded).compute().unwrap(),
        correlator(&local).compute().unwrap()
    );
}

#[test]
fn threaded_engine_refuses_to_block_a_runtime() {
    let engine = EngineConfig::Threaded { workers: 2 }.build().unwrap();
    let session = Session::builder().lattice(lattice()).engine(engine).build();
    let field = correlator(&session);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let blocked = runtime.block_on(async { field.compute() });
    assert!(matches!(blocked, Err(FieldError::Engine(_))));
    let awaited = runtime.block_on(field.compute_async()).unwrap();
    assert_eq!(awaited.shape(), &[4]);
}

#[test]
fn environment_overrides() {
    let lookup = |name: &str| match name {
        "LATFIELD_ENGINE" => Some("threaded".to_string()),
        "LATFIELD_WORKERS" => Some("3".to_string()),
        _ => None,
    };
    let config = SessionConfig::default().overridden_by(lookup).unwrap();
    assert_eq!(config.engine, EngineConfig::Threaded { workers: 3 });

    let invalid = |name: &str| (name == "LATFIELD_ENGINE").then(|| "gpu".to_string());
    assert!(SessionConfig::default().overridden_by(invalid).is_err());
}
