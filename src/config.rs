//! Serializable configuration
//!
//! A [`SessionConfig`] describes the execution engine, the logging setup and an optional
//! default lattice. It is usually loaded from a JSON file:
//!
//! ```
//! use latfield::config::{EngineConfig, SessionConfig};
//!
//! let config = SessionConfig::from_json(r#"{
//!     "engine": {"kind": "threaded", "workers": 4},
//!     "lattice": {"dims": {"t": 8, "x": 4, "y": 4, "z": 4}, "theory": "QCD"}
//! }"#).unwrap();
//! assert_eq!(config.engine, EngineConfig::Threaded { workers: 4 });
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, LocalEngine, TokioEngine};
use crate::errors::LatticeError;
use crate::lattice::{AxesSpec, Lattice, LatticeValue};
use crate::logging::LoggingConfig;

const ENGINE_ENV: &str = "LATFIELD_ENGINE";
const WORKERS_ENV: &str = "LATFIELD_WORKERS";

/// Serializable description of a [`Lattice`]
///
/// The sizes in `dofs` are applied after the theory, so they can resize its degrees of
/// freedom.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatticeConfig {
    pub dims: IndexMap<String, usize>,
    pub dofs: IndexMap<String, usize>,
    pub theory: Option<String>,
    pub labels: IndexMap<String, Vec<String>>,
    pub groups: IndexMap<String, Vec<String>>,
    pub properties: IndexMap<String, Vec<String>>,
}

impl Lattice {
    pub fn from_config(config: &LatticeConfig) -> Result<Lattice, LatticeError> {
        let mut lattice = Lattice::empty();
        let named = |map: &IndexMap<String, usize>| {
            AxesSpec::Named(map.iter().map(|(k, v)| (k.clone(), *v)).collect())
        };
        if !config.dims.is_empty() {
            lattice.set_dims(named(&config.dims))?;
        }
        match &config.theory {
            Some(theory) => {
                lattice.set_dofs(AxesSpec::Theory(theory.clone()))?;
                for (dof, size) in &config.dofs {
                    if !lattice.dofs().contains_key(dof) {
                        return Err(LatticeError::UnknownKey(dof.clone()));
                    }
                    lattice.set(dof, LatticeValue::Size(*size))?;
                }
            }
            None if !config.dofs.is_empty() => lattice.set_dofs(named(&config.dofs))?,
            None => {}
        }
        for (key, values) in &config.labels {
            lattice.add_label(key, values)?;
        }
        for (key, members) in &config.groups {
            lattice.add_group(key, members)?;
        }
        for (key, members) in &config.properties {
            lattice.add_property(key, members)?;
        }
        Ok(lattice)
    }

    pub fn to_config(&self) -> LatticeConfig {
        LatticeConfig {
            dims: self.dims().clone(),
            dofs: self.dofs().clone(),
            theory: None,
            labels: self.labels().clone(),
            groups: self.groups().clone(),
            properties: self.properties().clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EngineConfig {
    #[default]
    Local,
    Threaded { workers: usize },
}

impl EngineConfig {
    /// Threaded engine with one worker per available core
    pub fn threaded() -> Self {
        let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
        EngineConfig::Threaded { workers }
    }

    pub fn build(&self) -> anyhow::Result<Arc<dyn Engine>> {
        Ok(match self {
            EngineConfig::Local => Arc::new(LocalEngine),
            EngineConfig::Threaded { workers } => Arc::new(TokioEngine::new(*workers)?),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
    pub lattice: Option<LatticeConfig>,
}

impl SessionConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("parsing the session configuration")
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {path:?}"))?;
        Self::from_json(&text)
    }

    /// Applies `LATFIELD_ENGINE` and `LATFIELD_WORKERS`
    pub fn with_env_overrides(self) -> anyhow::Result<Self> {
        self.overridden_by(|name| std::env::var(name).ok())
    }

    /// Applies the engine overrides found by `lookup`
    pub fn overridden_by(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        if let Some(kind) = lookup(ENGINE_ENV) {
            self.engine = match kind.to_lowercase().as_str() {
                "local" => EngineConfig::Local,
                "threaded" | "tokio" => match self.engine {
                    EngineConfig::Threaded { workers } => EngineConfig::Threaded { workers },
                    EngineConfig::Local => EngineConfig::threaded(),
                },
                other => bail!("unknown engine {other:?} in {ENGINE_ENV}"),
            };
        }
        if let Some(workers) = lookup(WORKERS_ENV) {
            let workers: usize = workers
                .parse()
                .with_context(|| format!("{WORKERS_ENV} must be a positive integer"))?;
            if let EngineConfig::Threaded { workers: current } = &mut self.engine {
                *current = workers;
            }
        }
        Ok(self)
    }
}
