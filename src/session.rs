//! Execution context of fields
//!
//! A [`Session`] bundles what fields need besides their own data: the registry of field
//! types used to classify them, the engine realizing their computations, the formats they
//! can be stored in and, optionally, the lattice used when none is given.
//!
//! ```
//! use latfield::lattice::Lattice;
//! use latfield::session::Session;
//!
//! let session = Session::builder().lattice(Lattice::default()).build();
//! let field = session.field(&["dims", "dofs"]).build().unwrap();
//! assert_eq!(field.types()[0], "Vector");
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::axes::Axes;
use crate::config::SessionConfig;
use crate::engine::{Engine, LocalEngine};
use crate::errors::FieldTypeError;
use crate::field::FieldBuilder;
use crate::io::{Format, FormatRegistry};
use crate::lattice::Lattice;
use crate::logging;
use crate::types::{Capability, TypeRegistry};

pub struct Session {
    registry: TypeRegistry,
    engine: Arc<dyn Engine>,
    formats: FormatRegistry,
    lattice: Option<Lattice>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("types", &self.registry.names())
            .field("engine", &self.engine.name())
            .field("formats", &self.formats.names())
            .field("lattice", &self.lattice.as_ref().map(ToString::to_string))
            .finish()
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Session with the builtin types, the local engine and no default lattice
    pub fn new() -> Arc<Session> {
        Session::builder().build()
    }

    /// Session described by `config`, also installing its logging setup
    pub fn from_config(config: &SessionConfig) -> anyhow::Result<Arc<Session>> {
        if let Err(error) = logging::init_logging(&config.logging) {
            debug!(%error, "keeping the installed subscriber");
        }
        let mut builder = Session::builder().engine(config.engine.build()?);
        if let Some(lattice) = &config.lattice {
            builder = builder.lattice(Lattice::from_config(lattice)?);
        }
        Ok(builder.build())
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn formats(&self) -> &FormatRegistry {
        &self.formats
    }

    /// Frozen default lattice
    pub fn lattice(&self) -> Option<&Lattice> {
        self.lattice.as_ref()
    }

    /// Starts building a field with the given axes
    pub fn field<S: AsRef<str>>(self: &Arc<Self>, axes: &[S]) -> FieldBuilder {
        FieldBuilder::new(Arc::clone(self), axes)
    }
}

#[derive(Debug, Default)]
pub struct SessionBuilder {
    registry: Option<TypeRegistry>,
    engine: Option<Arc<dyn Engine>>,
    formats: Option<FormatRegistry>,
    lattice: Option<Lattice>,
}

impl SessionBuilder {
    /// Replaces the builtin types
    pub fn registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Adds a field type on top of the current registry
    pub fn register(
        mut self,
        name: &str,
        axes: Axes,
        parents: &[&str],
        capabilities: &[Capability],
    ) -> Result<Self, FieldTypeError> {
        self.registry
            .get_or_insert_with(TypeRegistry::builtin)
            .register_with(name, axes, parents, capabilities)?;
        Ok(self)
    }

    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn format(mut self, format: Arc<dyn Format>) -> Self {
        self.formats
            .get_or_insert_with(FormatRegistry::default)
            .register(format);
        self
    }

    pub fn lattice(mut self, lattice: Lattice) -> Self {
        self.lattice = Some(lattice);
        self
    }

    pub fn build(self) -> Arc<Session> {
        Arc::new(Session {
            registry: self.registry.unwrap_or_default(),
            engine: self.engine.unwrap_or_else(|| Arc::new(LocalEngine)),
            formats: self.formats.unwrap_or_default(),
            lattice: self.lattice.map(|lattice| lattice.freeze()),
        })
    }
}
