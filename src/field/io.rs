use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::config::LatticeConfig;
use crate::errors::{FieldError, IoError};
use crate::graph::{Delayed, Op};
use crate::io::Schema;
use crate::lattice::Lattice;
use crate::session::Session;
use crate::tunable::same_multiset;

use super::Field;

/// Whether `lattice` gives the axes of `schema` the sizes it was stored with
fn fits(lattice: &Lattice, schema: &Schema) -> bool {
    let sizes = |stored: &IndexMap<String, usize>, known: &IndexMap<String, usize>| {
        stored.iter().all(|(axis, size)| known.get(axis) == Some(size))
    };
    sizes(&schema.dims, lattice.dims()) && sizes(&schema.dofs, lattice.dofs())
}

impl Field {
    /// Description of the field as stored by [`Field::save`]
    ///
    /// Every axis must be a dimension or a degree of freedom, with the same size for all
    /// of its indexes.
    pub fn schema(&self) -> Result<Schema, FieldError> {
        let mut dims = IndexMap::new();
        let mut dofs = IndexMap::new();
        for (index, (axis, size)) in self.indexes.iter().zip(self.axes.iter().zip(&self.shape)) {
            let sizes = if self.lattice.dims().contains_key(axis) {
                &mut dims
            } else if self.lattice.dofs().contains_key(axis) {
                &mut dofs
            } else {
                return Err(IoError::Incompatible(format!(
                    "axis {axis:?} is neither a dimension nor a degree of freedom"
                ))
                .into());
            };
            match sizes.get(axis) {
                Some(known) if known != size => {
                    return Err(IoError::Incompatible(format!(
                        "index {index:?} has size {size}, other indexes of {axis:?} have {known}"
                    ))
                    .into())
                }
                _ => {
                    sizes.insert(axis.clone(), *size);
                }
            }
        }
        Ok(Schema {
            dims,
            dofs,
            axes: self.axes.clone(),
            dtype: self.dtype,
            field_type: self.field_type(),
        })
    }

    /// Field whose value is read from `path`, chunk by chunk
    ///
    /// The stored axes must be the ones of the field, with the sizes of the lattice. The
    /// format is deduced from the path when not given.
    pub fn load(&self, path: impl AsRef<Path>, format: Option<&str>) -> Result<Field, FieldError> {
        let path = path.as_ref();
        if !self.coords.is_empty() {
            return Err(FieldError::InvalidValue(
                "cannot load into a restricted field".to_string(),
            ));
        }
        let format = self.session.formats().resolve(path, format)?;
        let schema = format.get_type(path)?;
        if !same_multiset(&schema.axes, &self.axes) {
            return Err(IoError::Incompatible(format!(
                "{} stores the axes {:?}, the field has {:?}",
                path.display(),
                schema.axes,
                self.axes
            ))
            .into());
        }
        if !fits(&self.lattice, &schema) {
            return Err(IoError::Incompatible(format!(
                "{} was stored on {:?} x {:?}, the lattice is {}",
                path.display(),
                schema.dims,
                schema.dofs,
                self.lattice
            ))
            .into());
        }
        let layout = schema.indexes().into_iter().zip(schema.shape()?).collect();
        debug!(path = %path.display(), format = format.name(), "loading field");
        let chunks = self.chunks.fork();
        let value = Delayed::new(
            Op::Load {
                format,
                path: path.to_path_buf(),
                layout,
                chunks: Arc::clone(&chunks),
                to: self.order.clone(),
            },
            Vec::new(),
        );
        let field = Field {
            chunks,
            ..self.with_value(value)
        };
        Ok(field.with_dtype(schema.dtype))
    }

    /// Realizes the field and writes it to `path` in canonical index order
    pub fn save(&self, path: impl AsRef<Path>, format: Option<&str>) -> Result<(), FieldError> {
        let path = path.as_ref();
        let format = self.session.formats().resolve(path, format)?;
        let schema = self.schema()?;
        let buffer = self.compute()?;
        format.write(path, &schema, &buffer)?;
        info!(path = %path.display(), format = format.name(), indexes = ?self.indexes, "saved field");
        Ok(())
    }
}

impl Session {
    /// Field stored in `path`, on a lattice deduced from the stored sizes
    ///
    /// The default lattice of the session is used when it has the stored sizes.
    pub fn load(
        self: &Arc<Self>,
        path: impl AsRef<Path>,
        format: Option<&str>,
    ) -> Result<Field, FieldError> {
        let path = path.as_ref();
        let format = self.formats().resolve(path, format)?;
        let schema = format.get_type(path)?;
        let lattice = match self.lattice() {
            Some(lattice) if fits(lattice, &schema) => lattice.clone(),
            _ => Lattice::from_config(&LatticeConfig {
                dims: schema.dims.clone(),
                dofs: schema.dofs.clone(),
                ..Default::default()
            })?,
        };
        self.field(&schema.axes)
            .lattice(&lattice)
            .build()?
            .load(path, Some(format.name()))
    }
}

#[cfg(test)]
mod io_test {
    use super::*;
    use crate::buffer::DType;
    use crate::coordinates::Filters;
    use crate::lattice::LatticeValue;

    fn lattice() -> Lattice {
        let mut lattice = Lattice::default();
        lattice.set("space", LatticeValue::Size(2)).unwrap();
        lattice.set("time", LatticeValue::Size(4)).unwrap();
        lattice
    }

    fn session() -> Arc<Session> {
        Session::builder().lattice(lattice()).build()
    }

    #[test]
    fn schema_of_fields() {
        let session = session();
        let field = session.field(&["dims", "color", "color"]).build().unwrap();
        let schema = field.schema().unwrap();
        assert_eq!(schema.axes, field.axes());
        assert_eq!(schema.dims.get("t"), Some(&4));
        assert_eq!(schema.dofs.get("color"), Some(&3));
        assert_eq!(schema.dtype, DType::Complex128);

        let restricted = field.get(&Filters::new().with("color_0", 0)).unwrap();
        assert!(matches!(
            restricted.schema(),
            Err(FieldError::Io(IoError::Incompatible(_)))
        ));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vector.raw");
        let session = session();
        let field = session.field(&["dims", "spin"]).build().unwrap().random(3);
        field.save(&path, None).unwrap();

        let loaded = session
            .field(&["dims", "spin"])
            .build()
            .unwrap()
            .rechunk(&[("t", 2), ("x", 1)])
            .unwrap()
            .load(&path, None)
            .unwrap();
        assert_eq!(loaded.num_workers().unwrap(), 4);
        assert_eq!(loaded.compute().unwrap(), field.compute().unwrap());

        let by_time = session.field(&["dims", "spin"]).build().unwrap().load(&path, None).unwrap();
        let rechunked = by_time.rechunk(&[("t", 1)]).unwrap();
        assert_eq!(rechunked.num_workers().unwrap(), 4);
        assert_eq!(rechunked.compute().unwrap(), field.compute().unwrap());
        assert_eq!(by_time.num_workers().unwrap(), 1);
        assert_eq!(by_time.compute().unwrap(), field.compute().unwrap());

        let other = session.field(&["dims", "color"]).build().unwrap();
        assert!(matches!(
            other.load(&path, None),
            Err(FieldError::Io(IoError::Incompatible(_)))
        ));
    }

    #[test]
    fn session_load_deduces_the_lattice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gauge.bin");
        let field = session()
            .field(&["t", "color", "color"])
            .build()
            .unwrap()
            .ones();
        field.save(&path, Some("raw")).unwrap();

        let loaded = Session::new().load(&path, None).unwrap();
        assert_eq!(loaded.indexes(), field.indexes());
        assert_eq!(loaded.lattice().dims().get("t"), Some(&4));
        assert_eq!(loaded.compute().unwrap(), field.compute().unwrap());

        let same = session().load(&path, None).unwrap();
        assert_eq!(same.lattice(), field.lattice());
    }
}
