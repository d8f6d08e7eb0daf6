//! Field types
//!
//! A [`FieldType`] names a family of fields by the axes they carry. Types live in a
//! [`TypeRegistry`] which classifies the axes of a field into the list of types it is an
//! instance of, the most specific first.

use std::collections::{BTreeSet, HashMap};

use crate::axes::Axes;
use crate::errors::FieldTypeError;
use crate::lattice::Lattice;

/// Operations granted to fields by their types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Contraction of degrees of freedom on a single field, see `Field::trace`
    DofContraction,
    /// Sums and averages over the lattice sites
    VolumeReduction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldType {
    name: String,
    axes: Axes,
    parents: Vec<String>,
    capabilities: Vec<Capability>,
}

impl FieldType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn axes(&self) -> &Axes {
        &self.axes
    }

    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn is_subtype_of(&self, other: &FieldType) -> bool {
        self.axes.contains(&other.axes)
    }

    /// Whether a field with the given (expanded) axes on `lattice` is of this type
    ///
    /// Every label of the signature has to be known by the lattice. Then, for every axis a
    /// label expands to, the field must have at least the mandatory number of copies and,
    /// when the label does not allow more, exactly that number. Open labels without
    /// mandatory copies need at least one of their axes in the field.
    pub fn matches<S: AsRef<str>>(&self, lattice: &Lattice, axes: &[S]) -> bool {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for axis in axes {
            *counts.entry(axis.as_ref()).or_default() += 1;
        }
        for (label, count) in self.axes.iter() {
            let mut expanded = match lattice.expand([label]) {
                Ok(expanded) => expanded,
                Err(_) => return false,
            };
            expanded.sort();
            expanded.dedup();
            if expanded.is_empty() {
                return false;
            }
            for axis in &expanded {
                let found = counts.get(axis.as_str()).copied().unwrap_or(0);
                if found < count.must() || (!count.open() && found != count.must()) {
                    return false;
                }
            }
            if count.open()
                && count.must() == 0
                && !expanded.iter().any(|axis| counts.contains_key(axis.as_str()))
            {
                return false;
            }
        }
        true
    }

    /// Number of axes of the most general field of this type on `lattice`
    pub fn weight(&self, lattice: &Lattice) -> usize {
        lattice
            .expand(self.axes.expand())
            .map_or(0, |expanded| expanded.len())
    }
}

/// Registry of the known field types
///
/// The registry is ordered from the most recently registered type, which is the most
/// specific one, to the first.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: Vec<FieldType>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TypeRegistry {
    pub fn empty() -> Self {
        TypeRegistry { types: Vec::new() }
    }

    /// Registry with the lattice QCD types
    pub fn builtin() -> Self {
        let mut registry = TypeRegistry::empty();
        registry.install_builtin();
        registry
    }

    fn install_builtin(&mut self) {
        let parse = |tokens: &[&str]| Axes::parse(tokens).unwrap_or_default();
        let sites = parse(&["dims"]);
        let links = &sites + &parse(&["dirs"]);
        let gauge = parse(&["gauge"]);
        let definitions: [(&str, Axes, &[&str], &[Capability]); 10] = [
            ("Scalar", Axes::new(), &[], &[]),
            ("Degrees", parse(&["dofs"]), &["Scalar"], &[Capability::DofContraction]),
            ("Sites", sites.clone(), &["Scalar"], &[Capability::VolumeReduction]),
            ("Links", links.clone(), &["Sites"], &[]),
            ("Vector", &sites + &parse(&["dofs!"]), &["Sites"], &[]),
            ("Propagator", &sites + &parse(&["dofs!!"]), &["Sites"], &[]),
            ("Gauge", gauge.clone(), &["Scalar"], &[]),
            ("GaugeLinks", &links + &gauge, &["Links", "Gauge"], &[]),
            ("Spinor", parse(&["spin"]), &["Scalar"], &[]),
            ("SpinMatrix", parse(&["spin!!"]), &["Scalar"], &[]),
        ];
        for (name, axes, parents, capabilities) in definitions {
            self.types.push(FieldType {
                name: name.to_string(),
                axes,
                parents: parents.iter().map(|p| p.to_string()).collect(),
                capabilities: capabilities.to_vec(),
            });
        }
    }

    /// Registers a new type
    ///
    /// The signature must contain the signature of every parent.
    pub fn register(
        &mut self,
        name: &str,
        axes: Axes,
        parents: &[&str],
    ) -> Result<&FieldType, FieldTypeError> {
        self.register_with(name, axes, parents, &[])
    }

    pub fn register_with(
        &mut self,
        name: &str,
        axes: Axes,
        parents: &[&str],
        capabilities: &[Capability],
    ) -> Result<&FieldType, FieldTypeError> {
        if self.get(name).is_some() {
            return Err(FieldTypeError::DuplicateTypeName(name.to_string()));
        }
        for parent in parents {
            let parent = self
                .get(parent)
                .ok_or_else(|| FieldTypeError::UnknownType(parent.to_string()))?;
            if !axes.contains(parent.axes()) {
                return Err(FieldTypeError::IncompatibleAxes {
                    name: name.to_string(),
                    parent: parent.name.clone(),
                    axes: axes.to_string(),
                    parent_axes: parent.axes.to_string(),
                });
            }
        }
        self.types.push(FieldType {
            name: name.to_string(),
            axes,
            parents: parents.iter().map(|p| p.to_string()).collect(),
            capabilities: capabilities.to_vec(),
        });
        Ok(&self.types[self.types.len() - 1])
    }

    pub fn get(&self, name: &str) -> Option<&FieldType> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Types from the most specific to the most generic
    pub fn iter(&self) -> impl Iterator<Item = &FieldType> {
        self.types.iter().rev()
    }

    pub fn names(&self) -> Vec<&str> {
        self.iter().map(FieldType::name).collect()
    }

    /// Types the given axes are an instance of, the most specific first
    ///
    /// Types are sorted by the number of axes of their most general field on the lattice,
    /// ties keep the registry order.
    pub fn classify<S: AsRef<str>>(&self, lattice: &Lattice, axes: &[S]) -> Vec<&str> {
        let mut found: Vec<(usize, &FieldType)> = self
            .iter()
            .filter(|t| t.matches(lattice, axes))
            .map(|t| (t.weight(lattice), t))
            .collect();
        found.sort_by(|a, b| b.0.cmp(&a.0));
        found.into_iter().map(|(_, t)| t.name()).collect()
    }

    pub fn is_instance<S: AsRef<str>>(
        &self,
        lattice: &Lattice,
        axes: &[S],
        name: &str,
    ) -> Result<bool, FieldTypeError> {
        let field_type = self
            .get(name)
            .ok_or_else(|| FieldTypeError::UnknownType(name.to_string()))?;
        Ok(field_type.matches(lattice, axes))
    }

    /// Types whose labels are all defined on `lattice`
    pub fn available_on(&self, lattice: &Lattice) -> Vec<&str> {
        self.iter()
            .filter(|t| t.axes.labels().all(|label| lattice.expand([label]).is_ok()))
            .map(FieldType::name)
            .collect()
    }

    /// Union of the capabilities of the types the axes are an instance of
    pub fn capabilities<S: AsRef<str>>(&self, lattice: &Lattice, axes: &[S]) -> BTreeSet<Capability> {
        self.iter()
            .filter(|t| t.matches(lattice, axes))
            .flat_map(|t| t.capabilities.iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod types_test {
    use super::*;
    use crate::lattice::{AxesSpec, LatticeValue};

    fn lattice() -> Lattice {
        let mut lattice = Lattice::default();
        lattice.set("space", LatticeValue::Size(4)).unwrap();
        lattice.set("time", LatticeValue::Size(8)).unwrap();
        lattice
    }

    fn expand(lattice: &Lattice, tokens: &[&str]) -> Vec<String> {
        lattice
            .expand(Axes::parse(tokens).unwrap().expand())
            .unwrap()
    }

    #[test]
    fn builtin_hierarchy() {
        let registry = TypeRegistry::builtin();
        let get = |name| registry.get(name).unwrap();
        assert!(get("Vector").is_subtype_of(get("Sites")));
        assert!(get("GaugeLinks").is_subtype_of(get("Links")));
        assert!(get("GaugeLinks").is_subtype_of(get("Gauge")));
        assert!(!get("SpinMatrix").is_subtype_of(get("Spinor")));
        assert_eq!(registry.names()[0], "SpinMatrix");
    }

    #[test]
    fn registration_errors() {
        let mut registry = TypeRegistry::builtin();
        assert_eq!(
            registry.register("Vector", Axes::new(), &[]).unwrap_err(),
            FieldTypeError::DuplicateTypeName("Vector".into())
        );
        assert!(matches!(
            registry.register("Bad", Axes::parse(["spin"]).unwrap(), &["Sites"]),
            Err(FieldTypeError::IncompatibleAxes { .. })
        ));
        let axes = Axes::parse(["dims", "spin!"]).unwrap();
        registry.register("SpinVector", axes, &["Sites"]).unwrap();
        assert_eq!(registry.names()[0], "SpinVector");
    }

    #[test]
    fn classification() {
        let lattice = lattice();
        let registry = TypeRegistry::builtin();

        let propagator = expand(&lattice, &["dims", "dofs", "dofs"]);
        let types = registry.classify(&lattice, &propagator);
        assert_eq!(types[0], "Propagator");
        assert!(!types.contains(&"Vector"));
        assert!(types.contains(&"Sites"));
        assert!(types.contains(&"Degrees"));
        assert!(types.contains(&"Scalar"));

        let vector = expand(&lattice, &["dims", "dofs"]);
        assert_eq!(registry.classify(&lattice, &vector)[0], "Vector");

        let gauge_links = expand(&lattice, &["dims", "dirs", "gauge", "gauge"]);
        assert_eq!(registry.classify(&lattice, &gauge_links)[0], "GaugeLinks");

        let capabilities = registry.capabilities(&lattice, &vector);
        assert!(capabilities.contains(&Capability::DofContraction));
        assert!(capabilities.contains(&Capability::VolumeReduction));
    }

    #[test]
    fn spin_only_lattice() {
        let mut lattice = Lattice::empty();
        lattice.set_dims(AxesSpec::Sizes(vec![4, 4])).unwrap();
        lattice
            .set_dofs(AxesSpec::Named(vec![("spin".into(), 4)]))
            .unwrap();
        let registry = TypeRegistry::builtin();
        let axes = expand(&lattice, &["dims", "dofs!!"]);
        assert!(registry.is_instance(&lattice, &axes, "Propagator").unwrap());
        assert!(!registry.is_instance(&lattice, &axes, "Vector").unwrap());
        assert!(!registry.available_on(&lattice).contains(&"Gauge"));
    }
}
