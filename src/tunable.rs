//! Tunable options
//!
//! A tunable option is a parameter whose value is decided once, before a computation is
//! realized. Every option owns a [`Resolver`] giving its default value and telling which
//! values are acceptable. Options are single-assignment cells shared between every field
//! and graph node that depends on them.

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::errors::TuneError;

static NEXT_OPTION: AtomicU64 = AtomicU64::new(0);

/// Value taken by an option
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Names(Vec<String>),
    Indices(Vec<usize>),
    Chunks(IndexMap<String, usize>),
    Text(String),
    Int(i64),
    Flag(bool),
}

impl Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Names(names) => write!(f, "{names:?}"),
            OptionValue::Indices(indices) => write!(f, "{indices:?}"),
            OptionValue::Chunks(chunks) => write!(f, "{chunks:?}"),
            OptionValue::Text(text) => write!(f, "{text:?}"),
            OptionValue::Int(value) => write!(f, "{value}"),
            OptionValue::Flag(value) => write!(f, "{value}"),
        }
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(value: Vec<String>) -> Self {
        OptionValue::Names(value)
    }
}

impl From<Vec<&str>> for OptionValue {
    fn from(value: Vec<&str>) -> Self {
        OptionValue::Names(value.into_iter().map(String::from).collect())
    }
}

impl From<Vec<usize>> for OptionValue {
    fn from(value: Vec<usize>) -> Self {
        OptionValue::Indices(value)
    }
}

impl From<IndexMap<String, usize>> for OptionValue {
    fn from(value: IndexMap<String, usize>) -> Self {
        OptionValue::Chunks(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Text(value.to_string())
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Flag(value)
    }
}

/// Default value and acceptance rule of an option
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolver {
    /// Only this value
    Fixed(OptionValue),
    /// Any permutation of a list of names or indices
    Permutation(OptionValue),
    /// One of the options, the first being the default
    Choice(Vec<OptionValue>),
    /// Chunk sizes not larger than the given shape, the default being one chunk
    ChunksOf(IndexMap<String, usize>),
}

impl Resolver {
    pub fn permutation<S: AsRef<str>>(items: &[S]) -> Self {
        Resolver::Permutation(OptionValue::Names(
            items.iter().map(|s| s.as_ref().to_string()).collect(),
        ))
    }

    /// Permutations of `0..n`
    pub fn permutation_of(n: usize) -> Self {
        Resolver::Permutation(OptionValue::Indices((0..n).collect()))
    }

    pub fn choice(options: Vec<OptionValue>) -> Result<Self, TuneError> {
        if options.is_empty() {
            return Err(TuneError::InvalidResolver(
                "a choice needs at least one option".to_string(),
            ));
        }
        Ok(Resolver::Choice(options))
    }

    /// Value used when tuning without a callback
    pub fn default_value(&self) -> Option<OptionValue> {
        match self {
            Resolver::Fixed(value) | Resolver::Permutation(value) => Some(value.clone()),
            Resolver::Choice(options) => options.first().cloned(),
            Resolver::ChunksOf(shape) => Some(OptionValue::Chunks(shape.clone())),
        }
    }

    pub fn accepts(&self, value: &OptionValue) -> bool {
        match (self, value) {
            (Resolver::Fixed(fixed), value) => fixed == value,
            (Resolver::Permutation(OptionValue::Names(base)), OptionValue::Names(value)) => {
                same_multiset(base, value)
            }
            (Resolver::Permutation(OptionValue::Indices(base)), OptionValue::Indices(value)) => {
                same_multiset(base, value)
            }
            (Resolver::Permutation(_), _) => false,
            (Resolver::Choice(options), value) => options.contains(value),
            (Resolver::ChunksOf(shape), OptionValue::Chunks(chunks)) => {
                chunks.len() == shape.len()
                    && chunks.iter().all(|(key, chunk)| {
                        shape.get(key).map_or(false, |size| *chunk >= 1 && chunk <= size)
                    })
            }
            (Resolver::ChunksOf(_), _) => false,
        }
    }
}

pub(crate) fn same_multiset<T: Ord + Clone>(a: &[T], b: &[T]) -> bool {
    let (mut a, mut b) = (a.to_vec(), b.to_vec());
    a.sort();
    b.sort();
    a == b
}

/// Callback deciding the value of an option from its name and default
pub type TuneCallback = dyn Fn(&str, &OptionValue) -> OptionValue;

/// A named single-assignment option
#[derive(Debug)]
pub struct TunableOption {
    uid: u64,
    name: String,
    resolver: Resolver,
    value: OnceCell<OptionValue>,
}

impl TunableOption {
    pub fn new(name: impl Into<String>, resolver: Resolver) -> Arc<Self> {
        Arc::new(TunableOption {
            uid: NEXT_OPTION.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            resolver,
            value: OnceCell::new(),
        })
    }

    /// Option already tuned to `value`
    pub fn tuned(
        name: impl Into<String>,
        resolver: Resolver,
        value: OptionValue,
    ) -> Result<Arc<Self>, TuneError> {
        let option = TunableOption::new(name, resolver);
        option.set(value)?;
        Ok(option)
    }

    /// Option with a single acceptable value, already tuned
    pub fn fixed(name: impl Into<String>, value: OptionValue) -> Arc<Self> {
        let value_cell = OnceCell::new();
        let _ = value_cell.set(value.clone());
        Arc::new(TunableOption {
            uid: NEXT_OPTION.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            resolver: Resolver::Fixed(value),
            value: value_cell,
        })
    }

    /// New option with the same name and resolver, tuned to the same value if any
    pub fn fork(&self) -> Arc<Self> {
        let value = OnceCell::new();
        if let Some(current) = self.value.get() {
            let _ = value.set(current.clone());
        }
        Arc::new(TunableOption {
            uid: NEXT_OPTION.fetch_add(1, Ordering::Relaxed),
            name: self.name.clone(),
            resolver: self.resolver.clone(),
            value,
        })
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn value(&self) -> Option<&OptionValue> {
        self.value.get()
    }

    pub fn is_tuned(&self) -> bool {
        self.value.get().is_some()
    }

    /// Tunes the option to `value`
    ///
    /// Setting a tuned option to its current value does nothing.
    pub fn set(&self, value: OptionValue) -> Result<(), TuneError> {
        if !self.resolver.accepts(&value) {
            return Err(TuneError::IncompatibleValue {
                option: self.name.clone(),
                value: value.to_string(),
            });
        }
        match self.value.get() {
            Some(current) if *current == value => Ok(()),
            Some(_) => Err(TuneError::AlreadyTuned(self.name.clone())),
            None => self
                .value
                .set(value)
                .map_err(|_| TuneError::AlreadyTuned(self.name.clone())),
        }
    }

    /// Resolves the option, unless already tuned, and returns its value
    pub fn tune(&self, callback: Option<&TuneCallback>) -> Result<OptionValue, TuneError> {
        if let Some(value) = self.value.get() {
            return Ok(value.clone());
        }
        let default = self.resolver.default_value().ok_or_else(|| {
            TuneError::InvalidResolver(format!("option {:?} has no default", self.name))
        })?;
        let value = match callback {
            Some(callback) => callback(&self.name, &default),
            None => default,
        };
        self.set(value.clone())?;
        debug!(option = %self.name, value = %value, "tuned option");
        Ok(value)
    }
}

/// Registration-ordered collection of named options
#[derive(Debug, Clone, Default)]
pub struct Tunable {
    options: IndexMap<String, Arc<TunableOption>>,
}

impl Tunable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_option(
        &mut self,
        name: &str,
        resolver: Resolver,
    ) -> Result<Arc<TunableOption>, TuneError> {
        let option = TunableOption::new(name, resolver);
        self.attach(name, Arc::clone(&option))?;
        Ok(option)
    }

    /// Adds an option already fixed to `value`
    pub fn add_tuned(
        &mut self,
        name: &str,
        value: OptionValue,
    ) -> Result<Arc<TunableOption>, TuneError> {
        let option = TunableOption::fixed(name, value);
        self.attach(name, Arc::clone(&option))?;
        Ok(option)
    }

    /// Registers an option shared with someone else under `name`
    pub fn attach(&mut self, name: &str, option: Arc<TunableOption>) -> Result<(), TuneError> {
        if self.options.contains_key(name) {
            return Err(TuneError::DuplicateOption(name.to_string()));
        }
        self.options.insert(name.to_string(), option);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TunableOption>> {
        self.options.get(name)
    }

    pub fn value(&self, name: &str) -> Result<Option<OptionValue>, TuneError> {
        self.options
            .get(name)
            .map(|option| option.value().cloned())
            .ok_or_else(|| TuneError::UnknownOption(name.to_string()))
    }

    pub fn set(&self, name: &str, value: OptionValue) -> Result<(), TuneError> {
        self.options
            .get(name)
            .ok_or_else(|| TuneError::UnknownOption(name.to_string()))?
            .set(value)
    }

    /// Tunes `name`, or every pending option in registration order
    pub fn tune(&self, name: Option<&str>, callback: Option<&TuneCallback>) -> Result<(), TuneError> {
        match name {
            Some(name) => {
                self.options
                    .get(name)
                    .ok_or_else(|| TuneError::UnknownOption(name.to_string()))?
                    .tune(callback)?;
            }
            None => {
                for option in self.options.values() {
                    option.tune(callback)?;
                }
            }
        }
        Ok(())
    }

    /// Names of the options still to be tuned
    pub fn tunable_options(&self) -> Vec<&str> {
        self.options
            .iter()
            .filter(|(_, option)| !option.is_tuned())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn tuned_options(&self) -> Vec<(&str, OptionValue)> {
        self.options
            .iter()
            .filter_map(|(name, option)| option.value().map(|v| (name.as_str(), v.clone())))
            .collect()
    }

    pub fn is_tunable(&self) -> bool {
        self.options.values().any(|option| !option.is_tuned())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<TunableOption>)> {
        self.options.iter().map(|(name, option)| (name.as_str(), option))
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

impl FromIterator<(String, Arc<TunableOption>)> for Tunable {
    fn from_iter<T: IntoIterator<Item = (String, Arc<TunableOption>)>>(iter: T) -> Self {
        Tunable {
            options: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tunable_test {
    use super::*;

    #[test]
    fn permutation_resolver() {
        let resolver = Resolver::permutation(&["x", "y", "y"]);
        assert!(resolver.accepts(&vec!["y", "x", "y"].into()));
        assert!(!resolver.accepts(&vec!["y", "x", "x"].into()));
        assert!(!resolver.accepts(&vec![0usize, 1, 2].into()));
        assert_eq!(resolver.default_value(), Some(vec!["x", "y", "y"].into()));
    }

    #[test]
    fn chunks_resolver() {
        let shape: IndexMap<String, usize> = [("x".to_string(), 4), ("t".to_string(), 8)].into();
        let resolver = Resolver::ChunksOf(shape.clone());
        let mut chunks = shape.clone();
        chunks.insert("t".into(), 3);
        assert!(resolver.accepts(&chunks.clone().into()));
        chunks.insert("t".into(), 9);
        assert!(!resolver.accepts(&chunks.into()));
    }

    #[test]
    fn single_assignment() {
        let option = TunableOption::new("order", Resolver::permutation(&["a", "b"]));
        assert!(!option.is_tuned());
        assert_eq!(
            option.set(vec!["a", "c"].into()),
            Err(TuneError::IncompatibleValue {
                option: "order".into(),
                value: "[\"a\", \"c\"]".into()
            })
        );
        option.set(vec!["b", "a"].into()).unwrap();
        option.set(vec!["b", "a"].into()).unwrap();
        assert_eq!(
            option.set(vec!["a", "b"].into()),
            Err(TuneError::AlreadyTuned("order".into()))
        );
        assert!(matches!(
            option.set(vec!["a"].into()),
            Err(TuneError::IncompatibleValue { .. })
        ));
        assert_eq!(option.tune(None).unwrap(), vec!["b", "a"].into());
    }

    #[test]
    fn forks_are_independent() {
        let option = TunableOption::new("order", Resolver::permutation_of(2));
        let fork = option.fork();
        assert_ne!(fork.uid(), option.uid());
        fork.set(vec![1usize, 0].into()).unwrap();
        assert!(!option.is_tuned());

        option.set(vec![0usize, 1].into()).unwrap();
        let tuned = option.fork();
        assert_eq!(tuned.value(), Some(&vec![0usize, 1].into()));
        assert_eq!(tuned.resolver(), option.resolver());
    }

    #[test]
    fn tune_in_order_with_callback() {
        let mut tunable = Tunable::new();
        tunable
            .add_option("mode", Resolver::choice(vec!["fast".into(), "slow".into()]).unwrap())
            .unwrap();
        tunable.add_option("order", Resolver::permutation_of(3)).unwrap();
        tunable.add_tuned("dtype", "complex128".into()).unwrap();
        assert_eq!(tunable.tunable_options(), vec!["mode", "order"]);

        let pick_slow = |name: &str, default: &OptionValue| match name {
            "mode" => OptionValue::from("slow"),
            _ => default.clone(),
        };
        tunable.tune(Some("mode"), Some(&pick_slow)).unwrap();
        assert_eq!(tunable.tunable_options(), vec!["order"]);
        tunable.tune(None, None).unwrap();
        tunable.tune(None, None).unwrap();
        assert!(!tunable.is_tunable());
        assert_eq!(tunable.value("mode").unwrap(), Some("slow".into()));
        assert_eq!(tunable.value("order").unwrap(), Some(vec![0usize, 1, 2].into()));
        assert!(matches!(
            tunable.add_option("mode", Resolver::permutation_of(1)),
            Err(TuneError::DuplicateOption(_))
        ));
    }
}
