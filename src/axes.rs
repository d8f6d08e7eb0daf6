//! Grammar of axis signatures
//!
//! An axis signature is a list of tokens, each one a label followed by an optional run of
//! `!` and an optional `+`. A `!` asks for one mandatory occurrence of the label, a trailing
//! `+` (or a bare label) allows the label to appear more times. Repeated labels are merged
//! into a single [`Count`], so `["dofs", "dofs"]` and `["dofs!+"]` describe the same
//! signature.
//!
//! ```
//! use latfield::axes::Axes;
//!
//! let axes = Axes::parse(["dims", "dofs", "dofs"]).unwrap();
//! assert_eq!(axes.to_string(), "[dims+, dofs!+]");
//! assert_eq!(axes.expand(), vec!["dims", "dofs", "dofs"]);
//! ```

use std::fmt::{self, Display};
use std::ops::Add;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::AxesError;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-zA-Z][a-zA-Z0-9_]*)(!*)(\+?)$").expect("axis token pattern is valid")
});

static INDEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+)_[0-9]+$").expect("index pattern is valid"));

/// Merged multiplicity of a label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Count {
    must: usize,
    more: bool,
}

impl Count {
    pub fn new(must: usize, more: bool) -> Self {
        Count { must, more }
    }

    /// Number of mandatory occurrences
    pub fn must(&self) -> usize {
        self.must
    }

    /// Whether further occurrences are allowed
    pub fn open(&self) -> bool {
        self.more
    }

    /// Number of labels spelled out by [`Axes::expand`]
    pub fn len(&self) -> usize {
        self.must + usize::from(self.more)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn merge(self, token: Count) -> Count {
        let mut must = self.must + token.must;
        let mut more = self.more;
        if token.more {
            if self.more {
                must += 1;
            }
            more = true;
        }
        Count { must, more }
    }
}

impl Display for Count {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", "!".repeat(self.must))?;
        if self.more {
            write!(f, "+")?;
        }
        Ok(())
    }
}

/// Normalized axis signature: labels in order of first occurrence with their merged [`Count`]
///
/// Equality compares the label to count mapping and ignores the order of the labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Axes {
    entries: IndexMap<String, Count>,
}

impl Axes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a list of tokens, merging repeated labels
    pub fn parse<I, S>(tokens: I) -> Result<Axes, AxesError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut axes = Axes::new();
        for token in tokens {
            axes.push(token.as_ref())?;
        }
        Ok(axes)
    }

    /// Merges a single token into the signature
    pub fn push(&mut self, token: &str) -> Result<(), AxesError> {
        let (label, count) = parse_token(token)?;
        self.merge(label, count);
        Ok(())
    }

    fn merge(&mut self, label: &str, count: Count) {
        let entry = self.entries.entry(label.to_string()).or_default();
        *entry = entry.merge(count);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Count)> {
        self.entries.iter().map(|(label, count)| (label.as_str(), *count))
    }

    pub fn count(&self, label: &str) -> Option<Count> {
        self.entries.get(label).copied()
    }

    /// Canonical tokens, one per label
    pub fn tokens(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(label, count)| format!("{label}{count}"))
            .collect()
    }

    /// Labels repeated as many times as they appear in a field of this signature
    pub fn expand(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|(label, count)| std::iter::repeat(label.clone()).take(count.len()))
            .collect()
    }

    /// Every occurrence spelled out as its own token, keeping its marker
    ///
    /// `dofs!!+` becomes `["dofs!", "dofs!", "dofs+"]`. Parsing the result gives back the
    /// same signature.
    pub fn spelled(&self) -> Vec<String> {
        let mut tokens = Vec::new();
        for (label, count) in &self.entries {
            for _ in 0..count.must {
                tokens.push(format!("{label}!"));
            }
            if count.more {
                tokens.push(format!("{label}+"));
            }
        }
        tokens
    }

    /// Mandatory occurrences
    pub fn must(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|(label, count)| std::iter::repeat(label.clone()).take(count.must))
            .collect()
    }

    /// Labels allowed to repeat
    pub fn may(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, count)| count.more)
            .map(|(label, _)| label.clone())
            .collect()
    }

    /// Whether every label of `other` is accepted by `self`
    ///
    /// A label of `other` must be in `self` with at least as many mandatory occurrences,
    /// and when `other` allows more occurrences `self` has to allow them too.
    pub fn contains(&self, other: &Axes) -> bool {
        other
            .entries
            .iter()
            .all(|(label, theirs)| match self.entries.get(label) {
                Some(ours) => ours.must >= theirs.must && (!theirs.more || ours.more),
                None => false,
            })
    }
}

fn parse_token(token: &str) -> Result<(&str, Count), AxesError> {
    let caps = TOKEN
        .captures(token)
        .ok_or_else(|| AxesError::InvalidAxisToken(token.to_string()))?;
    let label = caps
        .get(1)
        .map(|m| m.as_str())
        .ok_or_else(|| AxesError::InvalidAxisToken(token.to_string()))?;
    let bangs = caps.get(2).map_or(0, |m| m.as_str().len());
    let plus = caps.get(3).map_or(false, |m| !m.as_str().is_empty());
    Ok((label, Count::new(bangs, plus || bangs == 0)))
}

impl Add for Axes {
    type Output = Axes;

    fn add(mut self, rhs: Axes) -> Axes {
        for (label, count) in rhs.entries {
            self.merge(&label, count);
        }
        self
    }
}

impl Add<&Axes> for &Axes {
    type Output = Axes;

    fn add(self, rhs: &Axes) -> Axes {
        self.clone() + rhs.clone()
    }
}

impl Display for Axes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.tokens().join(", "))
    }
}

/// Name of the `k`-th index of an axis repeated `count` times
pub fn index_name(axis: &str, k: usize, count: usize) -> String {
    if count > 1 {
        format!("{axis}_{k}")
    } else {
        axis.to_string()
    }
}

/// Axis an index belongs to
pub fn index_axis(index: &str) -> &str {
    INDEX
        .captures(index)
        .and_then(|caps| caps.get(1))
        .map_or(index, |m| m.as_str())
}

/// Index names of a list of axes, numbering the repeated ones
pub fn indexes_of<S: AsRef<str>>(axes: &[S]) -> Vec<String> {
    let mut totals: IndexMap<&str, usize> = IndexMap::new();
    for axis in axes {
        *totals.entry(axis.as_ref()).or_default() += 1;
    }
    let mut seen: IndexMap<&str, usize> = IndexMap::new();
    axes.iter()
        .map(|axis| {
            let axis = axis.as_ref();
            let k = seen.entry(axis).or_default();
            let name = index_name(axis, *k, totals.get(axis).copied().unwrap_or(1));
            *k += 1;
            name
        })
        .collect()
}

#[cfg(test)]
mod axes_test {
    use super::*;

    #[test]
    fn merging_markers() {
        let axes = Axes::parse(["a", "a"]).unwrap();
        assert_eq!(axes.count("a"), Some(Count::new(1, true)));

        let axes = Axes::parse(["a!", "a"]).unwrap();
        assert_eq!(axes.to_string(), "[a!+]");

        let axes = Axes::parse(["a!!", "a"]).unwrap();
        assert_eq!(axes.to_string(), "[a!!+]");

        let axes = Axes::parse(["a!", "a!"]).unwrap();
        assert_eq!(axes.to_string(), "[a!!]");
    }

    #[test]
    fn invalid_tokens() {
        for token in ["1a", "a+!", "", "a b", "_a", "a++"] {
            assert_eq!(
                Axes::parse([token]),
                Err(AxesError::InvalidAxisToken(token.to_string()))
            );
        }
    }

    #[test]
    fn expand_and_spell() {
        let axes = Axes::parse(["dofs!!", "dims"]).unwrap();
        assert_eq!(axes.expand(), vec!["dofs", "dofs", "dims"]);
        assert_eq!(axes.spelled(), vec!["dofs!", "dofs!", "dims+"]);
        assert_eq!(axes.must(), vec!["dofs", "dofs"]);
        assert_eq!(axes.may(), vec!["dims"]);
    }

    #[test]
    fn containment() {
        let sites = Axes::parse(["dims"]).unwrap();
        let vector = Axes::parse(["dims", "dofs!"]).unwrap();
        let spinor = Axes::parse(["spin"]).unwrap();
        let spin_matrix = Axes::parse(["spin!!"]).unwrap();

        assert!(vector.contains(&sites));
        assert!(!sites.contains(&vector));
        assert!(!spin_matrix.contains(&spinor));
        assert!(vector.contains(&Axes::new()));
    }

    #[test]
    fn index_names() {
        assert_eq!(
            indexes_of(&["x", "color", "color"]),
            vec!["x", "color_0", "color_1"]
        );
        assert_eq!(index_axis("color_1"), "color");
        assert_eq!(index_axis("x"), "x");
    }

    #[test]
    fn addition() {
        let links = Axes::parse(["dims"]).unwrap() + Axes::parse(["dirs"]).unwrap();
        let gauge = Axes::parse(["gauge"]).unwrap();
        let gauge_links = &links + &gauge;
        assert!(gauge_links.contains(&links));
        assert!(gauge_links.contains(&gauge));
        assert_eq!(gauge_links.len(), 3);
    }
}
