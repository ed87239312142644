//! Label sets identifying a series within a metric.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// The complete label set of a series.
///
/// Pairs are kept sorted by name, so two label sets built from the same pairs in a
/// different order are equal. Equality, hashing and ordering all agree with the
/// canonical string form.
#[derive(Debug, Clone)]
pub struct Labels {
    metric_name: String,
    names: Vec<String>,
    values: Vec<String>,
    canonical: String,
}

impl Labels {
    /// Builds a label set for `metric_name`. Duplicate names keep the last value.
    pub fn new<I, K, V>(metric_name: &str, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let sorted: BTreeMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let (names, values): (Vec<String>, Vec<String>) = sorted.into_iter().unzip();
        let canonical = canonical_form(metric_name, &names, &values);
        Labels {
            metric_name: metric_name.to_string(),
            names,
            values,
            canonical,
        }
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Canonical string form, used as the series cache key.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(String::as_str))
    }
}

fn canonical_form(metric_name: &str, names: &[String], values: &[String]) -> String {
    let mut out = String::with_capacity(
        metric_name.len() + names.iter().chain(values).map(|s| s.len() + 4).sum::<usize>() + 2,
    );
    push_escaped(&mut out, metric_name);
    out.push('{');
    for (i, (name, value)) in names.iter().zip(values).enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_escaped(&mut out, name);
        out.push_str("=\"");
        push_escaped(&mut out, value);
        out.push('"');
    }
    out.push('}');
    out
}

/// Escapes every character the canonical form uses as a delimiter, so distinct
/// label sets never share a canonical string.
fn push_escaped(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '=' | ',' | '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}

impl PartialEq for Labels {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for Labels {}

impl Hash for Labels {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl Ord for Labels {
    fn cmp(&self, other: &Self) -> Ordering {
        self.metric_name
            .cmp(&other.metric_name)
            .then_with(|| self.iter().cmp(other.iter()))
    }
}

impl PartialOrd for Labels {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}
