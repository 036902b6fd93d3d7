//! Task argument codec.
//!
//! A task's argument string is a list of comma-separated groups. Each group
//! is a bare flag (`-f`), `name=value` or `name value`; the value may contain
//! spaces. Commas cannot appear inside a value: there is no escaping.

use std::collections::BTreeMap;

/// Parsed task arguments, in their original order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskArguments {
    entries: Vec<(String, Option<String>)>,
}

impl TaskArguments {
    /// Parse a raw argument string. Empty or blank input yields no entries.
    pub fn parse(raw: &str) -> Self {
        let mut entries: Vec<(String, Option<String>)> = Vec::new();
        for group in raw.split(',').map(str::trim).filter(|g| !g.is_empty()) {
            let (name, value) = split_group(group);
            // Repeated names keep their first position and take the last value.
            match entries.iter_mut().find(|(n, _)| *n == name) {
                Some(entry) => entry.1 = value,
                None => entries.push((name, value)),
            }
        }
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw `(name, value)` pairs in input order.
    pub fn entries(&self) -> &[(String, Option<String>)] {
        &self.entries
    }

    /// Groups without a value, as written.
    pub fn flags(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Valued groups keyed by normalized name: leading dashes stripped,
    /// inner dashes turned into underscores.
    pub fn options(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(n, v)| v.as_ref().map(|v| (normalize_name(n), v.clone())))
            .collect()
    }

    /// The `--verbosity` (or `-v`) option, when it holds a number.
    pub fn verbosity(&self) -> Option<u8> {
        let options = self.options();
        options
            .get("verbosity")
            .or_else(|| options.get("v"))
            .and_then(|v| v.parse().ok())
    }

    /// Flattened positional form: each name followed by its value, if any.
    pub fn complete_args(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.entries.len() * 2);
        for (name, value) in &self.entries {
            out.push(name.clone());
            if let Some(value) = value {
                out.push(value.clone());
            }
        }
        out
    }

    /// Re-encode as an argument string using the `name value` form.
    pub fn encode(&self) -> String {
        self.entries
            .iter()
            .map(|(n, v)| match v {
                Some(v) => format!("{n} {v}"),
                None => n.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Split one group at its first `=` or whitespace, whichever comes first.
fn split_group(group: &str) -> (String, Option<String>) {
    match group
        .char_indices()
        .find(|(_, c)| *c == '=' || c.is_whitespace())
    {
        Some((idx, delim)) => {
            let name = group[..idx].trim().to_string();
            let value = group[idx + delim.len_utf8()..].trim();
            let value = (!value.is_empty()).then(|| value.to_string());
            (name, value)
        }
        None => (group.to_string(), None),
    }
}

fn normalize_name(name: &str) -> String {
    name.trim_start_matches('-').replace('-', "_")
}
