//! Strategy expansion into execution branches.

use cadence_core::pipeline::Strategy;
use cadence_core::{Branch, Error, Result};
use serde_json::Value;

/// Expander turning a job strategy into an ordered list of branches.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyExpander;

impl StrategyExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a strategy.
    ///
    /// Product rows come first in row-major order (the first axis varies
    /// slowest), minus excluded rows, followed by include rows that no
    /// existing branch already covers. Repeated axis values count once, so
    /// no two branches are equal. An empty matrix yields one empty branch.
    pub fn expand(&self, strategy: &Strategy) -> Result<Vec<Branch>> {
        let axes = strategy.axes()?;
        let mut branches = self.generate_combinations(&axes);

        branches.retain(|branch| {
            !strategy
                .exclude
                .iter()
                .any(|exclude| self.agrees(branch, exclude))
        });

        for include in &strategy.include {
            if let Some(key) = include.keys().find(|k| !strategy.matrix.contains_key(*k)) {
                return Err(Error::Configuration(format!(
                    "include row key {:?} is not a matrix axis",
                    key
                )));
            }
            if branches.iter().any(|branch| self.agrees(branch, include)) {
                continue;
            }
            branches.push(include.clone());
        }

        Ok(branches)
    }

    fn generate_combinations(&self, axes: &[(&str, &[Value])]) -> Vec<Branch> {
        let mut result = vec![Branch::new()];

        for (key, values) in axes {
            let distinct: Vec<&Value> = values
                .iter()
                .enumerate()
                .filter(|&(i, value)| !values[..i].contains(value))
                .map(|(_, value)| value)
                .collect();
            let mut next = Vec::with_capacity(result.len() * distinct.len());
            for combo in &result {
                for value in &distinct {
                    let mut row = combo.clone();
                    row.insert((*key).to_string(), (*value).clone());
                    next.push(row);
                }
            }
            result = next;
        }

        result
    }

    /// Whether `branch` carries every key/value pair of `partial`.
    fn agrees(&self, branch: &Branch, partial: &Branch) -> bool {
        partial
            .iter()
            .all(|(key, value)| branch.get(key) == Some(value))
    }
}
