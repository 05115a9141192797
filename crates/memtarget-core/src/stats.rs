//! Recursive usage snapshot produced by every memory target.
//!
//! Consumed by reporting layers; this crate only builds and prints it.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// `peak` sentinel for composites whose peak cannot be derived from children.
pub const PEAK_UNKNOWN: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub current: i64,
    pub peak: i64,
    /// Ordered so equal trees serialize byte-identically.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, StatsSnapshot>,
}

impl StatsSnapshot {
    pub fn leaf(current: i64, peak: i64) -> Self {
        Self {
            current,
            peak,
            children: BTreeMap::new(),
        }
    }

    /// Aggregate node: `current` is the sum of the children, `peak` unknown.
    pub fn merged<I>(children: I) -> Self
    where
        I: IntoIterator<Item = (String, StatsSnapshot)>,
    {
        let children: BTreeMap<_, _> = children.into_iter().collect();
        Self {
            current: children.values().map(|c| c.current).sum(),
            peak: PEAK_UNKNOWN,
            children,
        }
    }

    pub fn with_child(mut self, name: impl Into<String>, child: StatsSnapshot) -> Self {
        self.children.insert(name.into(), child);
        self
    }

    pub fn peak_known(&self) -> bool {
        self.peak != PEAK_UNKNOWN
    }

    pub fn child(&self, name: &str) -> Option<&StatsSnapshot> {
        self.children.get(name)
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Indented tree, one node per line, rooted at `name`.
    pub fn pretty(&self, name: &str) -> String {
        let mut out = String::new();
        self.write_node(&mut out, name, "", "");
        out
    }

    fn write_node(&self, out: &mut String, name: &str, head: &str, tail: &str) {
        let peak = if self.peak_known() {
            self.peak.to_string()
        } else {
            "N/A".to_string()
        };
        let _ = writeln!(out, "{head}{name}: current {} bytes, peak {peak}", self.current);
        let last = self.children.len().saturating_sub(1);
        for (i, (child_name, child)) in self.children.iter().enumerate() {
            let (branch, cont) = if i == last {
                ("\\- ", "   ")
            } else {
                ("+- ", "|  ")
            };
            child.write_node(
                out,
                child_name,
                &format!("{tail}{branch}"),
                &format!("{tail}{cont}"),
            );
        }
    }
}
