//! Bipartite test <-> route coverage map.
//!
//! Built from one instrumented run of the whole suite. The harness learns the trace file
//! from [`TRACE_ENV`] and appends one record per line:
//!
//! ```text
//! test<TAB>tests/test_users.py::test_create_adult
//! route<TAB>tests/test_users.py::test_create_adult<TAB>POST<TAB>/users
//! ```
//!
//! Every test the harness collected gets a `test` record, so tests that never reach a
//! route still show up (as uninstrumented).

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::error::TraceError;
use crate::route::RouteKey;

/// Environment variable naming the trace file during the instrumented baseline run.
pub const TRACE_ENV: &str = "SMART_MUTANT_TRACE";

/// Identifier the test command accepts as a selection argument.
pub type TestId = String;

static NO_TESTS: BTreeSet<TestId> = BTreeSet::new();

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageRegistry {
    tests: BTreeMap<TestId, BTreeSet<RouteKey>>,

    #[serde(skip)]
    by_route: BTreeMap<RouteKey, BTreeSet<TestId>>,
}

impl CoverageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_test(&mut self, test: &str) {
        self.tests.entry(test.to_string()).or_default();
    }

    /// Record that `test` exercised `route`.
    pub fn record(&mut self, test: &str, route: RouteKey) {
        self.tests
            .entry(test.to_string())
            .or_default()
            .insert(route.clone());
        self.by_route
            .entry(route)
            .or_default()
            .insert(test.to_string());
    }

    /// Tests that exercise `route`; empty for routes no test reaches.
    pub fn tests_for(&self, route: &RouteKey) -> &BTreeSet<TestId> {
        self.by_route.get(route).unwrap_or(&NO_TESTS)
    }

    /// Registered tests that never reached a route. They can never kill a mutant.
    pub fn uninstrumented(&self) -> Vec<TestId> {
        self.tests
            .iter()
            .filter(|(_, routes)| routes.is_empty())
            .map(|(test, _)| test.clone())
            .collect()
    }

    pub fn test_count(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn parse_trace(text: &str) -> Result<Self, TraceError> {
        let mut registry = Self::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }

            let bad = |reason: &str| TraceError {
                line: idx + 1,
                reason: reason.to_string(),
            };

            let fields: Vec<&str> = line.split('\t').collect();
            match fields.as_slice() {
                ["test", id] if !id.trim().is_empty() => registry.register_test(id.trim()),
                ["route", id, method, path] if !id.trim().is_empty() => {
                    let route = RouteKey::new(method, path);
                    if route.method.is_empty() || route.path.is_empty() {
                        return Err(bad("route record needs a method and a path"));
                    }
                    registry.record(id.trim(), route);
                }
                ["test", ..] | ["route", ..] => {
                    return Err(bad("wrong number of fields or empty test id"));
                }
                _ => return Err(bad("expected a `test` or `route` record")),
            }
        }

        Ok(registry)
    }

    pub fn load_trace(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read coverage trace {path:?}"))?;
        Self::parse_trace(&text).with_context(|| format!("invalid coverage trace {path:?}"))
    }
}
