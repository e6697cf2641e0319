use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::coverage::{CoverageRegistry, TestId};
use crate::mutant::Mutant;
use crate::route::RouteKey;

/// Tests to run against one mutant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "tests", rename_all = "snake_case")]
pub enum TestSelection {
    /// The entire suite, no selection arguments.
    All,
    Only(BTreeSet<TestId>),
}

impl TestSelection {
    pub fn is_empty(&self) -> bool {
        matches!(self, TestSelection::Only(tests) if tests.is_empty())
    }

    /// Number of selected tests; `None` for the entire suite.
    pub fn len(&self) -> Option<usize> {
        match self {
            TestSelection::All => None,
            TestSelection::Only(tests) => Some(tests.len()),
        }
    }

    /// Whether both selections may run a common test.
    pub fn overlaps(&self, other: &TestSelection) -> bool {
        match (self, other) {
            (TestSelection::Only(a), TestSelection::Only(b)) => !a.is_disjoint(b),
            (TestSelection::All, s) | (s, TestSelection::All) => !s.is_empty(),
        }
    }

    fn union(&mut self, other: &TestSelection) {
        match (&mut *self, other) {
            (TestSelection::All, _) => {}
            (_, TestSelection::All) => *self = TestSelection::All,
            (TestSelection::Only(a), TestSelection::Only(b)) => a.extend(b.iter().cloned()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// May run concurrently with other independent groups.
    Independent,

    /// Runs alone, after every independent group finished.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledMutant {
    pub mutant: Mutant,
    pub tests: TestSelection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionGroup {
    pub id: u64,
    pub isolation: Isolation,

    /// Owning route of an independent group; `None` for the tail.
    pub route: Option<RouteKey>,
    pub mutants: Vec<ScheduledMutant>,
}

/// The scheduler's plan for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    pub independent: Vec<ExecutionGroup>,

    /// Serialized tail; `None` when nothing needs serializing.
    pub serialized: Option<ExecutionGroup>,

    /// Mutants no registered test can reach.
    pub uncovered: Vec<Mutant>,
}

impl Schedule {
    pub fn scheduled_len(&self) -> usize {
        self.groups().map(|g| g.mutants.len()).sum()
    }

    pub fn groups(&self) -> impl Iterator<Item = &ExecutionGroup> {
        self.independent.iter().chain(self.serialized.iter())
    }

    /// Mutant id -> group id, for the cache.
    pub fn group_ids(&self) -> BTreeMap<u64, u64> {
        self.groups()
            .flat_map(|g| g.mutants.iter().map(move |s| (s.mutant.id, g.id)))
            .collect()
    }
}

/// Test selection for `mutant`: every test reaching a route in its blast radius.
///
/// Without coverage (full mode) the entire suite runs.
pub fn select_tests(mutant: &Mutant, coverage: Option<&CoverageRegistry>) -> TestSelection {
    let Some(coverage) = coverage else {
        return TestSelection::All;
    };
    let tests = mutant
        .blast_radius
        .iter()
        .flat_map(|route| coverage.tests_for(route).iter().cloned())
        .collect();
    TestSelection::Only(tests)
}

/// Split mutants into independent route groups, a serialized tail and uncovered mutants.
pub fn plan(mutants: Vec<Mutant>, coverage: Option<&CoverageRegistry>) -> Schedule {
    let mut uncovered = Vec::new();
    let mut tail = Vec::new();
    let mut by_route: BTreeMap<RouteKey, Vec<ScheduledMutant>> = BTreeMap::new();

    for mutant in mutants {
        let tests = select_tests(&mutant, coverage);
        if tests.is_empty() {
            uncovered.push(mutant);
            continue;
        }

        match (&mutant.owner, mutant.shared) {
            (Some(route), false) => by_route
                .entry(route.clone())
                .or_default()
                .push(ScheduledMutant { mutant, tests }),
            _ => tail.push(ScheduledMutant { mutant, tests }),
        }
    }

    // Route groups whose tests overlap must not run side by side.
    let selections: Vec<(RouteKey, TestSelection)> = by_route
        .iter()
        .map(|(route, members)| {
            let mut all = TestSelection::Only(BTreeSet::new());
            for s in members {
                all.union(&s.tests);
            }
            (route.clone(), all)
        })
        .collect();

    let mut candidates = Vec::new();
    for (idx, (route, selection)) in selections.iter().enumerate() {
        let conflicting = selections
            .iter()
            .enumerate()
            .any(|(other, (_, s))| other != idx && selection.overlaps(s));

        let Some(members) = by_route.remove(route) else {
            continue;
        };
        if conflicting {
            log::debug!("route {route} shares tests with another route, serializing its mutants");
            tail.extend(members);
        } else {
            candidates.push((route.clone(), members));
        }
    }

    candidates.sort_by_key(|(_, members)| members.iter().map(|s| s.mutant.id).min());

    let independent: Vec<ExecutionGroup> = candidates
        .into_iter()
        .zip(1u64..)
        .map(|((route, mut members), id)| {
            members.sort_by_key(|s| s.mutant.id);
            ExecutionGroup {
                id,
                isolation: Isolation::Independent,
                route: Some(route),
                mutants: members,
            }
        })
        .collect();

    tail.sort_by_key(|s| s.mutant.id);
    let serialized = (!tail.is_empty()).then(|| ExecutionGroup {
        id: independent.len() as u64 + 1,
        isolation: Isolation::Shared,
        route: None,
        mutants: tail,
    });

    uncovered.sort_by_key(|m| m.id);

    log::info!(
        "scheduled {} independent groups, {} serialized mutants, {} uncovered",
        independent.len(),
        serialized.as_ref().map_or(0, |g| g.mutants.len()),
        uncovered.len()
    );

    Schedule {
        independent,
        serialized,
        uncovered,
    }
}
