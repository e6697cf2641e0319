use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::changes::ChangeSet;
use crate::mutant::{Mutant, MutantOutcome};

/// Name of the cache file inside the output directory.
pub const CACHE_FILE: &str = "cache.json";

const CACHE_VERSION: u32 = 1;

/// Outcomes of the previous run, keyed by source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalCache {
    pub version: u32,

    /// Config the outcomes were produced under.
    pub config_fingerprint: String,

    /// Fingerprint of changed files outside the mutated sources (tests, fixtures).
    ///
    /// `None` when the change-set was unknown at the time the cache was written.
    #[serde(default)]
    pub context_fingerprint: Option<String>,

    pub files: BTreeMap<PathBuf, CachedFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFile {
    /// Content fingerprint of the source file when its mutants ran.
    pub fingerprint: String,
    pub entries: Vec<CachedOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOutcome {
    /// Execution group the mutant ran in; `None` when it was never scheduled.
    pub group_id: Option<u64>,
    pub mutant: Mutant,
}

/// Mutants split into those to execute now and those whose previous outcome still holds.
#[derive(Debug, Default)]
pub struct Partition {
    pub execute: Vec<Mutant>,
    pub carried: Vec<Mutant>,
}

impl IncrementalCache {
    pub fn new(config_fingerprint: &str, context_fingerprint: Option<String>) -> Self {
        Self {
            version: CACHE_VERSION,
            config_fingerprint: config_fingerprint.to_string(),
            context_fingerprint,
            files: BTreeMap::new(),
        }
    }

    /// Load the cache in `out_dir`. Anything unusable gives an empty (cold) cache.
    pub fn load(out_dir: &Path, config_fingerprint: &str) -> Self {
        let path = out_dir.join(CACHE_FILE);
        let cold = || Self::new(config_fingerprint, None);

        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => {
                log::info!("no incremental cache at {path:?}, starting cold");
                return cold();
            }
        };

        match serde_json::from_str::<IncrementalCache>(&text) {
            Ok(cache) if cache.version != CACHE_VERSION => {
                log::info!("ignoring cache {path:?} written by format version {}", cache.version);
                cold()
            }
            Ok(cache) if cache.config_fingerprint != config_fingerprint => {
                log::info!("project config changed since {path:?} was written, starting cold");
                cold()
            }
            Ok(cache) => cache,
            Err(e) => {
                log::warn!("ignoring unreadable cache {path:?}: {e}");
                cold()
            }
        }
    }

    pub fn save(&self, out_dir: &Path) -> Result<()> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create output dir {out_dir:?}"))?;
        let path = out_dir.join(CACHE_FILE);
        let json = serde_json::to_string_pretty(self).context("serialize cache")?;
        fs::write(&path, json).with_context(|| format!("failed to write {path:?}"))?;
        Ok(())
    }

    /// Record classified mutants. Mutants that never ran are left out.
    pub fn record(
        &mut self,
        fingerprints: &BTreeMap<PathBuf, String>,
        mutants: &[Mutant],
        groups: &BTreeMap<u64, u64>,
    ) {
        for m in mutants {
            if m.outcome == MutantOutcome::NotRun {
                continue;
            }
            let Some(fingerprint) = fingerprints.get(&m.span.file) else {
                continue;
            };

            let mut mutant = m.clone();
            mutant.carried_forward = false;

            self.files
                .entry(m.span.file.clone())
                .or_insert_with(|| CachedFile {
                    fingerprint: fingerprint.clone(),
                    entries: Vec::new(),
                })
                .entries
                .push(CachedOutcome {
                    group_id: groups.get(&m.id).copied(),
                    mutant,
                });
        }
    }

    /// Split `mutants` into carried-forward and to-execute sets.
    ///
    /// A file's outcomes are reused only while its content and the test context match the
    /// cache; everything else runs. Carried mutants keep their current ids and spend no
    /// run time in this pass.
    pub fn partition(
        &self,
        mutants: Vec<Mutant>,
        fingerprints: &BTreeMap<PathBuf, String>,
        context_fingerprint: Option<&str>,
    ) -> Partition {
        let mut partition = Partition::default();
        let context_matches =
            context_fingerprint.is_some() && self.context_fingerprint.as_deref() == context_fingerprint;

        for mut m in mutants {
            let reusable = context_matches
                .then(|| self.files.get(&m.span.file))
                .flatten()
                .filter(|cached| fingerprints.get(&m.span.file) == Some(&cached.fingerprint))
                .and_then(|cached| cached.entries.iter().find(|e| same_mutation(&e.mutant, &m)));

            match reusable {
                Some(entry) => {
                    m.outcome = entry.mutant.outcome;
                    m.duration_ms = Some(0);
                    m.tests_run = entry.mutant.tests_run;
                    m.note = entry.mutant.note.clone();
                    m.no_coverage = entry.mutant.no_coverage;
                    m.carried_forward = true;
                    partition.carried.push(m);
                }
                None => partition.execute.push(m),
            }
        }

        log::info!(
            "incremental: {} mutants carried forward, {} to execute",
            partition.carried.len(),
            partition.execute.len()
        );

        partition
    }
}

fn same_mutation(a: &Mutant, b: &Mutant) -> bool {
    a.span == b.span
        && a.operator == b.operator
        && a.original_snippet == b.original_snippet
        && a.mutated_snippet == b.mutated_snippet
}

/// Fingerprint of the changed files that are not mutated sources.
///
/// Tests live there; when they change, previously classified mutants may classify
/// differently.
pub fn context_fingerprint(
    root: &Path,
    changes: &ChangeSet,
    is_source: impl Fn(&Path) -> bool,
    ignore: &[&Path],
) -> String {
    let mut hasher = blake3::Hasher::new();
    for path in changes.iter() {
        if is_source(path) || ignore.iter().any(|dir| path.starts_with(dir)) {
            continue;
        }
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(&[0]);
        match fs::read(root.join(path)) {
            Ok(bytes) => {
                hasher.update(&bytes);
            }
            Err(_) => {
                hasher.update(b"<deleted>");
            }
        }
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutant::fixtures::mutant;

    fn classified(id: u64, file: &str, start: u32, outcome: MutantOutcome) -> Mutant {
        let mut m = mutant(id, file, start, Some("GET /a"));
        m.outcome = outcome;
        m.duration_ms = Some(40);
        m
    }

    fn prints(pairs: &[(&str, &str)]) -> BTreeMap<PathBuf, String> {
        pairs
            .iter()
            .map(|(f, p)| (PathBuf::from(f), p.to_string()))
            .collect()
    }

    fn warm_cache() -> IncrementalCache {
        let mut cache = IncrementalCache::new("cfg", Some("ctx".to_string()));
        cache.record(
            &prints(&[("a.py", "fa"), ("b.py", "fb")]),
            &[
                classified(1, "a.py", 10, MutantOutcome::Killed),
                classified(2, "b.py", 10, MutantOutcome::Survived),
                mutant(3, "b.py", 30, Some("GET /a")),
            ],
            &BTreeMap::from([(1, 1), (2, 2)]),
        );
        cache
    }

    #[test]
    fn record_skips_mutants_that_never_ran() {
        let cache = warm_cache();
        assert_eq!(cache.files[Path::new("a.py")].entries.len(), 1);
        assert_eq!(cache.files[Path::new("b.py")].entries.len(), 1);
        assert_eq!(cache.files[Path::new("b.py")].entries[0].group_id, Some(2));
    }

    #[test]
    fn unchanged_file_is_carried_and_changed_file_runs() {
        let cache = warm_cache();
        let fresh = vec![
            mutant(1, "a.py", 10, Some("GET /a")),
            mutant(2, "b.py", 10, Some("GET /a")),
        ];

        let part = cache.partition(fresh, &prints(&[("a.py", "fa2"), ("b.py", "fb")]), Some("ctx"));

        assert_eq!(part.execute.len(), 1);
        assert_eq!(part.execute[0].span.file, PathBuf::from("a.py"));
        assert_eq!(part.carried.len(), 1);
        let carried = &part.carried[0];
        assert_eq!(carried.outcome, MutantOutcome::Survived);
        assert_eq!(carried.duration_ms, Some(0));
        assert!(carried.carried_forward);
    }

    #[test]
    fn changed_test_context_reruns_everything() {
        let cache = warm_cache();
        let fresh = vec![mutant(1, "b.py", 10, Some("GET /a"))];

        let part = cache.partition(fresh.clone(), &prints(&[("b.py", "fb")]), Some("other"));
        assert_eq!(part.execute.len(), 1);

        let part = cache.partition(fresh, &prints(&[("b.py", "fb")]), None);
        assert_eq!(part.execute.len(), 1);
    }

    #[test]
    fn save_and_load_round_trip_and_config_change_is_cold() {
        let dir = tempfile::tempdir().unwrap();
        let cache = warm_cache();
        cache.save(dir.path()).unwrap();

        assert_eq!(IncrementalCache::load(dir.path(), "cfg"), cache);

        let cold = IncrementalCache::load(dir.path(), "cfg2");
        assert!(cold.files.is_empty());
        assert_eq!(cold.config_fingerprint, "cfg2");
    }

    #[test]
    fn missing_or_corrupt_cache_is_cold() {
        let dir = tempfile::tempdir().unwrap();
        assert!(IncrementalCache::load(dir.path(), "cfg").files.is_empty());

        fs::write(dir.path().join(CACHE_FILE), "{ not json").unwrap();
        assert!(IncrementalCache::load(dir.path(), "cfg").files.is_empty());
    }

    #[test]
    fn context_ignores_sources_and_output() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("tests")).unwrap();
        fs::write(dir.path().join("tests/test_a.py"), "assert 1\n").unwrap();

        let changes = ChangeSet::from_paths([
            PathBuf::from("app/a.py"),
            PathBuf::from("tests/test_a.py"),
            PathBuf::from("smart-mutant.out/log"),
        ]);
        let is_source = |p: &Path| p == Path::new("app/a.py");
        let out = Path::new("smart-mutant.out");

        let before = context_fingerprint(dir.path(), &changes, is_source, &[out]);
        let only_tests = ChangeSet::from_paths([PathBuf::from("tests/test_a.py")]);
        assert_eq!(before, context_fingerprint(dir.path(), &only_tests, is_source, &[out]));

        fs::write(dir.path().join("tests/test_a.py"), "assert 2\n").unwrap();
        assert_ne!(before, context_fingerprint(dir.path(), &changes, is_source, &[out]));
    }
}
