use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;

use crate::error::{AnalysisError, GenerationError};
use crate::mutant::OperatorCategory;
use crate::pipeline::prepare;
use crate::project::Project;
use crate::route::RouteKey;

/// Registry and target overview of a project, without running any test.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectOverview {
    /// Directory holding `smart-mutant.toml`.
    pub root: PathBuf,

    pub routes: Vec<RouteOverview>,
    pub shared: Vec<SharedOverview>,

    /// Number of source files referenced by the registry.
    pub files: usize,

    pub targets: usize,
    pub targets_by_category: BTreeMap<OperatorCategory, usize>,
    pub mutants: usize,

    /// Targets skipped per excluded category.
    pub excluded: BTreeMap<OperatorCategory, usize>,

    pub analysis_errors: Vec<AnalysisError>,
    pub generation_errors: Vec<GenerationError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteOverview {
    pub route: RouteKey,
    pub handler: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Targets and mutants whose blast radius includes this route.
    pub targets: usize,
    pub mutants: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SharedOverview {
    pub region: String,
    pub used_by: Vec<RouteKey>,
}

impl ProjectOverview {
    pub fn from_project(project: &Project) -> Result<Self> {
        let registry = project.registry()?;
        let prepared = prepare(project, &project.config.mutation.exclude)?;
        let targets = &prepared.analysis.targets;
        let mutants = &prepared.generation.mutants;

        let routes = registry
            .routes()
            .iter()
            .map(|r| RouteOverview {
                route: r.key.clone(),
                handler: r.handler.to_string(),
                schema: r.schema.as_ref().map(ToString::to_string),
                targets: targets
                    .iter()
                    .filter(|t| t.blast_radius.contains(&r.key))
                    .count(),
                mutants: mutants
                    .iter()
                    .filter(|m| m.blast_radius.contains(&r.key))
                    .count(),
            })
            .collect();

        let shared = registry
            .shared()
            .iter()
            .map(|s| SharedOverview {
                region: s.region.to_string(),
                used_by: s.used_by.iter().cloned().collect(),
            })
            .collect();

        let mut targets_by_category = BTreeMap::new();
        for t in targets {
            *targets_by_category.entry(t.category).or_insert(0) += 1;
        }

        Ok(Self {
            root: project.root().to_path_buf(),
            routes,
            shared,
            files: project.source_files().len(),
            targets: targets.len(),
            targets_by_category,
            mutants: mutants.len(),
            excluded: prepared.generation.excluded.clone(),
            analysis_errors: prepared.analysis.errors.clone(),
            generation_errors: prepared.generation.errors.clone(),
        })
    }
}

/// Load the project at `root` and describe it.
pub fn scan_project(root: &Path) -> Result<ProjectOverview> {
    let project = Project::from_root(root.to_path_buf())?;
    ProjectOverview::from_project(&project)
}
