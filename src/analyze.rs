use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::error::AnalysisError;
use crate::frontend::{Dialect, Extraction, HandlerFrontend, LexedSource};
use crate::mutant::{MutationTarget, OperatorCategory, TargetDetail};
use crate::route::{RouteKey, RouteRegistry, SourceRegion};
use crate::source::SourceSet;
use crate::span::SourceSpan;

/// Result of one analysis pass over a registry snapshot.
#[derive(Debug, Default)]
pub struct Analysis {
    /// Targets ordered by file, offsets, then category; ids are 1..n in this order.
    pub targets: Vec<MutationTarget>,

    pub errors: Vec<AnalysisError>,

    /// Routes left out entirely because one of their regions could not be analyzed.
    pub excluded_routes: Vec<RouteKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    /// Request schema: validation bounds only.
    Schema,

    /// Handler body or shared helper: every extractor.
    Body,
}

type TargetKey = (PathBuf, u32, u32, OperatorCategory);

struct Found {
    detail: TargetDetail,
    original: String,
    dialect: Dialect,
    routes: BTreeSet<RouteKey>,
}

/// Derive mutation targets from every route in the snapshot.
///
/// Read-only and deterministic: the same snapshot and sources give the same targets in the
/// same order.
pub fn analyze(
    registry: &RouteRegistry,
    sources: &dyn SourceSet,
    frontend: &dyn HandlerFrontend,
) -> Analysis {
    let mut analysis = Analysis::default();

    let mut files: BTreeMap<PathBuf, Result<LexedSource, String>> = BTreeMap::new();
    let regions = registry
        .routes()
        .iter()
        .flat_map(|r| std::iter::once(&r.handler).chain(r.schema.as_ref()))
        .chain(registry.shared().iter().map(|s| &s.region));
    for region in regions {
        files
            .entry(region.file.clone())
            .or_insert_with(|| load_lexed(sources, &region.file));
    }

    let mut found: BTreeMap<TargetKey, Found> = BTreeMap::new();

    for route in registry.routes() {
        let mut regions = vec![(&route.handler, RegionKind::Body)];
        if let Some(schema) = &route.schema {
            regions.push((schema, RegionKind::Schema));
        }

        let mut resolved = Vec::with_capacity(regions.len());
        let mut failure = None;
        for (region, kind) in regions {
            match resolve(&files, region) {
                Ok((src, range)) => resolved.push((src, range, kind)),
                Err(reason) => {
                    failure = Some(AnalysisError {
                        route: Some(route.key.clone()),
                        file: region.file.clone(),
                        line: None,
                        reason: format!("{region}: {reason}"),
                    });
                    break;
                }
            }
        }

        if let Some(err) = failure {
            log::warn!("excluding route {}: {err}", route.key);
            analysis.errors.push(err);
            analysis.excluded_routes.push(route.key.clone());
            continue;
        }

        let owners = BTreeSet::from([route.key.clone()]);
        for (src, range, kind) in resolved {
            let extraction = extract(frontend, src, range, kind);
            collect(&mut found, &mut analysis.errors, src, extraction, &owners, Some(&route.key));
        }
    }

    for shared in registry.shared() {
        let routes: BTreeSet<RouteKey> = shared
            .used_by
            .iter()
            .filter(|r| !analysis.excluded_routes.contains(r))
            .cloned()
            .collect();
        if routes.is_empty() {
            continue;
        }

        match resolve(&files, &shared.region) {
            Ok((src, range)) => {
                let extraction = extract(frontend, src, range, RegionKind::Body);
                collect(&mut found, &mut analysis.errors, src, extraction, &routes, None);
            }
            Err(reason) => {
                let err = AnalysisError {
                    route: None,
                    file: shared.region.file.clone(),
                    line: None,
                    reason: format!("{}: {reason}", shared.region),
                };
                log::warn!("skipping shared region: {err}");
                analysis.errors.push(err);
            }
        }
    }

    for (idx, ((file, start, end, category), f)) in found.into_iter().enumerate() {
        let shared = f.routes.len() > 1;
        let owner = if shared {
            None
        } else {
            f.routes.iter().next().cloned()
        };

        analysis.targets.push(MutationTarget {
            id: idx as u64 + 1,
            span: SourceSpan { file, start, end },
            category,
            detail: f.detail,
            original: f.original,
            owner,
            shared,
            blast_radius: f.routes.into_iter().collect(),
            dialect: f.dialect,
        });
    }

    log::debug!(
        "analyzed {} routes: {} targets, {} errors",
        registry.routes().len(),
        analysis.targets.len(),
        analysis.errors.len()
    );

    analysis
}

fn load_lexed(sources: &dyn SourceSet, rel: &Path) -> Result<LexedSource, String> {
    sources
        .load(rel)
        .map(|code| LexedSource::new(rel, code))
        .map_err(|e| format!("{e:#}"))
}

fn resolve<'a>(
    files: &'a BTreeMap<PathBuf, Result<LexedSource, String>>,
    region: &SourceRegion,
) -> Result<(&'a LexedSource, Range<usize>), String> {
    let src = match files.get(&region.file) {
        Some(Ok(src)) => src,
        Some(Err(reason)) => return Err(reason.clone()),
        None => return Err("file was not loaded".to_string()),
    };

    let range = src
        .line_range(region.start_line, region.end_line)
        .ok_or_else(|| format!("line range is outside the file ({} lines)", src.line_count()))?;

    if let Some(offset) = src.unterminated {
        if offset < range.end {
            return Err(format!(
                "unterminated string literal starting at line {}",
                src.line_of(offset)
            ));
        }
    }

    if !src.delimiters_balanced(range.clone()) {
        return Err("unbalanced delimiters".to_string());
    }

    Ok((src, range))
}

fn extract(
    frontend: &dyn HandlerFrontend,
    src: &LexedSource,
    range: Range<usize>,
    kind: RegionKind,
) -> Extraction {
    let mut extraction = frontend.extract_constraints(src, range.clone());
    if kind == RegionKind::Body {
        extraction.merge(frontend.extract_branches(src, range.clone()));
        extraction.merge(frontend.extract_literals(src, range));
    }
    extraction
}

fn collect(
    found: &mut BTreeMap<TargetKey, Found>,
    errors: &mut Vec<AnalysisError>,
    src: &LexedSource,
    extraction: Extraction,
    routes: &BTreeSet<RouteKey>,
    route: Option<&RouteKey>,
) {
    for raw in extraction.targets {
        let key = (
            src.file.clone(),
            raw.span.start as u32,
            raw.span.end as u32,
            raw.category,
        );
        found
            .entry(key)
            .or_insert_with(|| Found {
                detail: raw.detail,
                original: src.code[raw.span.clone()].to_string(),
                dialect: src.dialect,
                routes: BTreeSet::new(),
            })
            .routes
            .extend(routes.iter().cloned());
    }

    for ambiguity in extraction.ambiguous {
        errors.push(AnalysisError {
            route: route.cloned(),
            file: src.file.clone(),
            line: Some(src.line_of(ambiguity.offset)),
            reason: ambiguity.reason,
        });
    }
}
