use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::error::GenerationError;
use crate::frontend::LexedSource;
use crate::mutant::{
    Mutant, MutantOutcome, MutationOperator, MutationTarget, OperatorCategory, TargetDetail,
    assign_ids,
};
use crate::patch::apply_checked_patch;
use crate::source::SourceSet;
use crate::span::SourceSpan;

/// Status codes a status literal may be rewritten to.
pub const STATUS_ALPHABET: [u16; 16] = [
    200, 201, 202, 204, 301, 302, 304, 400, 401, 403, 404, 409, 422, 500, 502, 503,
];

/// Replacement used when filling an empty string literal.
const FILLER: &str = "mutated";

/// Operator categories left out of a run because they only yield equivalent mutants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionPolicy {
    excluded: BTreeSet<OperatorCategory>,
}

impl ExclusionPolicy {
    pub fn new(categories: impl IntoIterator<Item = OperatorCategory>) -> Self {
        Self {
            excluded: categories.into_iter().collect(),
        }
    }

    pub fn excludes(&self, category: OperatorCategory) -> bool {
        self.excluded.contains(&category)
    }

    pub fn categories(&self) -> impl Iterator<Item = OperatorCategory> + '_ {
        self.excluded.iter().copied()
    }
}

#[derive(Debug, Default)]
pub struct Generation {
    /// Valid mutants with ids 1..n.
    pub mutants: Vec<Mutant>,

    /// Candidates discarded before scheduling.
    pub errors: Vec<GenerationError>,

    /// Targets skipped per excluded category.
    pub excluded: BTreeMap<OperatorCategory, usize>,
}

/// One rewrite proposed for a target.
struct Candidate {
    name: &'static str,
    span: SourceSpan,
    replacement: String,
}

/// Turn targets into concrete, validated mutants.
pub fn generate_mutants(
    targets: &[MutationTarget],
    policy: &ExclusionPolicy,
    sources: &dyn SourceSet,
) -> Generation {
    let mut generation = Generation::default();
    let mut files: BTreeMap<PathBuf, Result<LexedSource, String>> = BTreeMap::new();
    let mut seen = BTreeSet::new();

    for target in targets {
        if policy.excludes(target.category) {
            *generation.excluded.entry(target.category).or_default() += 1;
            continue;
        }

        let src = files.entry(target.span.file.clone()).or_insert_with(|| {
            sources
                .load(&target.span.file)
                .map(|code| LexedSource::with_dialect(&target.span.file, code, target.dialect))
                .map_err(|e| format!("{e:#}"))
        });
        let src = match src {
            Ok(src) => &*src,
            Err(reason) => {
                generation.errors.push(error(target, "*", reason.clone()));
                continue;
            }
        };

        if src.code.get(target.span.range()) != Some(target.original.as_str()) {
            generation.errors.push(error(
                target,
                "*",
                "source no longer matches the analyzed target".to_string(),
            ));
            continue;
        }

        for candidate in candidates(target) {
            let candidate = match candidate {
                Ok(c) => c,
                Err((name, reason)) => {
                    generation.errors.push(error(target, name, reason));
                    continue;
                }
            };

            let original = match validate(src, &candidate) {
                Ok(original) => original,
                Err(reason) => {
                    generation.errors.push(error(target, candidate.name, reason));
                    continue;
                }
            };

            // Chained comparisons share one expression; keep a single copy of each rewrite.
            let key = (
                candidate.span.clone(),
                candidate.replacement.clone(),
            );
            if !seen.insert(key) {
                continue;
            }

            generation.mutants.push(Mutant {
                id: 0,
                target_id: target.id,
                operator: MutationOperator {
                    category: target.category,
                    name: candidate.name.to_string(),
                },
                span: candidate.span,
                original_snippet: original,
                mutated_snippet: candidate.replacement,
                owner: target.owner.clone(),
                shared: target.shared,
                blast_radius: target.blast_radius.clone(),
                outcome: MutantOutcome::NotRun,
                duration_ms: None,
                tests_run: None,
                note: None,
                no_coverage: false,
                carried_forward: false,
            });
        }
    }

    assign_ids(&mut generation.mutants);

    for err in &generation.errors {
        log::debug!("discarded mutant candidate: {err}");
    }

    generation
}

fn error(target: &MutationTarget, operator: &str, reason: String) -> GenerationError {
    GenerationError {
        target_id: target.id,
        file: target.span.file.clone(),
        start: target.span.start,
        operator: operator.to_string(),
        reason,
    }
}

type CandidateResult = Result<Candidate, (&'static str, String)>;

fn candidates(target: &MutationTarget) -> Vec<CandidateResult> {
    let at_target = |name: &'static str, replacement: String| -> CandidateResult {
        Ok(Candidate {
            name,
            span: target.span.clone(),
            replacement,
        })
    };

    match &target.detail {
        TargetDetail::Bound { value, clause } => {
            let moved = |name: &'static str, next: Option<i64>| match next {
                Some(v) => at_target(name, v.to_string()),
                None => Err((name, format!("bound {value} cannot move by one without overflow"))),
            };
            vec![
                moved("bound_decrement", value.checked_sub(1)),
                moved("bound_increment", value.checked_add(1)),
                Ok(Candidate {
                    name: "remove_constraint",
                    span: clause.clone(),
                    replacement: String::new(),
                }),
            ]
        }

        TargetDetail::Comparison { op, expr } => {
            let mut out = Vec::new();
            match negated(op) {
                Some(neg) => out.push(at_target("negate_comparison", neg.to_string())),
                None => out.push(Err(("negate_comparison", format!("unknown comparison `{op}`")))),
            }
            if let Some(shift) = shifted(op) {
                out.push(at_target("shift_comparison", shift.to_string()));
            }
            for (name, literal) in [
                ("always_true", target.dialect.true_literal()),
                ("always_false", target.dialect.false_literal()),
            ] {
                out.push(Ok(Candidate {
                    name,
                    span: expr.clone(),
                    replacement: literal.to_string(),
                }));
            }
            out
        }

        TargetDetail::Logical { op } => match target.dialect.swap_logical(op) {
            Some(swapped) => vec![at_target("swap_logical", swapped.to_string())],
            None => vec![Err(("swap_logical", format!("unknown connective `{op}`")))],
        },

        TargetDetail::Status { code } => {
            vec![at_target("alternate_status", alternate_status(*code).to_string())]
        }

        TargetDetail::Boolean { value } => {
            let flipped = if *value {
                target.dialect.false_literal()
            } else {
                target.dialect.true_literal()
            };
            vec![at_target("flip_boolean", flipped.to_string())]
        }

        TargetDetail::Text => vec![string_candidate(target)],
    }
}

fn string_candidate(target: &MutationTarget) -> CandidateResult {
    let original = &target.original;
    let Some(quote) = original.chars().next().filter(|c| matches!(c, '"' | '\'')) else {
        return Err(("empty_string", "string literal does not start with a quote".to_string()));
    };

    let candidate = |name: &'static str, replacement: String| -> CandidateResult {
        Ok(Candidate {
            name,
            span: target.span.clone(),
            replacement,
        })
    };
    if original.len() <= 2 {
        candidate("non_empty_string", format!("{quote}{FILLER}{quote}"))
    } else {
        candidate("empty_string", format!("{quote}{quote}"))
    }
}

fn negated(op: &str) -> Option<&'static str> {
    Some(match op {
        "==" => "!=",
        "!=" => "==",
        "===" => "!==",
        "!==" => "===",
        "<" => ">=",
        ">=" => "<",
        ">" => "<=",
        "<=" => ">",
        _ => return None,
    })
}

/// Off-by-one shift of an ordered comparison (`>=` <-> `>`, `<=` <-> `<`).
fn shifted(op: &str) -> Option<&'static str> {
    Some(match op {
        "<" => "<=",
        "<=" => "<",
        ">" => ">=",
        ">=" => ">",
        _ => return None,
    })
}

/// Nearest other code in [`STATUS_ALPHABET`]; ties go to the lower code.
pub fn alternate_status(code: u16) -> u16 {
    STATUS_ALPHABET
        .iter()
        .copied()
        .filter(|&c| c != code)
        .min_by_key(|&c| (c.abs_diff(code), c))
        .unwrap_or(200)
}

/// Check a candidate against the file it will be applied to.
///
/// Returns the original text under the candidate's span.
fn validate(src: &LexedSource, candidate: &Candidate) -> Result<String, String> {
    let original = src
        .code
        .get(candidate.span.range())
        .ok_or_else(|| "span is outside the file".to_string())?
        .to_string();

    if original == candidate.replacement {
        return Err("mutation does not change the source".to_string());
    }

    let patched = apply_checked_patch(&src.code, &candidate.span, &original, &candidate.replacement)
        .map_err(|e| e.to_string())?;

    let after = LexedSource::with_dialect(&src.file, patched, src.dialect);

    let whole = |s: &LexedSource| 0..s.code.len();
    if src.delimiters_balanced(whole(src)) && !after.delimiters_balanced(whole(&after)) {
        return Err("mutation unbalances delimiters".to_string());
    }
    if src.unterminated.is_none() && after.unterminated.is_some() {
        return Err("mutation leaves a string literal unterminated".to_string());
    }

    Ok(original)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::fixtures::{CONFIG, MODELS, sources};
    use crate::analyze::{Analysis, analyze};
    use crate::config::ProjectConfig;
    use crate::frontend::TextFrontend;
    use crate::route::RouteRegistry;

    fn analysis() -> Analysis {
        let registry = RouteRegistry::snapshot(&ProjectConfig::parse(CONFIG).unwrap()).unwrap();
        analyze(&registry, &sources(), &TextFrontend)
    }

    fn default_policy() -> ExclusionPolicy {
        ExclusionPolicy::new([OperatorCategory::StringLiteral])
    }

    fn listing(generation: &Generation) -> Vec<(u64, String, String, String)> {
        generation
            .mutants
            .iter()
            .map(|m| {
                (
                    m.id,
                    m.operator.name.clone(),
                    m.original_snippet.clone(),
                    m.mutated_snippet.clone(),
                )
            })
            .collect()
    }

    #[test]
    fn users_api_yields_ten_mutants_in_order() {
        let generation = generate_mutants(&analysis().targets, &default_policy(), &sources());

        assert!(generation.errors.is_empty(), "{:?}", generation.errors);
        assert_eq!(generation.excluded.get(&OperatorCategory::StringLiteral), Some(&4));

        let s = |v: &str| v.to_string();
        assert_eq!(
            listing(&generation),
            vec![
                (1, s("remove_constraint"), s("ge=18"), s("")),
                (2, s("bound_decrement"), s("18"), s("17")),
                (3, s("bound_increment"), s("18"), s("19")),
                (4, s("alternate_status"), s("201"), s("200")),
                (5, s("always_false"), s("limit > 100"), s("False")),
                (6, s("always_true"), s("limit > 100"), s("True")),
                (7, s("negate_comparison"), s(">"), s("<=")),
                (8, s("shift_comparison"), s(">"), s(">=")),
                (9, s("alternate_status"), s("400"), s("401")),
                (10, s("alternate_status"), s("200"), s("201")),
            ]
        );
    }

    #[test]
    fn boundary_mutants_target_the_owning_route() {
        let generation = generate_mutants(&analysis().targets, &default_policy(), &sources());
        let boundary: Vec<&Mutant> = generation
            .mutants
            .iter()
            .filter(|m| m.operator.category == OperatorCategory::Boundary)
            .collect();

        assert_eq!(boundary.len(), 3);
        for m in boundary {
            assert_eq!(m.route_label(), "POST /users");
            let patched = apply_checked_patch(MODELS, &m.span, &m.original_snippet, &m.mutated_snippet)
                .unwrap();
            assert!(patched.contains("Field(ge=17)") || patched.contains("Field(ge=19)") || patched.contains("Field()"));
        }
    }

    #[test]
    fn excluded_categories_never_appear() {
        let policy = ExclusionPolicy::new([
            OperatorCategory::StringLiteral,
            OperatorCategory::Comparison,
            OperatorCategory::StatusLiteral,
        ]);
        let generation = generate_mutants(&analysis().targets, &policy, &sources());

        assert!(
            generation
                .mutants
                .iter()
                .all(|m| !policy.excludes(m.operator.category))
        );
        assert_eq!(generation.mutants.len(), 3);
        assert_eq!(generation.excluded.get(&OperatorCategory::StatusLiteral), Some(&3));
        let ids: Vec<u64> = generation.mutants.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn string_literals_are_emptied_or_filled() {
        let generation = generate_mutants(&analysis().targets, &ExclusionPolicy::default(), &sources());
        let strings: Vec<(String, String)> = generation
            .mutants
            .iter()
            .filter(|m| m.operator.category == OperatorCategory::StringLiteral)
            .map(|m| (m.original_snippet.clone(), m.mutated_snippet.clone()))
            .collect();

        assert_eq!(strings.len(), 4);
        assert_eq!(strings[0], ("\"name\"".to_string(), "\"\"".to_string()));

        let mut target = analysis().targets[1].clone();
        target.original = "''".to_string();
        match string_candidate(&target) {
            Ok(c) => assert_eq!(c.replacement, "'mutated'"),
            Err((_, reason)) => panic!("{reason}"),
        }
    }

    #[test]
    fn overflowing_bound_and_stale_target_become_generation_errors() {
        let mut targets = analysis().targets;
        if let TargetDetail::Bound { value, .. } = &mut targets[0].detail {
            *value = i64::MAX;
        }
        // Span that no longer holds the comparison it was analyzed from.
        targets[3].span.start += 1;
        targets[3].span.end += 1;

        let generation = generate_mutants(&targets, &default_policy(), &sources());

        let failed: Vec<(&str, String)> = generation
            .errors
            .iter()
            .map(|e| (e.operator.as_str(), e.file.display().to_string()))
            .collect();
        assert_eq!(
            failed,
            vec![
                ("bound_increment", "app/models.py".to_string()),
                ("*", "app/users.py".to_string()),
            ]
        );
        assert!(
            !generation
                .mutants
                .iter()
                .any(|m| m.operator.category == OperatorCategory::Comparison)
        );
    }

    #[test]
    fn alternate_status_picks_nearest_code() {
        assert_eq!(alternate_status(201), 200);
        assert_eq!(alternate_status(200), 201);
        assert_eq!(alternate_status(400), 401);
        assert_eq!(alternate_status(418), 422);
        assert_eq!(alternate_status(503), 502);
        assert_eq!(alternate_status(250), 204);
    }
}
