use crate::mutant::{Mutant, MutantOutcome};
use crate::project::Project;
use crate::run_report::{FallbackReason, GateLevel, MutationReport};
use crate::ui::Ui;

/// Print the human summary of a finished pass.
pub fn print_report(ui: &mut Ui, project: &Project, report: &MutationReport, verbose: bool) {
    print_summary(ui, report);
    print_routes(ui, report);
    print_diagnostics(ui, report);

    if verbose {
        print_all_mutants(ui, project, &report.mutants);
    }
    print_surviving_mutants(ui, project, &report.mutants);
    print_audit(ui, report);
}

fn print_summary(ui: &mut Ui, report: &MutationReport) {
    let s = &report.summary;

    ui.title("--- mutation run summary ---");
    match report.fallback_reason {
        Some(reason) => ui.line(format!(
            "mode:             {} (requested {}, {})",
            report.mode,
            report.requested_mode,
            fallback_label(reason)
        )),
        None => ui.line(format!("mode:             {}", report.mode)),
    }
    ui.line(format!("mutants total:    {}", s.total));
    ui.line(format!("mutants killed:   {}", s.killed));
    ui.line(format!("mutants survived: {}", s.survived));
    if s.no_coverage > 0 {
        ui.line(format!("  no coverage:    {}", s.no_coverage));
    }
    ui.line(format!("mutants timeout:  {}", s.timeouts));
    ui.line(format!("mutants errored:  {}", s.errored));
    if s.carried_forward > 0 {
        ui.line(format!("carried forward:  {}", s.carried_forward));
    }
    if s.not_run > 0 {
        ui.line(format!("not run:          {}", s.not_run));
    }

    match report.score {
        Some(score) => ui.line(format!(
            "mutation score:   {score:.2}% ({})",
            gate_label(report.gate.level)
        )),
        None => ui.line("mutation score:   n/a (nothing killed or survived)"),
    }
    if report.gate.break_failed {
        if let Some(threshold) = report.thresholds.break_at {
            ui.error(format!("mutation score is below the break threshold of {threshold}%"));
        }
    }
}

fn fallback_label(reason: FallbackReason) -> &'static str {
    match reason {
        FallbackReason::DiffUnavailable => "diff unavailable",
        FallbackReason::CoverageUnavailable => "coverage unavailable",
    }
}

fn gate_label(level: Option<GateLevel>) -> &'static str {
    match level {
        Some(GateLevel::High) => "high",
        Some(GateLevel::Warning) => "warning",
        Some(GateLevel::Low) => "low",
        None => "-",
    }
}

fn print_routes(ui: &mut Ui, report: &MutationReport) {
    if report.routes.is_empty() {
        return;
    }

    ui.title("--- routes ---");
    for r in &report.routes {
        let score = r
            .score
            .map(|s| format!("{s:.2}%"))
            .unwrap_or_else(|| "n/a".to_string());
        ui.line(format!(
            "{:<24} {:>8}  killed {} / survived {} / total {}",
            r.route, score, r.summary.killed, r.summary.survived, r.summary.total
        ));
        if !r.untested_boundaries.is_empty() {
            let ids: Vec<String> = r.untested_boundaries.iter().map(|id| format!("#{id}")).collect();
            ui.line(format!("  untested boundaries: {}", ids.join(", ")));
        }
    }
}

fn print_diagnostics(ui: &mut Ui, report: &MutationReport) {
    for category in &report.excluded_categories {
        ui.line(format!(
            "excluded {}: {} targets",
            category.category, category.targets
        ));
    }

    if !report.uninstrumented_tests.is_empty() {
        ui.warn(format!(
            "tests that reach no route: {}",
            report.uninstrumented_tests.join(", ")
        ));
    }

    for e in &report.analysis_errors {
        ui.warn(format!("skipped route: {e}"));
    }
    for e in &report.generation_errors {
        ui.warn(format!("discarded mutant: {e}"));
    }
}

fn print_audit(ui: &mut Ui, report: &MutationReport) {
    let Some(audit) = &report.audit else {
        return;
    };

    ui.title("--- audit ---");
    let score = |s: Option<f64>| s.map(|s| format!("{s:.2}%")).unwrap_or_else(|| "n/a".to_string());
    ui.line(format!(
        "compared {} mutants: {} score {}, full score {}",
        audit.compared,
        report.mode,
        score(audit.smart_score),
        score(audit.full_score)
    ));
    for d in &audit.divergent {
        ui.error(format!(
            "mutant {} diverged: {} vs {} in full mode",
            d.mutant_id,
            d.smart.label(),
            d.full.label()
        ));
    }
    if audit.passed() {
        ui.line("audit passed");
    }
}

/// Print a detailed list of all mutants and their outcomes.
pub fn print_all_mutants(ui: &mut Ui, project: &Project, mutants: &[Mutant]) {
    if mutants.is_empty() {
        return;
    }

    ui.title("--- mutants (detailed) ---");
    for m in collect_sorted(mutants.iter()) {
        let duration = duration_label(m.duration_ms);
        let base = format_mutant_with_location(project, m);

        ui.line(format!("{:>8} {:>8} {}", m.outcome.label(), duration, base));
    }
}

/// Print a short list of surviving mutants.
///
/// Uncovered survivors say so; the others are tests worth writing.
pub fn print_surviving_mutants(ui: &mut Ui, project: &Project, mutants: &[Mutant]) {
    let survivors = collect_sorted(
        mutants
            .iter()
            .filter(|m| m.outcome == MutantOutcome::Survived),
    );

    if survivors.is_empty() {
        return;
    }

    ui.title(format!(
        "--- surviving mutants ({} of {}) ---",
        survivors.len(),
        mutants.len()
    ));

    for m in survivors {
        let line = format_mutant_with_location(project, m);
        if m.no_coverage {
            ui.line(format!("{line} (no covering test)"));
        } else {
            ui.line(line);
        }
    }
}

fn collect_sorted<'a>(iter: impl Iterator<Item = &'a Mutant>) -> Vec<&'a Mutant> {
    let mut v: Vec<&'a Mutant> = iter.collect();
    v.sort_by_key(|m| m.id);
    v
}

fn duration_label(duration_ms: Option<u64>) -> String {
    match duration_ms {
        Some(ms) => format!("{ms}ms"),
        None => "-".to_string(),
    }
}

/// Format one mutant as a single, readable line using line/column positions when possible.
///
/// Falls back to byte spans when the source file cannot be read.
pub fn format_mutant_with_location(project: &Project, m: &Mutant) -> String {
    let Some(code) = project
        .find_source(&m.span.file)
        .and_then(|s| s.read_to_string().ok())
    else {
        return format_mutant_short(m);
    };

    let Some((sl, sc)) = byte_offset_to_line_col(&code, m.span.start as usize) else {
        return format_mutant_short(m);
    };
    let Some((el, ec)) = byte_offset_to_line_col(&code, m.span.end as usize) else {
        return format_mutant_short(m);
    };

    format!(
        "#{id} {file}:{sl}:{sc}-{el}:{ec} {category}/{name} in {route}: {orig:?} -> {mutated:?}",
        id = m.id,
        file = m.span.file.display(),
        category = m.operator.category,
        name = m.operator.name,
        route = m.route_label(),
        orig = m.original_snippet,
        mutated = m.mutated_snippet,
    )
}

/// Format one mutant as a single, readable line.
pub fn format_mutant_short(m: &Mutant) -> String {
    format!(
        "#{id} {file} [{start}..{end}] {category}/{name} in {route}: {orig:?} -> {mutated:?}",
        id = m.id,
        file = m.span.file.display(),
        start = m.span.start,
        end = m.span.end,
        category = m.operator.category,
        name = m.operator.name,
        route = m.route_label(),
        orig = m.original_snippet,
        mutated = m.mutated_snippet,
    )
}

/// Convert a byte offset into a 1-based (line, column) location.
///
/// Column counts Unicode scalar values on the line segment.
pub(crate) fn byte_offset_to_line_col(code: &str, offset: usize) -> Option<(usize, usize)> {
    let prefix = code.get(..offset)?;

    let line = prefix.bytes().filter(|&b| b == b'\n').count() + 1;
    let line_start = prefix.rfind('\n').map(|pos| pos + 1).unwrap_or(0);
    let col = prefix[line_start..].chars().count() + 1;

    Some((line, col))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::mutant::fixtures::mutant;

    #[test]
    fn format_short_is_stable() {
        let m = mutant(7, "app/users.py", 10, Some("GET /users"));

        insta::assert_snapshot!(
            format_mutant_short(&m),
            @r#"#7 app/users.py [10..12] comparison/negate_comparison in GET /users: ">=" -> "<""#
        );
    }

    #[test]
    fn shared_mutants_use_the_shared_bucket() {
        let m = mutant(3, "app/common.py", 0, None);
        assert!(format_mutant_short(&m).contains(" in <shared>: "));
    }

    #[test]
    fn location_format_uses_lines_and_columns() {
        let project =
            Project::from_root(PathBuf::from("tests/fixtures/users_api")).expect("fixture");
        let code = project
            .find_source(std::path::Path::new("app/users.py"))
            .unwrap()
            .read_to_string()
            .unwrap();
        let start = code.find("> 100").unwrap() as u32;

        let mut m = mutant(2, "app/users.py", start, Some("GET /users"));
        m.span.end = start + 1;
        m.original_snippet = ">".to_string();
        m.mutated_snippet = ">=".to_string();

        let line = format_mutant_with_location(&project, &m);
        assert!(line.starts_with("#2 app/users.py:9:"), "{line}");
        assert!(line.ends_with(r#"in GET /users: ">" -> ">=""#), "{line}");
    }

    #[test]
    fn missing_source_falls_back_to_byte_span() {
        let project =
            Project::from_root(PathBuf::from("tests/fixtures/users_api")).expect("fixture");
        let m = mutant(5, "app/gone.py", 4, Some("GET /users"));
        assert_eq!(format_mutant_with_location(&project, &m), format_mutant_short(&m));
    }

    #[test]
    fn byte_offset_to_line_col_basic() {
        let code = "a\nbcd\nef";
        assert_eq!(byte_offset_to_line_col(code, 0), Some((1, 1)));
        assert_eq!(byte_offset_to_line_col(code, 1), Some((1, 2)));
        assert_eq!(byte_offset_to_line_col(code, 2), Some((2, 1)));
        assert_eq!(byte_offset_to_line_col(code, 4), Some((2, 3)));
        assert_eq!(byte_offset_to_line_col(code, 6), Some((3, 1)));
        assert_eq!(byte_offset_to_line_col(code, code.len()), Some((3, 3)));
        assert_eq!(byte_offset_to_line_col(code, code.len() + 1), None);
    }
}
