use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::mutant::{Mutant, MutantOutcome};
use crate::project::Project;
use crate::report::{byte_offset_to_line_col, format_mutant_with_location};
use crate::run_report::MutationReport;

/// Default output directory, created in the project root.
pub const OUT_DIR_NAME: &str = "smart-mutant.out";

/// Write every report artifact of a pass into `out_dir`.
///
/// `cache.json` is left alone; the pass saves it separately.
pub fn write_all(out_dir: &Path, project: &Project, report: &MutationReport) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create output dir {:?}", out_dir))?;

    write_pretty_json(&out_dir.join("report.json"), report)?;
    write_outcome_txts(out_dir, project, &report.mutants)?;
    write_diff_dir(out_dir, project, &report.mutants)?;
    write_log(out_dir, report)?;
    Ok(())
}

/// Write cargo-mutants-style outcome lists:
/// - caught.txt   (killed)
/// - missed.txt   (survived)
/// - timeout.txt  (timeout)
/// - unviable.txt (errored)
pub fn write_outcome_txts(out_dir: &Path, project: &Project, mutants: &[Mutant]) -> Result<()> {
    for (name, want) in [
        ("caught.txt", MutantOutcome::Killed),
        ("missed.txt", MutantOutcome::Survived),
        ("timeout.txt", MutantOutcome::Timeout),
        ("unviable.txt", MutantOutcome::Errored),
    ] {
        write_txt_for(out_dir.join(name), project, mutants, want)?;
    }
    Ok(())
}

/// Write one `diff/NNNNNN.diff` per executed mutant. Stale diffs of a previous pass are removed.
pub fn write_diff_dir(out_dir: &Path, project: &Project, mutants: &[Mutant]) -> Result<()> {
    let diff_dir = out_dir.join("diff");
    if diff_dir.exists() {
        fs::remove_dir_all(&diff_dir)
            .with_context(|| format!("failed to clear diff dir {:?}", diff_dir))?;
    }
    fs::create_dir_all(&diff_dir)
        .with_context(|| format!("failed to create diff dir {:?}", diff_dir))?;

    let code_of = |m: &Mutant| {
        project
            .find_source(&m.span.file)
            .and_then(|s| s.read_to_string().ok())
    };

    for m in mutants.iter().filter(|m| m.outcome != MutantOutcome::NotRun) {
        let content = match code_of(m) {
            Some(code) => render_diff(&code, m),
            None => snippet_diff(m),
        };

        let path = diff_dir.join(format!("{:06}.diff", m.id));
        fs::write(&path, content).with_context(|| format!("failed to write {:?}", path))?;
    }

    Ok(())
}

/// Unified diff of the lines the mutant touches.
fn render_diff(code: &str, m: &Mutant) -> String {
    let start = m.span.start as usize;
    let end = m.span.end as usize;
    if code.get(start..end) != Some(m.original_snippet.as_str()) {
        return snippet_diff(m);
    }
    let Some((line, _)) = byte_offset_to_line_col(code, start) else {
        return snippet_diff(m);
    };

    let block_start = code[..start].rfind('\n').map_or(0, |p| p + 1);
    let block_end = code[end..].find('\n').map_or(code.len(), |p| end + p);
    let before = &code[block_start..block_end];
    let after = format!(
        "{}{}{}",
        &code[block_start..start],
        m.mutated_snippet,
        &code[end..block_end]
    );

    let file = m.span.file.display();
    let mut out = format!(
        "--- a/{file}\n+++ b/{file}\n@@ -{line},{} +{line},{} @@ {}\n",
        before.lines().count(),
        after.lines().count(),
        m.operator.name
    );
    for l in before.lines() {
        out.push_str(&format!("-{l}\n"));
    }
    for l in after.lines() {
        out.push_str(&format!("+{l}\n"));
    }
    out
}

fn snippet_diff(m: &Mutant) -> String {
    let file = m.span.file.display();
    format!(
        "--- a/{file}\n+++ b/{file}\n@@ [{start}..{end}] {op}\n- {orig:?}\n+ {mutated:?}\n",
        start = m.span.start,
        end = m.span.end,
        op = m.operator.name,
        orig = m.original_snippet,
        mutated = m.mutated_snippet,
    )
}

/// Write a stable `log` file (no timestamps) with mode, summary and error.
pub fn write_log(out_dir: &Path, report: &MutationReport) -> Result<()> {
    let path = out_dir.join("log");
    let s = &report.summary;

    let mut lines = Vec::new();
    lines.push(format!("tool: {}", report.tool));
    lines.push(format!("version: {}", report.version));
    lines.push(format!("project_root: {}", report.project_root.display()));
    lines.push(format!(
        "mode: {} (requested {})",
        report.mode, report.requested_mode
    ));
    if let Some(detail) = &report.fallback_detail {
        lines.push(format!("fallback: {detail}"));
    }
    if let Some(changed) = &report.changed_files {
        lines.push(format!("changed_files: {}", changed.len()));
    }
    lines.push(format!(
        "summary: total={} killed={} survived={} timeout={} errored={} no_coverage={} carried_forward={} not_run={}",
        s.total,
        s.killed,
        s.survived,
        s.timeouts,
        s.errored,
        s.no_coverage,
        s.carried_forward,
        s.not_run
    ));
    match report.score {
        Some(score) => lines.push(format!("score: {score:.2}")),
        None => lines.push("score: n/a".to_string()),
    }
    if let Some(audit) = &report.audit {
        lines.push(format!(
            "audit: compared={} divergent={}",
            audit.compared,
            audit.divergent.len()
        ));
    }
    if let Some(err) = &report.error {
        lines.push(format!("error: {err}"));
    }

    let content = lines.join("\n") + "\n";
    fs::write(&path, content).with_context(|| format!("failed to write {:?}", path))?;
    Ok(())
}

fn write_txt_for(
    path: PathBuf,
    project: &Project,
    mutants: &[Mutant],
    want: MutantOutcome,
) -> Result<()> {
    let mut ordered: Vec<&Mutant> = mutants.iter().filter(|m| m.outcome == want).collect();
    ordered.sort_by_key(|m| m.id);

    // The file is created even when the list is empty.
    let mut out = String::new();
    for m in ordered {
        out.push_str(&format_mutant_with_location(project, m));
        out.push('\n');
    }

    fs::write(&path, out).with_context(|| format!("failed to write {:?}", path))?;
    Ok(())
}

// `?Sized` allows passing unsized values such as slices.
pub fn write_pretty_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize json")?;
    fs::write(path, json).with_context(|| format!("failed to write {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Thresholds, TimeoutPolicy};
    use crate::mutant::fixtures::mutant;
    use crate::options::RunMode;

    const FIXTURE: &str = "tests/fixtures/users_api";

    fn boundary_mutant(project: &Project) -> Mutant {
        let code = project
            .find_source(Path::new("app/users.py"))
            .unwrap()
            .read_to_string()
            .unwrap();
        let start = code.find("> 100").unwrap() as u32;

        let mut m = mutant(1, "app/users.py", start, Some("GET /users"));
        m.span.end = start + 1;
        m.original_snippet = ">".to_string();
        m.mutated_snippet = ">=".to_string();
        m.operator.name = "shift_comparison".to_string();
        m
    }

    fn report(project: &Project, mutants: Vec<Mutant>) -> MutationReport {
        MutationReport::success(
            project.root().to_path_buf(),
            RunMode::Smart,
            RunMode::Smart,
            Thresholds::default(),
            TimeoutPolicy::Exclude,
            mutants,
        )
    }

    #[test]
    fn diff_shows_the_mutated_line() {
        let project = Project::from_root(PathBuf::from(FIXTURE)).unwrap();
        let code = fs::read_to_string(project.root().join("app/users.py")).unwrap();

        let diff = render_diff(&code, &boundary_mutant(&project));

        insta::assert_snapshot!(diff, @r"
        --- a/app/users.py
        +++ b/app/users.py
        @@ -9,1 +9,1 @@ shift_comparison
        -    if limit > 100:
        +    if limit >= 100:
        ");
    }

    #[test]
    fn stale_snippet_falls_back_to_byte_span() {
        let mut m = mutant(4, "app/users.py", 0, Some("GET /users"));
        m.original_snippet = "nope".to_string();
        assert_eq!(render_diff("from app.models", &m), snippet_diff(&m));
    }

    #[test]
    fn write_all_creates_every_artifact() {
        let project = Project::from_root(PathBuf::from(FIXTURE)).unwrap();
        let out = tempfile::tempdir().unwrap();

        let mut killed = boundary_mutant(&project);
        killed.outcome = MutantOutcome::Killed;
        killed.duration_ms = Some(5);
        let mut survived = mutant(2, "app/users.py", 0, Some("GET /users"));
        survived.outcome = MutantOutcome::Survived;
        survived.duration_ms = Some(5);
        let pending = mutant(3, "app/users.py", 4, Some("GET /users"));

        // A leftover diff from an earlier pass.
        fs::create_dir_all(out.path().join("diff")).unwrap();
        fs::write(out.path().join("diff/000099.diff"), "old").unwrap();

        let report = report(&project, vec![killed, survived, pending]);
        write_all(out.path(), &project, &report).unwrap();

        for name in [
            "report.json",
            "caught.txt",
            "missed.txt",
            "timeout.txt",
            "unviable.txt",
            "log",
        ] {
            assert!(out.path().join(name).exists(), "{name} missing");
        }

        let caught = fs::read_to_string(out.path().join("caught.txt")).unwrap();
        assert!(caught.starts_with("#1 app/users.py:9:"), "{caught}");
        assert_eq!(fs::read_to_string(out.path().join("timeout.txt")).unwrap(), "");

        assert!(out.path().join("diff/000001.diff").exists());
        assert!(out.path().join("diff/000002.diff").exists());
        assert!(!out.path().join("diff/000003.diff").exists());
        assert!(!out.path().join("diff/000099.diff").exists());

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.path().join("report.json")).unwrap())
                .unwrap();
        assert_eq!(json["summary"]["killed"], 1);
        assert_eq!(json["summary"]["not_run"], 1);

        let log = fs::read_to_string(out.path().join("log")).unwrap();
        assert!(log.contains("mode: smart (requested smart)"));
        assert!(log.contains("score: 50.00"));
    }
}
