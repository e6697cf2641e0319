use thiserror::Error;

use crate::span::SourceSpan;

/// A recorded replacement no longer lines up with the code it targets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("span [{start}, {end}) is out of bounds for code length {len}")]
    OutOfBounds { start: usize, end: usize, len: usize },

    #[error("span [{start}, {end}) holds {found:?}, expected {expected:?}")]
    Mismatch {
        start: usize,
        end: usize,
        expected: String,
        found: String,
    },
}

/// Apply a single textual replacement to `code` based on `span`.
///
/// The `span` offsets are byte indices into `code`.
pub fn apply_span_patch(
    code: &str,
    span: &SourceSpan,
    replacement: &str,
) -> Result<String, PatchError> {
    let start = span.start as usize;
    let end = span.end as usize;

    if start > end
        || end > code.len()
        || !code.is_char_boundary(start)
        || !code.is_char_boundary(end)
    {
        return Err(PatchError::OutOfBounds {
            start,
            end,
            len: code.len(),
        });
    }

    let mut out = String::with_capacity(
        code.len() + replacement.len().saturating_sub(end.saturating_sub(start)),
    );

    out.push_str(&code[..start]);
    out.push_str(replacement);
    out.push_str(&code[end..]);

    Ok(out)
}

/// Apply a replacement after verifying that the original slice matches `expected_original`.
///
/// Mutants can outlive the file they were generated from (the incremental cache
/// keeps them across runs), so the check is enforced in release builds too.
pub fn apply_checked_patch(
    code: &str,
    span: &SourceSpan,
    expected_original: &str,
    replacement: &str,
) -> Result<String, PatchError> {
    let start = span.start as usize;
    let end = span.end as usize;

    match code.get(start..end) {
        Some(found) if found == expected_original => {}
        Some(found) => {
            return Err(PatchError::Mismatch {
                start,
                end,
                expected: expected_original.to_string(),
                found: found.to_string(),
            });
        }
        None => {
            return Err(PatchError::OutOfBounds {
                start,
                end,
                len: code.len(),
            });
        }
    }

    apply_span_patch(code, span, replacement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn span_for_substr(code: &str, needle: &str) -> SourceSpan {
        let start = code
            .find(needle)
            .unwrap_or_else(|| panic!("needle {:?} not found in {:?}", needle, code));
        let end = start + needle.len();
        SourceSpan {
            file: PathBuf::from("app/users.py"),
            start: start as u32,
            end: end as u32,
        }
    }

    #[test]
    fn patch_middle_of_string() {
        let code = "if age >= 18:";
        let span = span_for_substr(code, ">=");

        let patched = apply_span_patch(code, &span, "<").unwrap();
        assert_eq!(patched, "if age < 18:");
    }

    #[test]
    fn patch_at_start_and_end() {
        let code = "True or x";
        let span = span_for_substr(code, "True");
        assert_eq!(apply_span_patch(code, &span, "False").unwrap(), "False or x");

        let span = span_for_substr(code, "x");
        assert_eq!(apply_span_patch(code, &span, "y").unwrap(), "True or y");
    }

    #[test]
    fn checked_patch_verifies_original_slice() {
        let code = "age: int = Field(ge=18)";
        let span = span_for_substr(code, "18");

        let patched = apply_checked_patch(code, &span, "18", "17").unwrap();
        assert_eq!(patched, "age: int = Field(ge=17)");

        let err = apply_checked_patch(code, &span, "19", "20").unwrap_err();
        assert!(matches!(err, PatchError::Mismatch { .. }));
    }

    #[test]
    fn out_of_bounds_span_is_rejected() {
        let span = SourceSpan {
            file: PathBuf::from("app/users.py"),
            start: 4,
            end: 40,
        };

        let err = apply_span_patch("short", &span, "x").unwrap_err();
        assert_eq!(
            err,
            PatchError::OutOfBounds {
                start: 4,
                end: 40,
                len: 5
            }
        );
    }
}
