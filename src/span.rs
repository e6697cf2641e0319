use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::PathBuf;

/// Byte span inside a project source file.
///
/// Offsets are byte indices into the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceSpan {
    /// Project-relative path to the source file.
    pub file: PathBuf,

    /// Start byte offset (inclusive).
    pub start: u32,

    /// End byte offset (exclusive).
    pub end: u32,
}

impl SourceSpan {
    pub fn new(file: impl Into<PathBuf>, range: Range<usize>) -> Self {
        Self {
            file: file.into(),
            start: range.start as u32,
            end: range.end as u32,
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.start as usize..self.end as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_round_trips_the_offsets() {
        let span = SourceSpan::new("app/users.py", 10..20);
        assert_eq!(span.range(), 10..20);
        assert_eq!(&"x".repeat(30)[span.range()], "xxxxxxxxxx");
    }
}
