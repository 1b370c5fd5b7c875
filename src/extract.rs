//! Locating a nested unit's materialization code inside its parent.

use std::ops::Range;

use crate::error::DecodeError;
use crate::linetable::{resolve_span, scan};
use crate::unit::CompiledUnit;

/// Length of the store instruction that binds a freshly built nested unit to
/// its name. The bundled compiler always emits a 3-byte store here.
pub const DEFAULT_GLUE_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeExtractor {
    glue_len: usize,
}

impl Default for RangeExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_GLUE_LEN)
    }
}

impl RangeExtractor {
    pub fn new(glue_len: usize) -> Self {
        Self { glue_len }
    }

    pub fn glue_len(&self) -> usize {
        self.glue_len
    }

    /// Byte range of `parent`'s instructions that materialize `child`.
    ///
    /// The start falls back to 0 when no line-table breakpoint reaches the
    /// child's first line, and the end falls back to the last scanned offset
    /// when no breakpoint reaches its last line. The trailing store is cut off
    /// the end, never past the start.
    pub fn extract<U: CompiledUnit>(&self, parent: &U, child: &U) -> Result<Range<usize>, DecodeError> {
        let (child_first, child_last) = resolve_span(child)?;
        let snapshots = scan(parent)?;

        let mut start = None;
        let mut end = None;
        let mut last_offset = 0;
        for snap in &snapshots {
            last_offset = snap.offset;
            if start.is_none() {
                if snap.line >= child_first {
                    start = Some(snap.offset);
                }
            } else if snap.line >= child_last {
                end = Some(snap.offset);
                break;
            }
        }

        let len = parent.instructions().len();
        let start = start.unwrap_or(0).min(len);
        let end = end.unwrap_or(last_offset).min(len);
        let end = end.saturating_sub(self.glue_len).max(start);
        Ok(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::fixtures::unit;

    #[test]
    fn range_runs_from_definition_to_next_statement() {
        // def at line 2 (offsets 6..25), next statement at line 5
        let parent = unit("<module>", 1, vec![0; 40], vec![6, 1, 19, 3]);
        let child = unit("f", 2, vec![0; 10], vec![4, 2]);

        let extractor = RangeExtractor::default();
        assert_eq!(extractor.extract(&parent, &child).unwrap(), 6..22);
    }

    #[test]
    fn initial_snapshot_matches_definition_on_first_line() {
        let parent = unit("<module>", 1, vec![0; 19], vec![9, 2]);
        let child = unit("f", 1, vec![0; 4], Vec::new());

        assert_eq!(
            RangeExtractor::default().extract(&parent, &child).unwrap(),
            0..6
        );
    }

    #[test]
    fn start_falls_back_to_zero() {
        let parent = unit("g", 1, vec![0; 12], vec![6, 1]);
        let child = unit("f", 9, vec![0; 4], Vec::new());

        let range = RangeExtractor::new(0).extract(&parent, &child).unwrap();
        assert_eq!(range.start, 0);
        assert_eq!(range.end, 6);
    }

    #[test]
    fn end_falls_back_to_last_scanned_offset() {
        // child is the final statement: nothing after it in the table
        let parent = unit("C", 1, vec![0; 17], vec![6, 1]);
        let child = unit("m", 2, vec![0; 4], Vec::new());

        assert_eq!(
            RangeExtractor::default().extract(&parent, &child).unwrap(),
            6..6
        );
    }

    #[test]
    fn trimming_never_crosses_start() {
        let parent = unit("p", 1, vec![0; 8], vec![2, 1, 2, 1]);
        let child = unit("c", 2, vec![0; 2], Vec::new());

        let range = RangeExtractor::default().extract(&parent, &child).unwrap();
        assert_eq!(range, 2..2);
    }

    #[test]
    fn malformed_child_table_fails() {
        let parent = unit("p", 1, vec![0; 8], vec![2, 1]);
        let child = unit("c", 2, Vec::new(), vec![1]);
        assert!(RangeExtractor::default().extract(&parent, &child).is_err());
    }
}
