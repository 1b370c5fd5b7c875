//! Decoding of the delta-pair line table.

use crate::error::DecodeError;
use crate::unit::CompiledUnit;

/// Cumulative position after applying a prefix of the line table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub offset: usize,
    pub line: u32,
}

/// `(firstLine, lastLine)` of a unit.
pub fn resolve_span<U: CompiledUnit>(unit: &U) -> Result<(u32, u32), DecodeError> {
    let pairs = pairs(unit)?;
    let first = unit.first_line();
    let mut last = first;
    for (_, line_delta) in pairs {
        last = last
            .checked_add(u32::from(line_delta))
            .ok_or_else(|| DecodeError::LineOverflow {
                unit: unit.name().to_string(),
                first_line: first,
            })?;
    }
    Ok((first, last))
}

/// Snapshots of the running `(offset, line)` position.
///
/// The first snapshot is the starting point `(0, firstLine)`, followed by one
/// snapshot per delta pair.
pub fn scan<U: CompiledUnit>(unit: &U) -> Result<Vec<Snapshot>, DecodeError> {
    let pairs = pairs(unit)?;
    let mut snapshots = Vec::with_capacity(pairs.len() + 1);
    let mut current = Snapshot {
        offset: 0,
        line: unit.first_line(),
    };
    snapshots.push(current);
    for (byte_delta, line_delta) in pairs {
        current.offset += usize::from(byte_delta);
        current.line = current
            .line
            .checked_add(u32::from(line_delta))
            .ok_or_else(|| DecodeError::LineOverflow {
                unit: unit.name().to_string(),
                first_line: unit.first_line(),
            })?;
        snapshots.push(current);
    }
    Ok(snapshots)
}

fn pairs<U: CompiledUnit>(unit: &U) -> Result<Vec<(u8, u8)>, DecodeError> {
    let table = unit.line_table();
    if table.len() % 2 != 0 {
        return Err(DecodeError::OddLineTable {
            unit: unit.name().to_string(),
            len: table.len(),
        });
    }
    Ok(table.chunks_exact(2).map(|p| (p[0], p[1])).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::fixtures::unit;

    #[test]
    fn span_sums_line_deltas() {
        let u = unit("f", 10, vec![0; 40], vec![0, 1, 6, 2, 255, 0, 4, 255]);
        assert_eq!(resolve_span(&u).unwrap(), (10, 268));
    }

    #[test]
    fn span_of_empty_table_is_single_line() {
        let u = unit("f", 7, vec![0; 4], Vec::new());
        assert_eq!(resolve_span(&u).unwrap(), (7, 7));
    }

    #[test]
    fn odd_table_is_rejected() {
        let u = unit("broken", 1, Vec::new(), vec![3, 1, 2]);
        assert_eq!(
            resolve_span(&u),
            Err(DecodeError::OddLineTable {
                unit: "broken".to_string(),
                len: 3
            })
        );
        assert!(scan(&u).is_err());
    }

    #[test]
    fn scan_starts_at_first_line() {
        let u = unit("m", 1, vec![0; 30], vec![9, 3, 6, 0, 3, 1]);
        let offsets: Vec<(usize, u32)> = scan(&u)
            .unwrap()
            .into_iter()
            .map(|s| (s.offset, s.line))
            .collect();
        assert_eq!(offsets, vec![(0, 1), (9, 4), (15, 4), (18, 5)]);
    }
}
