//! Typed failures raised by the decoding core.
//!
//! Everything above the core (compiler backend, service, CLI) wraps these in
//! `anyhow::Error`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("line table of `{unit}` has an odd number of entries ({len})")]
    OddLineTable { unit: String, len: usize },

    #[error("line numbers of `{unit}` overflow past line {first_line}")]
    LineOverflow { unit: String, first_line: u32 },

    #[error(
        "parameter metadata of `{unit}` needs {needed} variable names but only {available} are present"
    )]
    Parameters {
        unit: String,
        needed: usize,
        available: usize,
    },
}

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("failed to compile the class probe: {0}")]
    Compile(String),

    #[error("class probe has no nested unit at depth {depth}")]
    MissingProbeUnit { depth: usize },

    #[error("class probe glue is {available} bytes, shorter than the {wanted}-byte signature")]
    ShortGlue { wanted: usize, available: usize },

    #[error("signature length must be at least 1")]
    EmptySignature,

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_names_the_unit() {
        let err = DecodeError::OddLineTable {
            unit: "f".to_string(),
            len: 3,
        };
        assert_eq!(
            err.to_string(),
            "line table of `f` has an odd number of entries (3)"
        );
    }

    #[test]
    fn calibration_wraps_decode_errors() {
        let err: CalibrationError = DecodeError::OddLineTable {
            unit: "probe".to_string(),
            len: 1,
        }
        .into();
        assert!(err.to_string().contains("probe"));
    }
}
