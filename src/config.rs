use anyhow::{Context, Result};
use std::env;

use crate::cli::Cli;
use crate::extract::DEFAULT_GLUE_LEN;
use crate::signature::DEFAULT_SIGNATURE_LEN;

pub const GLUE_LEN_ENV: &str = "UNITMAP_GLUE_LEN";
pub const SIGNATURE_LEN_ENV: &str = "UNITMAP_SIGNATURE_LEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub glue_len: usize,
    pub signature_len: usize,
}

impl Settings {
    pub fn resolve(cli: &Cli) -> Result<Self> {
        Ok(Settings {
            glue_len: resolve_glue_len(cli)?,
            signature_len: resolve_signature_len(cli)?,
        })
    }
}

pub fn resolve_glue_len(cli: &Cli) -> Result<usize> {
    resolve_len(cli.glue_len, GLUE_LEN_ENV, env::var(GLUE_LEN_ENV).ok(), DEFAULT_GLUE_LEN)
}

pub fn resolve_signature_len(cli: &Cli) -> Result<usize> {
    resolve_len(
        cli.signature_len,
        SIGNATURE_LEN_ENV,
        env::var(SIGNATURE_LEN_ENV).ok(),
        DEFAULT_SIGNATURE_LEN,
    )
}

/// Flag, then environment variable, then default.
fn resolve_len(
    flag: Option<usize>,
    var: &str,
    env_value: Option<String>,
    default: usize,
) -> Result<usize> {
    if let Some(v) = flag {
        return Ok(v);
    }

    if let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) {
        return raw
            .trim()
            .parse()
            .with_context(|| format!("{var} must be a non-negative integer, got {raw:?}"));
    }

    Ok(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_environment() {
        let v = resolve_len(Some(5), GLUE_LEN_ENV, Some("7".to_string()), 3).unwrap();
        assert_eq!(v, 5);
    }

    #[test]
    fn environment_wins_over_default() {
        let v = resolve_len(None, GLUE_LEN_ENV, Some(" 6 ".to_string()), 3).unwrap();
        assert_eq!(v, 6);
        let v = resolve_len(None, GLUE_LEN_ENV, Some(String::new()), 3).unwrap();
        assert_eq!(v, 3);
        let v = resolve_len(None, GLUE_LEN_ENV, None, 3).unwrap();
        assert_eq!(v, 3);
    }

    #[test]
    fn unparsable_environment_names_the_variable() {
        let err = resolve_len(None, SIGNATURE_LEN_ENV, Some("two".to_string()), 1).unwrap_err();
        assert!(err.to_string().contains(SIGNATURE_LEN_ENV));
    }
}
