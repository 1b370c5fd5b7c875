//! Display of a unit's declared parameters.

use crate::error::DecodeError;
use crate::tree::CodeUnitKind;
use crate::unit::{CodeFlags, CompiledUnit};

/// `(a, b, *args, k, **kwargs)` for functions and methods, empty otherwise.
pub fn format_args<U: CompiledUnit>(kind: CodeUnitKind, unit: &U) -> Result<String, DecodeError> {
    if !matches!(kind, CodeUnitKind::Function | CodeUnitKind::Method) {
        return Ok(String::new());
    }

    let params = unit.params();
    let has_varargs = params.flags.contains(CodeFlags::VARARGS);
    let has_varkw = params.flags.contains(CodeFlags::VARKEYWORDS);
    let needed = params.arg_count
        + params.kwonly_arg_count
        + usize::from(has_varargs)
        + usize::from(has_varkw);
    if needed > params.var_names.len() {
        return Err(DecodeError::Parameters {
            unit: unit.name().to_string(),
            needed,
            available: params.var_names.len(),
        });
    }

    let names = params.var_names;
    let positional = &names[..params.arg_count];
    let kwonly = &names[params.arg_count..params.arg_count + params.kwonly_arg_count];
    let mut next = params.arg_count + params.kwonly_arg_count;

    let mut parts: Vec<String> = positional.to_vec();
    if has_varargs {
        parts.push(format!("*{}", names[next]));
        next += 1;
    } else if !kwonly.is_empty() {
        parts.push("*".to_string());
    }
    parts.extend(kwonly.iter().cloned());
    if has_varkw {
        parts.push(format!("**{}", names[next]));
    }

    Ok(format!("({})", parts.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::fixtures::unit;

    fn with_params(arg_count: usize, kwonly: usize, names: &[&str], flags: u32) -> crate::unit::CodeObject {
        let mut u = unit("f", 1, Vec::new(), Vec::new());
        u.arg_count = arg_count;
        u.kwonly_arg_count = kwonly;
        u.var_names = names.iter().map(|s| s.to_string()).collect();
        u.flags = CodeFlags::from_bits(flags);
        u
    }

    #[test]
    fn positional_only() {
        let u = with_params(2, 0, &["a", "b", "local"], 0);
        assert_eq!(format_args(CodeUnitKind::Function, &u).unwrap(), "(a, b)");
    }

    #[test]
    fn variadic_markers() {
        let u = with_params(1, 0, &["a", "args", "kwargs"], 0x0c);
        assert_eq!(
            format_args(CodeUnitKind::Method, &u).unwrap(),
            "(a, *args, **kwargs)"
        );
    }

    #[test]
    fn keyword_only_without_varargs_gets_bare_star() {
        let u = with_params(1, 1, &["a", "key", "kw"], 0x08);
        assert_eq!(
            format_args(CodeUnitKind::Function, &u).unwrap(),
            "(a, *, key, **kw)"
        );
    }

    #[test]
    fn classes_and_modules_have_no_args() {
        let u = with_params(2, 0, &["a", "b"], 0);
        assert_eq!(format_args(CodeUnitKind::Class, &u).unwrap(), "");
        assert_eq!(format_args(CodeUnitKind::Module, &u).unwrap(), "");
    }

    #[test]
    fn missing_names_are_a_decode_error() {
        let u = with_params(2, 0, &["a"], 0x04);
        assert_eq!(
            format_args(CodeUnitKind::Function, &u),
            Err(DecodeError::Parameters {
                unit: "f".to_string(),
                needed: 3,
                available: 1
            })
        );
    }
}
