//! Source-to-unit compilation.
//!
//! The core only sees [`CompiledUnit`]s; a [`Compiler`] is the host side that
//! produces them and supplies the probe snippet the class signature is
//! calibrated from. [`PythonCompiler`] parses with tree-sitter and lowers the
//! syntax tree to stack-machine instructions.

pub mod opcode;
mod python;

use anyhow::{Context, Result, bail};
use tree_sitter::{Node, Parser};

use crate::unit::{CodeObject, CompiledUnit};

pub trait Compiler {
    type Unit: CompiledUnit;

    fn compile(&self, source: &str, filename: &str) -> Result<Self::Unit>;

    /// Source holding one function whose body declares one class followed by
    /// at least one more statement.
    fn class_probe(&self) -> &str;
}

const PYTHON_CLASS_PROBE: &str = "\
def probe():
    class Probe:
        pass
    pass
";

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonCompiler;

impl PythonCompiler {
    pub fn new() -> Self {
        PythonCompiler
    }
}

impl Compiler for PythonCompiler {
    type Unit = CodeObject;

    fn compile(&self, source: &str, filename: &str) -> Result<CodeObject> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .context("Failed to load the Python grammar")?;
        let tree = parser
            .parse(source, None)
            .with_context(|| format!("Parser produced no tree for {filename}"))?;

        let root = tree.root_node();
        if root.has_error() {
            let line = first_error(root).map_or(1, |n| n.start_position().row + 1);
            bail!("{filename}:{line}: invalid syntax");
        }

        python::lower_module(root, source, filename)
    }

    fn class_probe(&self) -> &str {
        PYTHON_CLASS_PROBE
    }
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children
        .into_iter()
        .filter(|child| child.has_error())
        .find_map(first_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Constant;

    #[test]
    fn syntax_errors_are_reported_with_a_line() {
        let err = PythonCompiler::new()
            .compile("x = 1\ndef f(:\n    pass\n", "bad.py")
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("bad.py:"), "{msg}");
        assert!(msg.contains("invalid syntax"));
    }

    #[test]
    fn probe_has_one_function_with_one_class() {
        let compiler = PythonCompiler::new();
        let module = compiler.compile(compiler.class_probe(), "<probe>").unwrap();
        let function: Vec<&CodeObject> = module.nested_units().collect();
        assert_eq!(function.len(), 1);
        let class: Vec<&CodeObject> = function[0].nested_units().collect();
        assert_eq!(class.len(), 1);
        assert_eq!(class[0].name, "Probe");
    }

    #[test]
    fn module_unit_is_named_and_returns_none() {
        let module = PythonCompiler::new().compile("x = 1\n", "m.py").unwrap();
        assert_eq!(module.name, "<module>");
        assert_eq!(module.filename, "m.py");
        assert_eq!(module.first_line, 1);
        assert_eq!(module.code.last(), Some(&opcode::RETURN_VALUE));
        assert!(module.consts.contains(&Constant::None));
    }
}
