//! Flattening a compiled unit into its tree of named entities.

use serde::Serialize;

use crate::args::format_args;
use crate::error::DecodeError;
use crate::linetable::resolve_span;
use crate::signature::Classifier;
use crate::unit::{CompiledUnit, IdentityToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeUnitKind {
    Module,
    Function,
    Method,
    Class,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathElement {
    pub kind: CodeUnitKind,
    pub name: String,
}

/// Root-to-entity sequence of `(kind, name)` pairs, inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AncestryPath(Vec<PathElement>);

impl AncestryPath {
    pub fn root(kind: CodeUnitKind, name: &str) -> Self {
        AncestryPath(vec![PathElement {
            kind,
            name: name.to_string(),
        }])
    }

    pub fn child(&self, kind: CodeUnitKind, name: &str) -> Self {
        let mut elements = self.0.clone();
        elements.push(PathElement {
            kind,
            name: name.to_string(),
        });
        AncestryPath(elements)
    }

    pub fn elements(&self) -> &[PathElement] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&PathElement> {
        self.0.last()
    }

    /// Dotted display name: `@` follows functions and methods, `.` follows
    /// everything else, and a leading module is dropped unless it is the
    /// whole path.
    pub fn qualified_name(&self) -> String {
        let skip = usize::from(self.0.len() > 1 && self.0[0].kind == CodeUnitKind::Module);
        let mut out = String::new();
        for (idx, element) in self.0.iter().enumerate().skip(skip) {
            if idx > skip {
                let prev = self.0[idx - 1].kind;
                out.push(match prev {
                    CodeUnitKind::Function | CodeUnitKind::Method => '@',
                    _ => '.',
                });
            }
            out.push_str(&element.name);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeEntity {
    pub kind: CodeUnitKind,
    pub name: String,
    pub first_line: u32,
    pub last_line: u32,
    /// Offsets into the immediate parent's instructions; the root covers its
    /// own instructions.
    pub byte_start: usize,
    pub byte_end: usize,
    pub path: AncestryPath,
    pub args: String,
    pub identity: IdentityToken,
}

impl CodeEntity {
    pub fn display_text(&self) -> String {
        format!("{}{}", self.path.qualified_name(), self.args)
    }
}

/// Pre-order list of every unit reachable from `root`, root first, siblings
/// in constant-table order.
pub fn build_tree<U: CompiledUnit>(
    root: &U,
    classifier: &Classifier,
) -> Result<Vec<CodeEntity>, DecodeError> {
    let path = AncestryPath::root(CodeUnitKind::Module, root.name());
    let mut entities = vec![entity(
        root,
        CodeUnitKind::Module,
        path.clone(),
        0,
        root.instructions().len(),
    )?];
    walk(root, &path, classifier, &mut entities)?;
    Ok(entities)
}

fn walk<U: CompiledUnit>(
    parent: &U,
    path: &AncestryPath,
    classifier: &Classifier,
    out: &mut Vec<CodeEntity>,
) -> Result<(), DecodeError> {
    for child in parent.nested_units() {
        let range = classifier.extractor().extract(parent, child)?;
        let kind = if classifier.glue_matches(parent.instructions(), range.clone()) {
            CodeUnitKind::Class
        } else {
            CodeUnitKind::Function
        };
        let child_path = path.child(kind, child.name());
        out.push(entity(child, kind, child_path.clone(), range.start, range.end)?);
        walk(child, &child_path, classifier, out)?;
    }
    Ok(())
}

fn entity<U: CompiledUnit>(
    unit: &U,
    kind: CodeUnitKind,
    path: AncestryPath,
    byte_start: usize,
    byte_end: usize,
) -> Result<CodeEntity, DecodeError> {
    let (first_line, last_line) = resolve_span(unit)?;
    Ok(CodeEntity {
        kind,
        name: unit.name().to_string(),
        first_line,
        last_line,
        byte_start,
        byte_end,
        path,
        args: format_args(kind, unit)?,
        identity: IdentityToken::of(unit),
    })
}

/// Relabels functions defined directly in a class body as methods, in every
/// path they appear in.
pub fn label_methods(entities: &mut [CodeEntity]) {
    for entity in entities.iter_mut() {
        let elements = &mut entity.path.0;
        for idx in 1..elements.len() {
            if elements[idx].kind == CodeUnitKind::Function
                && elements[idx - 1].kind == CodeUnitKind::Class
            {
                elements[idx].kind = CodeUnitKind::Method;
            }
        }
        if let Some(last) = elements.last() {
            entity.kind = last.kind;
        }
    }
}
