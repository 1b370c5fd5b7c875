use anyhow::{Context, Result};
use std::collections::HashSet;
use tree_sitter::Node;

use super::opcode::{self as op, Assembler};
use crate::unit::{CodeFlags, CodeObject, Constant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Module,
    Class,
    Function,
}

struct UnitBuilder {
    name: String,
    first_line: u32,
    scope: Scope,
    asm: Assembler,
    consts: Vec<Constant<CodeObject>>,
    names: Vec<String>,
    var_names: Vec<String>,
    globals: HashSet<String>,
    arg_count: usize,
    kwonly_arg_count: usize,
    flags: CodeFlags,
    loops: Vec<usize>,
}

impl UnitBuilder {
    fn new(name: &str, first_line: u32, scope: Scope) -> Self {
        Self {
            name: name.to_string(),
            first_line,
            scope,
            asm: Assembler::new(first_line),
            consts: Vec::new(),
            names: Vec::new(),
            var_names: Vec::new(),
            globals: HashSet::new(),
            arg_count: 0,
            kwonly_arg_count: 0,
            flags: CodeFlags::default(),
            loops: Vec::new(),
        }
    }

    fn const_index(&mut self, value: Constant<CodeObject>) -> u32 {
        if !matches!(value, Constant::Unit(_))
            && let Some(idx) = self.consts.iter().position(|c| *c == value)
        {
            return idx as u32;
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u32
    }

    fn name_index(&mut self, name: &str) -> u32 {
        intern(&mut self.names, name)
    }

    fn var_index(&mut self, name: &str) -> u32 {
        intern(&mut self.var_names, name)
    }

    fn load_const(&mut self, value: Constant<CodeObject>) {
        let idx = self.const_index(value);
        self.asm.emit_arg(op::LOAD_CONST, idx);
    }

    fn is_fast(&self, name: &str) -> bool {
        self.scope == Scope::Function && !self.globals.contains(name)
    }

    fn load_name(&mut self, name: &str) {
        if self.is_fast(name) && self.var_names.iter().any(|v| v == name) {
            let idx = self.var_index(name);
            self.asm.emit_arg(op::LOAD_FAST, idx);
        } else if self.scope == Scope::Function {
            let idx = self.name_index(name);
            self.asm.emit_arg(op::LOAD_GLOBAL, idx);
        } else {
            let idx = self.name_index(name);
            self.asm.emit_arg(op::LOAD_NAME, idx);
        }
    }

    fn store_name(&mut self, name: &str) {
        if self.is_fast(name) {
            let idx = self.var_index(name);
            self.asm.emit_arg(op::STORE_FAST, idx);
        } else if self.scope == Scope::Function {
            let idx = self.name_index(name);
            self.asm.emit_arg(op::STORE_GLOBAL, idx);
        } else {
            let idx = self.name_index(name);
            self.asm.emit_arg(op::STORE_NAME, idx);
        }
    }

    fn delete_name(&mut self, name: &str) {
        if self.is_fast(name) {
            let idx = self.var_index(name);
            self.asm.emit_arg(op::DELETE_FAST, idx);
        } else if self.scope == Scope::Function {
            let idx = self.name_index(name);
            self.asm.emit_arg(op::DELETE_GLOBAL, idx);
        } else {
            let idx = self.name_index(name);
            self.asm.emit_arg(op::DELETE_NAME, idx);
        }
    }

    fn finish(self, filename: &str) -> Result<CodeObject> {
        let (code, lnotab) = self
            .asm
            .finish()
            .with_context(|| format!("Failed to assemble `{}`", self.name))?;
        Ok(CodeObject {
            name: self.name,
            filename: filename.to_string(),
            first_line: self.first_line,
            code,
            lnotab,
            consts: self.consts,
            names: self.names,
            var_names: self.var_names,
            arg_count: self.arg_count,
            kwonly_arg_count: self.kwonly_arg_count,
            flags: self.flags,
        })
    }
}

fn intern(table: &mut Vec<String>, name: &str) -> u32 {
    if let Some(idx) = table.iter().position(|n| n == name) {
        return idx as u32;
    }
    table.push(name.to_string());
    (table.len() - 1) as u32
}

#[derive(Debug, Default)]
struct Signature<'t> {
    positional: Vec<String>,
    kwonly: Vec<String>,
    varargs: Option<String>,
    varkw: Option<String>,
    defaults: Vec<Node<'t>>,
}

enum Body<'t> {
    Block(Node<'t>),
    Expr(Node<'t>),
}

pub(super) fn lower_module(root: Node<'_>, source: &str, filename: &str) -> Result<CodeObject> {
    let lower = Lowering {
        source: source.as_bytes(),
        filename,
    };
    let mut unit = UnitBuilder::new("<module>", 1, Scope::Module);
    let stmts = named_children(root);
    let rest = lower.namespace_docstring(&mut unit, &stmts);
    for stmt in rest {
        lower.statement(&mut unit, *stmt)?;
    }
    unit.load_const(Constant::None);
    unit.asm.emit(op::RETURN_VALUE);
    unit.finish(filename)
}

struct Lowering<'s> {
    source: &'s [u8],
    filename: &'s str,
}

impl<'s> Lowering<'s> {
    fn text(&self, node: Node<'_>) -> &'s str {
        node.utf8_text(self.source).unwrap_or("")
    }

    fn field_text(&self, node: Node<'_>, field: &str) -> Result<&'s str> {
        let child = node.child_by_field_name(field).with_context(|| {
            format!(
                "{}:{}: `{}` has no `{field}`",
                self.filename,
                line_of(node),
                node.kind()
            )
        })?;
        Ok(self.text(child))
    }

    fn docstring(&self, stmts: &[Node<'_>]) -> Option<String> {
        let first = stmts.first()?;
        if first.kind() != "expression_statement" {
            return None;
        }
        let inner = named_children(*first);
        match inner.as_slice() {
            [s] if matches!(s.kind(), "string" | "concatenated_string") => {
                Some(self.text(*s).to_string())
            }
            _ => None,
        }
    }

    /// Stores a module or class docstring in `__doc__` and returns the
    /// statements after it.
    fn namespace_docstring<'a, 't>(
        &self,
        unit: &mut UnitBuilder,
        stmts: &'a [Node<'t>],
    ) -> &'a [Node<'t>] {
        match self.docstring(stmts) {
            Some(doc) => {
                unit.asm.set_line(line_of(stmts[0]));
                unit.load_const(Constant::Str(doc));
                unit.store_name("__doc__");
                &stmts[1..]
            }
            None => stmts,
        }
    }

    fn block(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        for stmt in named_children(node) {
            self.statement(unit, stmt)?;
        }
        Ok(())
    }

    fn statement(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        unit.asm.set_line(line_of(node));
        match node.kind() {
            "function_definition" => self.function_def(unit, node, &[]),
            "class_definition" => self.class_def(unit, node, &[]),
            "decorated_definition" => {
                let decorators: Vec<Node<'_>> = named_children(node)
                    .into_iter()
                    .filter(|n| n.kind() == "decorator")
                    .collect();
                let definition = node
                    .child_by_field_name("definition")
                    .context("decorated definition without a definition")?;
                match definition.kind() {
                    "class_definition" => self.class_def(unit, definition, &decorators),
                    _ => self.function_def(unit, definition, &decorators),
                }
            }
            "expression_statement" => self.expression_statement(unit, node),
            "return_statement" => {
                match named_children(node).first() {
                    Some(value) => self.expr(unit, *value)?,
                    None => unit.load_const(Constant::None),
                }
                unit.asm.emit(op::RETURN_VALUE);
                Ok(())
            }
            "pass_statement" => Ok(()),
            "break_statement" => {
                unit.asm.emit(op::BREAK_LOOP);
                Ok(())
            }
            "continue_statement" => {
                if let Some(&start) = unit.loops.last() {
                    unit.asm.emit_arg(op::CONTINUE_LOOP, start as u32);
                }
                Ok(())
            }
            "if_statement" => self.if_statement(unit, node),
            "while_statement" => self.while_statement(unit, node),
            "for_statement" => self.for_statement(unit, node),
            "try_statement" => self.try_statement(unit, node),
            "with_statement" => self.with_statement(unit, node),
            "import_statement" => self.import_statement(unit, node),
            "import_from_statement" => {
                let module = self.field_text(node, "module_name")?;
                self.import_from(unit, node, module)
            }
            "future_import_statement" => self.import_from(unit, node, "__future__"),
            "global_statement" => {
                for name in named_children(node) {
                    unit.globals.insert(self.text(name).to_string());
                }
                Ok(())
            }
            "nonlocal_statement" => Ok(()),
            "raise_statement" => {
                let parts = named_children(node);
                for part in &parts {
                    self.expr(unit, *part)?;
                }
                unit.asm.emit_arg(op::RAISE_VARARGS, parts.len() as u32);
                Ok(())
            }
            "assert_statement" => self.assert_statement(unit, node),
            "delete_statement" => self.delete_statement(unit, node),
            "print_statement" => {
                for part in named_children(node) {
                    self.expr(unit, part)?;
                    unit.asm.emit(op::PRINT_ITEM);
                }
                unit.asm.emit(op::PRINT_NEWLINE);
                Ok(())
            }
            "exec_statement" => {
                for part in named_children(node) {
                    self.expr(unit, part)?;
                }
                unit.asm.emit(op::EXEC_STMT);
                Ok(())
            }
            _ => self.fallback_statement(unit, node),
        }
    }

    fn fallback_statement(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        for child in named_children(node) {
            if child.kind() == "block" {
                self.block(unit, child)?;
            } else if child.kind().ends_with("_clause") {
                self.fallback_statement(unit, child)?;
            } else {
                self.expr(unit, child)?;
                unit.asm.emit(op::POP_TOP);
            }
        }
        Ok(())
    }

    fn function_def(
        &self,
        unit: &mut UnitBuilder,
        node: Node<'_>,
        decorators: &[Node<'_>],
    ) -> Result<()> {
        let name = self.field_text(node, "name")?;
        let first_line = decorators.first().map_or(line_of(node), |d| line_of(*d));
        for decorator in decorators {
            self.decorator(unit, *decorator)?;
        }

        let signature = self.parameters(node.child_by_field_name("parameters"));
        for default in &signature.defaults {
            self.expr(unit, *default)?;
        }
        let body = node
            .child_by_field_name("body")
            .with_context(|| format!("{}:{}: `{name}` has no body", self.filename, line_of(node)))?;
        let code = self.function_unit(name, first_line, &signature, Body::Block(body))?;

        unit.load_const(Constant::Unit(code));
        unit.asm
            .emit_arg(op::MAKE_FUNCTION, signature.defaults.len() as u32);
        for _ in decorators {
            unit.asm.emit_arg(op::CALL_FUNCTION, 1);
        }
        unit.store_name(name);
        Ok(())
    }

    fn class_def(
        &self,
        unit: &mut UnitBuilder,
        node: Node<'_>,
        decorators: &[Node<'_>],
    ) -> Result<()> {
        let name = self.field_text(node, "name")?;
        let first_line = decorators.first().map_or(line_of(node), |d| line_of(*d));
        for decorator in decorators {
            self.decorator(unit, *decorator)?;
        }

        unit.load_const(Constant::Str(name.to_string()));
        let mut bases = 0;
        if let Some(superclasses) = node.child_by_field_name("superclasses") {
            for base in named_children(superclasses) {
                if base.kind() == "keyword_argument" {
                    continue;
                }
                self.expr(unit, base)?;
                bases += 1;
            }
        }
        unit.asm.emit_arg(op::BUILD_TUPLE, bases);

        let body = node
            .child_by_field_name("body")
            .with_context(|| format!("{}:{}: `{name}` has no body", self.filename, line_of(node)))?;
        let code = self.class_unit(name, first_line, body)?;

        unit.load_const(Constant::Unit(code));
        unit.asm.emit_arg(op::MAKE_FUNCTION, 0);
        unit.asm.emit_arg(op::CALL_FUNCTION, 0);
        unit.asm.emit(op::BUILD_CLASS);
        for _ in decorators {
            unit.asm.emit_arg(op::CALL_FUNCTION, 1);
        }
        unit.store_name(name);
        Ok(())
    }

    fn decorator(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        for expr in named_children(node) {
            self.expr(unit, expr)?;
        }
        Ok(())
    }

    fn function_unit(
        &self,
        name: &str,
        first_line: u32,
        signature: &Signature<'_>,
        body: Body<'_>,
    ) -> Result<CodeObject> {
        let mut f = UnitBuilder::new(name, first_line, Scope::Function);
        f.var_names.extend(signature.positional.iter().cloned());
        f.var_names.extend(signature.kwonly.iter().cloned());
        f.arg_count = signature.positional.len();
        f.kwonly_arg_count = signature.kwonly.len();
        if let Some(varargs) = &signature.varargs {
            f.var_names.push(varargs.clone());
            f.flags.insert(CodeFlags::VARARGS);
        }
        if let Some(varkw) = &signature.varkw {
            f.var_names.push(varkw.clone());
            f.flags.insert(CodeFlags::VARKEYWORDS);
        }

        match body {
            Body::Block(block) => {
                let stmts = named_children(block);
                let doc = self.docstring(&stmts);
                let rest = if doc.is_some() {
                    f.asm.set_line(line_of(stmts[0]));
                    &stmts[1..]
                } else {
                    &stmts[..]
                };
                f.consts.push(doc.map_or(Constant::None, Constant::Str));
                for stmt in rest {
                    self.statement(&mut f, *stmt)?;
                }
                f.load_const(Constant::None);
                f.asm.emit(op::RETURN_VALUE);
            }
            Body::Expr(expr) => {
                self.expr(&mut f, expr)?;
                f.asm.emit(op::RETURN_VALUE);
            }
        }
        f.finish(self.filename)
    }

    fn class_unit(&self, name: &str, first_line: u32, body: Node<'_>) -> Result<CodeObject> {
        let mut c = UnitBuilder::new(name, first_line, Scope::Class);
        c.load_name("__name__");
        c.store_name("__module__");
        let stmts = named_children(body);
        let rest = self.namespace_docstring(&mut c, &stmts);
        for stmt in rest {
            self.statement(&mut c, *stmt)?;
        }
        c.asm.emit(op::LOAD_LOCALS);
        c.asm.emit(op::RETURN_VALUE);
        c.finish(self.filename)
    }

    fn parameters<'t>(&self, node: Option<Node<'t>>) -> Signature<'t> {
        let mut signature = Signature::default();
        let Some(node) = node else {
            return signature;
        };

        let mut keyword_only = false;
        for param in named_children(node) {
            let name = match param.kind() {
                "identifier" | "tuple_pattern" => Some(self.text(param).to_string()),
                "default_parameter" | "typed_default_parameter" => {
                    if let Some(value) = param.child_by_field_name("value") {
                        signature.defaults.push(value);
                    }
                    param
                        .child_by_field_name("name")
                        .map(|n| self.text(n).to_string())
                }
                "typed_parameter" => match named_children(param).first() {
                    Some(inner) if inner.kind() == "list_splat_pattern" => {
                        signature.varargs = Some(self.splat_name(*inner));
                        keyword_only = true;
                        None
                    }
                    Some(inner) if inner.kind() == "dictionary_splat_pattern" => {
                        signature.varkw = Some(self.splat_name(*inner));
                        None
                    }
                    Some(inner) => Some(self.text(*inner).to_string()),
                    None => None,
                },
                "list_splat_pattern" => {
                    signature.varargs = Some(self.splat_name(param));
                    keyword_only = true;
                    None
                }
                "dictionary_splat_pattern" => {
                    signature.varkw = Some(self.splat_name(param));
                    None
                }
                "keyword_separator" => {
                    keyword_only = true;
                    None
                }
                _ => None,
            };
            if let Some(name) = name {
                if keyword_only {
                    signature.kwonly.push(name);
                } else {
                    signature.positional.push(name);
                }
            }
        }
        signature
    }

    fn splat_name(&self, node: Node<'_>) -> String {
        named_children(node)
            .first()
            .map(|n| self.text(*n).to_string())
            .unwrap_or_default()
    }

    fn expression_statement(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        for child in named_children(node) {
            match child.kind() {
                "assignment" => self.assignment(unit, child)?,
                "augmented_assignment" => {
                    let left = child
                        .child_by_field_name("left")
                        .context("augmented assignment without target")?;
                    let right = child
                        .child_by_field_name("right")
                        .context("augmented assignment without value")?;
                    self.expr(unit, left)?;
                    self.expr(unit, right)?;
                    unit.asm.emit(op::INPLACE_ADD);
                    self.store(unit, left)?;
                }
                _ => {
                    self.expr(unit, child)?;
                    unit.asm.emit(op::POP_TOP);
                }
            }
        }
        Ok(())
    }

    fn assignment(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        let mut targets = Vec::new();
        let mut current = node;
        let value = loop {
            let left = current
                .child_by_field_name("left")
                .context("assignment without target")?;
            targets.push(left);
            match current.child_by_field_name("right") {
                Some(right) if right.kind() == "assignment" => current = right,
                other => break other,
            }
        };
        // annotation without a value
        let Some(value) = value else {
            return Ok(());
        };

        self.expr(unit, value)?;
        for (idx, target) in targets.iter().enumerate() {
            if idx + 1 < targets.len() {
                unit.asm.emit(op::DUP_TOP);
            }
            self.store(unit, *target)?;
        }
        Ok(())
    }

    fn store(&self, unit: &mut UnitBuilder, target: Node<'_>) -> Result<()> {
        match target.kind() {
            "identifier" => unit.store_name(self.text(target)),
            "attribute" => {
                let object = target
                    .child_by_field_name("object")
                    .context("attribute without object")?;
                self.expr(unit, object)?;
                let idx = unit.name_index(self.field_text(target, "attribute")?);
                unit.asm.emit_arg(op::STORE_ATTR, idx);
            }
            "subscript" => {
                for part in named_children(target) {
                    self.expr(unit, part)?;
                }
                unit.asm.emit(op::STORE_SUBSCR);
            }
            "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list"
            | "expression_list" => {
                let items = named_children(target);
                unit.asm.emit_arg(op::UNPACK_SEQUENCE, items.len() as u32);
                for item in items {
                    self.store(unit, item)?;
                }
            }
            "list_splat_pattern" | "list_splat" | "parenthesized_expression"
            | "as_pattern_target" => {
                if let Some(inner) = named_children(target).first() {
                    self.store(unit, *inner)?;
                }
            }
            _ => unit.asm.emit(op::POP_TOP),
        }
        Ok(())
    }

    fn expr(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        match node.kind() {
            "identifier" => unit.load_name(self.text(node)),
            "integer" => unit.load_const(int_constant(self.text(node))),
            "float" => {
                let text = self.text(node).replace('_', "");
                let value = text
                    .parse::<f64>()
                    .map_or_else(|_| Constant::Str(text.clone()), Constant::Float);
                unit.load_const(value);
            }
            "string" | "concatenated_string" => {
                unit.load_const(Constant::Str(self.text(node).to_string()))
            }
            "true" => unit.load_const(Constant::Bool(true)),
            "false" => unit.load_const(Constant::Bool(false)),
            "none" => unit.load_const(Constant::None),
            "ellipsis" => unit.load_name("Ellipsis"),
            "lambda" => self.lambda(unit, node)?,
            "call" => self.call(unit, node)?,
            "attribute" => {
                let object = node
                    .child_by_field_name("object")
                    .context("attribute without object")?;
                self.expr(unit, object)?;
                let idx = unit.name_index(self.field_text(node, "attribute")?);
                unit.asm.emit_arg(op::LOAD_ATTR, idx);
            }
            "subscript" => {
                for part in named_children(node) {
                    self.expr(unit, part)?;
                }
                unit.asm.emit(op::BINARY_SUBSCR);
            }
            "binary_operator" => {
                for part in named_children(node) {
                    self.expr(unit, part)?;
                }
                let operator = node.child_by_field_name("operator").map_or("+", |o| o.kind());
                unit.asm.emit(binary_opcode(operator));
            }
            "boolean_operator" => {
                let left = node
                    .child_by_field_name("left")
                    .context("boolean operator without left operand")?;
                let right = node
                    .child_by_field_name("right")
                    .context("boolean operator without right operand")?;
                let short_circuit = match node.child_by_field_name("operator").map(|o| o.kind()) {
                    Some("or") => op::JUMP_IF_TRUE_OR_POP,
                    _ => op::JUMP_IF_FALSE_OR_POP,
                };
                self.expr(unit, left)?;
                let slot = unit.asm.emit_jump(short_circuit);
                self.expr(unit, right)?;
                unit.asm.patch(slot);
            }
            "comparison_operator" => {
                let operands = named_children(node);
                for (idx, operand) in operands.iter().enumerate() {
                    self.expr(unit, *operand)?;
                    if idx > 0 {
                        unit.asm.emit_arg(op::COMPARE_OP, 2);
                    }
                }
            }
            "not_operator" => {
                self.operands(unit, node)?;
                unit.asm.emit(op::UNARY_NOT);
            }
            "unary_operator" => {
                self.operands(unit, node)?;
                let opcode = match node.child_by_field_name("operator").map(|o| o.kind()) {
                    Some("+") => op::UNARY_POSITIVE,
                    Some("~") => op::UNARY_INVERT,
                    _ => op::UNARY_NEGATIVE,
                };
                unit.asm.emit(opcode);
            }
            "tuple" | "expression_list" => self.collection(unit, node, op::BUILD_TUPLE)?,
            "list" => self.collection(unit, node, op::BUILD_LIST)?,
            "set" => self.collection(unit, node, op::BUILD_SET)?,
            "dictionary" => {
                let entries = named_children(node);
                unit.asm.emit_arg(op::BUILD_MAP, entries.len() as u32);
                for entry in entries {
                    if entry.kind() == "pair" {
                        let key = entry.child_by_field_name("key").context("pair without key")?;
                        let value = entry
                            .child_by_field_name("value")
                            .context("pair without value")?;
                        self.expr(unit, value)?;
                        self.expr(unit, key)?;
                        unit.asm.emit(op::STORE_MAP);
                    } else {
                        self.expr(unit, entry)?;
                    }
                }
            }
            "conditional_expression" => {
                let parts = named_children(node);
                if let [body, condition, alternative] = parts.as_slice() {
                    self.expr(unit, *condition)?;
                    let to_alternative = unit.asm.emit_jump(op::POP_JUMP_IF_FALSE);
                    self.expr(unit, *body)?;
                    let to_end = unit.asm.emit_jump(op::JUMP_FORWARD);
                    unit.asm.patch(to_alternative);
                    self.expr(unit, *alternative)?;
                    unit.asm.patch(to_end);
                } else {
                    self.operands(unit, node)?;
                }
            }
            "yield" => {
                match named_children(node).first() {
                    Some(value) => self.expr(unit, *value)?,
                    None => unit.load_const(Constant::None),
                }
                unit.asm.emit(op::YIELD_VALUE);
            }
            "keyword_argument" => {
                if let Some(value) = node.child_by_field_name("value") {
                    self.expr(unit, value)?;
                }
            }
            _ => self.operands(unit, node)?,
        }
        Ok(())
    }

    fn operands(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        for child in named_children(node) {
            self.expr(unit, child)?;
        }
        Ok(())
    }

    fn collection(&self, unit: &mut UnitBuilder, node: Node<'_>, build: u8) -> Result<()> {
        let items = named_children(node);
        for item in &items {
            self.expr(unit, *item)?;
        }
        unit.asm.emit_arg(build, items.len() as u32);
        Ok(())
    }

    fn call(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        let function = node
            .child_by_field_name("function")
            .context("call without callee")?;
        self.expr(unit, function)?;

        let mut positional = 0u32;
        let mut keywords = 0u32;
        if let Some(arguments) = node.child_by_field_name("arguments") {
            if arguments.kind() == "generator_expression" {
                self.expr(unit, arguments)?;
                positional = 1;
            } else {
                for arg in named_children(arguments) {
                    if arg.kind() == "keyword_argument" {
                        let name = self.field_text(arg, "name")?;
                        unit.load_const(Constant::Str(name.to_string()));
                        self.expr(unit, arg)?;
                        keywords += 1;
                    } else {
                        self.expr(unit, arg)?;
                        positional += 1;
                    }
                }
            }
        }
        unit.asm
            .emit_arg(op::CALL_FUNCTION, (keywords << 8) | positional);
        Ok(())
    }

    fn lambda(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        let signature = self.parameters(node.child_by_field_name("parameters"));
        for default in &signature.defaults {
            self.expr(unit, *default)?;
        }
        let body = node
            .child_by_field_name("body")
            .context("lambda without body")?;
        let code = self.function_unit("<lambda>", line_of(node), &signature, Body::Expr(body))?;
        unit.load_const(Constant::Unit(code));
        unit.asm
            .emit_arg(op::MAKE_FUNCTION, signature.defaults.len() as u32);
        Ok(())
    }

    fn if_statement(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        let condition = node
            .child_by_field_name("condition")
            .context("if without condition")?;
        self.expr(unit, condition)?;
        let mut to_next = Some(unit.asm.emit_jump(op::POP_JUMP_IF_FALSE));
        if let Some(consequence) = node.child_by_field_name("consequence") {
            self.block(unit, consequence)?;
        }

        let mut cursor = node.walk();
        let alternatives: Vec<Node<'_>> = node
            .children_by_field_name("alternative", &mut cursor)
            .collect();
        let mut to_end = Vec::new();
        for alternative in alternatives {
            to_end.push(unit.asm.emit_jump(op::JUMP_FORWARD));
            if let Some(slot) = to_next.take() {
                unit.asm.patch(slot);
            }
            unit.asm.set_line(line_of(alternative));
            match alternative.kind() {
                "elif_clause" => {
                    let condition = alternative
                        .child_by_field_name("condition")
                        .context("elif without condition")?;
                    self.expr(unit, condition)?;
                    to_next = Some(unit.asm.emit_jump(op::POP_JUMP_IF_FALSE));
                    if let Some(consequence) = alternative.child_by_field_name("consequence") {
                        self.block(unit, consequence)?;
                    }
                }
                _ => self.else_body(unit, alternative)?,
            }
        }
        if let Some(slot) = to_next {
            unit.asm.patch(slot);
        }
        for slot in to_end {
            unit.asm.patch(slot);
        }
        Ok(())
    }

    fn else_body(&self, unit: &mut UnitBuilder, clause: Node<'_>) -> Result<()> {
        match clause.child_by_field_name("body") {
            Some(body) => self.block(unit, body),
            None => self.fallback_statement(unit, clause),
        }
    }

    fn while_statement(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        let setup = unit.asm.emit_jump(op::SETUP_LOOP);
        let start = unit.asm.offset();
        unit.loops.push(start);
        let condition = node
            .child_by_field_name("condition")
            .context("while without condition")?;
        self.expr(unit, condition)?;
        let exit = unit.asm.emit_jump(op::POP_JUMP_IF_FALSE);
        if let Some(body) = node.child_by_field_name("body") {
            self.block(unit, body)?;
        }
        unit.asm.emit_jump_to(op::JUMP_ABSOLUTE, start);
        unit.asm.patch(exit);
        unit.asm.emit(op::POP_BLOCK);
        unit.loops.pop();
        if let Some(alternative) = node.child_by_field_name("alternative") {
            self.else_body(unit, alternative)?;
        }
        unit.asm.patch(setup);
        Ok(())
    }

    fn for_statement(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        let setup = unit.asm.emit_jump(op::SETUP_LOOP);
        let iterable = node
            .child_by_field_name("right")
            .context("for without iterable")?;
        self.expr(unit, iterable)?;
        unit.asm.emit(op::GET_ITER);
        let start = unit.asm.offset();
        unit.loops.push(start);
        let next = unit.asm.emit_jump(op::FOR_ITER);
        let target = node
            .child_by_field_name("left")
            .context("for without target")?;
        self.store(unit, target)?;
        if let Some(body) = node.child_by_field_name("body") {
            self.block(unit, body)?;
        }
        unit.asm.emit_jump_to(op::JUMP_ABSOLUTE, start);
        unit.asm.patch(next);
        unit.asm.emit(op::POP_BLOCK);
        unit.loops.pop();
        if let Some(alternative) = node.child_by_field_name("alternative") {
            self.else_body(unit, alternative)?;
        }
        unit.asm.patch(setup);
        Ok(())
    }

    fn try_statement(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        let clauses = named_children(node);
        let handlers: Vec<Node<'_>> = clauses
            .iter()
            .copied()
            .filter(|c| matches!(c.kind(), "except_clause" | "except_group_clause"))
            .collect();
        let else_clause = clauses.iter().copied().find(|c| c.kind() == "else_clause");
        let finally_clause = clauses
            .iter()
            .copied()
            .find(|c| c.kind() == "finally_clause");

        let finally_setup = finally_clause.map(|_| unit.asm.emit_jump(op::SETUP_FINALLY));
        let except_setup = (!handlers.is_empty()).then(|| unit.asm.emit_jump(op::SETUP_EXCEPT));

        if let Some(body) = node.child_by_field_name("body") {
            self.block(unit, body)?;
        }

        if let Some(setup) = except_setup {
            unit.asm.emit(op::POP_BLOCK);
            let to_else = unit.asm.emit_jump(op::JUMP_FORWARD);
            unit.asm.patch(setup);

            let mut to_end = Vec::new();
            for handler in handlers {
                unit.asm.set_line(line_of(handler));
                let parts = named_children(handler);
                let matchers: Vec<Node<'_>> = parts
                    .iter()
                    .copied()
                    .filter(|p| p.kind() != "block")
                    .collect();

                let mut to_next_handler = None;
                match matchers.first() {
                    Some(matcher) => {
                        let (exc_type, alias) = if matcher.kind() == "as_pattern" {
                            let inner = named_children(*matcher);
                            (inner.first().copied(), matcher.child_by_field_name("alias"))
                        } else {
                            (Some(*matcher), matchers.get(1).copied())
                        };
                        unit.asm.emit(op::DUP_TOP);
                        if let Some(exc_type) = exc_type {
                            self.expr(unit, exc_type)?;
                        }
                        unit.asm.emit_arg(op::COMPARE_OP, 10);
                        to_next_handler = Some(unit.asm.emit_jump(op::POP_JUMP_IF_FALSE));
                        unit.asm.emit(op::POP_TOP);
                        match alias {
                            Some(alias) => self.store(unit, alias)?,
                            None => unit.asm.emit(op::POP_TOP),
                        }
                        unit.asm.emit(op::POP_TOP);
                    }
                    None => {
                        for _ in 0..3 {
                            unit.asm.emit(op::POP_TOP);
                        }
                    }
                }

                for part in parts.iter().filter(|p| p.kind() == "block") {
                    self.block(unit, *part)?;
                }
                to_end.push(unit.asm.emit_jump(op::JUMP_FORWARD));
                if let Some(slot) = to_next_handler {
                    unit.asm.patch(slot);
                }
            }
            unit.asm.emit(op::END_FINALLY);
            unit.asm.patch(to_else);
            if let Some(clause) = else_clause {
                self.else_body(unit, clause)?;
            }
            for slot in to_end {
                unit.asm.patch(slot);
            }
        }

        if let (Some(setup), Some(clause)) = (finally_setup, finally_clause) {
            unit.asm.emit(op::POP_BLOCK);
            unit.load_const(Constant::None);
            unit.asm.patch(setup);
            unit.asm.set_line(line_of(clause));
            self.fallback_statement(unit, clause)?;
            unit.asm.emit(op::END_FINALLY);
        }
        Ok(())
    }

    fn with_statement(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        let mut setups = Vec::new();
        let clause = named_children(node)
            .into_iter()
            .find(|c| c.kind() == "with_clause");
        if let Some(clause) = clause {
            for item in named_children(clause) {
                let value = item
                    .child_by_field_name("value")
                    .or_else(|| named_children(item).first().copied())
                    .context("with item without value")?;
                if value.kind() == "as_pattern" {
                    if let Some(manager) = named_children(value).first() {
                        self.expr(unit, *manager)?;
                    }
                    setups.push(unit.asm.emit_jump(op::SETUP_WITH));
                    match value.child_by_field_name("alias") {
                        Some(alias) => self.store(unit, alias)?,
                        None => unit.asm.emit(op::POP_TOP),
                    }
                } else {
                    self.expr(unit, value)?;
                    setups.push(unit.asm.emit_jump(op::SETUP_WITH));
                    unit.asm.emit(op::POP_TOP);
                }
            }
        }

        if let Some(body) = node.child_by_field_name("body") {
            self.block(unit, body)?;
        }
        for setup in setups.into_iter().rev() {
            unit.asm.emit(op::POP_BLOCK);
            unit.load_const(Constant::None);
            unit.asm.patch(setup);
            unit.asm.emit(op::WITH_CLEANUP);
            unit.asm.emit(op::END_FINALLY);
        }
        Ok(())
    }

    fn import_statement(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        let mut cursor = node.walk();
        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
        for name in names {
            let (module, alias) = if name.kind() == "aliased_import" {
                (
                    self.field_text(name, "name")?,
                    Some(self.field_text(name, "alias")?),
                )
            } else {
                (self.text(name), None)
            };
            unit.load_const(Constant::Int(-1));
            unit.load_const(Constant::None);
            let idx = unit.name_index(module);
            unit.asm.emit_arg(op::IMPORT_NAME, idx);
            match alias {
                Some(alias) => {
                    for attr in module.split('.').skip(1) {
                        let idx = unit.name_index(attr);
                        unit.asm.emit_arg(op::LOAD_ATTR, idx);
                    }
                    unit.store_name(alias);
                }
                None => unit.store_name(module.split('.').next().unwrap_or(module)),
            }
        }
        Ok(())
    }

    fn import_from(&self, unit: &mut UnitBuilder, node: Node<'_>, module: &str) -> Result<()> {
        unit.load_const(Constant::Int(-1));
        let wildcard = named_children(node)
            .iter()
            .any(|c| c.kind() == "wildcard_import");
        if wildcard {
            unit.load_const(Constant::Str("*".to_string()));
            let idx = unit.name_index(module);
            unit.asm.emit_arg(op::IMPORT_NAME, idx);
            unit.asm.emit(op::IMPORT_STAR);
            return Ok(());
        }

        let mut cursor = node.walk();
        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
        unit.load_const(Constant::None);
        let idx = unit.name_index(module);
        unit.asm.emit_arg(op::IMPORT_NAME, idx);
        for name in names {
            let (imported, alias) = if name.kind() == "aliased_import" {
                (
                    self.field_text(name, "name")?,
                    self.field_text(name, "alias")?,
                )
            } else {
                (self.text(name), self.text(name))
            };
            let idx = unit.name_index(imported);
            unit.asm.emit_arg(op::IMPORT_FROM, idx);
            unit.store_name(alias);
        }
        unit.asm.emit(op::POP_TOP);
        Ok(())
    }

    fn assert_statement(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        let parts = named_children(node);
        let Some(condition) = parts.first() else {
            return Ok(());
        };
        self.expr(unit, *condition)?;
        let skip = unit.asm.emit_jump(op::POP_JUMP_IF_TRUE);
        let idx = unit.name_index("AssertionError");
        unit.asm.emit_arg(op::LOAD_GLOBAL, idx);
        if let Some(message) = parts.get(1) {
            self.expr(unit, *message)?;
            unit.asm.emit_arg(op::CALL_FUNCTION, 1);
        }
        unit.asm.emit_arg(op::RAISE_VARARGS, 1);
        unit.asm.patch(skip);
        Ok(())
    }

    fn delete_statement(&self, unit: &mut UnitBuilder, node: Node<'_>) -> Result<()> {
        let mut targets = named_children(node);
        if targets.len() == 1 && targets[0].kind() == "expression_list" {
            targets = named_children(targets[0]);
        }
        for target in targets {
            match target.kind() {
                "identifier" => unit.delete_name(self.text(target)),
                "attribute" => {
                    let object = target
                        .child_by_field_name("object")
                        .context("attribute without object")?;
                    self.expr(unit, object)?;
                    let idx = unit.name_index(self.field_text(target, "attribute")?);
                    unit.asm.emit_arg(op::DELETE_ATTR, idx);
                }
                "subscript" => {
                    for part in named_children(target) {
                        self.expr(unit, part)?;
                    }
                    unit.asm.emit(op::DELETE_SUBSCR);
                }
                _ => {
                    self.expr(unit, target)?;
                    unit.asm.emit(op::POP_TOP);
                }
            }
        }
        Ok(())
    }
}

fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|n| !matches!(n.kind(), "comment" | "line_continuation"))
        .collect()
}

fn line_of(node: Node<'_>) -> u32 {
    node.start_position().row as u32 + 1
}

fn int_constant<U>(text: &str) -> Constant<U> {
    let cleaned = text.replace('_', "");
    let cleaned = cleaned.trim_end_matches(['l', 'L']);
    let lower = cleaned.to_ascii_lowercase();
    let parsed = if let Some(hex) = lower.strip_prefix("0x") {
        i64::from_str_radix(hex, 16)
    } else if let Some(oct) = lower.strip_prefix("0o") {
        i64::from_str_radix(oct, 8)
    } else if let Some(bin) = lower.strip_prefix("0b") {
        i64::from_str_radix(bin, 2)
    } else {
        lower.parse::<i64>()
    };
    parsed.map_or_else(|_| Constant::Str(text.to_string()), Constant::Int)
}

fn binary_opcode(operator: &str) -> u8 {
    match operator {
        "-" => op::BINARY_SUBTRACT,
        "*" | "@" => op::BINARY_MULTIPLY,
        "/" => op::BINARY_DIVIDE,
        "//" => op::BINARY_FLOOR_DIVIDE,
        "%" => op::BINARY_MODULO,
        "**" => op::BINARY_POWER,
        "<<" => op::BINARY_LSHIFT,
        ">>" => op::BINARY_RSHIFT,
        "&" => op::BINARY_AND,
        "^" => op::BINARY_XOR,
        "|" => op::BINARY_OR,
        _ => op::BINARY_ADD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{Compiler, PythonCompiler};
    use crate::unit::CompiledUnit;

    fn compile(source: &str) -> CodeObject {
        PythonCompiler::new().compile(source, "t.py").unwrap()
    }

    #[test]
    fn function_binding_glue() {
        let module = compile("def f(a, b): pass\n");
        assert_eq!(
            &module.code[..9],
            &[op::LOAD_CONST, 0, 0, op::MAKE_FUNCTION, 0, 0, op::STORE_NAME, 0, 0]
        );
        let f = module.nested_units().next().unwrap();
        assert_eq!(f.var_names, vec!["a", "b"]);
        assert_eq!(f.arg_count, 2);
        assert_eq!(f.first_line, 1);
    }

    #[test]
    fn class_binding_glue_ends_with_build_class_and_store() {
        let module = compile("class C(Base):\n    pass\n");
        // STORE_NAME, then the trailing LOAD_CONST None; RETURN_VALUE
        let store_at = module.code.len() - 1 - 3 - 3;
        assert_eq!(module.code[store_at - 1], op::BUILD_CLASS);
        assert_eq!(module.code[store_at], op::STORE_NAME);
    }

    #[test]
    fn class_body_starts_with_module_binding() {
        let module = compile("class C:\n    x = 1\n");
        let class = module.nested_units().next().unwrap();
        assert_eq!(class.code[0], op::LOAD_NAME);
        assert_eq!(class.code[3], op::STORE_NAME);
        assert_eq!(class.names[..2], ["__name__".to_string(), "__module__".to_string()]);
        assert_eq!(
            &class.code[class.code.len() - 2..],
            &[op::LOAD_LOCALS, op::RETURN_VALUE]
        );
    }

    #[test]
    fn line_table_follows_statements() {
        let module = compile("a = 1\n\n\nb = 2\nc = 3\n");
        assert_eq!(module.lnotab, vec![6, 3, 6, 1]);
    }

    #[test]
    fn decorated_definitions_start_at_the_decorator() {
        let module = compile("@wrap\n@other(1)\ndef f():\n    return 1\n");
        let f = module.nested_units().next().unwrap();
        assert_eq!(f.first_line, 1);
        assert_eq!(f.lnotab, vec![0, 3]);
    }

    #[test]
    fn signature_layout() {
        let module = compile("def f(a, b=2, *args, key, flag=True, **kw):\n    local = a\n");
        let f = module.nested_units().next().unwrap();
        assert_eq!(f.var_names, vec!["a", "b", "key", "flag", "args", "kw", "local"]);
        assert_eq!(f.arg_count, 2);
        assert_eq!(f.kwonly_arg_count, 2);
        assert!(f.flags.contains(CodeFlags::VARARGS));
        assert!(f.flags.contains(CodeFlags::VARKEYWORDS));
    }

    #[test]
    fn docstrings_do_not_emit_code_in_functions() {
        let module = compile("def f():\n    \"\"\"Doc.\"\"\"\n    return 1\n");
        let f = module.nested_units().next().unwrap();
        assert_eq!(f.consts[0], Constant::Str("\"\"\"Doc.\"\"\"".to_string()));
        assert_eq!(f.code[0], op::LOAD_CONST);
        assert_eq!(f.lnotab, vec![0, 2]);
    }

    #[test]
    fn nested_units_keep_source_order() {
        let module = compile(
            "def a():\n    pass\nif x:\n    class B:\n        pass\nelse:\n    g = lambda: 0\nfor i in y:\n    def c():\n        pass\n",
        );
        let names: Vec<&str> = module.nested_units().map(|u| u.name()).collect();
        assert_eq!(names, vec!["a", "B", "<lambda>", "c"]);
    }

    #[test]
    fn control_flow_compiles() {
        let source = "\
import os.path as osp
from collections import OrderedDict, deque as dq
from os import *

def work(items):
    global counter
    total = 0
    for item in items:
        if item > 3 and item < 10:
            continue
        elif not item:
            break
        else:
            total += item
    while total:
        total -= 1
    try:
        risky()
    except (ValueError, KeyError) as err:
        raise RuntimeError(err)
    except Exception:
        pass
    else:
        total = -1
    finally:
        counter = total
    with open('f') as fh, lock:
        data = fh.read()[1:2]
    assert total == 0, 'boom'
    del data
    return {'a': [1, 2.5, 0x1f], 'b': (yield total)} if total else None
";
        let module = compile(source);
        let work = module.nested_units().next().unwrap();
        assert_eq!(work.name, "work");
        assert_eq!(work.code.last(), Some(&op::RETURN_VALUE));
        assert!(work.names.contains(&"counter".to_string()));
    }

    #[test]
    fn integer_literals() {
        assert_eq!(int_constant::<CodeObject>("1_000"), Constant::Int(1000));
        assert_eq!(int_constant::<CodeObject>("0x1F"), Constant::Int(31));
        assert_eq!(int_constant::<CodeObject>("10L"), Constant::Int(10));
        assert_eq!(
            int_constant::<CodeObject>("99999999999999999999"),
            Constant::Str("99999999999999999999".to_string())
        );
    }
}
