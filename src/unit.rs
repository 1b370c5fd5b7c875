//! The compiled-unit interface the core decodes against.
//!
//! A backend only has to expose an ordered instruction buffer, a delta-pair
//! line table, an ordered constant list in which nested units are tagged, and
//! the parameter layout of the unit. [`CodeObject`] is the owned
//! representation produced by the bundled compiler.

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Constant<U> {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Unit(U),
}

impl<U> Constant<U> {
    pub fn as_unit(&self) -> Option<&U> {
        match self {
            Constant::Unit(u) => Some(u),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeFlags(u32);

impl CodeFlags {
    pub const VARARGS: CodeFlags = CodeFlags(0x04);
    pub const VARKEYWORDS: CodeFlags = CodeFlags(0x08);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        CodeFlags(bits)
    }

    pub fn contains(self, other: CodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: CodeFlags) {
        self.0 |= other.0;
    }
}

/// Raw parameter metadata, decoded by [`crate::args::format_args`].
///
/// `var_names` starts with the positional names, then keyword-only names,
/// then the `*args` name and the `**kwargs` name when the flags say so.
#[derive(Debug, Clone, Copy)]
pub struct ParamLayout<'a> {
    pub arg_count: usize,
    pub kwonly_arg_count: usize,
    pub var_names: &'a [String],
    pub flags: CodeFlags,
}

pub trait CompiledUnit: Sized {
    fn name(&self) -> &str;

    fn first_line(&self) -> u32;

    fn instructions(&self) -> &[u8];

    /// Flat `(byteDelta, lineDelta)` pairs.
    fn line_table(&self) -> &[u8];

    fn constants(&self) -> &[Constant<Self>];

    fn params(&self) -> ParamLayout<'_>;

    fn nested_units(&self) -> impl Iterator<Item = &Self> {
        self.constants().iter().filter_map(Constant::as_unit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    pub name: String,
    pub filename: String,
    pub first_line: u32,
    pub code: Vec<u8>,
    pub lnotab: Vec<u8>,
    pub consts: Vec<Constant<CodeObject>>,
    pub names: Vec<String>,
    pub var_names: Vec<String>,
    pub arg_count: usize,
    pub kwonly_arg_count: usize,
    pub flags: CodeFlags,
}

impl CompiledUnit for CodeObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn first_line(&self) -> u32 {
        self.first_line
    }

    fn instructions(&self) -> &[u8] {
        &self.code
    }

    fn line_table(&self) -> &[u8] {
        &self.lnotab
    }

    fn constants(&self) -> &[Constant<Self>] {
        &self.consts
    }

    fn params(&self) -> ParamLayout<'_> {
        ParamLayout {
            arg_count: self.arg_count,
            kwonly_arg_count: self.kwonly_arg_count,
            var_names: &self.var_names,
            flags: self.flags,
        }
    }
}

/// Content-derived token identifying one physical unit.
///
/// Two units with the same name, first line, instructions, line table and
/// nested units get the same token, so repeated queries of an unchanged file
/// can be matched up by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityToken(u64);

impl IdentityToken {
    pub fn of<U: CompiledUnit>(unit: &U) -> Self {
        let digest = unit_digest(unit);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        IdentityToken(u64::from_be_bytes(head))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0.to_be_bytes()))
    }
}

impl Serialize for IdentityToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn unit_digest<U: CompiledUnit>(unit: &U) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(unit.name().as_bytes());
    hasher.update([0]);
    hasher.update(unit.first_line().to_le_bytes());
    hasher.update((unit.instructions().len() as u64).to_le_bytes());
    hasher.update(unit.instructions());
    hasher.update((unit.line_table().len() as u64).to_le_bytes());
    hasher.update(unit.line_table());
    for nested in unit.nested_units() {
        hasher.update(unit_digest(nested));
    }
    hasher.finalize().into()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Fresh directory under the system temp dir, unique per process and call.
    pub fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "unitmap_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn unit(name: &str, first_line: u32, code: Vec<u8>, lnotab: Vec<u8>) -> CodeObject {
        CodeObject {
            name: name.to_string(),
            filename: "<test>".to_string(),
            first_line,
            code,
            lnotab,
            consts: Vec::new(),
            names: Vec::new(),
            var_names: Vec::new(),
            arg_count: 0,
            kwonly_arg_count: 0,
            flags: CodeFlags::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::unit;
    use super::*;

    #[test]
    fn nested_units_skip_plain_constants() {
        let mut parent = unit("<module>", 1, vec![0; 6], Vec::new());
        parent.consts = vec![
            Constant::None,
            Constant::Unit(unit("a", 1, Vec::new(), Vec::new())),
            Constant::Str("x".to_string()),
            Constant::Unit(unit("b", 3, Vec::new(), Vec::new())),
        ];

        let names: Vec<&str> = parent.nested_units().map(|u| u.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn identity_token_tracks_content() {
        let a = unit("f", 1, vec![100, 0, 0], vec![3, 1]);
        let same = unit("f", 1, vec![100, 0, 0], vec![3, 1]);
        let moved = unit("f", 2, vec![100, 0, 0], vec![3, 1]);

        assert_eq!(IdentityToken::of(&a), IdentityToken::of(&same));
        assert_ne!(IdentityToken::of(&a), IdentityToken::of(&moved));
        assert_eq!(IdentityToken::of(&a).to_string().len(), 16);
    }

    #[test]
    fn identity_token_covers_nested_units() {
        let mut a = unit("<module>", 1, Vec::new(), Vec::new());
        let mut b = a.clone();
        a.consts.push(Constant::Unit(unit("f", 1, vec![1], Vec::new())));
        b.consts.push(Constant::Unit(unit("g", 1, vec![1], Vec::new())));
        assert_ne!(IdentityToken::of(&a), IdentityToken::of(&b));
    }

    #[test]
    fn code_flags_combine() {
        let mut flags = CodeFlags::default();
        assert!(!flags.contains(CodeFlags::VARARGS));
        flags.insert(CodeFlags::VARARGS);
        flags.insert(CodeFlags::VARKEYWORDS);
        assert!(flags.contains(CodeFlags::VARARGS));
        assert_eq!(flags.bits(), 0x0c);
    }
}
