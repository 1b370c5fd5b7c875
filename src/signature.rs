//! Class-versus-function classification of nested units.
//!
//! Nothing in a nested unit says whether it is a class body or a function.
//! The difference only shows in the parent, in the instructions emitted right
//! after the nested unit is materialized. The [`Classifier`] learns that
//! trailing pattern once, from a probe snippet compiled by the same backend
//! that compiles the queried sources, and then compares every nested unit's
//! glue against it.

use std::ops::Range;

use tracing::debug;

use crate::compile::Compiler;
use crate::error::{CalibrationError, DecodeError};
use crate::extract::RangeExtractor;
use crate::unit::CompiledUnit;

pub const DEFAULT_SIGNATURE_LEN: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSignature(Vec<u8>);

impl ClassSignature {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ClassSignature(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compiles the backend's class probe (a function holding exactly one
    /// nested class) and keeps the last `len` bytes of that class's glue.
    pub fn calibrate<C: Compiler>(
        compiler: &C,
        extractor: &RangeExtractor,
        len: usize,
    ) -> Result<Self, CalibrationError> {
        if len == 0 {
            return Err(CalibrationError::EmptySignature);
        }

        let module = compiler
            .compile(compiler.class_probe(), "<class-probe>")
            .map_err(|e| CalibrationError::Compile(format!("{e:#}")))?;
        let function = module
            .nested_units()
            .next()
            .ok_or(CalibrationError::MissingProbeUnit { depth: 1 })?;
        let class = function
            .nested_units()
            .next()
            .ok_or(CalibrationError::MissingProbeUnit { depth: 2 })?;

        let range = extractor.extract(function, class)?;
        let glue = &function.instructions()[range];
        if glue.len() < len {
            return Err(CalibrationError::ShortGlue {
                wanted: len,
                available: glue.len(),
            });
        }

        let signature = ClassSignature(glue[glue.len() - len..].to_vec());
        debug!(signature = %hex::encode(&signature.0), "calibrated class signature");
        Ok(signature)
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    extractor: RangeExtractor,
    signature: ClassSignature,
}

impl Classifier {
    pub fn new(extractor: RangeExtractor, signature: ClassSignature) -> Self {
        Self {
            extractor,
            signature,
        }
    }

    pub fn calibrate<C: Compiler>(
        compiler: &C,
        extractor: RangeExtractor,
        signature_len: usize,
    ) -> Result<Self, CalibrationError> {
        let signature = ClassSignature::calibrate(compiler, &extractor, signature_len)?;
        Ok(Self::new(extractor, signature))
    }

    pub fn extractor(&self) -> &RangeExtractor {
        &self.extractor
    }

    pub fn signature(&self) -> &ClassSignature {
        &self.signature
    }

    pub fn is_class<U: CompiledUnit>(&self, parent: &U, child: &U) -> Result<bool, DecodeError> {
        let range = self.extractor.extract(parent, child)?;
        Ok(self.glue_matches(parent.instructions(), range))
    }

    /// Whether `code[range]` ends with the class signature. An empty signature
    /// or a too-short range never matches.
    pub fn glue_matches(&self, code: &[u8], range: Range<usize>) -> bool {
        if self.signature.is_empty() {
            return false;
        }
        code.get(range)
            .is_some_and(|glue| glue.ends_with(self.signature.as_bytes()))
    }
}
