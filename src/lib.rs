//! # unitmap
//!
//! Maps the functions and classes nested inside a compiled code unit to their
//! source lines and to the instruction ranges that build them, and serves
//! those maps to a profiler over a binary stdio protocol.
//!
//! ## Architecture
//!
//! - **unit**: The compiled-unit interface the core decodes against, and its owned form
//! - **linetable**: Delta-pair line table decoding into line spans and breakpoints
//! - **extract**: Byte range of a nested unit's materialization inside its parent
//! - **signature**: Class signature calibration and class-versus-function classification
//! - **tree**: Pre-order entity tree with ancestry paths and method labeling
//! - **args**: Argument signature display
//! - **compile**: Compiler backends; Python via tree-sitter lowered to stack bytecode
//! - **wire**: Native-endian response framing
//! - **lookup**: Handshake-negotiated search paths for relative requests
//! - **service**: The stdio query loop with switchable read and write strategies
//! - **dump**: Offline text and JSON entity maps for files and directories

pub mod args;
pub mod cli;
pub mod compile;
pub mod config;
pub mod dump;
pub mod error;
pub mod extract;
pub mod linetable;
pub mod lookup;
pub mod service;
pub mod signature;
pub mod tree;
pub mod unit;
pub mod wire;
