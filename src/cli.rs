use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "unitmap")]
#[command(
    about = "Map the functions and classes nested in compiled code units to lines and instruction ranges"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Bytes of the store instruction trimmed off every extracted range
    #[arg(long, value_name = "BYTES", global = true)]
    pub glue_len: Option<usize>,

    /// Trailing glue bytes that identify a class definition
    #[arg(long, value_name = "BYTES", global = true)]
    pub signature_len: Option<usize>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Answer file-path queries on stdin with binary frames on stdout
    Serve {
        /// Copy every written byte, and a report of every failure, to this file
        #[arg(value_name = "OUT_LOG")]
        out_log: Option<PathBuf>,

        /// Copy every line read to this file
        #[arg(value_name = "IN_LOG", requires = "out_log")]
        in_log: Option<PathBuf>,

        /// Skip the four-line startup handshake
        #[arg(long)]
        no_handshake: bool,
    },
    /// Print the entity map of source files, walking directories for *.py
    Dump {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
