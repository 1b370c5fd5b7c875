//! Line-oriented query service spoken over a pipe.
//!
//! After an optional four-line handshake, every input line is a file path and
//! every answer is one [`Response`] frame. Failures never leave the request
//! they happened in: they become a `-1` frame and the loop moves on. An empty
//! line or end of input stops the service without writing anything else.
//!
//! Reading and writing go through [`LineSource`] and [`FrameSink`], so the
//! diagnostic mode is just a pair of wrappers that copy the traffic to log
//! files.

use anyhow::{Context, Result};
use std::any::Any;
use std::backtrace::BacktraceStatus;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::compile::Compiler;
use crate::lookup::{Handshake, LookupEnv};
use crate::signature::Classifier;
use crate::tree::{CodeEntity, build_tree, label_methods};
use crate::wire::{Response, encode_status};

/// Appended to every requested source so the last definition in a file is
/// always followed by another statement.
pub const SENTINEL_TAIL: &str = "\n#dummy code\ndummydummy = None\n";

pub trait LineSource {
    /// Next line without surrounding whitespace; `None` at end of input.
    fn read_line(&mut self) -> Result<Option<String>>;
}

pub trait FrameSink {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<()>;
}

impl<T: LineSource + ?Sized> LineSource for Box<T> {
    fn read_line(&mut self) -> Result<Option<String>> {
        (**self).read_line()
    }
}

impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write_frame(bytes)
    }
}

pub struct StreamSource<R> {
    reader: R,
}

impl<R: BufRead> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> LineSource for StreamSource<R> {
    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .context("Failed to read request line")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

pub struct StreamSink<W> {
    writer: W,
}

impl<W: Write> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> FrameSink for StreamSink<W> {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .context("Failed to write frame")?;
        self.writer.flush().context("Failed to flush frame")?;
        Ok(())
    }
}

/// Append-only log file, truncated once when diagnostics are switched on.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    path: PathBuf,
}

impl DiagnosticLog {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }
        File::create(path)
            .with_context(|| format!("Failed to truncate log file: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open log file: {}", self.path.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("Failed to append to log file: {}", self.path.display()))?;
        Ok(())
    }
}

/// Copies every line read to a log.
pub struct TeeSource<S> {
    inner: S,
    log: DiagnosticLog,
}

impl<S: LineSource> TeeSource<S> {
    pub fn new(inner: S, log: DiagnosticLog) -> Self {
        Self { inner, log }
    }
}

impl<S: LineSource> LineSource for TeeSource<S> {
    fn read_line(&mut self) -> Result<Option<String>> {
        let line = self.inner.read_line()?;
        if let Some(line) = &line
            && let Err(err) = self.log.append(format!("{line}\n").as_bytes())
        {
            warn!("{err:#}");
        }
        Ok(line)
    }
}

/// Copies every frame written to a log.
pub struct TeeSink<S> {
    inner: S,
    log: DiagnosticLog,
}

impl<S: FrameSink> TeeSink<S> {
    pub fn new(inner: S, log: DiagnosticLog) -> Self {
        Self { inner, log }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: FrameSink> FrameSink for TeeSink<S> {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        if let Err(err) = self.log.append(bytes) {
            warn!("{err:#}");
        }
        self.inner.write_frame(bytes)
    }
}

pub struct QueryService<C, S, W> {
    compiler: C,
    classifier: Classifier,
    env: LookupEnv,
    source: S,
    sink: W,
    report: Option<DiagnosticLog>,
}

impl<C, S, W> QueryService<C, S, W>
where
    C: Compiler,
    S: LineSource,
    W: FrameSink,
{
    pub fn new(compiler: C, classifier: Classifier, source: S, sink: W) -> Self {
        Self {
            compiler,
            classifier,
            env: LookupEnv::new(),
            source,
            sink,
            report: None,
        }
    }

    /// Failed requests are additionally described in `log`.
    pub fn with_failure_report(mut self, log: DiagnosticLog) -> Self {
        self.report = Some(log);
        self
    }

    pub fn env(&self) -> &LookupEnv {
        &self.env
    }

    pub fn into_sink(self) -> W {
        self.sink
    }

    pub fn run(&mut self, handshake: bool) -> Result<()> {
        if handshake {
            self.handshake()?;
        }

        let mut served = 0usize;
        while let Some(line) = self.source.read_line()? {
            if line.is_empty() {
                break;
            }
            let (bytes, failure) = match self.try_answer(&line).and_then(|r| r.encode()) {
                Ok(bytes) => (bytes, None),
                Err(err) => (Response::Failed.encode()?, Some(err)),
            };
            self.sink.write_frame(&bytes)?;
            if let Some(err) = failure {
                self.report_failure(&line, &err);
            }
            served += 1;
        }
        info!(served, "query service stopped");
        Ok(())
    }

    fn handshake(&mut self) -> Result<()> {
        let mut lines: [String; 4] = Default::default();
        for slot in lines.iter_mut() {
            *slot = self.source.read_line()?.unwrap_or_default();
        }
        let handshake = Handshake::from_lines(lines);
        let outcome = self.env.apply(&handshake);
        debug!(
            ready = outcome.is_ok(),
            search_paths = self.env.search_paths().len(),
            "handshake done"
        );
        self.sink.write_frame(&encode_status(outcome.is_ok()))?;
        if let Err(err) = outcome {
            warn!("handshake degraded: {err:#}");
            self.report_failure("<handshake>", &err);
        }
        Ok(())
    }

    /// Response for one request line. Never fails and never unwinds.
    pub fn answer(&self, request: &str) -> Response {
        match self.try_answer(request) {
            Ok(response) => response,
            Err(err) => {
                self.report_failure(request, &err);
                Response::Failed
            }
        }
    }

    fn try_answer(&self, request: &str) -> Result<Response> {
        let Some(path) = self.env.resolve(request) else {
            debug!(request, "no such file");
            return Ok(Response::Missing);
        };

        let analyzed = panic::catch_unwind(AssertUnwindSafe(|| {
            analyze_file(&self.compiler, &self.classifier, &path)
        }));
        match analyzed {
            Ok(Ok(entities)) => {
                debug!(path = %path.display(), entities = entities.len(), "analyzed");
                Ok(Response::from_entities(&entities))
            }
            Ok(Err(err)) => {
                warn!(path = %path.display(), "analysis failed: {err:#}");
                Err(err)
            }
            Err(payload) => {
                let err = anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref()));
                warn!(path = %path.display(), "{err}");
                Err(err)
            }
        }
    }

    fn report_failure(&self, request: &str, err: &anyhow::Error) {
        let Some(log) = &self.report else {
            return;
        };
        let mut report = format!("\nrequest: {request}\nerror: {err}\n");
        for cause in err.chain().skip(1) {
            report.push_str(&format!("caused by: {cause}\n"));
        }
        if err.backtrace().status() == BacktraceStatus::Captured {
            report.push_str(&format!("backtrace:\n{}\n", err.backtrace()));
        }
        report.push_str(&"-".repeat(20));
        report.push('\n');
        if let Err(log_err) = log.append(report.as_bytes()) {
            warn!("{log_err:#}");
        }
    }
}

/// Reads, compiles and maps one source file, methods labeled.
pub fn analyze_file<C: Compiler>(
    compiler: &C,
    classifier: &Classifier,
    path: &Path,
) -> Result<Vec<CodeEntity>> {
    let raw = std::fs::read(path)
        .with_context(|| format!("Failed to read source file: {}", path.display()))?;
    let mut source = decode_source(raw);
    source.push_str(SENTINEL_TAIL);

    let filename = path.to_string_lossy();
    let unit = compiler
        .compile(&source, &filename)
        .with_context(|| format!("Failed to compile {filename}"))?;
    let mut entities = build_tree(&unit, classifier)
        .with_context(|| format!("Failed to build entity tree for {filename}"))?;
    label_methods(&mut entities);
    Ok(entities)
}

/// Source text of a file. Bytes that are not UTF-8 are taken as Latin-1 when
/// a coding cookie on the first two lines says so, and replaced otherwise;
/// line breaks survive either way.
fn decode_source(raw: Vec<u8>) -> String {
    match String::from_utf8(raw) {
        Ok(text) => text,
        Err(err) => {
            let raw = err.into_bytes();
            let cookie = coding_cookie(&raw);
            debug!(encoding = ?cookie, "source is not UTF-8");
            if cookie.as_deref().is_some_and(is_latin1) {
                raw.iter().copied().map(char::from).collect()
            } else {
                String::from_utf8_lossy(&raw).into_owned()
            }
        }
    }
}

/// Encoding named by a `coding[:=]` comment on one of the first two lines,
/// lowercased.
fn coding_cookie(raw: &[u8]) -> Option<String> {
    for line in raw.split(|&b| b == b'\n').take(2) {
        let line = String::from_utf8_lossy(line);
        let Some(comment) = line.trim_start().strip_prefix('#') else {
            continue;
        };
        let Some(at) = comment.find("coding") else {
            continue;
        };
        let rest = &comment[at + "coding".len()..];
        let Some(rest) = rest.strip_prefix([':', '=']) else {
            continue;
        };
        let name: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            .collect();
        if !name.is_empty() {
            return Some(name.to_ascii_lowercase().replace('_', "-"));
        }
    }
    None
}

fn is_latin1(encoding: &str) -> bool {
    matches!(
        encoding,
        "latin-1" | "latin1" | "l1" | "iso-8859-1" | "iso8859-1" | "iso-latin-1" | "cp819"
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
