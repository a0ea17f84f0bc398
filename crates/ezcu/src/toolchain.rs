//! Device compiler invocation
//!
//! A [`Compiler`] turns a `.cu` source into a loadable binary written beside
//! it. [`Nvcc`] shells out to the NVIDIA compiler; tests and embedders can
//! supply their own implementation.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::config::CompilerConfig;
use crate::error::{EzcuError, Result};

/// Accepted kernel source extension.
pub const SOURCE_EXTENSION: &str = "cu";

/// Binary extensions, in load preference order.
pub const BINARY_EXTENSIONS: [&str; 3] = ["fatbin", "cubin", "ptx"];

/// One compilation job.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    pub source: &'a Path,
    pub output_dir: &'a Path,
    /// `--generate-code` flags for the opened devices
    pub arch_options: &'a str,
    /// Caller options for this source
    pub options: &'a str,
}

pub trait Compiler: Send + Sync {
    /// Compile `request.source` and return the binary to load.
    fn compile(&self, request: &CompileRequest<'_>) -> Result<PathBuf>;
}

/// Reject anything but a `.cu` file.
pub fn check_source(path: &Path) -> Result<()> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(SOURCE_EXTENSION) => Ok(()),
        _ => Err(EzcuError::UnsupportedSource(path.to_path_buf())),
    }
}

/// First existing `<stem>.{fatbin,cubin,ptx}` in `dir`.
pub fn find_binary(source: &Path, dir: &Path) -> Result<PathBuf> {
    let stem = source
        .file_stem()
        .ok_or_else(|| EzcuError::UnsupportedSource(source.to_path_buf()))?;
    BINARY_EXTENSIONS
        .iter()
        .map(|ext| dir.join(stem).with_extension(ext))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| EzcuError::BinaryNotFound(source.to_path_buf()))
}

/// Directory the binary for `source` is written to.
pub fn output_dir(source: &Path) -> PathBuf {
    match source.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[derive(Debug, Clone, Default)]
pub struct Nvcc {
    config: CompilerConfig,
}

impl Nvcc {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    /// Full argument list for `request`, without the executable.
    pub fn arguments(&self, request: &CompileRequest<'_>) -> Vec<String> {
        let mut args = self.config.base_options.clone();
        args.push("-odir".to_string());
        args.push(request.output_dir.display().to_string());
        args.extend(request.arch_options.split_whitespace().map(String::from));
        args.extend(request.options.split_whitespace().map(String::from));
        args.extend(CompilerConfig::env_build_options());
        args.push(request.source.display().to_string());
        args
    }
}

impl Compiler for Nvcc {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<PathBuf> {
        let args = self.arguments(request);
        let command_line = format!("{} {}", self.config.executable.display(), args.join(" "));
        debug!(command = %command_line, "compile kernel source");

        let output = Command::new(&self.config.executable)
            .args(&args)
            .output()
            .map_err(|source| EzcuError::Io {
                path: self.config.executable.clone(),
                source,
            })?;
        debug!(stdout = %String::from_utf8_lossy(&output.stdout), "compiler output");
        if !output.status.success() {
            return Err(EzcuError::CompilerFailed {
                command: command_line,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        find_binary(request.source, request.output_dir)
    }
}
