//! Exec pipeline: materialize secrets, compose argv, replace the process.
//!
//! Runs strictly after decryption. Env vars are merged into the inherited
//! environment (replace an existing `KEY=` entry, else append), secret
//! files are written and closed, and only then is the process image
//! replaced, preserving PID and open descriptors. Everything up to the
//! final `execve` is a pure function over the manifest entry so the
//! composition rules can be tested without leaving the test process.

use std::collections::HashMap;
use std::convert::Infallible;
use std::ffi::{CString, NulError, OsStr, OsString};
use std::fs::File;
use std::io::{self, Write as _};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use pal_core::codec;
use pal_core::manifest::ManifestEntry;
use thiserror::Error;

/// Exec-stage failures; all fatal to the client.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The entrypoint string is not parsable shell words.
    #[error("could not parse entrypoint: {0}")]
    Entrypoint(#[from] shell_words::ParseError),

    /// Nothing to execute: no entrypoint, no command, empty argv.
    #[error("no command to execute")]
    Empty,

    /// argv[0] did not resolve against `PATH`.
    #[error("executable {0:?} not found in PATH")]
    NotFound(String),

    /// A `base64:`-prefixed secret value did not decode.
    #[error("secret value is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// A secret file could not be created or written.
    #[error("could not write secret file {path:?}: {source}")]
    File {
        /// Destination path from the manifest.
        path: PathBuf,
        /// Underlying I/O failure.
        source: io::Error,
    },

    /// An argument or environment entry contains a NUL byte.
    #[error("argument contains an interior NUL byte")]
    Nul(#[from] NulError),

    /// The final process-image replacement failed.
    #[error("could not replace process image: {0}")]
    Exec(#[from] nix::Error),
}

/// Composes the final argv from the manifest's command and entrypoint.
///
/// A `command` wraps everything in `/bin/sh -c`; an `entrypoint` is
/// shell-word-tokenized and prepended.
///
/// # Errors
///
/// Fails on unparsable entrypoints or an empty result.
pub fn compose_argv(entry: &ManifestEntry, argv: Vec<String>) -> Result<Vec<String>, ExecError> {
    let mut argv = argv;

    if !entry.command.is_empty() {
        // The workload argv is joined with bare spaces and re-parsed by the
        // shell, so arguments containing whitespace or metacharacters get
        // re-split. Kept for compatibility with deployed manifests that
        // pass flags through this way.
        let mut pieces = Vec::with_capacity(argv.len() + 1);
        pieces.push(entry.command.clone());
        pieces.extend(argv);
        argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            pieces.join(" "),
        ];
    }

    if !entry.entrypoint.is_empty() {
        let mut tokens = shell_words::split(&entry.entrypoint)?;
        tokens.extend(argv);
        argv = tokens;
    }

    if argv.is_empty() {
        return Err(ExecError::Empty);
    }
    Ok(argv)
}

/// Merges manifest env vars into an inherited `KEY=VALUE` environment.
///
/// The first existing entry with a matching `KEY=` prefix is replaced;
/// otherwise the entry is appended. Values are transport-decoded first.
///
/// # Errors
///
/// Fails when a `base64:`-prefixed value does not decode.
pub fn merge_environ(
    mut environ: Vec<OsString>,
    envs: &HashMap<String, String>,
) -> Result<Vec<OsString>, ExecError> {
    for (name, value) in envs {
        let data = codec::decode_value(value)?;
        let prefix = format!("{name}=");
        let mut entry = OsString::from(&prefix);
        entry.push(OsString::from_vec(data));

        match environ
            .iter_mut()
            .find(|existing| existing.as_bytes().starts_with(prefix.as_bytes()))
        {
            Some(existing) => *existing = entry,
            None => environ.push(entry),
        }
    }
    Ok(environ)
}

/// Writes every manifest file entry, transport-decoded, closing each file
/// before returning.
///
/// # Errors
///
/// Fails on undecodable values or any filesystem error.
pub fn materialize_files(files: &HashMap<String, String>) -> Result<(), ExecError> {
    for (path, value) in files {
        let data = codec::decode_value(value)?;
        write_file(Path::new(path), &data).map_err(|err| ExecError::File {
            path: PathBuf::from(path),
            source: err,
        })?;
    }
    Ok(())
}

fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    Ok(())
}

/// Resolves a program name against the process `PATH`.
///
/// # Errors
///
/// Fails when no executable candidate exists.
pub fn resolve_path(program: &str) -> Result<PathBuf, ExecError> {
    let path_list = std::env::var_os("PATH").unwrap_or_default();
    resolve_in(&path_list, program)
}

fn resolve_in(path_list: &OsStr, program: &str) -> Result<PathBuf, ExecError> {
    if program.contains('/') {
        let candidate = PathBuf::from(program);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
        return Err(ExecError::NotFound(program.to_string()));
    }

    for dir in std::env::split_paths(path_list) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(ExecError::NotFound(program.to_string()))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Runs the whole pipeline and replaces the process image. Only returns on
/// failure.
///
/// # Errors
///
/// Any failure before or during the replacement is returned; the caller's
/// process is still intact in that case.
pub fn exec(
    entry: &ManifestEntry,
    argv: Vec<String>,
    environ: Vec<OsString>,
) -> Result<Infallible, ExecError> {
    let argv = compose_argv(entry, argv)?;
    let argv0 = resolve_path(&argv[0])?;
    let environ = merge_environ(environ, &entry.env)?;
    materialize_files(&entry.file)?;

    let program = CString::new(argv0.into_os_string().into_vec())?;
    let args = argv
        .into_iter()
        .map(|arg| CString::new(arg.into_bytes()))
        .collect::<Result<Vec<_>, _>>()?;
    let environ = environ
        .into_iter()
        .map(|entry| CString::new(entry.into_vec()))
        .collect::<Result<Vec<_>, _>>()?;

    // Preserves PID and open descriptors; descriptors beyond the standard
    // streams may leak into the workload.
    match nix::unistd::execve(&program, &args, &environ) {
        Ok(never) => match never {},
        Err(errno) => Err(ExecError::Exec(errno)),
    }
}
