//! Locating and sanitizing the build descriptor of a template directory.
//!
//! A template directory holds exactly one descriptor: `Dockerfile`, or else a
//! single `*.Dockerfile`. A trailing `CMD`/`ENTRYPOINT` is lifted out of the
//! descriptor and handed to the vendor as the start command instead.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::sandbox::error::SandboxError;

const DEFAULT_NAME: &str = "Dockerfile";
const SUFFIX: &str = ".Dockerfile";

/// A descriptor with its start instruction removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub content: String,
    pub start_command: Option<String>,
}

/// Sanitized descriptor written next to the build context. The file is
/// removed when this value is dropped.
#[derive(Debug)]
pub struct PreparedDescriptor {
    pub file: NamedTempFile,
    pub content: String,
    pub start_command: Option<String>,
}

impl PreparedDescriptor {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

pub fn find_descriptor(dir: &Path) -> Result<PathBuf, SandboxError> {
    if !dir.is_dir() {
        return Err(SandboxError::Build(format!(
            "template directory does not exist: {}",
            dir.display()
        )));
    }
    let default = dir.join(DEFAULT_NAME);
    if default.is_file() {
        return Ok(default);
    }

    let mut matches: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(SUFFIX))
        .map(|entry| entry.path())
        .collect();
    matches.sort();

    match matches.len() {
        0 => Err(SandboxError::Build(format!(
            "no Dockerfile found in template directory: {}",
            dir.display()
        ))),
        1 => Ok(matches.remove(0)),
        _ => {
            let names: Vec<String> = matches
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect();
            Err(SandboxError::Build(format!(
                "multiple {SUFFIX} files in {}: {}; use exactly one",
                dir.display(),
                names.join(", ")
            )))
        }
    }
}

/// Split off a trailing `CMD` or `ENTRYPOINT`. Trailing comments and blank
/// lines after it are dropped along with it.
pub fn parse(content: &str) -> Descriptor {
    let lines: Vec<&str> = content.lines().collect();

    // Logical instructions as (first line, one past last line).
    let mut instructions = Vec::new();
    let mut start = None;
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if start.is_none() {
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            start = Some(i);
        }
        if !trimmed.ends_with('\\') {
            if let Some(s) = start.take() {
                instructions.push((s, i + 1));
            }
        }
    }
    if let Some(s) = start {
        instructions.push((s, lines.len()));
    }

    let Some(&(first, last)) = instructions.last() else {
        return Descriptor {
            content: content.to_string(),
            start_command: None,
        };
    };

    let text = lines[first..last]
        .iter()
        .map(|l| l.trim().trim_end_matches('\\').trim())
        .collect::<Vec<_>>()
        .join(" ");
    let (keyword, args) = text.split_once(char::is_whitespace).unwrap_or((text.as_str(), ""));
    if !keyword.eq_ignore_ascii_case("CMD") && !keyword.eq_ignore_ascii_case("ENTRYPOINT") {
        return Descriptor {
            content: content.to_string(),
            start_command: None,
        };
    }

    Descriptor {
        content: lines[..first].join("\n").trim_end().to_string() + "\n",
        start_command: Some(start_command(args.trim())),
    }
}

fn start_command(args: &str) -> String {
    if args.starts_with('[') {
        if let Ok(parts) = serde_json::from_str::<Vec<String>>(args) {
            return parts.join(" ");
        }
    }
    args.to_string()
}

/// Find, sanitize and write the descriptor into `dir`.
pub fn prepare(dir: &Path) -> Result<PreparedDescriptor, SandboxError> {
    let source = find_descriptor(dir)?;
    let raw = fs::read_to_string(&source)?;
    let Descriptor {
        content,
        start_command,
    } = parse(&raw);

    let mut file = tempfile::Builder::new()
        .prefix(".build-")
        .suffix(".dockerfile")
        .tempfile_in(dir)?;
    file.write_all(content.as_bytes())?;
    file.flush()?;

    tracing::debug!(
        source = %source.display(),
        sanitized = %file.path().display(),
        start_command = ?start_command,
        "descriptor prepared"
    );
    Ok(PreparedDescriptor {
        file,
        content,
        start_command,
    })
}
