use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use super::dockerfile::{parse_dockerfile, Instruction, ParseError, Stage};

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("no FROM instruction found")]
    NoStages,

    #[error("stage {stage}: {manifest} is never copied on its own")]
    ManifestNotCopied { stage: String, manifest: String },

    #[error("stage {stage}: {manifest} copied at line {manifest_line} but no RUN step installs it")]
    InstallMissing {
        stage: String,
        manifest: String,
        manifest_line: usize,
    },

    #[error(
        "stage {stage}: source copied at line {source_line} before dependencies are installed; \
         every source change will reinstall them"
    )]
    SourceBeforeInstall { stage: String, source_line: usize },
}

/// Where the cache boundary sits in the final stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerReport {
    pub stage: String,
    pub manifest: String,
    pub manifest_line: usize,
    pub install_line: usize,
    /// First COPY of application source, if the image copies any
    pub source_line: Option<usize>,
}

/// Check a Dockerfile on disk
pub fn check_file(path: &Path, manifest: &str) -> Result<LayerReport, LayerError> {
    let text = std::fs::read_to_string(path).map_err(|source| LayerError::Io {
        path: path.display().to_string(),
        source,
    })?;
    check_cache_boundary(&text, manifest)
}

/// Verify that the final stage copies `manifest` alone, installs from it,
/// and only then copies the application source
pub fn check_cache_boundary(text: &str, manifest: &str) -> Result<LayerReport, LayerError> {
    let stages = parse_dockerfile(text)?;
    let (index, stage) = stages
        .iter()
        .enumerate()
        .last()
        .ok_or(LayerError::NoStages)?;

    check_stage(stage, &stage.label(index), manifest)
}

fn check_stage(stage: &Stage, label: &str, manifest: &str) -> Result<LayerReport, LayerError> {
    let manifest_name = file_name(manifest);
    let mut manifest_line = None;
    let mut install_line = None;
    let mut source_line = None;

    for instruction in &stage.instructions {
        if instruction.is_copy() {
            // Artifacts from other stages are not application source
            if instruction.flag("from").is_some() {
                continue;
            }

            if copies_only_manifest(instruction, manifest_name) {
                manifest_line.get_or_insert(instruction.line);
                continue;
            }

            if install_line.is_none() {
                return Err(LayerError::SourceBeforeInstall {
                    stage: label.to_string(),
                    source_line: instruction.line,
                });
            }
            source_line.get_or_insert(instruction.line);
        } else if instruction.keyword == "RUN"
            && manifest_line.is_some()
            && install_line.is_none()
            && installs_from(instruction, manifest_name)
        {
            install_line = Some(instruction.line);
        }
    }

    let manifest_line = manifest_line.ok_or_else(|| LayerError::ManifestNotCopied {
        stage: label.to_string(),
        manifest: manifest.to_string(),
    })?;
    let install_line = install_line.ok_or_else(|| LayerError::InstallMissing {
        stage: label.to_string(),
        manifest: manifest.to_string(),
        manifest_line,
    })?;

    Ok(LayerReport {
        stage: label.to_string(),
        manifest: manifest.to_string(),
        manifest_line,
        install_line,
        source_line,
    })
}

fn copies_only_manifest(instruction: &Instruction, manifest_name: &str) -> bool {
    let sources = instruction.copy_sources();
    !sources.is_empty()
        && sources
            .iter()
            .all(|s| is_manifest_source(s, manifest_name))
}

/// A literal manifest path, or a glob whose literal prefix already spells
/// the manifest stem (`requirements*.txt`, never `*` or `*.txt`)
fn is_manifest_source(source: &str, manifest_name: &str) -> bool {
    let name = file_name(source);
    let is_wild = |c: char| c == '*' || c == '?';

    let Some(first_wild) = name.find(is_wild) else {
        return name == manifest_name;
    };

    let stem = manifest_name.split('.').next().unwrap_or(manifest_name);
    !stem.is_empty() && name[..first_wild].starts_with(stem) && wildcard_match(name, manifest_name)
}

/// Subcommands that install dependencies (pip, uv, poetry, npm)
const INSTALL_VERBS: &[&str] = &["install", "ci", "sync"];

/// The RUN invokes an installer and names the manifest as a whole word
fn installs_from(instruction: &Instruction, manifest_name: &str) -> bool {
    let words: Vec<&str> = instruction
        .raw
        .split(|c: char| c.is_whitespace() || ";&|()\"'=,[]".contains(c))
        .filter(|w| !w.is_empty())
        .collect();

    words.iter().any(|w| INSTALL_VERBS.contains(w))
        && words.iter().any(|w| file_name(w) == manifest_name)
}

fn file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// `*` and `?` globbing as COPY sources allow
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}
