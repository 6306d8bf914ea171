//! Minimal Dockerfile parser
//!
//! Understands enough of the format to reason about layer ordering:
//! comments, `\` line continuations, instruction flags (`--from=`,
//! `--chown=`), shell and JSON-array argument forms, and multi-stage
//! `FROM image AS name`. Anything else is kept as raw text.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

fn parse_error(line: usize, message: impl Into<String>) -> ParseError {
    ParseError {
        line,
        message: message.into(),
    }
}

/// One instruction, continuation lines joined
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// 1-based line the instruction starts on
    pub line: usize,
    /// Upper-cased keyword (`COPY`, `RUN`, ...)
    pub keyword: String,
    /// `--name=value` flags in order; bare flags have no value
    pub flags: Vec<(String, Option<String>)>,
    /// Arguments after the flags, JSON form decoded
    pub args: Vec<String>,
    /// Everything after the keyword, as written
    pub raw: String,
}

impl Instruction {
    pub fn flag(&self, name: &str) -> Option<&str> {
        self.flags
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn is_copy(&self) -> bool {
        self.keyword == "COPY" || self.keyword == "ADD"
    }

    /// Sources of a COPY/ADD (all args but the destination)
    pub fn copy_sources(&self) -> &[String] {
        match self.args.split_last() {
            Some((_, sources)) if self.is_copy() => sources,
            _ => &[],
        }
    }
}

/// A build stage: `FROM base [AS name]` plus what follows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub line: usize,
    pub base: String,
    pub name: Option<String>,
    pub instructions: Vec<Instruction>,
}

impl Stage {
    /// Stage name, or its index when unnamed
    pub fn label(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| index.to_string())
    }
}

/// Parse a Dockerfile into stages
pub fn parse_dockerfile(text: &str) -> Result<Vec<Stage>, ParseError> {
    let mut stages: Vec<Stage> = Vec::new();

    for (line, body) in logical_lines(text) {
        let (keyword, rest) = match body.split_once(char::is_whitespace) {
            Some((k, r)) => (k.to_ascii_uppercase(), r.trim().to_string()),
            None => (body.to_ascii_uppercase(), String::new()),
        };

        let (flags, remainder) = split_flags(&rest);
        let args = split_args(remainder).map_err(|m| parse_error(line, m))?;

        let instruction = Instruction {
            line,
            keyword,
            flags,
            args,
            raw: rest,
        };

        match instruction.keyword.as_str() {
            "FROM" => stages.push(from_stage(instruction)?),
            // Global ARGs may precede the first FROM
            "ARG" if stages.is_empty() => {}
            _ => match stages.last_mut() {
                Some(stage) => {
                    if instruction.is_copy() && instruction.args.len() < 2 {
                        return Err(parse_error(
                            line,
                            format!("{} requires a source and a destination", instruction.keyword),
                        ));
                    }
                    stage.instructions.push(instruction);
                }
                None => {
                    return Err(parse_error(
                        line,
                        format!("{} before the first FROM", instruction.keyword),
                    ))
                }
            },
        }
    }

    Ok(stages)
}

fn from_stage(instruction: Instruction) -> Result<Stage, ParseError> {
    let line = instruction.line;
    match instruction.args.as_slice() {
        [base] => Ok(Stage {
            line,
            base: base.clone(),
            name: None,
            instructions: Vec::new(),
        }),
        [base, as_kw, name] if as_kw.eq_ignore_ascii_case("as") => Ok(Stage {
            line,
            base: base.clone(),
            name: Some(name.clone()),
            instructions: Vec::new(),
        }),
        _ => Err(parse_error(line, "expected FROM <image> [AS <name>]")),
    }
}

/// Join continuations and drop comments; yields (start line, text)
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut current: Option<(usize, String)> = None;

    for (index, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();

        // Comment lines are dropped even in the middle of a continuation
        if trimmed.starts_with('#') {
            continue;
        }
        if trimmed.is_empty() && current.is_none() {
            continue;
        }

        let (piece, continues) = match trimmed.strip_suffix('\\') {
            Some(head) => (head.trim_end(), true),
            None => (trimmed, false),
        };

        let entry = current.get_or_insert_with(|| (index + 1, String::new()));
        if !piece.is_empty() {
            if !entry.1.is_empty() {
                entry.1.push(' ');
            }
            entry.1.push_str(piece);
        }

        if !continues {
            if let Some(done) = current.take() {
                if !done.1.is_empty() {
                    out.push(done);
                }
            }
        }
    }

    if let Some(done) = current.take() {
        if !done.1.is_empty() {
            out.push(done);
        }
    }

    out
}

/// Peel leading `--flag[=value]` tokens off an argument string
fn split_flags(rest: &str) -> (Vec<(String, Option<String>)>, &str) {
    let mut flags = Vec::new();
    let mut remainder = rest.trim_start();

    while let Some(after) = remainder.strip_prefix("--") {
        let end = after.find(char::is_whitespace).unwrap_or(after.len());
        let token = &after[..end];
        match token.split_once('=') {
            Some((name, value)) => flags.push((name.to_string(), Some(value.to_string()))),
            None => flags.push((token.to_string(), None)),
        }
        remainder = after[end..].trim_start();
    }

    (flags, remainder)
}

/// JSON array form or whitespace-separated shell form
fn split_args(remainder: &str) -> Result<Vec<String>, String> {
    let trimmed = remainder.trim();
    if trimmed.starts_with('[') {
        if let Ok(args) = serde_json::from_str::<Vec<String>>(trimmed) {
            return Ok(args);
        }
        // Docker treats an invalid JSON array as shell form; so do we,
        // unless it is obviously an unterminated array.
        if !trimmed.ends_with(']') {
            return Err(format!("unterminated JSON array: {}", trimmed));
        }
    }
    Ok(trimmed.split_whitespace().map(String::from).collect())
}
