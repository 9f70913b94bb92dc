//! Clusterfile parser.
//!
//! Tokenises the build file into an ordered instruction list. Five
//! commands exist: `FROM`, `COPY`, `RUN`, `CMD`, `ARG`. Comments and
//! blank lines are discarded, a trailing backslash joins a line with the
//! next, and the first instruction must be `FROM`.

use std::path::Path;

use kubeimage_core::{EngineError, Result};

const UTF8_BOM: &str = "\u{feff}";

/// Build instruction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    From,
    Copy,
    Run,
    Cmd,
    Arg,
}

impl InstructionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionKind::From => "FROM",
            InstructionKind::Copy => "COPY",
            InstructionKind::Run => "RUN",
            InstructionKind::Cmd => "CMD",
            InstructionKind::Arg => "ARG",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "FROM" => Some(InstructionKind::From),
            "COPY" => Some(InstructionKind::Copy),
            "RUN" => Some(InstructionKind::Run),
            "CMD" => Some(InstructionKind::Cmd),
            "ARG" => Some(InstructionKind::Arg),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instruction: `(kind, value)` in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub kind: InstructionKind,
    pub value: String,
}

/// A parsed build file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clusterfile {
    pub instructions: Vec<Instruction>,
}

impl Clusterfile {
    /// Parse build-file text into instructions.
    pub fn parse(content: &str) -> Result<Self> {
        let content = content.strip_prefix(UTF8_BOM).unwrap_or(content);

        let mut instructions = Vec::new();
        let mut lines = content.lines().enumerate();

        while let Some((idx, raw)) = lines.next() {
            let line_num = idx + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            // join continuation lines, collapsing the whitespace around
            // the break into a single space
            let (mut logical, mut ended) = trim_continuation(trimmed);
            while !ended {
                match lines.next() {
                    Some((_, next)) => {
                        let next = next.trim();
                        if next.starts_with('#') || next.is_empty() {
                            continue;
                        }
                        let (fragment, is_end) = trim_continuation(next);
                        if !fragment.is_empty() {
                            logical.push(' ');
                            logical.push_str(&fragment);
                        }
                        ended = is_end;
                    }
                    None => break,
                }
            }
            if logical.is_empty() {
                continue;
            }

            instructions.push(decode_line(&logical, line_num)?);
        }

        if instructions.is_empty() {
            return Err(EngineError::Parse {
                line: 0,
                message: "build file contains no instructions".to_string(),
            });
        }
        if instructions[0].kind != InstructionKind::From {
            return Err(EngineError::Parse {
                line: 1,
                message: "first instruction must be FROM".to_string(),
            });
        }

        Ok(Clusterfile { instructions })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Parse {
            line: 0,
            message: format!("cannot read build file {}: {}", path.display(), e),
        })?;
        Self::parse(&content)
    }
}

/// Strip a trailing (unescaped) backslash; returns the fragment and
/// whether the logical line ended here.
fn trim_continuation(line: &str) -> (String, bool) {
    let trimmed = line.trim_end_matches([' ', '\t']);
    if trimmed.ends_with('\\') && !trimmed.ends_with("\\\\") {
        (trimmed[..trimmed.len() - 1].trim_end().to_string(), false)
    } else {
        (trimmed.to_string(), true)
    }
}

fn decode_line(line: &str, line_num: usize) -> Result<Instruction> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let value = parts.next().map(str::trim).unwrap_or_default();

    let kind = InstructionKind::parse(&command.to_uppercase()).ok_or_else(|| {
        EngineError::Parse {
            line: line_num,
            message: format!("unknown command '{}'", command),
        }
    })?;
    if value.is_empty() {
        return Err(EngineError::Parse {
            line: line_num,
            message: format!("{} requires a value", kind),
        });
    }

    // validate shaped values at parse time so errors carry line numbers
    let value = match kind {
        InstructionKind::Arg => {
            parse_arg_pairs(value).map_err(|e| at_line(e, line_num))?;
            value.to_string()
        }
        InstructionKind::Copy => {
            let (src, dest) = parse_copy_value(value).map_err(|e| at_line(e, line_num))?;
            format!("{} {}", src, dest)
        }
        _ => value.to_string(),
    };

    Ok(Instruction { kind, value })
}

fn at_line(err: EngineError, line: usize) -> EngineError {
    match err {
        EngineError::Parse { message, .. } => EngineError::Parse { line, message },
        other => other,
    }
}

/// Parse an `ARG` value: comma-separated `key=value` pairs with
/// alphanumeric keys. Values keep interior spaces, trimmed at the ends.
pub fn parse_arg_pairs(value: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for element in value.split(',') {
        let (k, v) = element.split_once('=').ok_or_else(|| EngineError::Parse {
            line: 0,
            message: format!("invalid ARG '{}': expected key=value", element.trim()),
        })?;
        let key = k.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(EngineError::Parse {
                line: 0,
                message: format!("ARG key '{}' must be alphanumeric", key),
            });
        }
        pairs.push((key.to_string(), v.trim().to_string()));
    }
    Ok(pairs)
}

/// Parse a `CMD` value: comma-separated command strings, empties dropped.
pub fn parse_cmd_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a `COPY` value into `(src, dest)`; dest loses a leading `./`.
pub fn parse_copy_value(value: &str) -> Result<(String, String)> {
    let mut fields = value.split_whitespace();
    let src = fields.next().unwrap_or_default().to_string();
    let dest = fields.next().unwrap_or_default();
    if src.is_empty() || dest.is_empty() || fields.next().is_some() {
        return Err(EngineError::Parse {
            line: 0,
            message: format!("invalid COPY '{}': expected '<src> <dest>'", value),
        });
    }
    let dest = dest.strip_prefix("./").unwrap_or(dest).to_string();
    Ok((src, dest))
}
