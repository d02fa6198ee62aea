//! Line-level `go.mod` model with byte spans, edited through [`EditBuffer`].
//!
//! Only the directives the relocation needs are modelled (`module`, `go`,
//! `require`, `replace`). Other known directives are accepted and kept
//! verbatim.

use std::fmt;
use std::ops::Range;

use super::errors::GoModError;
use crate::edit::EditBuffer;

/// Directives accepted but not modelled.
const PASSTHROUGH_VERBS: &[&str] = &[
    "toolchain", "exclude", "retract", "godebug", "tool", "ignore",
];

/// A module path with an optional version, as written on either side of a
/// replace directive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleVersion {
    pub path: String,
    pub version: Option<String>,
}

impl ModuleVersion {
    pub fn new(path: impl Into<String>, version: Option<String>) -> Self {
        Self {
            path: path.into(),
            version,
        }
    }

    pub fn unversioned(path: impl Into<String>) -> Self {
        Self::new(path, None)
    }

    /// Parse the `path[@version]` command-line form.
    pub fn parse_arg(arg: &str) -> Self {
        match arg.rsplit_once('@') {
            Some((path, version)) if !version.is_empty() && !path.is_empty() => {
                Self::new(path, Some(version.to_string()))
            }
            _ => Self::unversioned(arg),
        }
    }

    /// Whether the path is a filesystem path rather than a module path.
    pub fn is_local_path(&self) -> bool {
        is_local_path(&self.path)
    }

    pub fn is_relative_path(&self) -> bool {
        self.path.starts_with("./") || self.path.starts_with("../")
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&quote_if_needed(&self.path))?;
        if let Some(version) = &self.version {
            write!(f, " {version}")?;
        }
        Ok(())
    }
}

pub fn is_local_path(path: &str) -> bool {
    path.starts_with("./")
        || path.starts_with("../")
        || path.starts_with('/')
        || path == "."
        || path == ".."
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Require {
    pub module: ModuleVersion,
    pub indirect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replace {
    pub old: ModuleVersion,
    pub new: ModuleVersion,
    /// Bytes of `old [v] => new [v]`, excluding the `replace` keyword.
    pub span: Range<usize>,
    /// The whole line including its newline.
    pub line: Range<usize>,
}

#[derive(Debug, Clone)]
pub struct GoMod {
    text: String,
    pub module: Option<String>,
    pub go_version: Option<String>,
    pub requires: Vec<Require>,
    pub replaces: Vec<Replace>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Module,
    Go,
    Require,
    Replace,
    Passthrough,
}

struct Token {
    text: String,
    range: Range<usize>,
}

impl GoMod {
    pub fn parse(text: &str) -> Result<Self, GoModError> {
        let mut gomod = GoMod {
            text: text.to_string(),
            module: None,
            go_version: None,
            requires: Vec::new(),
            replaces: Vec::new(),
        };

        let mut block: Option<Verb> = None;
        let mut line_start = 0;
        for (idx, raw) in text.split_inclusive('\n').enumerate() {
            let lineno = idx + 1;
            let line_range = line_start..line_start + raw.len();
            let (code, comment) = split_comment(raw);
            let tokens = tokenize(code, line_start, lineno)?;
            line_start += raw.len();

            if tokens.is_empty() {
                continue;
            }

            if let Some(verb) = block {
                if tokens.len() == 1 && tokens[0].text == ")" {
                    block = None;
                    continue;
                }
                gomod.directive(verb, &tokens, comment, line_range, lineno)?;
                continue;
            }

            let verb = match tokens[0].text.as_str() {
                "module" => Verb::Module,
                "go" => Verb::Go,
                "require" => Verb::Require,
                "replace" => Verb::Replace,
                v if PASSTHROUGH_VERBS.contains(&v) => Verb::Passthrough,
                other => {
                    return Err(GoModError::Parse {
                        line: lineno,
                        message: format!("unknown directive: {other}"),
                    })
                }
            };

            if tokens.len() == 2 && tokens[1].text == "(" {
                block = Some(verb);
                continue;
            }
            gomod.directive(verb, &tokens[1..], comment, line_range, lineno)?;
        }

        if block.is_some() {
            return Err(GoModError::Parse {
                line: text.lines().count(),
                message: "unterminated block".to_string(),
            });
        }
        Ok(gomod)
    }

    fn directive(
        &mut self,
        verb: Verb,
        args: &[Token],
        comment: &str,
        line: Range<usize>,
        lineno: usize,
    ) -> Result<(), GoModError> {
        let arity_error = |expected: &str| GoModError::Parse {
            line: lineno,
            message: format!("usage: {expected}"),
        };

        match verb {
            Verb::Module => {
                let [path] = args else {
                    return Err(arity_error("module module/path"));
                };
                self.module = Some(path.text.clone());
            }
            Verb::Go => {
                let [version] = args else {
                    return Err(arity_error("go 1.23"));
                };
                self.go_version = Some(version.text.clone());
            }
            Verb::Require => {
                let [path, version] = args else {
                    return Err(arity_error("require module/path v1.2.3"));
                };
                check_version(&version.text, lineno)?;
                self.requires.push(Require {
                    module: ModuleVersion::new(path.text.clone(), Some(version.text.clone())),
                    indirect: comment.trim_start_matches('/').trim() == "indirect",
                });
            }
            Verb::Replace => {
                let usage = "replace module/path [v1.2.3] => other/module v1.4 | ./local/dir";
                let arrow = args
                    .iter()
                    .position(|t| t.text == "=>")
                    .ok_or_else(|| arity_error(usage))?;
                let (left, right) = (&args[..arrow], &args[arrow + 1..]);
                let old = side(left).ok_or_else(|| arity_error(usage))?;
                let new = side(right).ok_or_else(|| arity_error(usage))?;
                if let Some(v) = &old.version {
                    check_version(v, lineno)?;
                }
                match &new.version {
                    Some(_) if new.is_local_path() => {
                        return Err(GoModError::Parse {
                            line: lineno,
                            message: "replacement directory cannot have a version".to_string(),
                        })
                    }
                    Some(v) => check_version(v, lineno)?,
                    None if !new.is_local_path() => {
                        return Err(GoModError::Parse {
                            line: lineno,
                            message: "replacement module must have a version".to_string(),
                        })
                    }
                    None => {}
                }
                let span = args[0].range.start..args[args.len() - 1].range.end;
                self.replaces.push(Replace {
                    old,
                    new,
                    span,
                    line,
                });
            }
            Verb::Passthrough => {}
        }
        Ok(())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Set a replace directive with `go mod edit -replace` semantics.
    ///
    /// Without an old version every directive for `old.path` is affected;
    /// with one only the exact match is. The first matching directive is
    /// rewritten in place, later ones are removed, and a new directive is
    /// appended when nothing matched. Returns whether the text changed.
    pub fn set_replace(
        &mut self,
        old: &ModuleVersion,
        new: &ModuleVersion,
    ) -> Result<bool, GoModError> {
        let rendered = format!("{old} => {new}");
        let mut buf = EditBuffer::new(self.text.as_str());
        let mut need = true;

        for rep in &self.replaces {
            let matches =
                rep.old.path == old.path && (old.version.is_none() || rep.old.version == old.version);
            if !matches {
                continue;
            }
            if need {
                if self.text[rep.span.clone()] != rendered {
                    buf.replace(rep.span.start, rep.span.end, rendered.clone())?;
                }
                need = false;
            } else {
                buf.delete(rep.line.start, rep.line.end)?;
            }
        }

        if need {
            let mut addition = String::new();
            if !self.text.is_empty() && !self.text.ends_with('\n') {
                addition.push('\n');
            }
            addition.push_str(&format!("replace {rendered}\n"));
            buf.insert(self.text.len(), addition)?;
        }

        if buf.is_empty() {
            return Ok(false);
        }
        let updated = buf.apply()?;
        *self = GoMod::parse(&updated)?;
        Ok(true)
    }
}

fn side(tokens: &[Token]) -> Option<ModuleVersion> {
    match tokens {
        [path] => Some(ModuleVersion::unversioned(path.text.clone())),
        [path, version] => Some(ModuleVersion::new(
            path.text.clone(),
            Some(version.text.clone()),
        )),
        _ => None,
    }
}

fn check_version(version: &str, line: usize) -> Result<(), GoModError> {
    let bare = version.strip_prefix('v').unwrap_or(version);
    semver::Version::parse(bare)
        .map(|_| ())
        .map_err(|source| GoModError::InvalidVersion {
            line,
            version: version.to_string(),
            source,
        })
}

/// Split a line at a `//` comment that is not inside a quoted string.
fn split_comment(line: &str) -> (&str, &str) {
    let bytes = line.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' && q == b'"' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'`' {
                    quote = Some(b);
                } else if b == b'/' && bytes.get(i + 1) == Some(&b'/') {
                    return (&line[..i], &line[i..]);
                }
            }
        }
        i += 1;
    }
    (line, "")
}

/// Split into whitespace-separated tokens, unquoting quoted ones. Ranges are
/// absolute byte offsets into the file.
fn tokenize(code: &str, offset: usize, lineno: usize) -> Result<Vec<Token>, GoModError> {
    let bytes = code.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        let text = match bytes[i] {
            q @ (b'"' | b'`') => {
                let mut out = String::new();
                i += 1;
                loop {
                    let Some(&b) = bytes.get(i) else {
                        return Err(GoModError::Parse {
                            line: lineno,
                            message: "unterminated quoted string".to_string(),
                        });
                    };
                    if b == q {
                        i += 1;
                        break;
                    }
                    if q == b'"' && b == b'\\' {
                        if let Some(&next) = bytes.get(i + 1) {
                            out.push(next as char);
                            i += 2;
                            continue;
                        }
                    }
                    let ch_len = code[i..].chars().next().map_or(1, char::len_utf8);
                    out.push_str(&code[i..i + ch_len]);
                    i += ch_len;
                }
                out
            }
            _ => {
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                code[start..i].to_string()
            }
        };
        tokens.push(Token {
            text,
            range: offset + start..offset + i,
        });
    }
    Ok(tokens)
}

fn quote_if_needed(path: &str) -> String {
    if path.is_empty() || path.chars().any(|c| c.is_whitespace() || c == '"' || c == '`') {
        let escaped = path.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    } else {
        path.to_string()
    }
}
