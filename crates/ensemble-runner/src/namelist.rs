//! Fortran namelist reading and in-place patching.
//!
//! Patches are applied as byte-range edits on the original text, so comments,
//! alignment and every group or entry that is not named in the update survive
//! unchanged. A value that formats to the text already present leaves the file
//! byte-identical, which is what makes the post-patch dirty check meaningful.

use crate::config::{format_real, Scalar};
use crate::error::PatchError;
use crate::patch::{suffixed, write_atomic, ScratchFiles};
use std::fmt;
use std::fs;
use std::path::Path;

/// A value as read from, or written to, a namelist.
#[derive(Debug, Clone, PartialEq)]
pub enum NmlValue {
    Int(i64),
    Real(f64),
    Logical(bool),
    Str(String),
    List(Vec<NmlValue>),
    Null,
    /// Anything not interpreted (complex literals and similar).
    Raw(String),
}

impl NmlValue {
    /// Exact comparison against a requested parameter value.
    ///
    /// Integers and reals compare numerically, so `30` matches `30.0`.
    /// There is no tolerance: round-off differences are caught after patching.
    pub fn matches(&self, scalar: &Scalar) -> bool {
        match (self, scalar) {
            (NmlValue::Int(a), Scalar::Int(b)) => a == b,
            (NmlValue::Int(_) | NmlValue::Real(_), Scalar::Int(_) | Scalar::Float(_)) => {
                self.as_f64() == scalar.as_f64()
            }
            (NmlValue::Logical(a), Scalar::Bool(b)) => a == b,
            (NmlValue::Str(a), Scalar::Str(b)) => a == b,
            _ => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NmlValue::Int(i) => Some(*i as f64),
            NmlValue::Real(x) => Some(*x),
            _ => None,
        }
    }

    fn parse_word(word: &str) -> Vec<NmlValue> {
        if let Some((count, rest)) = word.split_once('*') {
            if let Ok(n) = count.parse::<usize>() {
                let value = if rest.is_empty() {
                    NmlValue::Null
                } else {
                    NmlValue::parse_scalar(rest)
                };
                return vec![value; n];
            }
        }
        vec![NmlValue::parse_scalar(word)]
    }

    fn parse_scalar(word: &str) -> NmlValue {
        if let Ok(i) = word.parse::<i64>() {
            return NmlValue::Int(i);
        }
        if let Ok(x) = word.replace(['d', 'D'], "e").parse::<f64>() {
            if word.chars().any(|c| c.is_ascii_digit()) {
                return NmlValue::Real(x);
            }
        }
        if let Some(b) = parse_logical(word) {
            return NmlValue::Logical(b);
        }
        if word.starts_with('\'') || word.starts_with('"') {
            return NmlValue::Str(unquote(word));
        }
        NmlValue::Raw(word.to_string())
    }
}

impl From<&Scalar> for NmlValue {
    fn from(value: &Scalar) -> Self {
        match value {
            Scalar::Int(i) => NmlValue::Int(*i),
            Scalar::Float(x) => NmlValue::Real(*x),
            Scalar::Bool(b) => NmlValue::Logical(*b),
            Scalar::Str(s) => NmlValue::Str(s.clone()),
        }
    }
}

impl fmt::Display for NmlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NmlValue::Int(i) => write!(f, "{}", i),
            NmlValue::Real(x) => f.write_str(&format_real(*x)),
            NmlValue::Logical(true) => f.write_str(".true."),
            NmlValue::Logical(false) => f.write_str(".false."),
            NmlValue::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
            NmlValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                f.write_str(&parts.join(", "))
            }
            NmlValue::Null => Ok(()),
            NmlValue::Raw(s) => f.write_str(s),
        }
    }
}

fn parse_logical(word: &str) -> Option<bool> {
    let lower = word.to_ascii_lowercase();
    let body = lower.strip_prefix('.').unwrap_or(&lower);
    match body.chars().next() {
        Some('t') if body == "t" || body.starts_with("t.") || body.starts_with("true") => {
            Some(true)
        }
        Some('f') if body == "f" || body.starts_with("f.") || body.starts_with("false") => {
            Some(false)
        }
        _ => None,
    }
}

fn unquote(raw: &str) -> String {
    let quote = raw.chars().next().unwrap_or('\'');
    let inner = raw
        .strip_prefix(quote)
        .and_then(|s| s.strip_suffix(quote))
        .unwrap_or(raw);
    let doubled = format!("{}{}", quote, quote);
    inner.replace(&doubled, &quote.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TokKind {
    Word,
    Str,
    Paren,
    Eq,
    Sep,
}

#[derive(Debug, Clone, Copy)]
struct Tok {
    kind: TokKind,
    start: usize,
    end: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    index: Option<String>,
    values: Vec<NmlValue>,
    /// Byte range of the value list, if any value is present.
    value_span: Option<(usize, usize)>,
    /// Byte offset just past the `=`.
    after_eq: usize,
}

#[derive(Debug, Clone)]
struct Group {
    name: String,
    entries: Vec<Entry>,
    /// Byte offset of the terminating `/` (or `&end`).
    end_at: usize,
}

/// Parsed namelist file; values are looked up case-insensitively.
#[derive(Debug, Clone)]
pub struct Namelist {
    groups: Vec<Group>,
}

impl Namelist {
    pub fn read(path: &Path) -> Result<Self, PatchError> {
        let text = fs::read_to_string(path).map_err(|source| PatchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// `path` is only used in error messages.
    pub fn parse(text: &str, path: &Path) -> Result<Self, PatchError> {
        let bytes = text.as_bytes();
        let mut groups = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            match bytes[pos] {
                b'!' => pos = skip_line(bytes, pos),
                b'&' | b'$' => {
                    let name_end = scan_ident(bytes, pos + 1);
                    let name = text[pos + 1..name_end].to_ascii_lowercase();
                    if name.is_empty() || name == "end" {
                        pos = name_end.max(pos + 1);
                        continue;
                    }
                    let (group, next) = parse_group(text, name, pos, name_end, path)?;
                    groups.push(group);
                    pos = next;
                }
                _ => pos += 1,
            }
        }
        Ok(Self { groups })
    }

    /// First scalar (unindexed) entry named `name` in `group`.
    pub fn get(&self, group: &str, name: &str) -> Option<NmlValue> {
        let entry = self.entry(group, name)?;
        match entry.values.as_slice() {
            [single] => Some(single.clone()),
            [] => Some(NmlValue::Null),
            many => Some(NmlValue::List(many.to_vec())),
        }
    }

    fn group(&self, group: &str) -> Option<&Group> {
        let group = group.to_ascii_lowercase();
        self.groups.iter().find(|g| g.name == group)
    }

    fn entry(&self, group: &str, name: &str) -> Option<&Entry> {
        let name = name.to_ascii_lowercase();
        self.group(group)?
            .entries
            .iter()
            .find(|e| e.name == name && e.index.is_none())
    }
}

fn parse_group(
    text: &str,
    name: String,
    group_start: usize,
    body_start: usize,
    path: &Path,
) -> Result<(Group, usize), PatchError> {
    let (toks, end_at, next) = lex_group(text, group_start, body_start, path)?;
    let parse_err = |at: usize, reason: String| PatchError::Parse {
        path: path.to_path_buf(),
        line: line_of(text, at),
        reason,
    };
    let slice = |t: &Tok| &text[t.start..t.end];

    let mut entries = Vec::new();
    let mut i = 0;
    while i < toks.len() {
        let tok = toks[i];
        if tok.kind == TokKind::Sep {
            i += 1;
            continue;
        }
        if tok.kind != TokKind::Word {
            return Err(parse_err(
                tok.start,
                format!("expected a variable name in group '{}'", name),
            ));
        }
        let entry_name = slice(&tok).to_ascii_lowercase();
        let mut j = i + 1;
        let mut index = None;
        if j < toks.len() && toks[j].kind == TokKind::Paren && toks[j].start == tok.end {
            index = Some(slice(&toks[j]).to_string());
            j += 1;
        }
        if j >= toks.len() || toks[j].kind != TokKind::Eq {
            return Err(parse_err(
                tok.start,
                format!("expected '=' after '{}'", entry_name),
            ));
        }
        let after_eq = toks[j].end;
        j += 1;

        let mut values = Vec::new();
        let mut value_span: Option<(usize, usize)> = None;
        let mut last_was_value = false;
        while j < toks.len() {
            let cur = toks[j];
            if is_key_start(&toks, j) {
                break;
            }
            match cur.kind {
                TokKind::Sep => {
                    if !last_was_value {
                        values.push(NmlValue::Null);
                    }
                    last_was_value = false;
                    j += 1;
                }
                TokKind::Eq => {
                    return Err(parse_err(cur.start, "unexpected '='".to_string()));
                }
                TokKind::Word | TokKind::Str | TokKind::Paren => {
                    let mut end = cur.end;
                    let word = slice(&cur);
                    let parsed = match cur.kind {
                        TokKind::Word
                            if word.ends_with('*')
                                && j + 1 < toks.len()
                                && toks[j + 1].kind == TokKind::Str
                                && toks[j + 1].start == cur.end =>
                        {
                            j += 1;
                            end = toks[j].end;
                            NmlValue::parse_word(&text[cur.start..end])
                        }
                        TokKind::Word => NmlValue::parse_word(word),
                        TokKind::Str => vec![NmlValue::Str(unquote(word))],
                        _ => vec![NmlValue::Raw(word.to_string())],
                    };
                    values.extend(parsed);
                    value_span = Some(match value_span {
                        Some((s, _)) => (s, end),
                        None => (cur.start, end),
                    });
                    last_was_value = true;
                    j += 1;
                }
            }
        }
        entries.push(Entry {
            name: entry_name,
            index,
            values,
            value_span,
            after_eq,
        });
        i = j;
    }

    Ok((
        Group {
            name,
            entries,
            end_at,
        },
        next,
    ))
}

fn is_key_start(toks: &[Tok], j: usize) -> bool {
    if toks[j].kind != TokKind::Word {
        return false;
    }
    match toks.get(j + 1) {
        Some(t) if t.kind == TokKind::Eq => true,
        Some(t) if t.kind == TokKind::Paren && t.start == toks[j].end => {
            matches!(toks.get(j + 2), Some(n) if n.kind == TokKind::Eq)
        }
        _ => false,
    }
}

/// Tokens of one group body, the offset of its terminator and the offset after it.
fn lex_group(
    text: &str,
    group_start: usize,
    mut pos: usize,
    path: &Path,
) -> Result<(Vec<Tok>, usize, usize), PatchError> {
    let bytes = text.as_bytes();
    let mut toks = Vec::new();
    let unterminated = |reason: &str| PatchError::Parse {
        path: path.to_path_buf(),
        line: line_of(text, group_start),
        reason: reason.to_string(),
    };
    loop {
        let Some(&c) = bytes.get(pos) else {
            return Err(unterminated("namelist group is not terminated"));
        };
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => pos += 1,
            b'!' => pos = skip_line(bytes, pos),
            b'/' => return Ok((toks, pos, pos + 1)),
            b'&' | b'$' => {
                let end = scan_ident(bytes, pos + 1);
                if !text[pos + 1..end].eq_ignore_ascii_case("end") {
                    return Err(PatchError::Parse {
                        path: path.to_path_buf(),
                        line: line_of(text, pos),
                        reason: format!(
                            "'{}' starts a group before the previous one is closed",
                            &text[pos..end]
                        ),
                    });
                }
                return Ok((toks, pos, end));
            }
            b'=' | b',' | b';' => {
                let kind = if c == b'=' { TokKind::Eq } else { TokKind::Sep };
                toks.push(Tok {
                    kind,
                    start: pos,
                    end: pos + 1,
                });
                pos += 1;
            }
            b'\'' | b'"' => {
                let end = scan_string(bytes, pos, c)
                    .ok_or_else(|| unterminated("unterminated string literal"))?;
                toks.push(Tok {
                    kind: TokKind::Str,
                    start: pos,
                    end,
                });
                pos = end;
            }
            b'(' => {
                let close = bytes[pos..]
                    .iter()
                    .position(|&b| b == b')')
                    .ok_or_else(|| unterminated("unbalanced parenthesis"))?;
                let end = pos + close + 1;
                toks.push(Tok {
                    kind: TokKind::Paren,
                    start: pos,
                    end,
                });
                pos = end;
            }
            _ => {
                let start = pos;
                while pos < bytes.len() && !is_delim(bytes[pos]) {
                    pos += 1;
                }
                if pos == start {
                    pos += 1;
                    continue;
                }
                toks.push(Tok {
                    kind: TokKind::Word,
                    start,
                    end: pos,
                });
            }
        }
    }
}

fn is_delim(b: u8) -> bool {
    matches!(
        b,
        b' ' | b'\t'
            | b'\r'
            | b'\n'
            | b'='
            | b','
            | b';'
            | b'/'
            | b'!'
            | b'('
            | b')'
            | b'\''
            | b'"'
            | b'&'
            | b'$'
    )
}

fn scan_ident(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
        pos += 1;
    }
    pos
}

fn scan_string(bytes: &[u8], start: usize, quote: u8) -> Option<usize> {
    let mut pos = start + 1;
    while pos < bytes.len() {
        if bytes[pos] == quote {
            if bytes.get(pos + 1) == Some(&quote) {
                pos += 2;
                continue;
            }
            return Some(pos + 1);
        }
        pos += 1;
    }
    None
}

fn skip_line(bytes: &[u8], pos: usize) -> usize {
    bytes[pos..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|n| pos + n + 1)
        .unwrap_or(bytes.len())
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset.min(text.len())]
        .bytes()
        .filter(|&b| b == b'\n')
        .count()
        + 1
}

/// Apply `updates` to `group` in namelist source text.
///
/// Existing unindexed entries have their value list replaced; missing entries
/// are appended before the group terminator; a missing group is appended at
/// the end of the file.
pub fn patch_text(
    text: &str,
    path: &Path,
    group: &str,
    updates: &[(String, NmlValue)],
) -> Result<String, PatchError> {
    let namelist = Namelist::parse(text, path)?;
    let Some(target) = namelist.group(group) else {
        let mut out = text.to_string();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&format!("&{}\n", group));
        for (name, value) in updates {
            out.push_str(&format!("    {} = {}\n", name, value));
        }
        out.push_str("/\n");
        return Ok(out);
    };

    let mut edits: Vec<(usize, usize, String)> = Vec::new();
    let mut appended = String::new();
    for (name, value) in updates {
        let lname = name.to_ascii_lowercase();
        match target
            .entries
            .iter()
            .find(|e| e.name == lname && e.index.is_none())
        {
            Some(entry) => match entry.value_span {
                Some((start, end)) => edits.push((start, end, value.to_string())),
                None => edits.push((entry.after_eq, entry.after_eq, format!(" {}", value))),
            },
            None => appended.push_str(&format!("    {} = {}\n", name, value)),
        }
    }
    if !appended.is_empty() {
        let line_start = text[..target.end_at].rfind('\n').map(|n| n + 1).unwrap_or(0);
        if text[line_start..target.end_at].trim().is_empty() {
            edits.push((line_start, line_start, appended));
        } else {
            edits.push((target.end_at, target.end_at, format!("\n{}", appended)));
        }
    }

    edits.sort_by(|a, b| b.0.cmp(&a.0));
    let mut out = text.to_string();
    for (start, end, replacement) in edits {
        out.replace_range(start..end, &replacement);
    }
    Ok(out)
}

/// Patch `src` into a new file at `dst`; `src` is not modified.
pub fn patch_namelist(
    src: &Path,
    dst: &Path,
    group: &str,
    updates: &[(String, NmlValue)],
) -> Result<(), PatchError> {
    let text = fs::read_to_string(src).map_err(|source| PatchError::Io {
        path: src.to_path_buf(),
        source,
    })?;
    let patched = patch_text(&text, src, group, updates)?;
    write_atomic(dst, patched.as_bytes())
}

/// Apply a sequence of patches to `path`, each stage reading the previous
/// stage's output, then rename the final result over `path`.
///
/// Intermediate files are removed whether or not the chain succeeds, and the
/// original is untouched unless every stage succeeded.
pub fn patch_namelist_in_place(
    path: &Path,
    group: &str,
    stages: &[Vec<(String, NmlValue)>],
) -> Result<(), PatchError> {
    let mut scratch = ScratchFiles::default();
    let mut current = path.to_path_buf();
    for (k, updates) in stages.iter().enumerate() {
        let remaining = stages.len() - k;
        let next = if remaining == 1 {
            suffixed(path, "_tmp")
        } else {
            suffixed(path, &format!("_tmp{}", remaining))
        };
        scratch.track(next.clone());
        patch_namelist(&current, &next, group, updates)?;
        current = next;
    }
    if current != path {
        fs::rename(&current, path).map_err(|source| PatchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}
