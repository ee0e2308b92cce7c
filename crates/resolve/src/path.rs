//! Field paths into object documents.
//!
//! Grammar: dot-separated keys with optional `[index]` or quoted
//! `['key.with.dots']` segments, e.g. `status.endpoints[0].host` or
//! `data['tls.crt']`. A leading `$`, `$.` or `.` and surrounding `{...}` are
//! accepted so kubectl-style jsonpaths can be pasted in.

use serde_json::Value as Json;

use crate::ResolveError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

fn invalid(path: &str, reason: &str) -> ResolveError {
    ResolveError::InvalidPath { path: path.to_string(), reason: reason.to_string() }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

pub fn parse(path: &str) -> Result<Vec<Segment>, ResolveError> {
    let mut s = path.trim();
    if let Some(inner) = s.strip_prefix('{').and_then(|x| x.strip_suffix('}')) {
        s = inner.trim();
    }
    s = s.strip_prefix('$').unwrap_or(s);
    s = s.strip_prefix('.').unwrap_or(s);
    if s.is_empty() {
        return Err(invalid(path, "empty path"));
    }

    let chars: Vec<char> = s.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    let mut expect_key = true;
    while i < chars.len() {
        match chars[i] {
            '.' => {
                if expect_key {
                    return Err(invalid(path, "empty segment"));
                }
                expect_key = true;
                i += 1;
                if i == chars.len() {
                    return Err(invalid(path, "trailing '.'"));
                }
            }
            '[' => {
                let close = chars[i..].iter().position(|&c| c == ']').map(|p| p + i).ok_or_else(|| invalid(path, "unclosed '['"))?;
                let inner: String = chars[i + 1..close].iter().collect();
                let quoted = inner
                    .strip_prefix('\'')
                    .and_then(|x| x.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|x| x.strip_suffix('"')));
                match quoted {
                    Some(key) if !key.is_empty() => out.push(Segment::Key(key.to_string())),
                    Some(_) => return Err(invalid(path, "empty quoted key")),
                    None => {
                        let idx: usize = inner.parse().map_err(|_| invalid(path, "index must be a non-negative integer"))?;
                        out.push(Segment::Index(idx));
                    }
                }
                expect_key = false;
                i = close + 1;
            }
            c if is_key_char(c) => {
                if !expect_key {
                    return Err(invalid(path, "missing '.' between segments"));
                }
                let start = i;
                while i < chars.len() && is_key_char(chars[i]) {
                    i += 1;
                }
                out.push(Segment::Key(chars[start..i].iter().collect()));
                expect_key = false;
            }
            _ => return Err(invalid(path, "unsupported character")),
        }
    }
    Ok(out)
}

pub fn extract<'a>(root: &'a Json, segments: &[Segment]) -> Option<&'a Json> {
    let mut cur = root;
    for seg in segments {
        cur = match (seg, cur) {
            (Segment::Key(k), Json::Object(map)) => map.get(k)?,
            (Segment::Index(i), Json::Array(arr)) => arr.get(*i)?,
            _ => return None,
        };
    }
    Some(cur)
}
