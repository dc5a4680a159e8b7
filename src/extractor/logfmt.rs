//! Hand-rolled logfmt decoder (§4.B): no crate in the pack owns this
//! format, so it uses a `once_cell::sync::Lazy<Regex>` token scanner rather
//! than a parser combinator dependency.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::errors::LogRecord;

/// Matches one `key=value` token, where `value` is either a bare run of
/// non-space characters or a double-quoted string (backslash-escaped).
static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([A-Za-z_][A-Za-z0-9_.]*)=("(?:[^"\\]|\\.)*"|\S*)"#).unwrap());

#[derive(Debug, Error)]
#[error("logfmt syntax error at line {line}: {detail}")]
pub struct LogfmtError {
    pub line: usize,
    pub detail: String,
    /// Records successfully forwarded before this error, so callers can
    /// report true partial progress rather than assuming zero.
    pub forwarded: usize,
}

/// One decoded line's key-value pairs, plus the structured fields the
/// classifier cares about (§4.A's `LogRecord`).
#[derive(Debug, Clone)]
pub struct DecodedLine {
    pub fields: HashMap<String, String>,
    pub record: LogRecord,
}

fn unquote(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        let inner = &raw[1..raw.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                out.push(c);
            }
        }
        out
    } else {
        raw.to_string()
    }
}

fn decode_line(line: &str) -> Result<HashMap<String, String>, String> {
    let mut fields = HashMap::new();
    let mut consumed = 0usize;
    for cap in TOKEN_RE.captures_iter(line) {
        let m = cap.get(0).unwrap();
        if m.start() != consumed && line[consumed..m.start()].trim().is_empty() {
            // whitespace gap between tokens, fine
        } else if m.start() != consumed {
            return Err(format!("unexpected token near byte {}", consumed));
        }
        consumed = m.end();
        let key = cap[1].to_string();
        let value = unquote(&cap[2]);
        fields.insert(key, value);
    }
    if line.trim().is_empty() {
        return Ok(fields);
    }
    if consumed < line.trim_end().len() && fields.is_empty() {
        return Err("no key=value tokens found".to_string());
    }
    Ok(fields)
}

/// Whether a decoded line should be suppressed (§4.B: `level=debug` with no
/// `source` key — framework-internal noise).
fn is_suppressed(fields: &HashMap<String, String>) -> bool {
    fields.get("level").map(String::as_str) == Some("debug") && !fields.contains_key("source")
}

/// Decodes a full logs buffer, forwarding every non-suppressed record.
/// Best-effort: on a syntax error, returns `Err` carrying the line number,
/// but the caller has already received every record decoded before it via
/// `forward`.
pub fn decode_logfmt(
    buf: &[u8],
    mut forward: impl FnMut(DecodedLine),
) -> Result<usize, LogfmtError> {
    let text = String::from_utf8_lossy(buf);
    let mut forwarded = 0;
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields = decode_line(line).map_err(|detail| LogfmtError {
            line: idx + 1,
            detail,
            forwarded,
        })?;
        if is_suppressed(&fields) {
            continue;
        }
        let record = LogRecord {
            level: fields.get("level").cloned(),
            source: fields.get("source").cloned(),
            msg: fields.get("msg").cloned(),
        };
        forward(DecodedLine { fields, record });
        forwarded += 1;
    }
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_quoted_and_bare_values() {
        let line = br#"level=error msg="boom: failed" source=stacktrace"#;
        let mut seen = Vec::new();
        decode_logfmt(line, |l| seen.push(l)).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].fields.get("msg").unwrap(), "boom: failed");
        assert_eq!(seen[0].record.level.as_deref(), Some("error"));
    }

    #[test]
    fn suppresses_debug_without_source() {
        let line = b"level=debug msg=\"noise\"\n";
        let mut seen = Vec::new();
        decode_logfmt(line, |l| seen.push(l)).unwrap();
        assert!(seen.is_empty());
    }

    #[test]
    fn forwards_debug_with_source() {
        let line = b"level=debug msg=\"noise\" source=http\n";
        let mut seen = Vec::new();
        decode_logfmt(line, |l| seen.push(l)).unwrap();
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn best_effort_forwards_records_before_the_error() {
        let buf = b"level=info msg=ok\nthis is \x07not valid logfmt \x07at all\n";
        let mut seen = Vec::new();
        let result = decode_logfmt(buf, |l| seen.push(l));
        assert_eq!(seen.len(), 1);
        let err = result.unwrap_err();
        assert_eq!(err.forwarded, 1);
    }
}
