// Cache Key Normalizer - formatting-insensitive identity for (plan, parameters)

use kgquery_common::Parameters;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use sha2::{Digest, Sha256};

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

static KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(ORDER BY|MATCH|WHERE|RETURN|SKIP|LIMIT|CREATE|SET|MERGE|DELETE|REMOVE|WITH|UNWIND)\b",
    )
    .expect("keyword pattern")
});

static TRAVERSAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(OPTIONAL\s+MATCH|MATCH)\b").expect("traversal pattern"));

/// Separates plan text from the parameter block in the hashed input.
const KEY_SEPARATOR: u8 = 0x1f;

enum Segment<'a> {
    Code(String),
    /// String literal or backtick-quoted identifier, quotes included.
    Quoted(&'a str),
}

pub struct CacheKeyNormalizer;

impl CacheKeyNormalizer {
    /// Canonical plan text: comments removed, whitespace collapsed, structural
    /// keywords uppercased. Quoted text is left byte-for-byte intact.
    pub fn normalize(plan: &str) -> String {
        let mut out = String::with_capacity(plan.len());
        for segment in split_segments(plan) {
            match segment {
                Segment::Code(code) => {
                    let collapsed = WHITESPACE_RE.replace_all(&code, " ");
                    let upper = KEYWORD_RE.replace_all(&collapsed, |caps: &Captures| {
                        let word = &caps[0];
                        match caps.get(0) {
                            Some(m) if is_keyword_position(&collapsed, m.start(), m.end()) => {
                                word.to_ascii_uppercase()
                            }
                            _ => word.to_string(),
                        }
                    });
                    out.push_str(&upper);
                }
                Segment::Quoted(text) => out.push_str(text),
            }
        }
        out.trim().to_string()
    }

    /// Stable key for a (plan, parameters) pair. Parameter order, including
    /// key order inside nested maps, does not affect the result.
    pub fn key(plan: &str, parameters: &Parameters) -> String {
        let normalized = Self::normalize(plan);

        let mut params = String::new();
        params.push('{');
        for (i, (name, value)) in parameters.iter().enumerate() {
            if i > 0 {
                params.push(',');
            }
            params.push_str(&Value::String(name.clone()).to_string());
            params.push(':');
            write_canonical(value, &mut params);
        }
        params.push('}');

        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update([KEY_SEPARATOR]);
        hasher.update(params.as_bytes());
        format!("q:{:x}", hasher.finalize())
    }

    /// Splices engine hints in right after the first traversal keyword, or
    /// prepends them as a plan-level annotation when there is none.
    ///
    /// Hints are trusted input and are inserted verbatim; only plan
    /// identifiers go through `sanitize`.
    pub fn apply_hints(plan: &str, hints: &[String]) -> String {
        if hints.is_empty() {
            return plan.to_string();
        }

        match TRAVERSAL_RE.find(plan) {
            Some(m) => {
                let using = hints
                    .iter()
                    .map(|h| format!("USING {}", h))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("{} {}{}", &plan[..m.end()], using, &plan[m.end()..])
            }
            None => format!("/*+ {} */ {}", hints.join(" "), plan),
        }
    }
}

// A keyword-shaped word is an identifier when it follows a label or type
// colon, a property dot, a parameter sigil or a type alternation bar, or
// when it is called like a function.
fn is_keyword_position(code: &str, start: usize, end: usize) -> bool {
    let before = code[..start].trim_end().chars().next_back();
    let after = code[end..].chars().next();
    !matches!(before, Some(':' | '.' | '$' | '|')) && after != Some('(')
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// Drops `//` and `/* */` comments and cuts the text into code and quoted
// runs so that later passes never touch literal content.
fn split_segments(plan: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut code = String::new();
    let mut chars = plan.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                let mut end = plan.len();
                let mut escaped = false;
                for (i, next) in chars.by_ref() {
                    if escaped {
                        escaped = false;
                    } else if next == '\\' && c != '`' {
                        escaped = true;
                    } else if next == c {
                        end = i + next.len_utf8();
                        break;
                    }
                }
                if !code.is_empty() {
                    segments.push(Segment::Code(std::mem::take(&mut code)));
                }
                segments.push(Segment::Quoted(&plan[start..end]));
            }
            '/' if matches!(chars.peek(), Some((_, '/'))) => {
                for (_, next) in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
                code.push(' ');
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                let mut prev = '\0';
                for (_, next) in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
                code.push(' ');
            }
            _ => code.push(c),
        }
    }

    if !code.is_empty() {
        segments.push(Segment::Code(code));
    }
    segments
}
