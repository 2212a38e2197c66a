//! Glob patterns translated to regular expressions.
//!
//! One translation serves every backend: the generated scripts receive the regex
//! source produced here, and in-process backends compile the same source with the
//! `regex` crate. The emitted syntax is the common subset of JavaScript and Rust regex.
//!
//! - `**/` matches zero or more directories, `**` anything (including `/`)
//! - `*` matches within a single path segment, `?` one non-`/` character
//! - `[abc]`, `[a-z]`, `[!abc]` are character classes
//!
//! Patterns are anchored and matched against paths relative to the search root.

use regex::Regex;

/// Translate a glob pattern into an anchored regex source string.
pub fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    push_class(&mut out, &chars[i + 1..end]);
                    i = end + 1;
                    continue;
                }
                None => out.push_str("\\["),
            },
            _ => push_literal(&mut out, c),
        }
        i += 1;
    }
    out.push('$');
    out
}

/// Index of the `]` closing the class opened at `start`, if any.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    if matches!(chars.get(j), Some('!') | Some('^')) {
        j += 1;
    }
    // a leading ']' is a literal member
    if chars.get(j) == Some(&']') {
        j += 1;
    }
    while j < chars.len() {
        if chars[j] == ']' {
            return Some(j);
        }
        j += 1;
    }
    None
}

fn push_class(out: &mut String, body: &[char]) {
    out.push('[');
    let mut rest = body;
    if let Some(&first) = rest.first() {
        if first == '!' || first == '^' {
            out.push('^');
            rest = &rest[1..];
        }
    }
    for &c in rest {
        match c {
            // '-' keeps its range meaning; these would otherwise open nested
            // classes or set operations in one engine or the other
            '\\' | '[' | ']' | '&' | '~' | '^' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out.push(']');
}

fn push_literal(out: &mut String, c: char) {
    if matches!(
        c,
        '\\' | '.' | '+' | '(' | ')' | '|' | '{' | '}' | '^' | '$' | ']'
    ) {
        out.push('\\');
    }
    out.push(c);
}

/// A compiled glob pattern.
#[derive(Clone, Debug)]
pub struct GlobMatcher {
    pattern: String,
    regex: Regex,
}

impl GlobMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: pattern.to_string(),
            regex: Regex::new(&glob_to_regex(pattern))?,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, relative_path: &str) -> bool {
        self.regex.is_match(relative_path)
    }
}
