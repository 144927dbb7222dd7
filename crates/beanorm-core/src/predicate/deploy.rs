//! Raw SQL fragment parsing.
//!
//! Fragments are written against bean property names. The parser walks the
//! text once, leaving quoted literals alone, replacing identifiers that name
//! properties and turning `:name` placeholders into positional `?` markers.

/// A bind parameter placeholder in a parsed fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamRef {
    /// `:name`
    Named(String),
    /// The n-th `?` (zero based).
    Positional(usize),
}

/// A fragment after property translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedClause {
    pub sql: String,
    /// Placeholders in order of appearance.
    pub params: Vec<ParamRef>,
}

impl ParsedClause {
    /// Number of `?` markers in the parsed SQL.
    pub fn placeholder_count(&self) -> usize {
        self.params.len()
    }

    pub fn has_named(&self) -> bool {
        self.params.iter().any(|p| matches!(p, ParamRef::Named(_)))
    }
}

/// Translates property names in raw SQL fragments.
pub struct DeployParser;

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_part(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

impl DeployParser {
    /// Parse `sql`, replacing every identifier for which `translate`
    /// returns a value.
    pub fn parse(sql: &str, mut translate: impl FnMut(&str) -> Option<String>) -> ParsedClause {
        let chars: Vec<char> = sql.chars().collect();
        let mut out = String::with_capacity(sql.len() + 16);
        let mut params = Vec::new();
        let mut positional = 0;
        // the word following `::` is a type name
        let mut after_cast = false;

        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            match c {
                '\'' | '"' => {
                    let quote = c;
                    out.push(c);
                    i += 1;
                    while i < chars.len() {
                        out.push(chars[i]);
                        i += 1;
                        if chars[i - 1] == quote {
                            break;
                        }
                    }
                    continue;
                }
                ':' if chars.get(i + 1) == Some(&':') => {
                    out.push_str("::");
                    after_cast = true;
                    i += 2;
                    continue;
                }
                ':' if chars.get(i + 1).copied().is_some_and(is_ident_start) => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                        end += 1;
                    }
                    params.push(ParamRef::Named(chars[start..end].iter().collect()));
                    out.push('?');
                    i = end;
                }
                '?' => {
                    params.push(ParamRef::Positional(positional));
                    positional += 1;
                    out.push('?');
                    i += 1;
                }
                c if c.is_ascii_digit() => {
                    while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.' || chars[i] == '_') {
                        out.push(chars[i]);
                        i += 1;
                    }
                }
                c if is_ident_start(c) => {
                    let start = i;
                    while i < chars.len() && is_ident_part(chars[i]) {
                        i += 1;
                    }
                    let word: String = chars[start..i].iter().collect();
                    let translated = if after_cast { None } else { translate(&word) };
                    out.push_str(translated.as_deref().unwrap_or(&word));
                }
                _ => {
                    out.push(c);
                    i += 1;
                }
            }
            after_cast = false;
        }

        ParsedClause { sql: out, params }
    }
}
