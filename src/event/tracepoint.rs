//! Tracepoint resolution against tracefs: event ids, field schemas, and the
//! filter-string adjustment needed across kernel versions.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;

use super::{Category, EventType};
use crate::error::{Error, Result};

const TRACEFS_CANDIDATES: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

pub fn tracefs_dir() -> Option<&'static Path> {
    TRACEFS_CANDIDATES
        .iter()
        .map(Path::new)
        .find(|dir| dir.join("events").is_dir())
}

fn event_dir(subsys: &str, name: &str) -> Result<PathBuf> {
    let tracefs = tracefs_dir().ok_or_else(|| {
        Error::CapabilityUnsupported("tracefs is not mounted or not readable".into())
    })?;
    let dir = tracefs.join("events").join(subsys).join(name);
    if dir.is_dir() {
        Ok(dir)
    } else {
        Err(Error::CapabilityUnsupported(format!(
            "unknown tracepoint '{subsys}:{name}'"
        )))
    }
}

/// Resolves `subsys:name` to an event type carrying the tracefs event id.
pub fn find_tracepoint(subsys: &str, name: &str) -> Result<EventType> {
    let id_path = event_dir(subsys, name)?.join("id");
    let id = fs::read_to_string(&id_path)?;
    let config = id.trim().parse::<u64>().map_err(|_| {
        Error::CapabilityUnsupported(format!("bad tracepoint id in {}", id_path.display()))
    })?;
    Ok(EventType {
        name: format!("{subsys}:{name}"),
        category: Category::Tracepoint,
        type_: crate::ffi::bindings::PERF_TYPE_TRACEPOINT,
        config,
    })
}

/// Field names of a tracepoint's schema, from its tracefs `format` file.
pub fn tracepoint_fields(subsys: &str, name: &str) -> Result<BTreeSet<String>> {
    let format = fs::read_to_string(event_dir(subsys, name)?.join("format"))?;
    Ok(parse_format_fields(&format))
}

fn parse_format_fields(format: &str) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    for line in format.lines() {
        // Lines look like `  field:unsigned short common_type;  offset:0; ...`.
        let Some(decl) = line.trim_start().strip_prefix("field:") else {
            continue;
        };
        let Some(decl) = decl.split(';').next() else {
            continue;
        };
        if let Some(name) = decl.split_whitespace().last() {
            // Array fields are declared as `char comm[16]`.
            let name = name.split('[').next().unwrap_or(name);
            fields.insert(name.to_string());
        }
    }
    fields
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TokenKind {
    Punct,
    Name,
    Number,
    QuotedString,
}

#[derive(Clone, Debug)]
struct Token {
    kind: TokenKind,
    text: String,
}

fn tokenize_filter(filter: &str) -> Result<Vec<Token>> {
    let bad = |what: &str| Error::FilterInvalid(format!("{what} in filter: {filter}"));
    let mut tokens = Vec::new();
    let mut chars = filter.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | '!' | '&' | '|' | '=' | '>' | '<' | '~' => {
                let mut text = String::new();
                while chars
                    .peek()
                    .is_some_and(|&c| "()!&|=><~".contains(c))
                {
                    text.push(chars.next().unwrap());
                    // Parens and `!x` bind singly; operators may pair (==, &&, >=).
                    if text == "(" || text == ")" {
                        break;
                    }
                    if text.len() == 2 {
                        break;
                    }
                    if text == "!" && chars.peek() != Some(&'=') {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Punct,
                    text,
                });
            }
            '"' | '\'' => {
                let quote = chars.next().unwrap();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some(c) => text.push(c),
                        None => return Err(bad("unterminated string")),
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::QuotedString,
                    text,
                });
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                text.push(chars.next().unwrap());
                while chars
                    .peek()
                    .is_some_and(|c| c.is_ascii_alphanumeric() || *c == 'x')
                {
                    text.push(chars.next().unwrap());
                }
                tokens.push(Token {
                    kind: TokenKind::Number,
                    text,
                });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = String::new();
                while chars
                    .peek()
                    .is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '*' || *c == '.')
                {
                    text.push(chars.next().unwrap());
                }
                tokens.push(Token {
                    kind: TokenKind::Name,
                    text,
                });
            }
            '*' => {
                // A glob operand like *comm* without quotes.
                let mut text = String::new();
                while chars
                    .peek()
                    .is_some_and(|c| c.is_ascii_alphanumeric() || "_*.".contains(*c))
                {
                    text.push(chars.next().unwrap());
                }
                tokens.push(Token {
                    kind: TokenKind::Name,
                    text,
                });
            }
            _ => return Err(bad(&format!("unexpected character '{c}'"))),
        }
    }
    Ok(tokens)
}

const COMPARE_OPS: &[&str] = &["==", "!=", ">", ">=", "<", "<=", "&", "~"];

/// Rewrites a tracepoint filter for the running kernel and collects the field
/// names it references.
///
/// Kernels since 4.19 require string operands to be quoted; older kernels
/// reject the quotes. Operand quoting is normalized accordingly and every
/// comparison's left-hand side is reported for schema validation.
pub fn adjust_filter(filter: &str, use_quote: bool) -> Result<(String, BTreeSet<String>)> {
    let tokens = tokenize_filter(filter)?;
    let bad = |what: String| Error::FilterInvalid(format!("{what} in filter: {filter}"));

    let mut out = Vec::with_capacity(tokens.len());
    let mut used_fields = BTreeSet::new();
    let mut i = 0;
    let mut paren_depth = 0i32;
    while i < tokens.len() {
        let token = &tokens[i];
        match token.kind {
            TokenKind::Punct if token.text == "(" => {
                paren_depth += 1;
                out.push("(".to_string());
                i += 1;
            }
            TokenKind::Punct if token.text == ")" => {
                paren_depth -= 1;
                if paren_depth < 0 {
                    return Err(bad("unmatched ')'".into()));
                }
                out.push(")".to_string());
                i += 1;
            }
            TokenKind::Punct if token.text == "&&" || token.text == "||" || token.text == "!" => {
                out.push(token.text.clone());
                i += 1;
            }
            TokenKind::Name => {
                // field op operand
                let op = tokens
                    .get(i + 1)
                    .filter(|t| t.kind == TokenKind::Punct && COMPARE_OPS.contains(&t.text.as_str()))
                    .ok_or_else(|| bad(format!("expected operator after '{}'", token.text)))?;
                let operand = tokens
                    .get(i + 2)
                    .ok_or_else(|| bad(format!("missing operand after '{}'", op.text)))?;
                let operand_text = match operand.kind {
                    TokenKind::Number => operand.text.clone(),
                    TokenKind::Name | TokenKind::QuotedString => {
                        if use_quote {
                            format!("\"{}\"", operand.text)
                        } else {
                            operand.text.clone()
                        }
                    }
                    TokenKind::Punct => {
                        return Err(bad(format!("bad operand '{}'", operand.text)));
                    }
                };
                used_fields.insert(token.text.clone());
                out.push(format!("{} {} {}", token.text, op.text, operand_text));
                i += 3;
            }
            _ => return Err(bad(format!("unexpected token '{}'", token.text))),
        }
    }
    if paren_depth != 0 {
        return Err(bad("unmatched '('".into()));
    }
    if used_fields.is_empty() {
        return Err(bad("no field comparison".into()));
    }
    Ok((out.iter().join(" "), used_fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_field_names() {
        let format = "\
name: sched_switch
ID: 316
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:char prev_comm[16];\toffset:8;\tsize:16;\tsigned:0;
\tfield:pid_t prev_pid;\toffset:24;\tsize:4;\tsigned:1;
";
        let fields = parse_format_fields(format);
        assert!(fields.contains("common_type"));
        assert!(fields.contains("common_flags"));
        assert!(fields.contains("prev_comm"));
        assert!(fields.contains("prev_pid"));
        assert_eq!(fields.len(), 4);
    }

    #[test]
    fn filter_quoting_for_new_kernels() {
        let (adjusted, fields) =
            adjust_filter("prev_comm != sleep && (prev_pid > 1)", true).unwrap();
        assert_eq!(adjusted, "prev_comm != \"sleep\" && ( prev_pid > 1 )");
        assert!(fields.contains("prev_comm"));
        assert!(fields.contains("prev_pid"));
    }

    #[test]
    fn filter_unquoting_for_old_kernels() {
        let (adjusted, _) = adjust_filter("prev_comm == \"systemd\"", false).unwrap();
        assert_eq!(adjusted, "prev_comm == systemd");
        let (adjusted, _) = adjust_filter("prev_comm == \"systemd\"", true).unwrap();
        assert_eq!(adjusted, "prev_comm == \"systemd\"");
    }

    #[test]
    fn filter_rejects_malformed_input() {
        assert!(adjust_filter("prev_comm !=", true).is_err());
        assert!(adjust_filter("(prev_pid > 1", true).is_err());
        assert!(adjust_filter("prev_pid > 1)", true).is_err());
        assert!(adjust_filter("42", true).is_err());
        assert!(adjust_filter("prev_comm == \"unterminated", true).is_err());
    }
}
