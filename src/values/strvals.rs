/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/values/strvals.rs
*
* Parser for `--set` style assignments (`a.b[0].c=v,d={x,y}`). It is used by
* the values resolver for string-valued ConfigMap/Secret entries and by the
* CLI `--set` flag.
*
* Supported syntax:
* - dotted keys create nested maps, `name[n]` addresses list elements;
* - `\.`, `\,`, `\=` and `\[` escape the structural characters;
* - `{a,b}` produces a list;
* - `true`/`false` become booleans, `null` a null and plain integers numbers.
*
* SPDX-License-Identifier: Apache-2.0 */

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Upper bound for `[n]` indexes, so a typo cannot allocate a huge list.
const MAX_INDEX: usize = 65536;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("key {0:?} has no value")]
    MissingValue(String),

    #[error("empty key in {0:?}")]
    EmptyKey(String),

    #[error("invalid index in key {0:?}")]
    InvalidIndex(String),

    #[error("unterminated list in {0:?}")]
    UnterminatedList(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parses a comma separated list of assignments into `dest`.
pub fn parse_into(input: &str, dest: &mut Map<String, Value>) -> Result<(), ParseError> {
    for assignment in split_unescaped(input, ',', true) {
        if assignment.trim().is_empty() {
            continue;
        }
        let (key, raw) = split_assignment(&assignment)?;
        let value = if raw.starts_with('{') {
            if !raw.ends_with('}') {
                return Err(ParseError::UnterminatedList(assignment.clone()));
            }
            let inner = &raw[1..raw.len() - 1];
            let items = if inner.is_empty() {
                Vec::new()
            } else {
                split_unescaped(inner, ',', false)
                    .iter()
                    .map(|item| typed_value(&unescape(item)))
                    .collect()
            };
            Value::Array(items)
        } else {
            typed_value(&unescape(raw))
        };
        set_path(dest, &parse_key(key)?, value);
    }
    Ok(())
}

/// Applies a single `key=value` pair. The value is taken verbatim (no comma
/// splitting, no list syntax) and typed like a scalar.
pub fn set_value(dest: &mut Map<String, Value>, key: &str, raw: &str) -> Result<(), ParseError> {
    set_path(dest, &parse_key(key)?, typed_value(raw));
    Ok(())
}

/// Splits on `sep` when it is not escaped and, if `track_braces` is set, not
/// inside a `{...}` list. Escapes are preserved for the later stages.
fn split_unescaped(input: &str, sep: char, track_braces: bool) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '{' if track_braces => {
                depth += 1;
                current.push(c);
            }
            '}' if track_braces => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c == sep && depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn split_assignment(assignment: &str) -> Result<(&str, &str), ParseError> {
    let mut escaped = false;
    for (i, c) in assignment.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            '=' if !escaped => return Ok((&assignment[..i], &assignment[i + 1..])),
            _ => escaped = false,
        }
    }
    Err(ParseError::MissingValue(assignment.to_string()))
}

fn parse_key(key: &str) -> Result<Vec<Segment>, ParseError> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = key.chars().peekable();
    // Set once a segment has been closed by `]`, so `a[0].b` does not push an
    // empty key for the dot that follows the index.
    let mut closed = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '.' => {
                if current.is_empty() && !closed {
                    return Err(ParseError::EmptyKey(key.to_string()));
                }
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                closed = false;
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                } else if segments.is_empty() {
                    return Err(ParseError::EmptyKey(key.to_string()));
                }
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) => digits.push(d),
                        None => return Err(ParseError::InvalidIndex(key.to_string())),
                    }
                }
                let index: usize = digits
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::InvalidIndex(key.to_string()))?;
                if index > MAX_INDEX {
                    return Err(ParseError::InvalidIndex(key.to_string()));
                }
                segments.push(Segment::Index(index));
                closed = true;
            }
            _ => {
                current.push(c);
                closed = false;
            }
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Key(current));
    } else if !closed {
        return Err(ParseError::EmptyKey(key.to_string()));
    }
    Ok(segments)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ (',' | '.' | '=' | '[' | ']' | '{' | '}' | '\\')) => out.push(next),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn typed_value(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    // Leading zeros keep the string form ("007" is an identifier, not 7).
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    let leading_zero = digits.len() > 1 && digits.starts_with('0');
    if !leading_zero {
        if let Ok(n) = raw.parse::<i64>() {
            return Value::Number(Number::from(n));
        }
    }
    Value::String(raw.to_string())
}

fn set_path(dest: &mut Map<String, Value>, path: &[Segment], value: Value) {
    let Some((Segment::Key(first), rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        dest.insert(first.clone(), value);
        return;
    }
    let slot = dest.entry(first.clone()).or_insert(Value::Null);
    set_in(slot, rest, value);
}

fn set_in(slot: &mut Value, path: &[Segment], value: Value) {
    let Some((segment, rest)) = path.split_first() else {
        *slot = value;
        return;
    };
    match segment {
        Segment::Key(key) => {
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(map) = slot {
                let child = map.entry(key.clone()).or_insert(Value::Null);
                set_in(child, rest, value);
            }
        }
        Segment::Index(index) => {
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Value::Array(list) = slot {
                if list.len() <= *index {
                    list.resize(index + 1, Value::Null);
                }
                set_in(&mut list[*index], rest, value);
            }
        }
    }
}
