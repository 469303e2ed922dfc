//! `${...}` variable expansion against a [`ScopedContext`].
//!
//! Supported forms:
//!
//! - `${name}`: nearest binding of `name` (then environment, then
//!   properties)
//! - `${a.b.c}`: dotted navigation through maps and child contexts; a
//!   list in the middle of a path is searched element by element and
//!   the first match wins
//! - `${items[0]}`, `${items[0][1]}`, `${items[0,2]}`: indexing, a
//!   comma-separated group selects a sublist in the written order
//! - `${key${suffix}}`: nested expressions are expanded first and form
//!   the name that is then looked up
//!
//! Resolution never fails. A missing variable becomes an empty string
//! and a malformed index group is ignored.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::context::{Resolved, ScopedContext};

/// Bound on nested expansion and variable-to-variable alias chains.
const MAX_DEPTH: usize = 32;

/// Resolve every string inside `value` against `ctx`.
pub fn resolve(ctx: &ScopedContext, value: &Value) -> Value {
    resolve_value_at(ctx, value, 0)
}

/// Like [`resolve`]; without a context the input is returned untouched.
pub fn resolve_opt(ctx: Option<&ScopedContext>, value: &Value) -> Value {
    match ctx {
        Some(ctx) => resolve(ctx, value),
        None => value.clone(),
    }
}

/// Resolve a template string. The result is structured when the whole
/// string is a single expression that points at a map or list.
pub fn resolve_str(ctx: &ScopedContext, text: &str) -> Value {
    resolve_string(ctx, text, 0)
}

/// Resolve a template string and render the result as text.
pub fn resolve_to_string(ctx: &ScopedContext, text: &str) -> String {
    stringify(&resolve_str(ctx, text))
}

/// Whether `text` contains at least one complete `${...}` expression.
pub fn contains_expression(text: &str) -> bool {
    !find_expressions(text).is_empty()
}

/// Render a value the way it appears inside surrounding text.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_value_at(ctx: &ScopedContext, value: &Value, depth: usize) -> Value {
    match value {
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (key, item) in map {
                let key = stringify(&resolve_string(ctx, key, depth));
                resolved.insert(key, resolve_value_at(ctx, item, depth));
            }
            Value::Object(resolved)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value_at(ctx, item, depth))
                .collect(),
        ),
        Value::String(text) => resolve_string(ctx, text, depth),
        scalar => scalar.clone(),
    }
}

/// Byte range of one `${...}` expression, delimiters included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

/// Locate top-level expressions. An expression runs from `${` to the
/// brace that closes it, so nested `${...}` stay inside one span.
fn find_expressions(text: &str) -> Vec<Span> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] != b'$' || bytes[i + 1] != b'{' {
            i += 1;
            continue;
        }
        let start = i;
        let mut depth = 1;
        let mut j = i + 2;
        while j < bytes.len() && depth > 0 {
            match bytes[j] {
                b'{' => depth += 1,
                b'}' => depth -= 1,
                _ => {}
            }
            j += 1;
        }
        if depth > 0 {
            // unterminated `${` is literal, later expressions still count
            i = start + 2;
            continue;
        }
        spans.push(Span { start, end: j });
        i = j;
    }

    spans
}

fn resolve_string(ctx: &ScopedContext, text: &str, depth: usize) -> Value {
    let spans = find_expressions(text);
    if spans.is_empty() {
        return Value::String(text.to_string());
    }

    if spans.len() == 1 && spans[0].start == 0 && spans[0].end == text.len() {
        let inner = &text[2..text.len() - 1];
        return match resolve_expression(ctx, inner, depth) {
            Some(Value::String(s)) => bracket_literal_to_list(&s)
                .unwrap_or(Value::String(s)),
            Some(value) => value,
            None => Value::String(String::new()),
        };
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for span in &spans {
        out.push_str(&text[last..span.start]);
        let inner = &text[span.start + 2..span.end - 1];
        if let Some(value) = resolve_expression(ctx, inner, depth) {
            out.push_str(&stringify(&value));
        }
        last = span.end;
    }
    out.push_str(&text[last..]);

    bracket_literal_to_list(&out).unwrap_or(Value::String(out))
}

/// Resolve the text between `${` and `}`.
fn resolve_expression(
    ctx: &ScopedContext,
    inner: &str,
    depth: usize,
) -> Option<Value> {
    if depth >= MAX_DEPTH {
        warn!(expression = inner, "variable expansion too deep, giving up");
        return None;
    }

    let path = if contains_expression(inner) {
        stringify(&resolve_string(ctx, inner, depth + 1))
    } else {
        inner.to_string()
    };
    let path = path.trim();

    let found = match lookup_path(ctx, path).map(Resolved::into_value) {
        Some(Value::Null) | None => {
            debug!(path, "variable not found");
            return None;
        }
        Some(found) => found,
    };

    match found {
        Value::String(s) if contains_expression(&s) => {
            Some(resolve_string(ctx, &s, depth + 1))
        }
        other => Some(other),
    }
}

/// Navigate a dotted path starting from the bindings visible in `ctx`.
pub fn lookup_path(ctx: &ScopedContext, path: &str) -> Option<Resolved> {
    let (head, rest) = split_path(path);
    let (name, groups) = parse_head(head);
    let found = ctx.resolve_value(name)?;
    let found = apply_indexes(found, &groups)?;
    continue_path(found, rest)
}

fn continue_path(current: Resolved, rest: Option<&str>) -> Option<Resolved> {
    match rest {
        Some(rest) if !rest.is_empty() => descend(current, rest),
        _ => Some(current),
    }
}

fn descend(current: Resolved, path: &str) -> Option<Resolved> {
    let (head, rest) = split_path(path);
    let (name, groups) = parse_head(head);

    let member = match current {
        Resolved::Scope(scope) => scope.get_local(name)?,
        Resolved::Value(Value::Object(mut map)) => {
            Resolved::Value(map.remove(name)?)
        }
        Resolved::Value(Value::Array(items)) => {
            // search, not an indexed lookup
            return items
                .into_iter()
                .find_map(|item| descend(Resolved::Value(item), path));
        }
        Resolved::Value(_) => return None,
    };

    let member = apply_indexes(member, &groups)?;
    continue_path(member, rest)
}

fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

/// Split `name[1][2,3]` into the bare name and its index groups. A
/// malformed suffix yields the bare name and no groups.
fn parse_head(head: &str) -> (&str, Vec<Vec<usize>>) {
    static HEAD_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^([^\[\]]*)((?:\[[^\[\]]*\])+)$")
            .expect("failed to compile index head regex")
    });
    static GROUP_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\[([^\[\]]*)\]")
            .expect("failed to compile index group regex")
    });

    if !head.contains('[') {
        return (head, Vec::new());
    }

    let Some(caps) = HEAD_RE.captures(head) else {
        let name = head.split('[').next().unwrap_or(head);
        debug!(head, "malformed index expression ignored");
        return (name, Vec::new());
    };
    let name = caps.get(1).map_or("", |m| m.as_str());
    let suffix = caps.get(2).map_or("", |m| m.as_str());

    let mut groups = Vec::new();
    for group in GROUP_RE.captures_iter(suffix) {
        let parsed: Result<Vec<usize>, _> = group[1]
            .split(',')
            .map(|index| index.trim().parse::<usize>())
            .collect();
        match parsed {
            Ok(indexes) => groups.push(indexes),
            Err(_) => {
                debug!(head, "malformed index expression ignored");
                return (name, Vec::new());
            }
        }
    }

    (name, groups)
}

fn apply_indexes(found: Resolved, groups: &[Vec<usize>]) -> Option<Resolved> {
    if groups.is_empty() {
        return Some(found);
    }

    let mut current = found.into_value();
    for group in groups {
        let Value::Array(items) = current else {
            return None;
        };
        current = match group.as_slice() {
            [index] => items.get(*index)?.clone(),
            indexes => Value::Array(
                indexes
                    .iter()
                    .map(|index| items.get(*index).cloned())
                    .collect::<Option<Vec<_>>>()?,
            ),
        };
    }

    Some(Resolved::Value(current))
}

/// Turn a resolved `[a, b, c]` string into a list of trimmed tokens.
///
/// Only applied to strings that went through substitution.
pub fn bracket_literal_to_list(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let inner = trimmed.strip_prefix('[')?.strip_suffix(']')?;
    if inner.trim().is_empty() {
        return Some(Value::Array(Vec::new()));
    }
    Some(Value::Array(
        inner
            .split(',')
            .map(|token| Value::String(token.trim().to_string()))
            .collect(),
    ))
}
