//! Best-effort rewrite of pipeline DSL snippets into interpreter syntax.
//!
//! Handles a handful of common line-level constructs only. Anything it does
//! not recognize is passed through unchanged and fails at evaluation time
//! with the engine's own error message.

/// Lines starting with one of these keywords are statements, never an
/// implicit return value.
const STATEMENT_KEYWORDS: &[&str] = &[
    "return", "let", "const", "var", "if", "else", "for", "while", "do", "switch", "try", "catch",
    "finally", "function", "class", "throw", "println",
];

const STATEMENT_PREFIXES: &[&str] = &["print(", "}", "{", "//", "/*", "*"];

/// Rewrite a pipeline DSL script:
///
/// - `def x = ...` becomes `let x = ...`
/// - `println x` and `println(x)` become `print(x)`
/// - double-quoted strings containing `${` become template literals
/// - a bare last expression at top level is returned
pub fn translate_pipeline_script(script: &str) -> String {
    let mut lines: Vec<String> = script.lines().map(translate_line).collect();
    add_implicit_return(&mut lines);
    lines.join("\n")
}

fn translate_line(line: &str) -> String {
    let indent_len = line.len() - line.trim_start().len();
    let (indent, body) = line.split_at(indent_len);
    let body = body
        .strip_prefix("def ")
        .map_or_else(|| body.to_string(), |rest| format!("let {rest}"));
    let body = rewrite_print(&body);
    format!("{indent}{}", interpolate_strings(&body))
}

fn rewrite_print(body: &str) -> String {
    let body = replace_in_code(body, "println(", "print(");
    for keyword in ["println ", "print "] {
        if let Some(arg) = body.strip_prefix(keyword) {
            let arg = arg.trim().trim_end_matches(';').trim_end();
            if !arg.is_empty() && !arg.starts_with('(') {
                return format!("print({arg})");
            }
        }
    }
    body
}

/// Turn `"... ${x} ..."` into `` `... ${x} ...` ``. Other literals are untouched.
fn interpolate_strings(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '`' => {
                out.push(c);
                copy_literal(&mut chars, c, &mut out);
            }
            '"' => {
                let mut literal = String::new();
                let closed = copy_literal(&mut chars, '"', &mut literal);
                let content = if closed { &literal[..literal.len() - 1] } else { literal.as_str() };
                if closed && content.contains("${") {
                    out.push('`');
                    out.push_str(&content.replace('`', "\\`"));
                    out.push('`');
                } else {
                    out.push('"');
                    out.push_str(&literal);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Replace `from` with `to` where it starts an identifier outside string
/// literals.
fn replace_in_code(body: &str, from: &str, to: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(c) = rest.chars().next() {
        let after_c = &rest[c.len_utf8()..];
        if matches!(c, '\'' | '"' | '`') {
            let mut chars = after_c.chars();
            out.push(c);
            copy_literal(&mut chars, c, &mut out);
            rest = chars.as_str();
            continue;
        }
        let at_boundary = !out.ends_with(|p: char| p.is_ascii_alphanumeric() || p == '_' || p == '$' || p == '.');
        match rest.strip_prefix(from) {
            Some(tail) if at_boundary => {
                out.push_str(to);
                rest = tail;
            }
            _ => {
                out.push(c);
                rest = after_c;
            }
        }
    }
    out
}

/// Copy a literal body up to and including the closing `quote`, honouring
/// backslash escapes. Returns whether the closing quote was found.
fn copy_literal(chars: &mut std::str::Chars<'_>, quote: char, out: &mut String) -> bool {
    while let Some(c) = chars.next() {
        out.push(c);
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else if c == quote {
            return true;
        }
    }
    false
}

fn add_implicit_return(lines: &mut [String]) {
    let Some(last) = lines.iter_mut().rev().find(|l| !l.trim().is_empty()) else {
        return;
    };
    if last.starts_with(char::is_whitespace) {
        return;
    }
    let trimmed = last.trim_end();
    if STATEMENT_KEYWORDS.iter().any(|k| starts_with_keyword(trimmed, k))
        || STATEMENT_PREFIXES.iter().any(|p| trimmed.starts_with(p))
        || trimmed.ends_with('{')
        || trimmed.ends_with(',')
    {
        return;
    }
    *last = format!("return {trimmed}");
}

fn starts_with_keyword(line: &str, keyword: &str) -> bool {
    line.strip_prefix(keyword)
        .is_some_and(|rest| !rest.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '$'))
}
