//! Python rewriting passes
//!
//! Loop guards keep every line in place by routing iteration through worker
//! helpers instead of inserting statements into loop bodies.

use super::edit::Edits;
use super::lexer::{tokenize, Dialect, Lexed, TokenKind};
use super::{
    first_diagnostic, InstrumentOptions, DEBUG_CLOSE, PY_CHECK_GUARD, PY_ITER_GUARD, PY_REPEAT,
    PY_UNTIL_ASYNC_GUARD, PY_UNTIL_GUARD, PY_WHILE_GUARD,
};
use crate::error::TranspileError;

const STATEMENT_KEYWORDS: &[&str] = &[
    "def", "class", "if", "elif", "else", "for", "while", "with", "try", "except", "finally",
    "import", "from", "return", "pass", "raise", "del", "global", "nonlocal", "assert", "break",
    "continue", "async", "yield", "print",
];

const ASSIGNMENT_OPS: &[&str] = &[
    "=", "+=", "-=", "*=", "/=", "//=", "%=", "**=", "@=", "&=", "|=", "^=", ">>=", "<<=",
];

/// A statement as an inclusive token range
#[derive(Debug, Clone, Copy)]
struct Statement {
    first: usize,
    last: usize,
    /// Starts a logical line
    line_start: bool,
}

/// Statements split at logical line breaks and top-level `;`
fn statements(lexed: &Lexed<'_>) -> Vec<Statement> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut current: Option<Statement> = None;

    for (i, tok) in lexed.tokens.iter().enumerate() {
        let text = lexed.text(i);
        if tok.newline_before && depth == 0 {
            out.extend(current.take());
        }
        if depth == 0 && text == ";" {
            out.extend(current.take());
            continue;
        }
        match current.as_mut() {
            Some(stmt) => stmt.last = i,
            None => {
                current = Some(Statement {
                    first: i,
                    last: i,
                    line_start: tok.newline_before,
                })
            }
        }
        match text {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    out.extend(current);
    out
}

/// Index of the first token in `first..=last` with `text`, outside brackets
fn find_top_level(lexed: &Lexed<'_>, first: usize, last: usize, text: &str) -> Option<usize> {
    let mut depth = 0usize;
    for i in first..=last {
        let t = lexed.text(i);
        if depth == 0 && t == text {
            return Some(i);
        }
        match t {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    None
}

fn has_top_level_assignment(lexed: &Lexed<'_>, first: usize, last: usize) -> Option<usize> {
    ASSIGNMENT_OPS
        .iter()
        .filter_map(|op| find_top_level(lexed, first, last, op))
        .min()
}

/// Step 1. `#?` after an assignment reports the assigned names, after an
/// expression reports the expression.
pub(super) fn magic_comments(code: &str, options: &InstrumentOptions) -> String {
    let lexed = tokenize(code, Dialect::Python);
    let stmts = statements(&lexed);
    let mut edits = Edits::new();

    for comment in &lexed.comments {
        if !lexed.comment_text(comment).starts_with("#?") {
            continue;
        }
        let line = comment.line;
        let on_line: Vec<&Statement> = stmts
            .iter()
            .filter(|s| {
                let last = &lexed.tokens[s.last];
                last.line == line && last.end <= comment.start
            })
            .collect();
        let [stmt] = on_line.as_slice() else {
            continue;
        };
        let (first, last) = (stmt.first, stmt.last);
        if !stmt.line_start || lexed.tokens[first].line != line {
            continue;
        }
        let head = lexed.text(first);
        if STATEMENT_KEYWORDS.contains(&head)
            || head == options.debug_function
            || lexed.is(last, ":")
            || head == "@"
        {
            continue;
        }

        if let Some(op) = has_top_level_assignment(&lexed, first, last) {
            let targets_end = find_top_level(&lexed, first, op, ":").unwrap_or(op);
            if targets_end == first {
                continue;
            }
            let targets = &code[lexed.tokens[first].start..lexed.tokens[targets_end - 1].end];
            let plain = (first..targets_end).all(|i| {
                lexed.tokens[i].kind == TokenKind::Ident || lexed.is(i, ",")
            });
            if !plain {
                continue;
            }
            let reported = if targets.contains(',') {
                format!("({})", targets)
            } else {
                targets.to_string()
            };
            edits.close(
                lexed.tokens[last].end,
                format!("; {}", options.debug_call(line, &reported)),
            );
        } else if find_top_level(&lexed, first, last, ":").is_none() {
            edits.open(lexed.tokens[first].start, options.debug_open(line));
            edits.close(lexed.tokens[last].end, DEBUG_CLOSE);
        }
    }

    edits.apply(code)
}

/// Python needs no transpilation; syntax problems are still reported
pub(super) fn check(code: &str) -> Result<(), TranspileError> {
    let lexed = tokenize(code, Dialect::Python);
    match first_diagnostic(&lexed) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Steps 3 to 5
pub(super) fn postprocess(code: &str, options: &InstrumentOptions) -> String {
    let lexed = tokenize(code, Dialect::Python);
    let stmts = statements(&lexed);
    let mut edits = Edits::new();

    rewrite_print(&lexed, options, &mut edits);
    if options.loop_protection {
        guard_loops(&lexed, &stmts, options, &mut edits);
    }
    if options.wrap_expressions {
        wrap_expressions(&lexed, &stmts, options, &mut edits);
    }

    edits.apply(code)
}

fn rewrite_print(lexed: &Lexed<'_>, options: &InstrumentOptions, edits: &mut Edits) {
    for i in 0..lexed.tokens.len() {
        if lexed.text(i) != "print" || !lexed.is(i + 1, "(") {
            continue;
        }
        if i > 0 && matches!(lexed.text(i - 1), "." | "def") {
            continue;
        }
        let line = lexed.tokens[i].line;
        let replacement = if lexed.is(i + 2, ")") {
            format!("{}({}", options.debug_function, line)
        } else {
            format!("{}({}, ", options.debug_function, line)
        };
        edits.replace(lexed.tokens[i].start, lexed.tokens[i + 1].end, replacement);
    }
}

fn guard_loops(lexed: &Lexed<'_>, stmts: &[Statement], options: &InstrumentOptions, edits: &mut Edits) {
    let limits = format!("{}, {}", options.max_iterations, options.check_interval.max(1));
    let mut counter = 0usize;

    for stmt in stmts.iter().filter(|s| s.line_start) {
        let (first, last) = (stmt.first, stmt.last);
        match lexed.text(first) {
            "for" => {
                let Some(in_kw) = find_top_level(lexed, first + 1, last, "in") else {
                    continue;
                };
                let Some(colon) = find_top_level(lexed, in_kw + 1, last, ":") else {
                    continue;
                };
                if colon == in_kw + 1 {
                    continue;
                }
                edits.open(lexed.tokens[in_kw + 1].start, format!("{}((", PY_ITER_GUARD));
                edits.close(lexed.tokens[colon - 1].end, format!("), {})", limits));
            }
            "while" => {
                let Some(colon) = find_top_level(lexed, first + 1, last, ":") else {
                    continue;
                };
                if colon == first + 1 {
                    continue;
                }
                let uses = |word: &str| (first + 1..colon).any(|i| lexed.text(i) == word);
                if uses("yield") {
                    counter += 1;
                    edits.open(
                        lexed.tokens[first + 1].start,
                        format!("{}({}, (", PY_CHECK_GUARD, counter),
                    );
                    edits.close(lexed.tokens[colon - 1].end, format!("), {})", limits));
                } else if uses(":=") || uses("await") {
                    // a generator expression binds `:=` targets in the enclosing scope
                    let head = if uses("await") {
                        format!("async for __livepad_ in {}(((", PY_UNTIL_ASYNC_GUARD)
                    } else {
                        format!("for __livepad_ in {}(((", PY_UNTIL_GUARD)
                    };
                    edits.replace(lexed.tokens[first].start, lexed.tokens[first + 1].start, head);
                    edits.close(
                        lexed.tokens[colon - 1].end,
                        format!(") for __livepad_ in {}()), {})", PY_REPEAT, limits),
                    );
                } else {
                    edits.replace(
                        lexed.tokens[first].start,
                        lexed.tokens[first + 1].start,
                        format!("for __livepad_ in {}(lambda: (", PY_WHILE_GUARD),
                    );
                    edits.close(lexed.tokens[colon - 1].end, format!("), {})", limits));
                }
            }
            _ => {}
        }
    }
}

fn wrap_expressions(lexed: &Lexed<'_>, stmts: &[Statement], options: &InstrumentOptions, edits: &mut Edits) {
    let mut top_level = false;
    for (n, stmt) in stmts.iter().enumerate() {
        let (first, last) = (stmt.first, stmt.last);
        if stmt.line_start {
            top_level = lexed.tokens[first].col == 1;
        }
        if !top_level {
            continue;
        }
        let head = lexed.text(first);
        let head_kind = lexed.tokens[first].kind;
        if head_kind == TokenKind::Ident
            && (STATEMENT_KEYWORDS.contains(&head) || head == options.debug_function)
        {
            continue;
        }
        if head == "@" || head == "..." || lexed.is(last, ":") {
            continue;
        }
        // a line that opens a compound statement on its own line
        if head_kind == TokenKind::Ident
            && matches!(head, "match" | "case" | "type")
            && lexed.is_ident(first + 1)
        {
            continue;
        }
        // module docstring
        if n == 0 && first == last && head_kind == TokenKind::String {
            continue;
        }
        if has_top_level_assignment(lexed, first, last).is_some()
            || find_top_level(lexed, first, last, ":").is_some()
        {
            continue;
        }
        let line = lexed.tokens[first].line;
        edits.open(lexed.tokens[first].start, options.debug_open(line));
        edits.close(lexed.tokens[last].end, DEBUG_CLOSE);
    }
}
