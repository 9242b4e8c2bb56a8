//! JavaScript rewriting passes, shared with TypeScript after type stripping

use super::edit::Edits;
use super::lexer::{tokenize, Dialect, Lexed, TokenKind};
use super::{first_diagnostic, InstrumentOptions, CANCEL_CHECK_FUNCTION, DEBUG_CLOSE};
use crate::error::TranspileError;

/// Reserved words and contextual keywords that start non-expression statements
pub(super) const STATEMENT_KEYWORDS: &[&str] = &[
    "var", "let", "const", "function", "class", "if", "else", "for", "while", "do", "switch",
    "try", "catch", "finally", "return", "throw", "break", "continue", "import", "export",
    "debugger", "with", "async", "case", "default", "interface", "enum", "declare",
];

/// Words that never name a value
pub(super) const KEYWORDS: &[&str] = &[
    "var", "let", "const", "function", "class", "if", "else", "for", "while", "do", "switch",
    "try", "catch", "finally", "return", "throw", "break", "continue", "import", "export",
    "debugger", "with", "case", "default", "new", "delete", "typeof", "instanceof", "in", "of",
    "void", "yield", "await", "extends",
];

const ASSIGNMENT_OPS: &[&str] = &[
    "=", "+=", "-=", "*=", "/=", "%=", "**=", "<<=", ">>=", ">>>=", "&=", "|=", "^=", "&&=",
    "||=", "??=",
];

/// Punctuators that cannot end an expression
fn is_open_ended(text: &str, kind: TokenKind) -> bool {
    match kind {
        TokenKind::Punct => !matches!(text, ")" | "]" | "}" | "++" | "--" | ";" | "!"),
        TokenKind::Ident => matches!(
            text,
            "instanceof" | "in" | "of" | "typeof" | "new" | "void" | "delete" | "extends"
        ),
        _ => false,
    }
}

/// Tokens that continue the previous line's expression
fn continues_expression(text: &str, kind: TokenKind) -> bool {
    match kind {
        TokenKind::Punct => !matches!(text, "{" | "!" | "~" | "++" | "--" | "..." | "#" | "@" | ";"),
        TokenKind::Template => true,
        TokenKind::Ident => matches!(text, "instanceof" | "in" | "of"),
        _ => false,
    }
}

/// Whether the token at `next` belongs to the statement ending at `prev`
pub(super) fn continues(lexed: &Lexed<'_>, prev: usize, next: usize) -> bool {
    let (p, n) = (&lexed.tokens[prev], &lexed.tokens[next]);
    if !n.newline_before {
        return true;
    }
    is_open_ended(lexed.text(prev), p.kind) || continues_expression(lexed.text(next), n.kind)
}

/// Like [`continues`], but a new line opening with `(`, `[`, `*` or a template
/// starts the next class member
pub(super) fn continues_member(lexed: &Lexed<'_>, prev: usize, next: usize) -> bool {
    let n = &lexed.tokens[next];
    if n.newline_before
        && (matches!(lexed.text(next), "(" | "[" | "*") || n.kind == TokenKind::Template)
    {
        return is_open_ended(lexed.text(prev), lexed.tokens[prev].kind);
    }
    continues(lexed, prev, next)
}

/// First token of a statement
pub(super) fn at_statement_start(lexed: &Lexed<'_>, index: usize) -> bool {
    if index == 0 {
        return true;
    }
    matches!(lexed.text(index - 1), ";" | "{" | "}") || !continues(lexed, index - 1, index)
}

pub(super) fn is_keyword(text: &str) -> bool {
    KEYWORDS.contains(&text)
}

fn is_opener(text: &str) -> bool {
    matches!(text, "(" | "[" | "{")
}

/// Last token index of the group starting at `index`
fn group_end(lexed: &Lexed<'_>, pairs: &[Option<usize>], index: usize) -> usize {
    if is_opener(lexed.text(index)) {
        pairs[index].unwrap_or(lexed.tokens.len() - 1)
    } else {
        index
    }
}

/// Inclusive end of the statement starting at `start`, brackets skipped
pub(super) fn statement_end(lexed: &Lexed<'_>, pairs: &[Option<usize>], start: usize) -> usize {
    let n = lexed.tokens.len();
    let mut i = start;
    loop {
        if lexed.is(i, ";") {
            return i;
        }
        let last = group_end(lexed, pairs, i);
        if last + 1 >= n || !continues(lexed, last, last + 1) {
            return last;
        }
        i = last + 1;
    }
}

/// Top-level statements as inclusive token ranges
fn top_level_statements(lexed: &Lexed<'_>, pairs: &[Option<usize>]) -> Vec<(usize, usize)> {
    let mut statements = Vec::new();
    let mut i = 0;
    while i < lexed.tokens.len() {
        let end = statement_end(lexed, pairs, i);
        statements.push((i, end));
        i = end + 1;
    }
    statements
}

/// Tokens between `start` and `end` (inclusive) form balanced groups
fn balanced(lexed: &Lexed<'_>, start: usize, end: usize) -> bool {
    let mut depth = 0i32;
    for i in start..=end {
        match lexed.text(i) {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Step 1. `//?` after a declaration reports the declared name, after an
/// expression reports the expression.
pub(super) fn magic_comments(code: &str, options: &InstrumentOptions) -> String {
    let lexed = tokenize(code, Dialect::Script);
    let mut edits = Edits::new();

    for comment in &lexed.comments {
        if !lexed.comment_text(comment).starts_with("//?") {
            continue;
        }
        let line = comment.line;
        let Some(first) = lexed.tokens.iter().position(|t| t.line == line) else {
            continue;
        };
        let Some(last) = lexed
            .tokens
            .iter()
            .rposition(|t| t.line == line && t.end <= comment.start)
        else {
            continue;
        };
        if last < first || !at_statement_start(&lexed, first) || !balanced(&lexed, first, last) {
            continue;
        }

        let has_semi = lexed.is(last, ";");
        if has_semi && last == first {
            continue;
        }
        let end = if has_semi { last - 1 } else { last };
        let head = lexed.text(first);

        let declared = if matches!(head, "const" | "let" | "var")
            && lexed.is_ident(first + 1)
            && (lexed.is(first + 2, "=") || lexed.is(first + 2, ":"))
        {
            Some(lexed.text(first + 1))
        } else if !is_keyword(head)
            && lexed.is_ident(first)
            && ASSIGNMENT_OPS.contains(&lexed.text_at(first + 1))
        {
            Some(head)
        } else {
            None
        };

        if let Some(name) = declared {
            let call = options.debug_call(line, name);
            let text = if has_semi {
                format!(" {};", call)
            } else {
                format!("; {};", call)
            };
            edits.close(lexed.tokens[last].end, text);
        } else if !STATEMENT_KEYWORDS.contains(&head)
            && head != options.debug_function
            && head != "console"
        {
            edits.open(lexed.tokens[first].start, options.debug_open(line));
            edits.close(lexed.tokens[end].end, DEBUG_CLOSE);
        }
    }

    edits.apply(code)
}

/// Remove `export` so snippets run as plain scripts
pub(super) fn strip_exports(lexed: &Lexed<'_>, pairs: &[Option<usize>], edits: &mut Edits) {
    let source = lexed.source;
    for i in 0..lexed.tokens.len() {
        if lexed.text(i) != "export" || !at_statement_start(lexed, i) {
            continue;
        }
        let next = i + 1;
        if lexed.is(next, "{") || lexed.is(next, "*") {
            let end = statement_end(lexed, pairs, i);
            edits.remove(source, lexed.tokens[i].start, lexed.tokens[end].end);
        } else if next < lexed.tokens.len() {
            let through = if lexed.is(next, "default") { next + 1 } else { next };
            if through < lexed.tokens.len() {
                edits.remove(source, lexed.tokens[i].start, lexed.tokens[through].start);
            }
        }
    }
}

/// Step 2 for plain JavaScript
pub(super) fn transpile(code: &str) -> Result<String, TranspileError> {
    let lexed = tokenize(code, Dialect::Script);
    if let Some(err) = first_diagnostic(&lexed) {
        return Err(err);
    }
    let pairs = lexed.bracket_pairs();
    let mut edits = Edits::new();
    strip_exports(&lexed, &pairs, &mut edits);
    Ok(edits.apply(code))
}

/// Steps 3 to 5
pub(super) fn postprocess(code: &str, options: &InstrumentOptions) -> String {
    let lexed = tokenize(code, Dialect::Script);
    let pairs = lexed.bracket_pairs();
    let mut edits = Edits::new();

    rewrite_console(&lexed, options, &mut edits);
    if options.loop_protection {
        LoopGuards::new(&lexed, &pairs, options).inject(&mut edits);
    }
    if options.wrap_expressions {
        wrap_expressions(&lexed, &pairs, options, &mut edits);
    }

    edits.apply(code)
}

fn rewrite_console(lexed: &Lexed<'_>, options: &InstrumentOptions, edits: &mut Edits) {
    let n = lexed.tokens.len();
    for i in 0..n.saturating_sub(3) {
        if lexed.text(i) != "console"
            || !lexed.is(i + 1, ".")
            || !matches!(lexed.text(i + 2), "log" | "info" | "debug")
            || !lexed.is(i + 3, "(")
        {
            continue;
        }
        if i > 0 && matches!(lexed.text(i - 1), "." | "?.") {
            continue;
        }
        let line = lexed.tokens[i].line;
        let replacement = if lexed.is(i + 4, ")") {
            format!("{}({}", options.debug_function, line)
        } else {
            format!("{}({}, ", options.debug_function, line)
        };
        edits.replace(lexed.tokens[i].start, lexed.tokens[i + 3].end, replacement);
    }
}

struct LoopGuards<'a, 'l> {
    lexed: &'a Lexed<'l>,
    pairs: &'a [Option<usize>],
    options: &'a InstrumentOptions,
    counter: usize,
}

/// Token positions of one recognised loop
struct LoopShape {
    /// First token of the loop, or of its label
    start: usize,
    /// Last token of the loop
    end: usize,
    body: Body,
}

enum Body {
    /// Index of the opening brace
    Block(usize),
    /// `while (x);`
    Empty(usize),
    /// Inclusive token range of a brace-less statement
    Statement(usize, usize),
}

impl<'a, 'l> LoopGuards<'a, 'l> {
    fn new(lexed: &'a Lexed<'l>, pairs: &'a [Option<usize>], options: &'a InstrumentOptions) -> Self {
        Self {
            lexed,
            pairs,
            options,
            counter: 0,
        }
    }

    fn inject(&mut self, edits: &mut Edits) {
        let mut do_whiles = Vec::new();
        for i in 0..self.lexed.tokens.len() {
            if do_whiles.contains(&i) || !self.lexed.is_ident(i) {
                continue;
            }
            if i > 0 && matches!(self.lexed.text(i - 1), "." | "?.") {
                continue;
            }
            let shape = match self.lexed.text(i) {
                "for" | "while" => self.for_or_while(i),
                "do" => self.do_while(i).map(|(shape, while_index)| {
                    do_whiles.push(while_index);
                    shape
                }),
                _ => None,
            };
            if let Some(shape) = shape {
                self.guard(shape, edits);
            }
        }
    }

    fn label_start(&self, keyword: usize) -> usize {
        let lx = self.lexed;
        if keyword >= 2
            && lx.is(keyword - 1, ":")
            && lx.is_ident(keyword - 2)
            && !is_keyword(lx.text(keyword - 2))
            && (keyword == 2 || at_statement_start(lx, keyword - 2))
        {
            keyword - 2
        } else {
            keyword
        }
    }

    fn for_or_while(&self, i: usize) -> Option<LoopShape> {
        let close = self.loop_head_close(i)?;
        let (body, end) = self.body_at(close + 1)?;
        Some(LoopShape {
            start: self.label_start(i),
            end,
            body,
        })
    }

    /// Closing paren of `for (...)`, `for await (...)` or `while (...)`
    fn loop_head_close(&self, keyword: usize) -> Option<usize> {
        let mut open = keyword + 1;
        if self.lexed.text(keyword) == "for" && self.lexed.is(open, "await") {
            open += 1;
        }
        self.closing(open, "(")
    }

    /// `do BODY while (...)`, with the index of the trailing `while`
    fn do_while(&self, i: usize) -> Option<(LoopShape, usize)> {
        let (body, while_index, end) = self.do_while_parts(i)?;
        Some((
            LoopShape {
                start: self.label_start(i),
                end,
                body,
            },
            while_index,
        ))
    }

    fn do_while_parts(&self, i: usize) -> Option<(Body, usize, usize)> {
        let lx = self.lexed;
        let (body, body_end) = self.body_at(i + 1)?;
        let while_index = body_end + 1;
        if !lx.is(while_index, "while") {
            return None;
        }
        let cond_close = self.closing(while_index + 1, "(")?;
        let end = if lx.is(cond_close + 1, ";") {
            cond_close + 1
        } else {
            cond_close
        };
        Some((body, while_index, end))
    }

    /// The loop body starting at `start` and its last token
    fn body_at(&self, start: usize) -> Option<(Body, usize)> {
        let end = self.statement_span(start)?;
        let body = match self.lexed.text(start) {
            "{" => Body::Block(start),
            ";" => Body::Empty(start),
            _ => Body::Statement(start, end),
        };
        Some((body, end))
    }

    fn closing(&self, index: usize, open: &str) -> Option<usize> {
        if self.lexed.is(index, open) {
            self.pairs[index]
        } else {
            None
        }
    }

    /// Last token of the statement starting at `start`, nested statements included
    fn statement_span(&self, start: usize) -> Option<usize> {
        let lx = self.lexed;
        if start >= lx.tokens.len() {
            return None;
        }
        match lx.text(start) {
            "{" => self.pairs[start],
            ";" => Some(start),
            "if" => {
                let close = self.closing(start + 1, "(")?;
                let then_end = self.statement_span(close + 1)?;
                if lx.is(then_end + 1, "else") {
                    self.statement_span(then_end + 2)
                } else {
                    Some(then_end)
                }
            }
            "for" | "while" => self.statement_span(self.loop_head_close(start)? + 1),
            "with" => self.statement_span(self.closing(start + 1, "(")? + 1),
            "do" => self.do_while_parts(start).map(|(_, _, end)| end),
            "switch" => {
                let close = self.closing(start + 1, "(")?;
                self.closing(close + 1, "{")
            }
            "try" => {
                let mut end = self.closing(start + 1, "{")?;
                if lx.is(end + 1, "catch") {
                    let mut block = end + 2;
                    if lx.is(block, "(") {
                        block = self.pairs[block]? + 1;
                    }
                    end = self.closing(block, "{")?;
                }
                if lx.is(end + 1, "finally") {
                    end = self.closing(end + 2, "{")?;
                }
                Some(end)
            }
            head if lx.is_ident(start) && lx.is(start + 1, ":") && !is_keyword(head) => {
                self.statement_span(start + 2)
            }
            _ => self.simple_statement_end(start),
        }
    }

    /// Through the terminating `;`, or up to where automatic semicolon
    /// insertion ends the statement
    fn simple_statement_end(&self, start: usize) -> Option<usize> {
        let lx = self.lexed;
        let mut i = start;
        loop {
            let text = lx.text(i);
            if text == ";" {
                return Some(i);
            }
            if matches!(text, ")" | "]" | "}") {
                return (i > start).then(|| i - 1);
            }
            let last = if is_opener(text) { self.pairs[i]? } else { i };
            if last + 1 >= lx.tokens.len() || !continues(lx, last, last + 1) {
                return Some(last);
            }
            i = last + 1;
        }
    }

    fn guard_text(&self, counter: usize) -> String {
        let o = self.options;
        format!(
            "if (++__lp{n} > {max}) throw new RangeError(\"loop limit exceeded\"); \
             if (__lp{n} % {every} === 0 && typeof {cancel} === \"function\" && {cancel}()) \
             throw Object.assign(new Error(\"execution cancelled\"), {{ name: \"CancellationError\" }});",
            n = counter,
            max = o.max_iterations,
            every = o.check_interval.max(1),
            cancel = CANCEL_CHECK_FUNCTION,
        )
    }

    fn guard(&mut self, shape: LoopShape, edits: &mut Edits) {
        let lx = self.lexed;
        self.counter += 1;
        let n = self.counter;
        let guard = self.guard_text(n);

        edits.open(lx.tokens[shape.start].start, format!("{{ let __lp{} = 0; ", n));
        match shape.body {
            Body::Block(open) => edits.open(lx.tokens[open].end, format!(" {}", guard)),
            Body::Empty(semi) => {
                edits.replace(lx.tokens[semi].start, lx.tokens[semi].end, format!("{{ {} }}", guard))
            }
            Body::Statement(first, last) => {
                edits.open(lx.tokens[first].start, format!("{{ {} ", guard));
                edits.close(lx.tokens[last].end, " }");
            }
        }
        edits.close(lx.tokens[shape.end].end, " }");
    }
}

fn wrap_expressions(
    lexed: &Lexed<'_>,
    pairs: &[Option<usize>],
    options: &InstrumentOptions,
    edits: &mut Edits,
) {
    for (first, end) in top_level_statements(lexed, pairs) {
        let last = if lexed.is(end, ";") {
            if end == first {
                continue;
            }
            end - 1
        } else {
            end
        };
        if !is_expression_statement(lexed, pairs, first, last, options) {
            continue;
        }
        let line = lexed.tokens[first].line;
        edits.open(lexed.tokens[first].start, options.debug_open(line));
        edits.close(lexed.tokens[last].end, DEBUG_CLOSE);
    }
}

fn is_expression_statement(
    lexed: &Lexed<'_>,
    pairs: &[Option<usize>],
    first: usize,
    last: usize,
    options: &InstrumentOptions,
) -> bool {
    let head = lexed.text(first);
    let kind = lexed.tokens[first].kind;

    if kind == TokenKind::Ident
        && (STATEMENT_KEYWORDS.contains(&head)
            || head == "delete"
            || head == options.debug_function
            || head == "console")
    {
        return false;
    }
    if kind == TokenKind::Punct && matches!(head, "{" | ";" | "}" | ")" | "]") {
        return false;
    }
    if matches!(head, "++" | "--") || matches!(lexed.text(last), "++" | "--") {
        return false;
    }
    // labels
    if kind == TokenKind::Ident && lexed.is(first + 1, ":") {
        return false;
    }
    // directives
    if first == last && kind == TokenKind::String && lexed.text(first)[1..].starts_with("use ") {
        return false;
    }

    let mut i = first;
    while i <= last {
        if ASSIGNMENT_OPS.contains(&lexed.text(i)) {
            return false;
        }
        i = group_end(lexed, pairs, i) + 1;
    }
    true
}
