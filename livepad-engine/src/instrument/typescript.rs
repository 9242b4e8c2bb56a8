//! TypeScript type stripping
//!
//! Removes type-level syntax and lowers `enum` and `namespace` so the output
//! runs as plain JavaScript. Removed spans keep their line breaks.

use super::edit::Edits;
use super::javascript::{
    at_statement_start, continues, continues_member, is_keyword, statement_end, strip_exports,
};
use super::lexer::{tokenize, Dialect, Lexed, TokenKind};
use super::first_diagnostic;
use crate::error::TranspileError;
use std::collections::HashSet;

const PARAM_MODIFIERS: &[&str] = &["public", "private", "protected", "readonly", "override"];

const MEMBER_MODIFIERS: &[&str] = &[
    "public", "private", "protected", "readonly", "abstract", "override", "declare",
];

const KEPT_MEMBER_MODIFIERS: &[&str] = &["static", "async", "get", "set", "accessor"];

const TYPE_PREFIXES: &[&str] = &["keyof", "typeof", "readonly", "unique", "infer", "asserts", "new", "abstract"];

/// Tokens allowed between the angle brackets of a type argument list
fn is_type_argument_token(text: &str, kind: TokenKind) -> bool {
    match kind {
        TokenKind::Ident | TokenKind::String | TokenKind::Number | TokenKind::Template => true,
        TokenKind::Punct => matches!(
            text,
            "," | "." | "[" | "]" | "(" | ")" | "{" | "}" | "|" | "&" | "<" | ">" | ">>" | ">>>"
                | ":" | ";" | "?" | "=>" | "=" | "..." | "-"
        ),
        TokenKind::Regex => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    Function,
    Method,
    Arrow,
    Catch,
}

pub(super) fn strip_types(code: &str) -> Result<String, TranspileError> {
    let lexed = tokenize(code, Dialect::Script);
    if let Some(err) = first_diagnostic(&lexed) {
        return Err(err);
    }
    let mut stripper = Stripper::new(&lexed);
    strip_exports(&lexed, &stripper.pairs, &mut stripper.edits);
    stripper.run()?;
    Ok(stripper.edits.apply(code))
}

struct Stripper<'a, 'l> {
    lx: &'a Lexed<'l>,
    pairs: Vec<Option<usize>>,
    edits: Edits,
    /// Opening parens whose parameter list was already stripped
    handled_params: HashSet<usize>,
    /// Tokens up to this index belong to an import/export clause
    module_clause_end: Option<usize>,
}

impl<'a, 'l> Stripper<'a, 'l> {
    fn new(lx: &'a Lexed<'l>) -> Self {
        Self {
            lx,
            pairs: lx.bracket_pairs(),
            edits: Edits::new(),
            handled_params: HashSet::new(),
            module_clause_end: None,
        }
    }

    fn len(&self) -> usize {
        self.lx.tokens.len()
    }

    fn is(&self, i: usize, text: &str) -> bool {
        self.lx.is(i, text)
    }

    fn text(&self, i: usize) -> &'l str {
        self.lx.text_at(i)
    }

    fn kind(&self, i: usize) -> Option<TokenKind> {
        self.lx.tokens.get(i).map(|t| t.kind)
    }

    fn is_name(&self, i: usize) -> bool {
        self.lx.is_ident(i) && !is_keyword(self.text(i))
    }

    fn newline_before(&self, i: usize) -> bool {
        self.lx.tokens.get(i).is_some_and(|t| t.newline_before)
    }

    fn pair(&self, i: usize) -> Option<usize> {
        self.pairs.get(i).copied().flatten()
    }

    fn error_at(&self, i: usize, message: &str) -> TranspileError {
        let tok = self.lx.tokens.get(i).or(self.lx.tokens.last());
        TranspileError {
            line: tok.map_or(1, |t| t.line),
            column: tok.map_or(1, |t| t.col),
            message: message.to_string(),
        }
    }

    /// Blank tokens `first..=last`
    fn remove(&mut self, first: usize, last: usize) {
        let (start, end) = (self.lx.tokens[first].start, self.lx.tokens[last].end);
        self.edits.remove(self.lx.source, start, end);
    }

    /// Blank a modifier keyword together with the spaces after it
    fn remove_word(&mut self, i: usize) {
        let start = self.lx.tokens[i].start;
        let end = match self.lx.tokens.get(i + 1) {
            Some(next) if !next.newline_before => next.start,
            _ => self.lx.tokens[i].end,
        };
        self.edits.remove(self.lx.source, start, end);
    }

    fn run(&mut self) -> Result<(), TranspileError> {
        let mut i = 0;
        while i < self.len() {
            let next = self.step(i)?;
            i = next.max(i + 1);
        }
        Ok(())
    }

    fn step(&mut self, i: usize) -> Result<usize, TranspileError> {
        let text = self.text(i);
        match self.kind(i) {
            Some(TokenKind::Ident) => {
                if at_statement_start(self.lx, i) || self.after_export(i) {
                    if let Some(next) = self.statement_form(i)? {
                        return Ok(next);
                    }
                }
                self.ident(i, text)
            }
            Some(TokenKind::Punct) => Ok(self.punct(i, text)),
            _ => Ok(i + 1),
        }
    }

    /// First token of an `export`ed declaration
    fn after_export(&self, i: usize) -> bool {
        i > 0 && self.is(i - 1, "export") && at_statement_start(self.lx, i - 1)
    }

    /// Declarations that only exist at statement start
    fn statement_form(&mut self, i: usize) -> Result<Option<usize>, TranspileError> {
        let next = match self.text(i) {
            "interface" if self.is_name(i + 1) => {
                let mut j = i + 2;
                while j < self.len() && !self.is(j, "{") {
                    j = if self.is(j, "<") {
                        self.skip_angle(j).unwrap_or(j + 1)
                    } else {
                        j + 1
                    };
                }
                let close = self
                    .pair(j)
                    .ok_or_else(|| self.error_at(i, "Expected interface body"))?;
                self.remove(i, close);
                close + 1
            }
            "type" if self.is_name(i + 1) && (self.is(i + 2, "=") || self.is(i + 2, "<")) => {
                let mut j = i + 2;
                if self.is(j, "<") {
                    j = self
                        .skip_angle(j)
                        .ok_or_else(|| self.error_at(j, "Unterminated type parameters"))?;
                }
                if !self.is(j, "=") {
                    return Err(self.error_at(j, "Expected '=' in type alias"));
                }
                let end = self.skip_type(j + 1);
                let last = if self.is(end, ";") { end } else { end - 1 };
                self.remove(i, last);
                last + 1
            }
            "declare" if self.lx.is_ident(i + 1) && !self.newline_before(i + 1) => {
                let end = statement_end(self.lx, &self.pairs, i);
                self.remove(i, end);
                end + 1
            }
            "import" if self.is(i + 1, "type") && !self.is(i + 2, "(") => {
                let end = statement_end(self.lx, &self.pairs, i);
                self.remove(i, end);
                end + 1
            }
            "type" if self.is(i + 1, "{") && self.after_export(i) => {
                let end = statement_end(self.lx, &self.pairs, i);
                self.remove(i, end);
                end + 1
            }
            "import" => {
                self.module_clause_end = Some(statement_end(self.lx, &self.pairs, i));
                return Ok(None);
            }
            "export" => {
                if matches!(self.text(i + 1), "{" | "*") {
                    self.module_clause_end = Some(statement_end(self.lx, &self.pairs, i));
                }
                return Ok(None);
            }
            "namespace" | "module" if self.is_name(i + 1) && matches!(self.text(i + 2), "{" | ".") => {
                self.lower_namespace(i)?
            }
            "abstract" if self.is(i + 1, "class") => {
                self.remove_word(i);
                i + 1
            }
            "enum" if self.is_name(i + 1) => self.lower_enum(i, i)?,
            "const" if self.is(i + 1, "enum") && self.is_name(i + 2) => self.lower_enum(i, i + 1)?,
            _ => return Ok(None),
        };
        Ok(Some(next))
    }

    fn ident(&mut self, i: usize, text: &str) -> Result<usize, TranspileError> {
        match text {
            "class" => return Ok(self.class(i)),
            "function" => {
                let mut j = i + 1;
                if self.is(j, "*") {
                    j += 1;
                }
                if self.lx.is_ident(j) {
                    j += 1;
                }
                if self.is(j, "<") {
                    if let Some(end) = self.skip_angle(j) {
                        self.remove(j, end - 1);
                        j = end;
                    }
                }
                if self.is(j, "(") {
                    self.params(j, ParamKind::Function, i);
                }
                return Ok(i + 1);
            }
            "let" | "const" | "var" => {
                self.declaration(i);
                return Ok(i + 1);
            }
            "catch" if self.is(i + 1, "(") => {
                self.params(i + 1, ParamKind::Catch, i);
                return Ok(i + 1);
            }
            "as" | "satisfies" if self.is_cast(i) => {
                let end = if self.is(i + 1, "const") {
                    i + 2
                } else {
                    self.skip_type(i + 1)
                };
                if end > i + 1 {
                    let start = self.lx.tokens[i - 1].end;
                    let stop = self.lx.tokens[end - 1].end;
                    self.edits.remove(self.lx.source, start, stop);
                    return Ok(end);
                }
                return Ok(i + 1);
            }
            _ => {}
        }

        if is_keyword(text) {
            return Ok(i + 1);
        }

        // generic arguments on calls and `new`
        if self.is(i + 1, "<") && self.lx.tokens[i + 1].start == self.lx.tokens[i].end {
            if let Some(end) = self.skip_angle(i + 1) {
                let after_new = i > 0 && self.is(i - 1, "new");
                let type_like = (i + 2..end - 1)
                    .all(|k| is_type_argument_token(self.text(k), self.lx.tokens[k].kind));
                if type_like && (self.is(end, "(") || after_new) {
                    self.remove(i + 1, end - 1);
                    if self.is(end, "(") {
                        self.maybe_method(i, end);
                    }
                    return Ok(end);
                }
            }
        }

        if self.is(i + 1, "(") {
            self.maybe_method(i, i + 1);
        }
        Ok(i + 1)
    }

    /// `name(...) {` or `name(...): T {` declares a method
    fn maybe_method(&mut self, name: usize, open: usize) {
        let Some(close) = self.pair(open) else {
            return;
        };
        let mut after = close + 1;
        if self.is(after, ":") {
            after = self.skip_type(after + 1);
        }
        if self.is(after, "{") {
            self.params(open, ParamKind::Method, name);
        }
    }

    fn punct(&mut self, i: usize, text: &str) -> usize {
        match text {
            "(" => {
                if let Some(close) = self.pair(i) {
                    let arrow = self.is(close + 1, "=>")
                        || (self.is(close + 1, ":") && self.is(self.skip_type(close + 2), "=>"));
                    if arrow {
                        self.params(i, ParamKind::Arrow, i);
                    }
                }
            }
            "!" => {
                let prev_ends_value = i > 0
                    && (self.is_name(i - 1) || matches!(self.text(i - 1), ")" | "]"))
                    && self.lx.tokens[i - 1].end == self.lx.tokens[i].start;
                if prev_ends_value && !self.is(i + 1, "=") {
                    self.remove(i, i);
                }
            }
            "<" => {
                // `<T>(x: T) => x`
                let expression_start = i == 0
                    || matches!(self.text(i - 1), "=" | "(" | "," | ":" | "?" | "=>" | "return");
                if expression_start {
                    if let Some(end) = self.skip_angle(i) {
                        if let Some(close) = self.is(end, "(").then(|| self.pair(end)).flatten() {
                            if self.is(close + 1, "=>") || self.is(close + 1, ":") {
                                self.remove(i, end - 1);
                                return end;
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        i + 1
    }

    /// `as`/`satisfies` directly after an expression-ending token on the same line
    fn is_cast(&self, i: usize) -> bool {
        if i == 0 || self.newline_before(i) {
            return false;
        }
        if self.module_clause_end.is_some_and(|end| i <= end) {
            return false;
        }
        let prev = i - 1;
        match self.kind(prev) {
            Some(TokenKind::Ident) => !is_keyword(self.text(prev)) || self.is(prev, "this"),
            Some(TokenKind::Punct) => matches!(self.text(prev), ")" | "]" | "}" | "!"),
            Some(_) => true,
            None => false,
        }
    }

    /// Index after the type starting at `i`; `i` itself when no type is there
    fn skip_type(&self, mut i: usize) -> usize {
        if self.is(i, "|") || self.is(i, "&") {
            i += 1;
        }
        loop {
            let next = self.skip_type_operand(i);
            if next == i {
                return i;
            }
            i = next;
            if self.is(i, "|") || self.is(i, "&") {
                i += 1;
                continue;
            }
            if self.is(i, "extends") && !self.newline_before(i) {
                i = self.skip_type(i + 1);
                if self.is(i, "?") {
                    i = self.skip_type(i + 1);
                    if self.is(i, ":") {
                        i = self.skip_type(i + 1);
                    }
                }
                return i;
            }
            if self.is(i, "is") && !self.newline_before(i) {
                return self.skip_type(i + 1);
            }
            return i;
        }
    }

    fn skip_type_operand(&self, start: usize) -> usize {
        let mut i = start;
        while TYPE_PREFIXES.contains(&self.text(i)) && i + 1 < self.len() {
            let next = self.text(i + 1);
            if matches!(next, "," | ")" | "]" | ">" | "=" | ";" | "|" | "&") {
                break;
            }
            i += 1;
        }
        if i >= self.len() {
            return start;
        }

        match (self.kind(i), self.text(i)) {
            (Some(TokenKind::Punct), "(") => {
                let Some(close) = self.pair(i) else {
                    return start;
                };
                i = close + 1;
                if self.is(i, "=>") {
                    return self.skip_type(i + 1);
                }
            }
            (Some(TokenKind::Punct), "{" | "[") => match self.pair(i) {
                Some(close) => i = close + 1,
                None => return start,
            },
            (Some(TokenKind::Punct), "<") => {
                let Some(end) = self.skip_angle(i) else {
                    return start;
                };
                let Some(close) = self.is(end, "(").then(|| self.pair(end)).flatten() else {
                    return start;
                };
                if !self.is(close + 1, "=>") {
                    return start;
                }
                return self.skip_type(close + 2);
            }
            (Some(TokenKind::Punct), "-") if self.kind(i + 1) == Some(TokenKind::Number) => {
                i += 2;
            }
            (Some(TokenKind::Ident), _) => {
                i += 1;
                while self.is(i, ".") && self.lx.is_ident(i + 1) {
                    i += 2;
                }
            }
            (Some(TokenKind::Number | TokenKind::String | TokenKind::Template), _) => i += 1,
            _ => return start,
        }

        loop {
            if self.is(i, "<") && !self.newline_before(i) {
                if let Some(end) = self.skip_angle(i) {
                    i = end;
                    continue;
                }
            }
            if self.is(i, "[") && !self.newline_before(i) {
                if let Some(close) = self.pair(i) {
                    i = close + 1;
                    continue;
                }
            }
            return i;
        }
    }

    /// Index after the angle-bracket group opening at `i`
    fn skip_angle(&self, i: usize) -> Option<usize> {
        let mut depth = 0i32;
        let mut j = i;
        while j < self.len() {
            match self.text(j) {
                "<" => depth += 1,
                ">" => depth -= 1,
                ">>" => depth -= 2,
                ">>>" => depth -= 3,
                "(" | "[" | "{" => j = self.pair(j)?,
                ";" | ")" | "]" | "}" | "&&" | "||" => return None,
                _ => {}
            }
            if depth <= 0 {
                return Some(j + 1);
            }
            j += 1;
        }
        None
    }

    /// Annotations on `let`/`const`/`var` bindings
    fn declaration(&mut self, keyword: usize) {
        let mut j = keyword + 1;
        loop {
            if self.lx.is_ident(j) {
                j += 1;
            } else if matches!(self.text(j), "{" | "[") {
                match self.pair(j) {
                    Some(close) => j = close + 1,
                    None => return,
                }
            } else {
                return;
            }

            if self.is(j, "!") && self.is(j + 1, ":") {
                self.remove(j, j);
                j += 1;
            }
            if self.is(j, ":") {
                let end = self.skip_type(j + 1);
                if end > j + 1 {
                    self.remove(j, end - 1);
                }
                j = end;
            }
            if self.is(j, "=") {
                j += 1;
                while j < self.len() && !self.is(j, ",") && !self.is(j, ";") {
                    if self.newline_before(j) && !continues(self.lx, j - 1, j) {
                        return;
                    }
                    j = match self.text(j) {
                        "(" | "[" | "{" => match self.pair(j) {
                            Some(close) => close + 1,
                            None => return,
                        },
                        _ => j + 1,
                    };
                }
            }
            if !self.is(j, ",") {
                return;
            }
            j += 1;
        }
    }

    /// Strip a parameter list and the return type after it
    fn params(&mut self, open: usize, kind: ParamKind, decl_start: usize) {
        if !self.handled_params.insert(open) {
            return;
        }
        let Some(close) = self.pair(open) else {
            return;
        };
        let mut properties = Vec::new();
        let mut j = open + 1;

        while j < close {
            let segment = j;
            let mut has_modifier = false;
            while PARAM_MODIFIERS.contains(&self.text(j))
                && (self.lx.is_ident(j + 1) || matches!(self.text(j + 1), "{" | "["))
            {
                self.remove_word(j);
                has_modifier = true;
                j += 1;
            }

            // `this: Type`
            if self.is(j, "this") && self.is(j + 1, ":") {
                let mut end = self.skip_type(j + 2);
                if self.is(end, ",") {
                    end += 1;
                }
                self.remove(j, end - 1);
                j = end;
                continue;
            }

            if self.is(j, "...") {
                j += 1;
            }
            let name = self.lx.is_ident(j).then(|| self.text(j));
            j = match self.text(j) {
                "{" | "[" => self.pair(j).map_or(j + 1, |c| c + 1),
                _ => j + 1,
            };
            if self.is(j, "?") {
                self.remove(j, j);
                j += 1;
            }
            if self.is(j, ":") {
                let end = self.skip_type(j + 1);
                if end > j + 1 {
                    self.remove(j, end - 1);
                }
                j = end;
            }
            if self.is(j, "=") {
                while j < close && !self.is(j, ",") {
                    j = match self.text(j) {
                        "(" | "[" | "{" => self.pair(j).map_or(j + 1, |c| c + 1),
                        _ => j + 1,
                    };
                }
            }
            if has_modifier && kind == ParamKind::Method {
                if let Some(name) = name {
                    properties.push(name);
                }
            }
            if self.is(j, ",") {
                j += 1;
            } else if j == segment {
                j += 1;
            } else if j < close {
                // unrecognised parameter syntax, skip to the next comma
                while j < close && !self.is(j, ",") {
                    j += 1;
                }
            }
        }

        let mut after = close + 1;
        if kind != ParamKind::Catch && self.is(after, ":") {
            let end = self.skip_type(after + 1);
            if end > after + 1 {
                self.remove(after, end - 1);
            }
            after = end;
        }

        // overload signature without a body
        if kind == ParamKind::Function && !self.is(after, "{") {
            let end = if self.is(after, ";") { after } else { after - 1 };
            self.remove(decl_start, end);
            return;
        }

        if !properties.is_empty() && self.is(after, "{") {
            self.assign_parameter_properties(after, &properties);
        }
    }

    /// `constructor(private x)` also stores `x` on the instance
    fn assign_parameter_properties(&mut self, body: usize, names: &[&str]) {
        let Some(body_close) = self.pair(body) else {
            return;
        };
        let mut at = self.lx.tokens[body].end;
        let mut separator = "";
        let mut j = body + 1;
        while j < body_close {
            if self.is(j, "super") && self.is(j + 1, "(") {
                if let Some(call_close) = self.pair(j + 1) {
                    if self.is(call_close + 1, ";") {
                        at = self.lx.tokens[call_close + 1].end;
                    } else {
                        at = self.lx.tokens[call_close].end;
                        separator = ";";
                    }
                }
                break;
            }
            j = match self.text(j) {
                "(" | "[" | "{" => self.pair(j).map_or(j + 1, |c| c + 1),
                _ => j + 1,
            };
        }
        let assignments: String = names
            .iter()
            .map(|name| format!(" this.{name} = {name};"))
            .collect();
        self.edits.open(at, format!("{separator}{assignments}"));
    }

    /// Header and members of a class; returns where scanning resumes
    fn class(&mut self, i: usize) -> usize {
        let mut j = i + 1;
        if self.is_name(j) && !matches!(self.text(j), "implements") {
            j += 1;
        }
        if self.is(j, "<") {
            if let Some(end) = self.skip_angle(j) {
                self.remove(j, end - 1);
                j = end;
            }
        }
        if self.is(j, "extends") {
            j += 1;
            while j < self.len() && !self.is(j, "{") && !self.is(j, "implements") {
                if self.is(j, "<") {
                    if let Some(end) = self.skip_angle(j) {
                        if self.is(end, "{") || self.is(end, "implements") {
                            self.remove(j, end - 1);
                            j = end;
                            continue;
                        }
                    }
                }
                j = match self.text(j) {
                    "(" | "[" => self.pair(j).map_or(j + 1, |c| c + 1),
                    _ => j + 1,
                };
            }
        }
        if self.is(j, "implements") {
            let mut k = j;
            while k < self.len() && !self.is(k, "{") {
                k += 1;
            }
            if k > j {
                self.remove(j, k - 1);
            }
            j = k;
        }
        let Some(close) = self.is(j, "{").then(|| self.pair(j)).flatten() else {
            return i + 1;
        };
        self.class_members(j, close);
        j + 1
    }

    /// Inclusive end of a class member whose tokens run through `last`
    fn member_end(&self, mut last: usize, limit: usize) -> usize {
        loop {
            let next = last + 1;
            if next >= limit {
                return last;
            }
            if self.is(next, ";") {
                return next;
            }
            if !continues_member(self.lx, last, next) {
                return last;
            }
            last = match self.text(next) {
                "(" | "[" | "{" => self.pair(next).unwrap_or(next),
                _ => next,
            };
        }
    }

    fn class_members(&mut self, open: usize, close: usize) {
        let mut j = open + 1;
        while j < close {
            if self.is(j, ";") {
                j += 1;
                continue;
            }
            let member = j;

            while self.is(j, "@") {
                j += 1;
                while self.lx.is_ident(j) || self.is(j, ".") {
                    j += 1;
                }
                if self.is(j, "(") {
                    j = self.pair(j).map_or(j + 1, |c| c + 1);
                }
            }

            // modifiers are only blanked once the member is known to survive
            let mut modifiers = Vec::new();
            let mut type_only = false;
            loop {
                let word = self.text(j);
                let removable = MEMBER_MODIFIERS.contains(&word);
                let kept = KEPT_MEMBER_MODIFIERS.contains(&word);
                let names_follow = self.lx.is_ident(j + 1)
                    || matches!(self.text(j + 1), "[" | "*")
                    || matches!(self.kind(j + 1), Some(TokenKind::String | TokenKind::Number));
                if !(removable || kept) || !names_follow || j + 1 >= close {
                    break;
                }
                if removable {
                    type_only |= matches!(word, "abstract" | "declare");
                    modifiers.push(j);
                }
                j += 1;
            }

            // static initialization block
            if self.is(j, "{") {
                j = self.pair(j).map_or(j + 1, |c| c + 1);
                continue;
            }

            // index signature
            if self.is(j, "[") && self.lx.is_ident(j + 1) && self.is(j + 2, ":") {
                let last = self.member_end(self.pair(j).unwrap_or(j), close);
                self.remove(member, last);
                j = last + 1;
                continue;
            }

            if self.is(j, "*") {
                j += 1;
            }
            let name = j;
            j = match self.text(j) {
                "[" => self.pair(j).map_or(j + 1, |c| c + 1),
                _ => j + 1,
            };
            let optional = (self.is(j, "?") || (self.is(j, "!") && self.is(j + 1, ":"))).then_some(j);
            if optional.is_some() {
                j += 1;
            }
            let generics = if self.is(j, "<") {
                self.skip_angle(j).map(|end| {
                    let span = (j, end - 1);
                    j = end;
                    span
                })
            } else {
                None
            };

            if self.is(j, "(") {
                let paren_close = self.pair(j).unwrap_or(j);
                let mut after = paren_close + 1;
                if self.is(after, ":") {
                    after = self.skip_type(after + 1);
                }
                if self.is(after, "{") && !type_only {
                    self.remove_member_syntax(&modifiers, optional, generics);
                    self.params(j, ParamKind::Method, name);
                    j = self.pair(after).map_or(after + 1, |c| c + 1);
                } else {
                    let last = self.member_end(after.saturating_sub(1).max(paren_close), close);
                    self.remove(member, last);
                    j = last + 1;
                }
                continue;
            }

            if type_only {
                let last = self.member_end(j - 1, close);
                self.remove(member, last);
                j = last + 1;
                continue;
            }

            self.remove_member_syntax(&modifiers, optional, generics);
            if self.is(j, ":") {
                let end = self.skip_type(j + 1);
                if end > j + 1 {
                    self.remove(j, end - 1);
                }
                j = end;
            }
            j = self.member_end(j - 1, close) + 1;
        }
    }

    fn remove_member_syntax(
        &mut self,
        modifiers: &[usize],
        optional: Option<usize>,
        generics: Option<(usize, usize)>,
    ) {
        for &m in modifiers {
            self.remove_word(m);
        }
        if let Some(mark) = optional {
            self.remove(mark, mark);
        }
        if let Some((first, last)) = generics {
            self.remove(first, last);
        }
    }

    /// `namespace N { ... }` runs its body in a function over the `N` object.
    /// Exported values are copied onto it when the body finishes.
    fn lower_namespace(&mut self, keyword: usize) -> Result<usize, TranspileError> {
        let name = self.text(keyword + 1);
        let open = keyword + 2;
        if self.is(open, ".") {
            return Err(self.error_at(open, "Dotted namespace names are not supported"));
        }
        let close = self
            .pair(open)
            .ok_or_else(|| self.error_at(open, "Unterminated namespace body"))?;

        let mut exported = Vec::new();
        let mut j = open + 1;
        while j < close {
            if self.is(j, "export") && at_statement_start(self.lx, j) {
                self.exported_names(j + 1, close, &mut exported)?;
            }
            j = match self.text(j) {
                "(" | "[" | "{" => self.pair(j).map_or(j + 1, |c| c + 1),
                _ => j + 1,
            };
        }

        let span_start = self.lx.tokens[keyword].start;
        let span_end = self.lx.tokens[open].end;
        let newlines = self.lx.source[span_start..span_end].matches('\n').count();
        self.edits.replace(
            span_start,
            span_end,
            format!("var {name} = (function ({name}) {{{}", "\n".repeat(newlines)),
        );

        let copies: String = exported
            .iter()
            .map(|export| format!("{name}.{export} = {export}; "))
            .collect();
        let (start, end) = (self.lx.tokens[close].start, self.lx.tokens[close].end);
        self.edits.replace(
            start,
            end,
            format!("; {copies}return {name}; }})({name} || {{}});"),
        );
        Ok(open + 1)
    }

    /// Value names declared by the statement after an `export` keyword
    fn exported_names(
        &self,
        mut k: usize,
        limit: usize,
        names: &mut Vec<&'l str>,
    ) -> Result<(), TranspileError> {
        while matches!(self.text(k), "declare" | "async" | "abstract" | "default") {
            if self.is(k, "declare") {
                return Ok(());
            }
            k += 1;
        }
        match self.text(k) {
            "const" if self.is(k + 1, "enum") => names.extend(self.is_name(k + 2).then(|| self.text(k + 2))),
            "const" | "let" | "var" => self.declarator_names(k + 1, limit, names)?,
            "function" => {
                let at = if self.is(k + 1, "*") { k + 2 } else { k + 1 };
                names.extend(self.is_name(at).then(|| self.text(at)));
            }
            "class" | "enum" | "namespace" | "module" => {
                names.extend(self.is_name(k + 1).then(|| self.text(k + 1)));
            }
            _ => {}
        }
        Ok(())
    }

    /// Names bound by `a = 1, b: T = 2` up to the end of the statement
    fn declarator_names(
        &self,
        mut j: usize,
        limit: usize,
        names: &mut Vec<&'l str>,
    ) -> Result<(), TranspileError> {
        loop {
            if !self.is_name(j) {
                return Err(self.error_at(j, "Exported namespace bindings must be plain names"));
            }
            names.push(self.text(j));
            j += 1;
            if self.is(j, ":") {
                j = self.skip_type(j + 1);
            }
            loop {
                if j >= limit
                    || self.is(j, ";")
                    || (self.newline_before(j) && !continues(self.lx, j - 1, j))
                {
                    return Ok(());
                }
                if self.is(j, ",") {
                    j += 1;
                    break;
                }
                j = match self.text(j) {
                    "(" | "[" | "{" => self.pair(j).map_or(j + 1, |c| c + 1),
                    _ => j + 1,
                };
            }
        }
    }

    /// `enum E { A, B = 5, C = "c" }` becomes a frozen lookup object
    fn lower_enum(&mut self, start: usize, keyword: usize) -> Result<usize, TranspileError> {
        let name = self.text(keyword + 1);
        let open = keyword + 2;
        if !self.is(open, "{") {
            return Err(self.error_at(open, "Expected enum body"));
        }
        let close = self
            .pair(open)
            .ok_or_else(|| self.error_at(open, "Unterminated enum body"))?;

        let mut body = String::new();
        let mut next_value: Option<i64> = Some(0);
        let mut previous_key: Option<String> = None;
        let mut j = open + 1;
        while j < close {
            let key = match self.kind(j) {
                Some(TokenKind::Ident) => self.text(j).to_string(),
                Some(TokenKind::String) => {
                    let raw = self.text(j);
                    raw[1..raw.len().saturating_sub(1).max(1)].to_string()
                }
                _ => return Err(self.error_at(j, "Expected enum member name")),
            };
            let mut k = j + 1;
            let mut initializer = None;
            if self.is(k, "=") {
                let first = k + 1;
                let mut last = first;
                while last < close && !self.is(last, ",") {
                    last = match self.text(last) {
                        "(" | "[" | "{" => self.pair(last).map_or(last + 1, |c| c + 1),
                        _ => last + 1,
                    };
                }
                if last == first {
                    return Err(self.error_at(k, "Expected enum initializer"));
                }
                let source = &self.lx.source[self.lx.tokens[first].start..self.lx.tokens[last - 1].end];
                initializer = Some((source.to_string(), self.kind(first), last - first == 1));
                k = last;
            }

            match initializer {
                Some((source, Some(TokenKind::String | TokenKind::Template), true)) => {
                    body.push_str(&format!("{name}[\"{key}\"] = {source}; "));
                    next_value = None;
                }
                Some((source, kind, single)) => {
                    next_value = (single && kind == Some(TokenKind::Number))
                        .then(|| source.parse::<i64>().ok())
                        .flatten()
                        .map(|v| v + 1);
                    body.push_str(&format!("{name}[{name}[\"{key}\"] = {source}] = \"{key}\"; "));
                }
                None => {
                    let value = match (next_value, &previous_key) {
                        (Some(v), _) => v.to_string(),
                        (None, Some(prev)) => format!("{name}[\"{prev}\"] + 1"),
                        (None, None) => "0".to_string(),
                    };
                    next_value = next_value.map(|v| v + 1);
                    body.push_str(&format!("{name}[{name}[\"{key}\"] = {value}] = \"{key}\"; "));
                }
            }
            previous_key = Some(key);

            if self.is(k, ",") {
                k += 1;
            }
            j = k.max(j + 1);
        }

        let span_start = self.lx.tokens[start].start;
        let span_end = self.lx.tokens[close].end;
        let newlines = self.lx.source[span_start..span_end].matches('\n').count();
        let lowered = format!(
            "const {name} = Object.freeze((function ({name}) {{ {body}return {name}; }})({{}}));{}",
            "\n".repeat(newlines)
        );
        self.edits.replace(span_start, span_end, lowered);
        Ok(close + 1)
    }
}
