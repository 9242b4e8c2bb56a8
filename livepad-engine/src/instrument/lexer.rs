//! Tolerant tokenizer for JavaScript/TypeScript and Python sources
//!
//! The lexer never fails: problems such as an unterminated string are
//! collected as diagnostics and the offending token runs to the end of input.
//! String, template and regex literals are single tokens, so brackets or
//! comment markers inside them never affect later passes.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// JavaScript and TypeScript
    Script,
    Python,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Number,
    String,
    Template,
    Regex,
    Punct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
    /// 1-based line of the first character
    pub line: u32,
    /// 1-based column of the first character
    pub col: u32,
    /// A line break (outside a line continuation) precedes this token
    pub newline_before: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Comment {
    pub start: usize,
    pub end: usize,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: u32,
    pub col: u32,
    pub message: String,
}

/// Tokens plus comments and problems found on the way
#[derive(Debug, Clone)]
pub struct Lexed<'a> {
    pub source: &'a str,
    pub tokens: Vec<Token>,
    pub comments: Vec<Comment>,
    pub diagnostics: Vec<Diagnostic>,
}

impl<'a> Lexed<'a> {
    pub fn text(&self, index: usize) -> &'a str {
        let t = &self.tokens[index];
        &self.source[t.start..t.end]
    }

    /// Text of the token at `index`, or "" past the end
    pub fn text_at(&self, index: usize) -> &'a str {
        if index < self.tokens.len() {
            self.text(index)
        } else {
            ""
        }
    }

    pub fn is(&self, index: usize, text: &str) -> bool {
        index < self.tokens.len() && self.text(index) == text
    }

    pub fn is_ident(&self, index: usize) -> bool {
        index < self.tokens.len() && self.tokens[index].kind == TokenKind::Ident
    }

    pub fn comment_text(&self, comment: &Comment) -> &'a str {
        &self.source[comment.start..comment.end]
    }

    /// Match each bracket with its partner; unmatched brackets map to `None`.
    pub fn bracket_pairs(&self) -> Vec<Option<usize>> {
        let mut pairs = vec![None; self.tokens.len()];
        let mut stack: Vec<usize> = Vec::new();
        for (i, tok) in self.tokens.iter().enumerate() {
            if tok.kind != TokenKind::Punct {
                continue;
            }
            match self.text(i) {
                "(" | "[" | "{" => stack.push(i),
                close @ (")" | "]" | "}") => {
                    let want = match close {
                        ")" => "(",
                        "]" => "[",
                        _ => "{",
                    };
                    if let Some(&open) = stack.last() {
                        if self.text(open) == want {
                            stack.pop();
                            pairs[open] = Some(i);
                            pairs[i] = Some(open);
                        }
                    }
                }
                _ => {}
            }
        }
        pairs
    }

    /// First bracket problem, if any
    pub fn bracket_error(&self) -> Option<Diagnostic> {
        let mut stack: Vec<usize> = Vec::new();
        for (i, tok) in self.tokens.iter().enumerate() {
            if tok.kind != TokenKind::Punct {
                continue;
            }
            let text = self.text(i);
            match text {
                "(" | "[" | "{" => stack.push(i),
                ")" | "]" | "}" => {
                    let expected = stack.pop().map(|open| closer_for(self.text(open)));
                    if expected != Some(text) {
                        return Some(Diagnostic {
                            line: tok.line,
                            col: tok.col,
                            message: format!("Unexpected '{}'", text),
                        });
                    }
                }
                _ => {}
            }
        }
        stack.first().map(|&open| {
            let tok = &self.tokens[open];
            Diagnostic {
                line: tok.line,
                col: tok.col,
                message: format!("'{}' is never closed", self.text(open)),
            }
        })
    }
}

fn closer_for(open: &str) -> &'static str {
    match open {
        "(" => ")",
        "[" => "]",
        _ => "}",
    }
}

const SCRIPT_PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==",
    "!=", "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=",
    "|=", "^=", "**", "<<", ">>",
];

const PYTHON_PUNCTUATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "->", ":=", "==", "!=", "<=", ">=", "**", "//", "<<", ">>",
    "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "@=",
];

/// Keywords after which a `/` starts a regular expression
const REGEX_PREFIX_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

pub fn tokenize(source: &str, dialect: Dialect) -> Lexed<'_> {
    let mut lexer = Lexer {
        src: source,
        pos: 0,
        line: 1,
        line_start: 0,
        dialect,
        tokens: Vec::new(),
        comments: Vec::new(),
        diagnostics: Vec::new(),
        newline_pending: false,
    };
    lexer.run();
    Lexed {
        source,
        tokens: lexer.tokens,
        comments: lexer.comments,
        diagnostics: lexer.diagnostics,
    }
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    line_start: usize,
    dialect: Dialect,
    tokens: Vec<Token>,
    comments: Vec<Comment>,
    diagnostics: Vec<Diagnostic>,
    newline_pending: bool,
}

impl<'a> Lexer<'a> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.src.get(self.pos + offset..)?.chars().next()
    }

    fn starts_with(&self, s: &str) -> bool {
        self.src[self.pos..].starts_with(s)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.line_start = self.pos;
        }
        Some(c)
    }

    fn col_of(&self, pos: usize) -> u32 {
        (self.src[self.line_start.min(pos)..pos].chars().count() + 1) as u32
    }

    fn diagnose(&mut self, line: u32, col: u32, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            line,
            col,
            message: message.into(),
        });
    }

    fn run(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                '\n' => {
                    self.bump();
                    self.newline_pending = true;
                }
                ' ' | '\t' | '\r' | '\u{feff}' | '\u{a0}' => {
                    self.bump();
                }
                '\\' if self.dialect == Dialect::Python
                    && matches!(self.peek_at(1), Some('\n') | Some('\r')) =>
                {
                    // explicit line continuation
                    self.bump();
                    if self.peek() == Some('\r') {
                        self.bump();
                    }
                    self.bump();
                }
                '#' if self.dialect == Dialect::Python => self.line_comment(),
                '/' if self.dialect == Dialect::Script && self.peek_at(1) == Some('/') => {
                    self.line_comment()
                }
                '/' if self.dialect == Dialect::Script && self.peek_at(1) == Some('*') => {
                    self.block_comment()
                }
                _ => self.token(c),
            }
        }
    }

    fn line_comment(&mut self) {
        let start = self.pos;
        let line = self.line;
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
        let end = self.src[start..self.pos].trim_end_matches('\r').len() + start;
        self.comments.push(Comment { start, end, line });
    }

    fn block_comment(&mut self) {
        let start = self.pos;
        let line = self.line;
        let col = self.col_of(start);
        self.bump();
        self.bump();
        loop {
            if self.starts_with("*/") {
                self.bump();
                self.bump();
                break;
            }
            match self.bump() {
                Some('\n') => self.newline_pending = true,
                Some(_) => {}
                None => {
                    self.diagnose(line, col, "Unterminated comment");
                    break;
                }
            }
        }
        self.comments.push(Comment {
            start,
            end: self.pos,
            line,
        });
    }

    fn push(&mut self, kind: TokenKind, start: usize, line: u32, col: u32) {
        self.tokens.push(Token {
            kind,
            start,
            end: self.pos,
            line,
            col,
            newline_before: self.newline_pending || self.tokens.is_empty(),
        });
        self.newline_pending = false;
    }

    fn token(&mut self, c: char) {
        let start = self.pos;
        let line = self.line;
        let col = self.col_of(start);

        if self.dialect == Dialect::Python {
            if let Some(prefix_len) = self.python_string_prefix() {
                for _ in 0..prefix_len {
                    self.bump();
                }
                self.python_string(line, col);
                self.push(TokenKind::String, start, line, col);
                return;
            }
        }

        match c {
            '"' | '\'' if self.dialect == Dialect::Script => {
                self.script_string(c, line, col);
                self.push(TokenKind::String, start, line, col);
            }
            '"' | '\'' => {
                self.python_string(line, col);
                self.push(TokenKind::String, start, line, col);
            }
            '`' if self.dialect == Dialect::Script => {
                self.template(line, col);
                self.push(TokenKind::Template, start, line, col);
            }
            '0'..='9' => {
                self.number();
                self.push(TokenKind::Number, start, line, col);
            }
            '.' if self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) => {
                self.number();
                self.push(TokenKind::Number, start, line, col);
            }
            '/' if self.dialect == Dialect::Script && self.regex_allowed() => {
                if self.regex() {
                    self.push(TokenKind::Regex, start, line, col);
                } else {
                    self.pos = start;
                    self.punct();
                    self.push(TokenKind::Punct, start, line, col);
                }
            }
            c if is_ident_start(c, self.dialect) => {
                while let Some(n) = self.peek() {
                    if is_ident_continue(n, self.dialect) {
                        self.bump();
                    } else {
                        break;
                    }
                }
                self.push(TokenKind::Ident, start, line, col);
            }
            _ => {
                self.punct();
                self.push(TokenKind::Punct, start, line, col);
            }
        }
    }

    /// Length of a Python string prefix (r, b, f, rb, ...) directly followed by a quote
    fn python_string_prefix(&self) -> Option<usize> {
        let rest = &self.src[self.pos..];
        let prefix_len = rest
            .chars()
            .take_while(|c| matches!(c, 'r' | 'R' | 'b' | 'B' | 'f' | 'F' | 'u' | 'U'))
            .count();
        if prefix_len == 0 || prefix_len > 2 {
            return None;
        }
        match rest[prefix_len..].chars().next() {
            Some('"') | Some('\'') => Some(prefix_len),
            _ => None,
        }
    }

    fn script_string(&mut self, quote: char, line: u32, col: u32) {
        self.bump();
        loop {
            match self.peek() {
                Some('\\') => {
                    self.bump();
                    self.bump();
                }
                Some('\n') | None => {
                    self.diagnose(line, col, "Unterminated string literal");
                    return;
                }
                Some(c) => {
                    self.bump();
                    if c == quote {
                        return;
                    }
                }
            }
        }
    }

    fn python_string(&mut self, line: u32, col: u32) {
        let quote = match self.peek() {
            Some(q) => q,
            None => return,
        };
        let triple: String = std::iter::repeat(quote).take(3).collect();
        if self.starts_with(&triple) {
            for _ in 0..3 {
                self.bump();
            }
            loop {
                if self.starts_with(&triple) {
                    for _ in 0..3 {
                        self.bump();
                    }
                    return;
                }
                match self.bump() {
                    Some('\\') => {
                        self.bump();
                    }
                    Some(_) => {}
                    None => {
                        self.diagnose(line, col, "Unterminated triple-quoted string");
                        return;
                    }
                }
            }
        }

        self.bump();
        loop {
            match self.peek() {
                Some('\\') => {
                    self.bump();
                    self.bump();
                }
                Some('\n') | None => {
                    self.diagnose(line, col, "Unterminated string literal");
                    return;
                }
                Some(c) => {
                    self.bump();
                    if c == quote {
                        return;
                    }
                }
            }
        }
    }

    /// Template literal including nested `${ ... }` expressions
    fn template(&mut self, line: u32, col: u32) {
        self.bump();
        loop {
            match self.peek() {
                Some('\\') => {
                    self.bump();
                    self.bump();
                }
                Some('`') => {
                    self.bump();
                    return;
                }
                Some('$') if self.peek_at(1) == Some('{') => {
                    self.bump();
                    self.bump();
                    if !self.template_expression() {
                        self.diagnose(line, col, "Unterminated template literal");
                        return;
                    }
                }
                Some(_) => {
                    self.bump();
                }
                None => {
                    self.diagnose(line, col, "Unterminated template literal");
                    return;
                }
            }
        }
    }

    /// Skip to the `}` closing a template substitution. False at end of input.
    fn template_expression(&mut self) -> bool {
        let mut depth = 1usize;
        while let Some(c) = self.peek() {
            match c {
                '{' => {
                    depth += 1;
                    self.bump();
                }
                '}' => {
                    self.bump();
                    depth -= 1;
                    if depth == 0 {
                        return true;
                    }
                }
                '"' | '\'' => {
                    let (line, col) = (self.line, self.col_of(self.pos));
                    self.script_string(c, line, col);
                }
                '`' => {
                    let (line, col) = (self.line, self.col_of(self.pos));
                    self.template(line, col);
                }
                '/' if self.peek_at(1) == Some('/') => {
                    while let Some(n) = self.peek() {
                        if n == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '/' if self.peek_at(1) == Some('*') => {
                    while self.peek().is_some() && !self.starts_with("*/") {
                        self.bump();
                    }
                    self.bump();
                    self.bump();
                }
                _ => {
                    self.bump();
                }
            }
        }
        false
    }

    fn number(&mut self) {
        let start = self.pos;
        let hex = matches!(self.src[start..].get(..2), Some("0x") | Some("0X"));
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                let exponent = !hex
                    && matches!(c, 'e' | 'E')
                    && matches!(self.peek_at(1), Some('+') | Some('-'));
                self.bump();
                if exponent {
                    self.bump();
                }
            } else {
                break;
            }
        }
    }

    fn regex_allowed(&self) -> bool {
        let Some(prev) = self.tokens.last() else {
            return true;
        };
        let text = &self.src[prev.start..prev.end];
        match prev.kind {
            TokenKind::Punct => !matches!(text, ")" | "]" | "}"),
            TokenKind::Ident => REGEX_PREFIX_KEYWORDS.contains(&text),
            _ => false,
        }
    }

    /// Consume a regex literal. False (nothing consumed permanently) when the
    /// line ends first.
    fn regex(&mut self) -> bool {
        let start = self.pos;
        let (line, line_start) = (self.line, self.line_start);
        self.bump();
        let mut in_class = false;
        loop {
            match self.peek() {
                Some('\\') => {
                    self.bump();
                    if self.peek() == Some('\n') {
                        break;
                    }
                    self.bump();
                }
                Some('[') => {
                    in_class = true;
                    self.bump();
                }
                Some(']') => {
                    in_class = false;
                    self.bump();
                }
                Some('/') if !in_class => {
                    self.bump();
                    while self.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
                        self.bump();
                    }
                    return true;
                }
                Some('\n') | None => break,
                Some(_) => {
                    self.bump();
                }
            }
        }
        self.pos = start;
        self.line = line;
        self.line_start = line_start;
        false
    }

    fn punct(&mut self) {
        let table = match self.dialect {
            Dialect::Script => SCRIPT_PUNCTUATORS,
            Dialect::Python => PYTHON_PUNCTUATORS,
        };
        let rest = &self.src[self.pos..];
        if let Some(p) = table.iter().find(|p| rest.starts_with(**p)) {
            // `?.5` is a conditional followed by a number
            let optional_chain_digit =
                *p == "?." && rest[2..].chars().next().is_some_and(|c| c.is_ascii_digit());
            if !optional_chain_digit {
                self.pos += p.len();
                return;
            }
        }
        self.bump();
    }
}

fn is_ident_start(c: char, dialect: Dialect) -> bool {
    c == '_' || c.is_alphabetic() || (dialect == Dialect::Script && (c == '$' || c == '#'))
}

fn is_ident_continue(c: char, dialect: Dialect) -> bool {
    c == '_' || c.is_alphanumeric() || (dialect == Dialect::Script && c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts<'a>(lexed: &Lexed<'a>) -> Vec<&'a str> {
        (0..lexed.tokens.len()).map(|i| lexed.text(i)).collect()
    }

    #[test]
    fn test_strings_and_templates_are_single_tokens() {
        let lexed = tokenize("log(\"a)b\", `x ${ {a: '}'}.a } y`, 'c')", Dialect::Script);
        assert_eq!(
            texts(&lexed),
            vec!["log", "(", "\"a)b\"", ",", "`x ${ {a: '}'}.a } y`", ",", "'c'", ")"]
        );
        assert!(lexed.diagnostics.is_empty());
    }

    #[test]
    fn test_regex_versus_division() {
        let lexed = tokenize("a = b / c / d; r = /[/)]+/g.test(s)", Dialect::Script);
        let kinds: Vec<TokenKind> = lexed.tokens.iter().map(|t| t.kind).collect();
        assert_eq!(kinds[3], TokenKind::Punct);
        let regex = lexed
            .tokens
            .iter()
            .position(|t| t.kind == TokenKind::Regex)
            .unwrap();
        assert_eq!(lexed.text(regex), "/[/)]+/g");
    }

    #[test]
    fn test_comments_and_lines() {
        let lexed = tokenize("a // one\n/* two\n three */ b", Dialect::Script);
        assert_eq!(texts(&lexed), vec!["a", "b"]);
        assert_eq!(lexed.comments.len(), 2);
        assert_eq!(lexed.comment_text(&lexed.comments[0]), "// one");
        assert_eq!(lexed.tokens[1].line, 3);
        assert!(lexed.tokens[1].newline_before);
    }

    #[test]
    fn test_multiline_template_tracks_lines() {
        let lexed = tokenize("const s = `a\nb\nc`;\nx", Dialect::Script);
        let x = lexed.tokens.last().unwrap();
        assert_eq!(x.line, 4);
    }

    #[test]
    fn test_unterminated_string_is_diagnosed() {
        let lexed = tokenize("let s = 'oops\nlet t = 1", Dialect::Script);
        assert_eq!(lexed.diagnostics.len(), 1);
        assert_eq!(lexed.diagnostics[0].line, 1);
        assert_eq!(lexed.tokens.last().map(|t| t.line), Some(2));
    }

    #[test]
    fn test_python_strings_and_continuations() {
        let src = "x = f'{a}' + r\"\\d\"  # note\ns = \"\"\"a\nb\"\"\"\ny = 1 + \\\n    2";
        let lexed = tokenize(src, Dialect::Python);
        let t = texts(&lexed);
        assert!(t.contains(&"f'{a}'"));
        assert!(t.contains(&"r\"\\d\""));
        assert!(t.contains(&"\"\"\"a\nb\"\"\""));
        let two = lexed.tokens.last().unwrap();
        assert_eq!(lexed.text(lexed.tokens.len() - 1), "2");
        assert!(!two.newline_before);
        assert_eq!(lexed.comments.len(), 1);
    }

    #[test]
    fn test_bracket_diagnostics() {
        let lexed = tokenize("f(a, [b)", Dialect::Script);
        let err = lexed.bracket_error().unwrap();
        assert_eq!(err.message, "Unexpected ')'");
        let lexed = tokenize("{\n  (", Dialect::Script);
        assert_eq!(lexed.bracket_error().unwrap().message, "'{' is never closed");
        let lexed = tokenize("a[(1)]", Dialect::Script);
        assert!(lexed.bracket_error().is_none());
        let pairs = lexed.bracket_pairs();
        assert_eq!(pairs[1], Some(5));
    }
}
