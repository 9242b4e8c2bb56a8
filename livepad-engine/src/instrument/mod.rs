//! Source instrumentation pipeline
//!
//! Rewrites user code so the worker can report values per line and interrupt
//! runaway loops. Every step is token based and preserves line numbers, so a
//! value reported for line N belongs to line N of the editor buffer.
//!
//! Steps, in order:
//! 1. magic comments (`//?`, `#?`) become debug calls
//! 2. transpilation (TypeScript type stripping, `export` removal)
//! 3. console/print calls are routed to the debug function
//! 4. loop guards
//! 5. top-level expression statements are wrapped in debug calls

mod edit;
mod javascript;
mod lexer;
mod python;
mod typescript;

use crate::config::{LanguageConfig, DEFAULT_DEBUG_FUNCTION};
use crate::error::TranspileError;
use crate::types::ExecutionOptions;
use livepad_common::Language;

pub use lexer::{tokenize, Dialect, Token, TokenKind};

/// Predicate the JavaScript worker exposes for cooperative cancellation
pub const CANCEL_CHECK_FUNCTION: &str = "__livepad_cancelled";

/// Python worker helpers used by loop guards
pub const PY_ITER_GUARD: &str = "__livepad_iter";
pub const PY_WHILE_GUARD: &str = "__livepad_while";
pub const PY_UNTIL_GUARD: &str = "__livepad_until";
pub const PY_UNTIL_ASYNC_GUARD: &str = "__livepad_until_async";
pub const PY_REPEAT: &str = "__livepad_repeat";
pub const PY_CHECK_GUARD: &str = "__livepad_check";

/// Knobs for one transform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentOptions {
    pub debug_function: String,
    pub max_iterations: u64,
    pub check_interval: u64,
    pub loop_protection: bool,
    pub magic_comments: bool,
    pub wrap_expressions: bool,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            debug_function: DEFAULT_DEBUG_FUNCTION.to_string(),
            max_iterations: 10_000,
            check_interval: 100,
            loop_protection: true,
            magic_comments: true,
            wrap_expressions: true,
        }
    }
}

impl InstrumentOptions {
    pub fn for_language(config: &LanguageConfig) -> Self {
        Self {
            debug_function: config.debug_function_name.clone(),
            max_iterations: config.max_iterations,
            check_interval: config.check_interval.max(1),
            ..Self::default()
        }
    }

    /// Apply per-request switches
    pub fn with_request(mut self, options: &ExecutionOptions) -> Self {
        self.loop_protection = options.loop_protection;
        self.magic_comments = options.magic_comments;
        self
    }

    fn debug_open(&self, line: u32) -> String {
        format!("{}({}, (", self.debug_function, line)
    }

    fn debug_call(&self, line: u32, args: &str) -> String {
        format!("{}({}, {})", self.debug_function, line, args)
    }
}

const DEBUG_CLOSE: &str = "))";

/// Stateless source-to-source transformer
#[derive(Debug, Clone, Copy, Default)]
pub struct Instrumentor;

impl Instrumentor {
    pub fn new() -> Self {
        Self
    }

    /// Run the whole pipeline.
    ///
    /// A transpile failure is returned for TypeScript. JavaScript and Python
    /// fall back to output rewriting and loop guards on the untranspiled
    /// source.
    pub fn transform(
        &self,
        code: &str,
        language: Language,
        options: &InstrumentOptions,
    ) -> Result<String, TranspileError> {
        let source = self.preprocess(code, language, options);
        match self.transpile(&source, language) {
            Ok(transpiled) => Ok(self.postprocess(&transpiled, language, options)),
            Err(err) => self.recover(&source, language, options, err),
        }
    }

    /// Degraded path after a failed transpile
    pub fn recover(
        &self,
        source: &str,
        language: Language,
        options: &InstrumentOptions,
        err: TranspileError,
    ) -> Result<String, TranspileError> {
        if language.is_strict() {
            return Err(err);
        }
        tracing::warn!(
            %language,
            line = err.line,
            column = err.column,
            error = %err.message,
            "Transpile failed, instrumenting source as-is"
        );
        let degraded = InstrumentOptions {
            wrap_expressions: false,
            ..options.clone()
        };
        Ok(self.postprocess(source, language, &degraded))
    }

    /// Step 1: magic comments
    pub fn preprocess(&self, code: &str, language: Language, options: &InstrumentOptions) -> String {
        if !options.magic_comments {
            return code.to_string();
        }
        match language {
            Language::JavaScript | Language::TypeScript => {
                javascript::magic_comments(code, options)
            }
            Language::Python => python::magic_comments(code, options),
        }
    }

    /// Step 2: language-level transpilation
    pub fn transpile(&self, code: &str, language: Language) -> Result<String, TranspileError> {
        match language {
            Language::TypeScript => typescript::strip_types(code),
            Language::JavaScript => javascript::transpile(code),
            Language::Python => python::check(code).map(|()| code.to_string()),
        }
    }

    /// Steps 3 to 5
    pub fn postprocess(&self, code: &str, language: Language, options: &InstrumentOptions) -> String {
        match language {
            Language::JavaScript | Language::TypeScript => javascript::postprocess(code, options),
            Language::Python => python::postprocess(code, options),
        }
    }
}

fn first_diagnostic(lexed: &lexer::Lexed<'_>) -> Option<TranspileError> {
    lexed
        .diagnostics
        .first()
        .cloned()
        .or_else(|| lexed.bracket_error())
        .map(|d| TranspileError {
            line: d.line,
            column: d.col,
            message: d.message,
        })
}
