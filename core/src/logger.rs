//! Debug logging (§10.1). No `log`/`tracing` dependency: callers register a
//! plain closure, mirroring the teacher's `TSLogger` callback.

/// Which phase emitted a log line: the GLR driver (shift/reduce/merge/error
/// decisions) or the lexer (character-level skip/consume).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Parse,
    Lex,
}

pub type Logger<'a> = Box<dyn FnMut(LogType, &str) + 'a>;
