//! An incremental GLR parser and concrete syntax tree with structural
//! sharing, modeled on tree-sitter's parsing core.
//!
//! [`Parser`] drives an [`Language`]'s generated tables over an [`Input`]
//! and produces a [`Tree`]; reparsing with an old tree and a set of edits
//! reuses unaffected subtrees instead of rebuilding them.

mod error_cost;
mod language;
mod length;
mod lexer;
mod logger;
mod parser;
mod range;
mod stack;
mod subtree;
mod tree;

pub mod input;

pub use error_cost::{
    ERROR_COST_PER_MISSING_TREE, ERROR_COST_PER_RECOVERY, ERROR_COST_PER_SKIPPED_CHAR,
    ERROR_COST_PER_SKIPPED_LINE, ERROR_COST_PER_SKIPPED_TREE,
};
pub use language::{
    ExternalScanner, FieldMapEntry, FieldMapSlice, Language, LanguageBuilder, LanguageError,
    LexFn, LexMode, ParseAction, StateId, Symbol, SymbolMetadata, TableEntry, BASE_STATE,
    END_SYMBOL, ERROR_REPEAT_SYMBOL, ERROR_STATE, ERROR_SYMBOL, LANGUAGE_VERSION,
    MIN_COMPATIBLE_LANGUAGE_VERSION, check_language_version,
};
pub use length::{max, min, Length, Point};
pub use lexer::Lexer;
pub use logger::{LogType, Logger};
pub use parser::{ParseError, Parser};
pub use range::{IncludedRangeError, Range};
pub use subtree::print_dot_graph;
pub use tree::{changed_ranges, InputEdit, Node, NodeChildIterator, Tree, TreeCursor};

pub use input::{BytesInput, Input, StrInput};
#[cfg(feature = "ropey")]
pub use input::RopeInput;
