//! Component C5: the incremental GLR parser driver. Mirrors `parser.c`,
//! `reusable_node.h` and the scheduling/cancellation shape of
//! `ts_parser_parse`.
//!
//! The driver advances every active stack version through shift/reduce
//! actions, consulting the reused tree (if any) before falling back to the
//! lexer, merging and pruning versions after each round, and invoking
//! error recovery when no version can make progress on the real lookahead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error_cost::{
    ERROR_COST_PER_MISSING_TREE, ERROR_COST_PER_RECOVERY, ERROR_COST_PER_SKIPPED_TREE,
};
use crate::input::Input;
use crate::language::{
    Language, LexMode, ParseAction, Symbol, StateId, BASE_STATE, END_SYMBOL, ERROR_REPEAT_SYMBOL,
    ERROR_STATE,
};
use crate::length::Length;
use crate::lexer::Lexer;
use crate::logger::LogType;
use crate::range::{self, Range};
use crate::stack::{Stack, StackSlice, StackVersion, MAX_VERSION_COUNT, MAX_VERSION_COUNT_OVERFLOW};
use crate::subtree::{Subtree, SubtreePool};
use crate::tree::Tree;

/// How many summary entries `ts_stack_record_summary` keeps per version:
/// deep enough to find a usable rewind point in `recover`'s strategy 1
/// without scanning the whole stack.
const MAX_SUMMARY_DEPTH: u32 = 16;

/// How many parse operations pass between cancellation/timeout polls, so
/// the check doesn't dominate hot-loop cost.
const OP_COUNT_PER_TIMEOUT_CHECK: u32 = 100;

/// Above this, two versions competing for the same slot are considered too
/// different in error cost to be worth keeping both; `parser.c` line 47.
const MAX_COST_DIFFERENCE: u32 = 16 * ERROR_COST_PER_SKIPPED_TREE;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no language has been set")]
    NoLanguage,
    #[error("parse was cancelled")]
    Cancelled,
    #[error("parse timed out")]
    Timeout,
}

/// Memoizes the most recently lexed token so that repeated `advance` calls
/// at the same `(byte_index, last_external_token)` skip re-lexing. Mirrors
/// `TokenCache` in `parser.c`.
#[derive(Default)]
struct TokenCache {
    token: Option<Subtree>,
    last_external_token: Option<Subtree>,
    byte_index: u32,
    valid: bool,
}

impl TokenCache {
    fn invalidate(&mut self, pool: &mut SubtreePool) {
        if let Some(t) = self.token.take() {
            pool.release(t);
        }
        if let Some(t) = self.last_external_token.take() {
            pool.release(t);
        }
        self.valid = false;
    }
}

/// One frame of the reusable-node iterator: the subtree currently under
/// consideration, which child of its parent it is, and the byte offset it
/// starts at. Mirrors `StackEntry` in `reusable_node.h`.
struct ReusableEntry {
    tree: Subtree,
    child_index: u32,
    byte_offset: Length,
}

/// Walks the previous parse tree in lockstep with the new parse, handing
/// out subtrees the new parse might be able to reuse instead of re-lexing
/// or re-parsing. Mirrors `ReusableNode` in `reusable_node.h`.
#[derive(Default)]
struct ReusableNode {
    stack: Vec<ReusableEntry>,
    last_external_token: Option<Subtree>,
}

impl ReusableNode {
    fn new(tree: Option<Subtree>) -> Self {
        let mut node = ReusableNode::default();
        node.reset(tree, Length::ZERO);
        node
    }

    fn reset(&mut self, tree: Option<Subtree>, byte_offset: Length) {
        self.stack.clear();
        self.last_external_token = None;
        if let Some(tree) = tree {
            self.stack.push(ReusableEntry { tree, child_index: 0, byte_offset });
        }
    }

    fn clear(&mut self) {
        self.stack.clear();
        self.last_external_token = None;
    }

    fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    fn tree(&self) -> Option<&Subtree> {
        self.stack.last().map(|e| &e.tree)
    }

    fn byte_offset(&self) -> Length {
        self.stack.last().map(|e| e.byte_offset).unwrap_or(Length::ZERO)
    }

    /// Pops back to the next sibling, ascending through parents as needed,
    /// tracking consumed leaves' external-token state along the way.
    fn advance(&mut self) {
        while let Some(top) = self.stack.pop() {
            if top.tree.child_count() == 0 && top.tree.has_external_tokens() {
                self.last_external_token = Some(top.tree.clone());
            }
            let next_offset = top.byte_offset + top.tree.total_size();
            let next_index = top.child_index + 1;
            let Some(parent_entry) = self.stack.last() else { continue };
            let children = parent_entry.tree.children();
            if (next_index as usize) < children.len() {
                self.stack.push(ReusableEntry {
                    tree: children[next_index as usize].clone(),
                    child_index: next_index,
                    byte_offset: next_offset,
                });
                return;
            }
            // No sibling left under this parent: keep popping to find an
            // uncle higher up the tree.
        }
    }

    /// Pushes the first child of the current node, descending one level.
    fn descend(&mut self) -> bool {
        let Some(top) = self.stack.last() else { return false };
        let children = top.tree.children();
        if children.is_empty() {
            return false;
        }
        let byte_offset = top.byte_offset;
        self.stack.push(ReusableEntry { tree: children[0].clone(), child_index: 0, byte_offset });
        true
    }

    /// Descends as far as possible (to the deepest first-leaf), then
    /// advances past it, used once a reused leaf has been consumed.
    fn advance_past_leaf(&mut self) {
        while self.descend() {}
        self.advance();
    }
}

/// The error-cost/precedence/size triple used to order two stack versions
/// for condensation and acceptance. Mirrors the comparison fields pulled
/// out of `Stack` in `ts_parser__compare_versions`.
#[derive(Debug, Clone, Copy)]
struct ErrorStatus {
    cost: u32,
    node_count: u32,
    dynamic_precedence: i32,
    is_in_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorComparison {
    TakeLeft,
    PreferLeft,
    None,
    PreferRight,
    TakeRight,
}

fn compare_error_status(left: ErrorStatus, right: ErrorStatus) -> ErrorComparison {
    if left.is_in_error != right.is_in_error {
        return if left.is_in_error { ErrorComparison::TakeRight } else { ErrorComparison::TakeLeft };
    }
    if left.cost < right.cost {
        ErrorComparison::TakeLeft
    } else if right.cost < left.cost {
        ErrorComparison::TakeRight
    } else if left.dynamic_precedence > right.dynamic_precedence {
        ErrorComparison::PreferLeft
    } else if right.dynamic_precedence > left.dynamic_precedence {
        ErrorComparison::PreferRight
    } else {
        ErrorComparison::None
    }
}

/// The incremental GLR parser. Owns the branching stack, the subtree
/// arena, and the parse configuration (language, timeouts, logging).
/// Mirrors the `TSParser` struct's Rust-shaped surface per §10.4.
pub struct Parser {
    language: Option<Language>,
    stack: Stack,
    pool: SubtreePool,
    logger: Option<Box<dyn FnMut(LogType, &str)>>,
    cancellation_flag: Option<Arc<AtomicBool>>,
    timeout: Option<Duration>,
    included_ranges: Vec<Range>,
    halt_on_error: bool,
    finished_tree: Option<Subtree>,
    operation_count: u32,
    start_time: Option<Instant>,
    in_progress: bool,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            language: None,
            stack: Stack::new(),
            pool: SubtreePool::new(),
            logger: None,
            cancellation_flag: None,
            timeout: None,
            included_ranges: vec![Range::WHOLE_DOCUMENT],
            halt_on_error: false,
            finished_tree: None,
            operation_count: 0,
            start_time: None,
            in_progress: false,
        }
    }

    pub fn set_language(&mut self, language: Language) -> Result<(), crate::language::LanguageError> {
        crate::language::check_language_version(&language)?;
        self.language = Some(language);
        self.reset();
        Ok(())
    }

    pub fn language(&self) -> Option<&Language> {
        self.language.as_ref()
    }

    pub fn set_logger(&mut self, logger: Option<Box<dyn FnMut(LogType, &str)>>) {
        self.logger = logger;
    }

    pub fn set_cancellation_flag(&mut self, flag: Option<Arc<AtomicBool>>) {
        self.cancellation_flag = flag;
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn set_halt_on_error(&mut self, halt: bool) {
        self.halt_on_error = halt;
    }

    pub fn set_included_ranges(&mut self, ranges: &[Range]) -> Result<(), range::IncludedRangeError> {
        range::validate(ranges)?;
        self.included_ranges = if ranges.is_empty() { vec![Range::WHOLE_DOCUMENT] } else { ranges.to_vec() };
        Ok(())
    }

    pub fn included_ranges(&self) -> &[Range] {
        &self.included_ranges
    }

    /// Drops any in-progress parse state and resets the stack to its base.
    pub fn reset(&mut self) {
        self.stack.clear(&mut self.pool);
        if let Some(tree) = self.finished_tree.take() {
            self.pool.release(tree);
        }
        self.in_progress = false;
        self.operation_count = 0;
        self.start_time = None;
    }

    /// Whether a previous `parse` call was interrupted by cancellation or a
    /// timeout and left resumable state behind (§7).
    pub fn has_outstanding_parse(&self) -> bool {
        self.in_progress
    }

    fn log(&mut self, message: &str) {
        if let Some(logger) = self.logger.as_mut() {
            logger(LogType::Parse, message);
        }
    }

    fn check_cancellation(&mut self) -> Result<(), ParseError> {
        self.operation_count += 1;
        if self.operation_count < OP_COUNT_PER_TIMEOUT_CHECK {
            return Ok(());
        }
        self.operation_count = 0;
        if let Some(flag) = &self.cancellation_flag {
            if flag.load(Ordering::SeqCst) {
                return Err(ParseError::Cancelled);
            }
        }
        if let Some(timeout) = self.timeout {
            if let Some(start) = self.start_time {
                if start.elapsed() >= timeout {
                    return Err(ParseError::Timeout);
                }
            }
        }
        Ok(())
    }

    /// Parses `input`, reusing as much of `old_tree` as still applies.
    /// Returns the new tree, or a [`ParseError`] if no language has been
    /// set or the parse was interrupted (in which case the parser remains
    /// resumable: calling `parse` again with the same arguments continues
    /// from where it left off, per §7).
    pub fn parse<I: Input>(&mut self, mut input: I, old_tree: Option<&Tree>) -> Result<Tree, ParseError> {
        let language = self.language.clone().ok_or(ParseError::NoLanguage)?;

        if !self.in_progress {
            self.stack.clear(&mut self.pool);
            self.start_time = Some(Instant::now());
        }
        self.in_progress = true;

        let old_included_ranges = old_tree.map(|t| t.included_ranges().to_vec());
        let reused_root = old_tree.map(|t| self.pool.retain(&t.root_subtree()));
        let mut reusable_node = ReusableNode::new(reused_root);

        let include_difference = match &old_included_ranges {
            Some(old_ranges) => range::symmetric_difference(old_ranges, &self.included_ranges),
            None => Vec::new(),
        };

        let mut lexer = Lexer::new(&mut input, self.included_ranges.clone());

        let result = self.do_parse(&language, &mut lexer, &mut reusable_node, &include_difference);

        if let Some(tree) = reusable_node.last_external_token.take() {
            self.pool.release(tree);
        }
        for entry in reusable_node.stack.drain(..) {
            self.pool.release(entry.tree);
        }

        match result {
            Ok(root) => {
                self.in_progress = false;
                self.start_time = None;
                Ok(Tree::new(root, language, self.included_ranges.clone()))
            }
            Err(e) => Err(e),
        }
    }

    fn do_parse(
        &mut self,
        language: &Language,
        lexer: &mut Lexer<'_>,
        reusable_node: &mut ReusableNode,
        include_difference: &[std::ops::Range<u32>],
    ) -> Result<Subtree, ParseError> {
        let mut cache = TokenCache::default();
        loop {
            self.check_cancellation()?;

            let mut version = 0;
            while version < self.stack.version_count() {
                let advanced =
                    self.advance_version(language, lexer, reusable_node, include_difference, version, &mut cache)?;
                if let Some(tree) = advanced {
                    self.release_cache(&mut cache);
                    return Ok(tree);
                }
                // Versions `advance_version` forks (via reduce/shift
                // ambiguity) are appended to the stack; walk into them too.
                version += 1;
            }

            let resumed = self.condense_stack(language);
            if let Some((version, lookahead)) = resumed {
                self.handle_error(language, lexer, reusable_node, version, lookahead)?;
            }
            if let Some(tree) = self.finished_tree.take() {
                self.release_cache(&mut cache);
                return Ok(tree);
            }
            if self.stack.version_count() == 0 {
                self.release_cache(&mut cache);
                return Ok(self.pool.new_error_leaf(None, Length::ZERO, Length::ZERO, 0, 0));
            }
        }
    }

    fn release_cache(&mut self, cache: &mut TokenCache) {
        cache.invalidate(&mut self.pool);
    }

    /// Drives one stack version forward until it stops being active for
    /// this round (shift/accept/recover consumed it, or it halted).
    /// Returns `Some(tree)` once an `Accept` action produces the final
    /// parse; `None` to keep going.
    fn advance_version(
        &mut self,
        language: &Language,
        lexer: &mut Lexer<'_>,
        reusable_node: &mut ReusableNode,
        include_difference: &[std::ops::Range<u32>],
        version: StackVersion,
        cache: &mut TokenCache,
    ) -> Result<Option<Subtree>, ParseError> {
        loop {
            self.check_cancellation()?;
            if !self.stack.is_active(version) {
                return Ok(None);
            }

            let state = self.stack.state(version);
            let position = self.stack.position(version);

            let (token, is_reused_leaf) =
                self.get_token(language, lexer, reusable_node, include_difference, version, cache, position)?;

            let symbol = if token.is_eof() { END_SYMBOL } else { token.symbol() };
            let entry = language.actions(state, symbol);

            if entry.is_empty() {
                self.pool.release(token);
                if self.breakdown_top_of_stack(language, version) {
                    continue;
                }
                self.log("pause");
                self.stack.pause(version, symbol);
                return Ok(None);
            }

            match entry.actions[0] {
                ParseAction::Shift { state: next_state, extra, .. } => {
                    if entry.actions.len() > 1 {
                        // Ambiguous shift/reduce: fork a version for each
                        // alternative action, keeping `version` on the shift.
                        for action in &entry.actions[1..] {
                            self.fork_action(language, version, token.clone(), *action);
                        }
                    }
                    self.shift(language, version, token, next_state, extra, is_reused_leaf);
                    return Ok(None);
                }
                ParseAction::Reduce { symbol, child_count, production_id, dynamic_precedence } => {
                    self.pool.release(token);
                    for action in &entry.actions[1..] {
                        self.fork_reduce(language, version, *action);
                    }
                    self.reduce(language, version, symbol, child_count, production_id, dynamic_precedence);
                    continue;
                }
                ParseAction::Accept => {
                    self.pool.release(token);
                    return Ok(Some(self.accept(language, version)));
                }
                ParseAction::Recover => {
                    self.pool.release(token);
                    self.recover(language, lexer, reusable_node, version)?;
                    return Ok(None);
                }
            }
        }
    }

    fn fork_action(&mut self, language: &Language, version: StackVersion, token: Subtree, action: ParseAction) {
        let copy = self.stack.copy_version(version);
        match action {
            ParseAction::Shift { state, extra, .. } => {
                self.shift(language, copy, token, state, extra, false);
            }
            _ => {
                self.pool.release(token);
                self.stack.remove_version(&mut self.pool, copy);
            }
        }
    }

    fn fork_reduce(&mut self, language: &Language, version: StackVersion, action: ParseAction) {
        if let ParseAction::Reduce { symbol, child_count, production_id, dynamic_precedence } = action {
            let copy = self.stack.copy_version(version);
            self.reduce(language, copy, symbol, child_count, production_id, dynamic_precedence);
        }
    }

    /// Obtains the next token for `version`: the reused tree first, then
    /// the token cache, then a fresh lex. Returns the retained token plus
    /// whether it came from the reused tree (so the caller can decide
    /// whether to push it as `is_pending`).
    fn get_token(
        &mut self,
        language: &Language,
        lexer: &mut Lexer<'_>,
        reusable_node: &mut ReusableNode,
        include_difference: &[std::ops::Range<u32>],
        version: StackVersion,
        cache: &mut TokenCache,
        position: Length,
    ) -> Result<(Subtree, bool), ParseError> {
        let state = self.stack.state(version);
        let last_external_token = self.stack.last_external_token(version).cloned();

        if let Some(reused) = self.reuse_node(
            language,
            reusable_node,
            include_difference,
            state,
            position,
            last_external_token.as_ref(),
        ) {
            return Ok((reused, true));
        }

        if cache.valid
            && cache.byte_index == position.bytes
            && crate::subtree::external_scanner_state_eq_opt(cache.last_external_token.as_ref(), last_external_token.as_ref())
        {
            return Ok((self.pool.retain(cache.token.as_ref().unwrap()), false));
        }

        let token = self.lex(language, lexer, state, position, last_external_token.as_ref())?;

        cache.invalidate(&mut self.pool);
        cache.token = Some(self.pool.retain(&token));
        cache.last_external_token = last_external_token;
        cache.byte_index = position.bytes;
        cache.valid = true;

        Ok((token, false))
    }

    /// Decides whether the reusable-node iterator currently points at a
    /// leaf the new parse can reuse outright, consuming it from the
    /// iterator and returning a retained copy if so. Mirrors `reuse_node`.
    fn reuse_node(
        &mut self,
        language: &Language,
        reusable_node: &mut ReusableNode,
        include_difference: &[std::ops::Range<u32>],
        state: StateId,
        position: Length,
        last_external_token: Option<&Subtree>,
    ) -> Option<Subtree> {
        loop {
            let candidate = reusable_node.tree()?.clone();
            let node_start = reusable_node.byte_offset();

            if node_start.bytes < position.bytes {
                reusable_node.advance_past_leaf();
                continue;
            }
            if node_start.bytes > position.bytes {
                return None;
            }

            if !crate::subtree::external_scanner_state_eq_opt(
                reusable_node.last_external_token.as_ref(),
                last_external_token,
            ) {
                reusable_node.advance();
                continue;
            }

            let disqualified = candidate.has_changes()
                || candidate.is_error()
                || candidate.is_missing()
                || candidate.fragile_left()
                || candidate.fragile_right();
            if disqualified {
                if reusable_node.descend() {
                    continue;
                }
                reusable_node.advance();
                return None;
            }

            let span = node_start.bytes..(node_start.bytes + candidate.total_size().bytes).max(node_start.bytes + 1);
            if range::intersects(include_difference, span) {
                reusable_node.advance();
                return None;
            }

            if !self.can_reuse_first_leaf(language, state, &candidate) {
                if reusable_node.descend() {
                    continue;
                }
                reusable_node.advance();
                return None;
            }

            reusable_node.advance_past_leaf();
            return Some(self.pool.retain(&candidate));
        }
    }

    /// Mirrors `can_reuse_first_leaf`: the candidate's first leaf's lex mode
    /// must be compatible with `state`'s lex mode (and, if the symbol is the
    /// keyword-capture token, the candidate must not itself be a
    /// keyword-lexed token sitting at a different state), or the leaf must
    /// be EOF, or the state requires no external scanning at all and the
    /// table marks the entry reusable. A symbol with no actions in the
    /// current state is never reusable.
    fn can_reuse_first_leaf(&self, language: &Language, state: StateId, tree: &Subtree) -> bool {
        let first_leaf = tree.first_leaf().unwrap_or_else(|| crate::subtree::FirstLeaf {
            symbol: tree.symbol(),
            parse_state: tree.parse_state(),
        });

        if first_leaf.symbol == END_SYMBOL {
            return true;
        }

        let table_entry = language.actions(state, first_leaf.symbol);
        let current_mode = language.lex_mode_for_state(state);
        let leaf_mode = language.lex_mode_for_state(first_leaf.parse_state);

        if !table_entry.is_empty()
            && leaf_mode == current_mode
            && (Some(first_leaf.symbol) != language.keyword_capture_token()
                || (!tree.is_keyword() && tree.parse_state() == state))
        {
            return true;
        }

        current_mode.external_lex_state == 0 && table_entry.is_reusable
    }

    /// Full token-recognition pipeline: tries the external scanner (if any
    /// token is valid in the current lex mode), then the generated internal
    /// lexer, retrying in error-skipping mode on failure, and finally
    /// re-lexing for a keyword capture. Mirrors `ts_parser__lex`.
    fn lex(
        &mut self,
        language: &Language,
        lexer: &mut Lexer<'_>,
        state: StateId,
        position: Length,
        last_external_token: Option<&Subtree>,
    ) -> Result<Subtree, ParseError> {
        let mode = language.lex_mode_for_state(state);
        lexer.reset(position);
        lexer.start();

        let mut error_start: Option<Length> = None;
        let mut first_error_character: Option<char> = None;
        let mut lookahead_end_byte = 0u32;
        let mut current_mode = mode;

        loop {
            self.check_cancellation()?;

            let external_result = if current_mode.external_lex_state != 0 {
                language.external_scanner().and_then(|scanner| {
                    let mut state_bytes = last_external_token
                        .and_then(Subtree::external_scanner_state)
                        .map(<[u8]>::to_vec)
                        .unwrap_or_default();
                    let valid = language.enabled_external_tokens(current_mode.external_lex_state).unwrap_or_default();
                    scanner.scan(lexer, &mut state_bytes, &valid).then(|| (scanner, state_bytes))
                })
            } else {
                None
            };

            let found = if let Some((scanner, state_bytes)) = external_result {
                lexer.finish(&mut lookahead_end_byte);
                let symbol = lexer.result_symbol();
                let (padding, end) = lexer.token_range();
                let size = end - padding;
                let mut leaf = self.pool.new_leaf(
                    language,
                    symbol,
                    padding,
                    size,
                    lookahead_end_byte.saturating_sub((padding + size).bytes),
                    state,
                    true,
                    false,
                );
                let mut buf = vec![0u8; state_bytes.len() + 64];
                let len = scanner.serialize(&state_bytes, &mut buf);
                buf.truncate(len);
                leaf = self.pool.attach_external_state(leaf, buf);
                Some(leaf)
            } else if current_mode.lex_state != u16::MAX {
                let lex_fn = language.lex_fn();
                if lex_fn(lexer, current_mode.lex_state) {
                    lexer.finish(&mut lookahead_end_byte);
                    let symbol = lexer.result_symbol();
                    let (padding, end) = lexer.token_range();
                    let size = end - padding;
                    Some(self.pool.new_leaf(
                        language,
                        symbol,
                        padding,
                        size,
                        lookahead_end_byte.saturating_sub((padding + size).bytes),
                        state,
                        false,
                        false,
                    ))
                } else {
                    None
                }
            } else {
                None
            };

            match found {
                Some(mut leaf) => {
                    if let Some(capture) = language.keyword_capture_token() {
                        if leaf.symbol() == capture {
                            if let Some(keyword_lex) = language.keyword_lex_fn() {
                                let (start, end) = lexer.token_range();
                                lexer.reset(start);
                                lexer.start();
                                if keyword_lex(lexer, 0) {
                                    let recognized = lexer.result_symbol();
                                    if !language.actions(state, recognized).is_empty() {
                                        leaf = self.pool.set_symbol(leaf, recognized, language);
                                    }
                                }
                                lexer.reset(end);
                            }
                        }
                    }
                    return Ok(leaf);
                }
                None => {
                    if lexer.lookahead() == 0 {
                        let start = error_start.unwrap_or_else(|| lexer.current_position());
                        self.log("lex_error_eof");
                        return Ok(self.pool.new_error_leaf(
                            first_error_character,
                            start,
                            lexer.current_position() - start,
                            0,
                            state,
                        ));
                    }
                    if error_start.is_none() {
                        error_start = Some(lexer.current_position());
                        first_error_character = char::from_u32(lexer.lookahead() as u32);
                        self.log("lex_error");
                    }
                    current_mode = LexMode { lex_state: mode.lex_state, external_lex_state: 0 };
                    lexer.advance(true);
                }
            }
        }
    }

    /// Pushes `token` onto `version`'s stack, transitioning to `next_state`.
    /// Mirrors `ts_parser__shift`, including the extra-token flag toggle.
    fn shift(
        &mut self,
        _language: &Language,
        version: StackVersion,
        mut token: Subtree,
        next_state: StateId,
        extra: bool,
        is_pending: bool,
    ) {
        if token.has_external_tokens() {
            self.stack.set_last_external_token(&mut self.pool, version, Some(self.pool.retain(&token)));
        }
        if extra != token.is_extra() {
            token = self.pool.set_extra(token, extra);
        }
        self.log("shift");
        self.stack.push(version, Some(token), is_pending, next_state);
    }

    /// Pops `child_count` subtrees, builds the reduced node, and pushes it
    /// back with the goto-table's destination state. Mirrors
    /// `ts_parser__reduce`; forks one extra version per revealed slice
    /// beyond the first (merging where possible).
    fn reduce(
        &mut self,
        language: &Language,
        version: StackVersion,
        symbol: Symbol,
        child_count: u8,
        production_id: u16,
        dynamic_precedence: i32,
    ) {
        let slices = self.stack.pop_count(&mut self.pool, version, child_count as u32);
        let mut first_pushed_version: Option<StackVersion> = None;

        for slice in slices {
            let mut children = slice.subtrees;
            if children.is_empty() {
                continue;
            }
            let mut node = self.pool.new_node(language, symbol, std::mem::take(&mut children), production_id);
            node = self.pool.balance(language, node);
            if dynamic_precedence != 0 {
                node = self.add_dynamic_precedence(node, dynamic_precedence);
            }

            let state = self.stack.state(slice.version);
            let next_state = language.goto_state(state, symbol);
            self.stack.push(slice.version, Some(node), true, next_state);

            match first_pushed_version {
                None => first_pushed_version = Some(slice.version),
                Some(first) => {
                    if !self.stack.merge(&mut self.pool, first, slice.version) {
                        // Keep both versions distinct; they'll be reconciled
                        // by the next condensation pass.
                    }
                }
            }
        }
    }

    fn add_dynamic_precedence(&mut self, subtree: Subtree, extra: i32) -> Subtree {
        self.pool.add_dynamic_precedence(subtree, extra)
    }

    /// Pops everything from `version` and returns the finished root,
    /// picking among competing accepted versions by `select_tree`'s
    /// ordering when more than one version reaches `Accept`.
    ///
    /// The popped slice may carry leading/trailing `extra` siblings (e.g. a
    /// top-level comment) alongside the real start-symbol subtree; the root
    /// we hand back always carries the grammar's own symbol, never a
    /// synthetic `ERROR_SYMBOL` wrapper, so splice the non-extra subtree's
    /// own children into the array and rebuild under its own identity.
    fn accept(&mut self, language: &Language, version: StackVersion) -> Subtree {
        let mut slices = self.stack.pop_all(&mut self.pool, version);
        self.log("accept");
        let slice = slices.pop().expect("accept always pops at least one slice");
        for extra in slices {
            for s in extra.subtrees {
                self.pool.release(s);
            }
        }
        let mut children = slice.subtrees;
        if children.len() == 1 {
            let _ = language;
            return children.pop().unwrap();
        }
        let root_index = children
            .iter()
            .rposition(|c| !c.is_extra())
            .expect("accept must pop exactly one non-extra subtree");
        let root = children.remove(root_index);
        let symbol = root.symbol();
        let production_id = root.production_id();
        let root_children: Vec<Subtree> = root.children().iter().map(|c| self.pool.retain(c)).collect();
        self.pool.release(root);
        children.splice(root_index..root_index, root_children);
        self.pool.new_node(language, symbol, children, production_id)
    }

    /// After a parse-table miss, tries every reduce action reachable from
    /// `version` (for `lookahead_symbol`, or all terminals if it's
    /// `END_SYMBOL`/0 meaning "any"), merging resulting versions where
    /// possible. Returns whether some resulting state can shift the real
    /// lookahead. Mirrors `do_all_potential_reductions`.
    fn do_all_potential_reductions(&mut self, language: &Language, version: StackVersion, lookahead_symbol: Symbol) -> bool {
        let mut can_shift = false;
        let mut worklist = vec![version];
        let mut visited_states = Vec::new();

        while let Some(v) = worklist.pop() {
            if !self.stack.is_active(v) {
                continue;
            }
            let state = self.stack.state(v);
            if visited_states.contains(&state) {
                continue;
            }
            visited_states.push(state);

            let symbols: Vec<Symbol> = if lookahead_symbol != END_SYMBOL {
                vec![lookahead_symbol]
            } else {
                (0..language.token_count()).collect()
            };

            for symbol in symbols {
                let entry = language.actions(state, symbol);
                for action in entry.actions {
                    match action {
                        ParseAction::Shift { .. } => can_shift = true,
                        ParseAction::Reduce { symbol: sym, child_count, production_id, dynamic_precedence } => {
                            let copy = self.stack.copy_version(v);
                            self.reduce(language, copy, *sym, *child_count, *production_id, *dynamic_precedence);
                            worklist.push(copy);
                        }
                        _ => {}
                    }
                }
            }
        }

        can_shift
    }

    /// Tries inserting a single missing terminal before `version`'s real
    /// lookahead: if doing so reaches a state with a reduce action for the
    /// lookahead, forks a version with a zero-size missing leaf pushed and
    /// keeps it if `do_all_potential_reductions` shows it helps. Mirrors
    /// `ts_parser__handle_error`'s missing-token pass, followed by
    /// `ts_parser__recover`.
    fn handle_error(
        &mut self,
        language: &Language,
        lexer: &mut Lexer<'_>,
        reusable_node: &mut ReusableNode,
        version: StackVersion,
        lookahead_symbol: Symbol,
    ) -> Result<(), ParseError> {
        self.stack.record_summary(&mut self.pool, version, MAX_SUMMARY_DEPTH);

        if self.do_all_potential_reductions(language, version, END_SYMBOL) {
            // A plain reduction already lets some version shift; nothing
            // more to do here, the outer loop will retry those versions.
        }

        let state = self.stack.state(version);
        for symbol in 0..language.token_count() {
            if symbol == lookahead_symbol {
                continue;
            }
            let next_state = language.next_state(state, symbol);
            if next_state == 0 {
                continue;
            }
            if !language.has_reduce_action(next_state, lookahead_symbol) {
                continue;
            }
            let copy = self.stack.copy_version(version);
            let missing = self.pool.new_missing_leaf(symbol, self.stack.position(copy), language);
            self.stack.push(copy, Some(missing), true, next_state);
            if self.do_all_potential_reductions(language, copy, lookahead_symbol) {
                return Ok(());
            }
            self.stack.remove_version(&mut self.pool, copy);
        }

        self.recover(language, lexer, reusable_node, version)
    }

    /// §4.4.2: when `halt_on_error` is set and condensation reports a
    /// nonzero minimum error cost, immediately synthesize a filler ERROR
    /// covering the remaining input and accept, instead of continuing
    /// incremental recovery.
    fn halt_parse(&mut self, language: &Language, lexer: &mut Lexer<'_>, version: StackVersion) -> Subtree {
        let position = self.stack.position(version);
        lexer.reset(position);
        lexer.advance_to_end();
        let end = lexer.current_position();
        let size = end - position;

        let mut slices = self.stack.pop_all(&mut self.pool, version);
        let slice = slices.pop().unwrap_or(StackSlice { subtrees: Vec::new(), version });
        for extra in slices {
            for s in extra.subtrees {
                self.pool.release(s);
            }
        }
        let mut children = slice.subtrees;
        let error_token = self.pool.new_error_leaf(None, Length::ZERO, size, 0, ERROR_STATE);
        children.push(error_token);
        if children.is_empty() {
            return self.pool.new_error_leaf(None, Length::ZERO, Length::ZERO, 0, ERROR_STATE);
        }
        self.pool.new_error_node(language, children, false)
    }

    /// Two-strategy error recovery: rewind to a compatible earlier state
    /// recorded in the stack summary (strategy 1), or wrap the current
    /// lookahead token in an ERROR node in place (strategy 2). Mirrors
    /// `ts_parser__recover`.
    fn recover(
        &mut self,
        language: &Language,
        lexer: &mut Lexer<'_>,
        reusable_node: &mut ReusableNode,
        version: StackVersion,
    ) -> Result<(), ParseError> {
        if self.halt_on_error {
            let tree = self.halt_parse(language, lexer, version);
            self.stack.halt(version);
            self.stack.remove_version(&mut self.pool, version);
            self.finished_tree = Some(tree);
            return Ok(());
        }

        let position = self.stack.position(version);
        let (token, _) = self.get_token(language, lexer, reusable_node, &[], version, &mut TokenCache::default(), position)?;
        let is_eof = token.is_eof();

        if !is_eof && self.stack.version_count() <= MAX_VERSION_COUNT {
            if let Some(summary) = self.stack.get_summary(version).map(|s| s.to_vec()) {
                for entry in summary.iter() {
                    if entry.depth == 0 {
                        continue;
                    }
                    let copy = self.stack.copy_version(version);
                    let popped = self.stack.pop_count(&mut self.pool, copy, entry.depth);
                    if let Some(slice) = popped.into_iter().next() {
                        let mut children = slice.subtrees;
                        if !children.is_empty() {
                            let error_node = self.pool.new_error_node(language, std::mem::take(&mut children), false);
                            self.stack.push(slice.version, Some(error_node), true, entry.state);
                            if self.finished_tree.is_some() || self.better_version_exists(slice.version) {
                                self.stack.remove_version(&mut self.pool, slice.version);
                                continue;
                            }
                            self.log("recover_strategy_1");
                            self.pool.release(token);
                            return Ok(());
                        }
                    }
                    self.stack.remove_version(&mut self.pool, copy);
                }
            }
        }

        // Strategy 2: wrap the current lookahead in an ERROR node,
        // extending a trailing ERROR already on top if one exists.
        self.log("recover_strategy_2");
        if is_eof {
            self.pool.release(token);
            let tree = self.accept(language, version);
            self.finished_tree = Some(tree);
            self.stack.remove_version(&mut self.pool, version);
            return Ok(());
        }

        let error_node = self.pool.new_error_node(language, vec![token], false);
        let state = self.stack.state(version);
        self.stack.push(version, Some(error_node), true, state);
        Ok(())
    }

    /// Removes a reused subtree's "pending" placeholder by expanding its
    /// children onto the stack individually, giving the fresh lookahead a
    /// chance against the finer-grained stack. Mirrors
    /// `ts_parser__breakdown_top_of_stack`: pops the pending top (a no-op if
    /// the top isn't pending) and re-pushes each of its children, replaying
    /// state transitions one symbol at a time via `Language::next_state` so
    /// later lookahead can match against the finer structure. Returns
    /// whether a breakdown actually happened.
    fn breakdown_top_of_stack(&mut self, language: &Language, version: StackVersion) -> bool {
        let slices = self.stack.pop_pending(&mut self.pool, version);
        let Some(slice) = slices.into_iter().next() else { return false };
        let Some(top) = slice.subtrees.into_iter().next() else { return false };
        if top.child_count() == 0 {
            let state = self.stack.state(slice.version);
            self.stack.push(slice.version, Some(top), false, state);
            return false;
        }

        let mut state = self.stack.state(slice.version);
        for child in top.children().to_vec() {
            let next_state = language.next_state(state, child.symbol());
            let is_pending = child.child_count() > 0;
            self.stack.push(slice.version, Some(child), is_pending, next_state);
            state = next_state;
        }
        self.pool.release(top);
        true
    }

    /// Merges/prunes stack versions after a round: drops halted versions,
    /// pairwise-compares the rest by error cost, caps the surviving count at
    /// `MAX_VERSION_COUNT`. If every surviving version is paused (none could
    /// shift the real lookahead this round), resumes whichever has the best
    /// error status and returns it so the caller can run error recovery with
    /// its saved lookahead. Mirrors `ts_parser__condense_stack`.
    fn condense_stack(&mut self, _language: &Language) -> Option<(StackVersion, Symbol)> {
        let mut i = 0;
        while i < self.stack.version_count() {
            if self.stack.is_halted(i) {
                self.stack.remove_version(&mut self.pool, i);
                continue;
            }
            i += 1;
        }

        let mut i = 0;
        'outer: while i < self.stack.version_count() {
            if !self.stack.is_active(i) {
                i += 1;
                continue;
            }
            let mut j = i + 1;
            while j < self.stack.version_count() {
                if !self.stack.is_active(j) {
                    j += 1;
                    continue;
                }
                if self.stack.merge(&mut self.pool, i, j) {
                    continue 'outer;
                }

                let left = self.version_status(i);
                let right = self.version_status(j);
                match compare_error_status(left, right) {
                    ErrorComparison::TakeLeft => {
                        self.stack.remove_version(&mut self.pool, j);
                        continue;
                    }
                    ErrorComparison::TakeRight => {
                        self.stack.remove_version(&mut self.pool, i);
                        continue 'outer;
                    }
                    _ => {}
                }
                j += 1;
            }
            i += 1;
        }

        while self.stack.version_count() > MAX_VERSION_COUNT + MAX_VERSION_COUNT_OVERFLOW {
            let last = self.stack.version_count() - 1;
            self.stack.remove_version(&mut self.pool, last);
        }

        let count = self.stack.version_count();
        if count > 0 && (0..count).all(|v| self.stack.is_paused(v)) {
            let mut best = 0;
            let mut best_status = self.version_status(0);
            for v in 1..count {
                let status = self.version_status(v);
                if compare_error_status(status, best_status) == ErrorComparison::TakeLeft {
                    best = v;
                    best_status = status;
                }
            }
            let lookahead = self.stack.resume(best);
            return Some((best, lookahead));
        }
        None
    }

    fn version_status(&mut self, version: StackVersion) -> ErrorStatus {
        ErrorStatus {
            cost: self.stack.error_cost(version),
            node_count: self.stack.node_count_since_error(version),
            dynamic_precedence: self.stack.dynamic_precedence(version),
            is_in_error: self.stack.state(version) == ERROR_STATE,
        }
    }

    /// Whether a better-scoring version than `version` already exists,
    /// used by `recover` to bail out of an unnecessary rewind. Mirrors
    /// `ts_parser__better_version_exists`.
    fn better_version_exists(&mut self, version: StackVersion) -> bool {
        let status = self.version_status(version);
        for v in 0..self.stack.version_count() {
            if v == version {
                continue;
            }
            let other = self.version_status(v);
            if compare_error_status(other, status) == ErrorComparison::TakeLeft {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::StrInput;
    use crate::language::{FieldMapEntry, LanguageBuilder, SymbolMetadata};

    // A toy grammar: S -> A B, A -> 'a'+, B -> 'b'.
    // Symbols: 0 end, 1 'a', 2 'b', 3 A, 4 B, 5 S.
    const SYM_A_TOKEN: Symbol = 1;
    const SYM_B_TOKEN: Symbol = 2;
    const SYM_A: Symbol = 3;
    const SYM_B: Symbol = 4;
    const SYM_S: Symbol = 5;

    fn lex_fn(lexer: &mut Lexer<'_>, _state: u16) -> bool {
        match lexer.lookahead() {
            c if c == 'a' as i32 => {
                lexer.advance(false);
                lexer.mark_end();
                lexer.set_result_symbol(SYM_A_TOKEN);
                true
            }
            c if c == 'b' as i32 => {
                lexer.advance(false);
                lexer.mark_end();
                lexer.set_result_symbol(SYM_B_TOKEN);
                true
            }
            _ => false,
        }
    }

    fn toy_language() -> Language {
        // State numbering starts at BASE_STATE (the state the parser's base
        // stack node actually carries): BASE_STATE start, 2 after one+ 'a'
        // (in A), 3 after goto(A) expecting 'b', 4 after shift 'b', 5 after
        // goto(B) expecting end, 6 after goto(S) expecting end (accept).
        // State 0 is never visited at runtime. This is a deliberately tiny
        // hand-rolled table sufficient to drive the parser loop end to end,
        // not a generated grammar.
        LanguageBuilder::new(6, 3, 7)
            .symbol(SYM_A_TOKEN, "a", SymbolMetadata { visible: true, named: false, extra: false })
            .symbol(SYM_B_TOKEN, "b", SymbolMetadata { visible: true, named: false, extra: false })
            .symbol(SYM_A, "A", SymbolMetadata { visible: true, named: true, extra: false })
            .symbol(SYM_B, "B", SymbolMetadata { visible: true, named: true, extra: false })
            .symbol(SYM_S, "S", SymbolMetadata { visible: true, named: true, extra: false })
            .lex_fn(lex_fn)
            .lex_modes(vec![
                LexMode { lex_state: 0, external_lex_state: 0 },
                LexMode { lex_state: 0, external_lex_state: 0 },
                LexMode { lex_state: 0, external_lex_state: 0 },
                LexMode { lex_state: 0, external_lex_state: 0 },
                LexMode { lex_state: 0, external_lex_state: 0 },
                LexMode { lex_state: 0, external_lex_state: 0 },
                LexMode { lex_state: 0, external_lex_state: 0 },
            ])
            .action(BASE_STATE, SYM_A_TOKEN, vec![ParseAction::Shift { state: 2, extra: false, repetition: false }])
            .action(2, SYM_A_TOKEN, vec![ParseAction::Shift { state: 2, extra: false, repetition: true }])
            .action(2, SYM_B_TOKEN, vec![ParseAction::Reduce { symbol: SYM_A, child_count: 1, production_id: 0, dynamic_precedence: 0 }])
            .action(2, END_SYMBOL, vec![ParseAction::Reduce { symbol: SYM_A, child_count: 1, production_id: 0, dynamic_precedence: 0 }])
            .goto(BASE_STATE, SYM_A, 3)
            .action(3, SYM_B_TOKEN, vec![ParseAction::Shift { state: 4, extra: false, repetition: false }])
            .action(4, END_SYMBOL, vec![ParseAction::Reduce { symbol: SYM_B, child_count: 1, production_id: 0, dynamic_precedence: 0 }])
            .goto(3, SYM_B, 5)
            .action(5, END_SYMBOL, vec![ParseAction::Reduce { symbol: SYM_S, child_count: 2, production_id: 0, dynamic_precedence: 0 }])
            .goto(BASE_STATE, SYM_S, 6)
            .action(6, END_SYMBOL, vec![ParseAction::Accept])
            .field(0, vec![FieldMapEntry { field_id: 0, structural_child_index: 0 }])
            .build()
    }

    #[test]
    fn parses_simple_input() {
        let language = toy_language();
        let mut parser = Parser::new();
        parser.set_language(language).unwrap();
        let tree = parser.parse(StrInput::new("ab"), None).unwrap();
        let root = tree.root_node();
        assert_eq!(root.kind(), "S");
    }

    #[test]
    fn reports_no_language_error() {
        let mut parser = Parser::new();
        let err = parser.parse(StrInput::new("ab"), None).unwrap_err();
        assert_eq!(err, ParseError::NoLanguage);
    }

    #[test]
    fn reset_clears_outstanding_parse() {
        let language = toy_language();
        let mut parser = Parser::new();
        parser.set_language(language).unwrap();
        assert!(!parser.has_outstanding_parse());
        parser.reset();
        assert!(!parser.has_outstanding_parse());
    }
}
