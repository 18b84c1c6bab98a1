//! The compiled language description table, treated as opaque read-only data
//! per the host's grammar compiler (out of scope for this crate: we only
//! consume the accessors, never generate the tables).

use std::sync::Arc;

use crate::lexer::Lexer;

/// A grammar symbol id. `0` is reserved for the end-of-input marker; the two
/// highest values are reserved for the two synthetic error symbols.
pub type Symbol = u16;
pub type StateId = u16;

pub const END_SYMBOL: Symbol = 0;
pub const ERROR_SYMBOL: Symbol = Symbol::MAX;
pub const ERROR_REPEAT_SYMBOL: Symbol = Symbol::MAX - 1;

/// `0` is used as an "absent" state id sentinel. State `1` is where a fresh
/// stack's base node sits.
pub const ERROR_STATE: StateId = StateId::MAX;
pub const BASE_STATE: StateId = 1;

/// Minimum/maximum language ABI version this parser core understands.
pub const MIN_COMPATIBLE_LANGUAGE_VERSION: u32 = 13;
pub const LANGUAGE_VERSION: u32 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymbolMetadata {
    pub visible: bool,
    pub named: bool,
    /// Belongs "between" structural children (comments, whitespace); excluded
    /// from the structural-child index and alias lookups.
    pub extra: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LexMode {
    pub lex_state: u16,
    pub external_lex_state: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseAction {
    Shift {
        state: StateId,
        extra: bool,
        repetition: bool,
    },
    Reduce {
        symbol: Symbol,
        child_count: u8,
        production_id: u16,
        dynamic_precedence: i32,
    },
    Accept,
    Recover,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TableEntry<'a> {
    pub actions: &'a [ParseAction],
    pub is_reusable: bool,
}

impl<'a> TableEntry<'a> {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Mirrors `ts_language_has_reduce_action`.
    pub fn has_reduce_action(&self) -> bool {
        matches!(self.actions.first(), Some(ParseAction::Reduce { .. }))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ActionTableEntry {
    offset: u32,
    count: u32,
    is_reusable: bool,
}

/// Per-production table that renames children at specific structural
/// positions so the tree reports them under a different symbol than the one
/// the parser actually reduced to.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMapEntry {
    pub field_id: u16,
    pub structural_child_index: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMapSlice {
    pub index: u32,
    pub length: u32,
}

pub type LexFn = for<'a> fn(&mut Lexer<'a>, state: u16) -> bool;

/// Callbacks for an external (hand-written) scanner. The state is an opaque
/// byte blob, compared only by length and content.
pub trait ExternalScanner: Send + Sync {
    fn create(&self) -> Vec<u8>;
    /// Scans starting at the lexer's current position; returns `true` and
    /// advances the lexer (via `mark_end`) on success.
    fn scan(&self, lexer: &mut Lexer<'_>, state: &mut Vec<u8>, valid_symbols: &[bool]) -> bool;
    fn serialize(&self, state: &[u8], out: &mut [u8]) -> usize;
    fn deserialize(&self, bytes: &[u8]) -> Vec<u8>;
}

/// The two-level lookup used for states beyond `large_state_count`: each
/// section is `(value, symbol_count, symbols...)`; the first section whose
/// symbol list contains the queried symbol wins.
#[derive(Debug, Clone, Default)]
struct SmallParseTable {
    /// Flattened section data, indexed into by `map`.
    data: Vec<u16>,
    /// One entry per small state, pointing at the start of that state's
    /// section list within `data`.
    map: Vec<u32>,
}

impl SmallParseTable {
    fn lookup(&self, small_state: u32, symbol: Symbol) -> u16 {
        let mut i = self.map[small_state as usize] as usize;
        let section_count = self.data[i];
        i += 1;
        for _ in 0..section_count {
            let value = self.data[i];
            let symbol_count = self.data[i + 1];
            i += 2;
            for _ in 0..symbol_count {
                if self.data[i] == symbol {
                    return value;
                }
                i += 1;
            }
        }
        0
    }
}

#[derive(Debug)]
pub(crate) struct LanguageData {
    pub symbol_count: u16,
    pub token_count: u16,
    pub external_token_count: u16,
    pub state_count: u32,
    pub large_state_count: u32,
    pub symbol_names: Vec<String>,
    pub symbol_metadata: Vec<SymbolMetadata>,
    pub lex_modes: Vec<LexMode>,
    /// Dense table covering the first `large_state_count` states:
    /// `table[state * symbol_count + symbol]` is an index into
    /// `action_table_entries` (terminals) or a raw next-state (nonterminals).
    dense_table: Vec<u16>,
    small_table: SmallParseTable,
    action_table_entries: Vec<ActionTableEntry>,
    parse_actions: Vec<ParseAction>,
    alias_sequences: Vec<Symbol>,
    pub max_alias_sequence_length: u16,
    field_map_slices: Vec<FieldMapSlice>,
    field_map_entries: Vec<FieldMapEntry>,
    pub field_names: Vec<String>,
    pub keyword_capture_token: Option<Symbol>,
    pub keyword_lex_fn: Option<LexFn>,
    pub lex_fn: LexFn,
    pub external_scanner: Option<Box<dyn ExternalScanner>>,
    pub abi_version: u32,
}

/// A compiled language description, cheaply clonable (reference counted).
/// Treated by this crate as opaque read-only data produced elsewhere.
#[derive(Clone)]
pub struct Language(pub(crate) Arc<LanguageData>);

impl Language {
    pub fn symbol_count(&self) -> u16 {
        self.0.symbol_count
    }

    pub fn token_count(&self) -> u16 {
        self.0.token_count
    }

    pub fn symbol_metadata(&self, symbol: Symbol) -> SymbolMetadata {
        if symbol == ERROR_SYMBOL || symbol == ERROR_REPEAT_SYMBOL {
            return SymbolMetadata {
                visible: true,
                named: true,
                extra: false,
            };
        }
        self.0
            .symbol_metadata
            .get(symbol as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn symbol_name(&self, symbol: Symbol) -> &str {
        match symbol {
            ERROR_SYMBOL => "ERROR",
            ERROR_REPEAT_SYMBOL => "_error_repeat",
            END_SYMBOL => "end",
            _ => self
                .0
                .symbol_names
                .get(symbol as usize)
                .map(String::as_str)
                .unwrap_or("UNKNOWN"),
        }
    }

    pub fn is_symbol_external(&self, symbol: Symbol) -> bool {
        symbol > 0 && symbol < self.0.external_token_count + 1
    }

    pub fn lex_mode_for_state(&self, state: StateId) -> LexMode {
        self.0
            .lex_modes
            .get(state as usize)
            .copied()
            .unwrap_or_default()
    }

    fn raw_lookup(&self, state: StateId, symbol: Symbol) -> u16 {
        let data = &self.0;
        if (state as u32) < data.large_state_count {
            data.dense_table[state as usize * data.symbol_count as usize + symbol as usize]
        } else {
            let small_state = state as u32 - data.large_state_count;
            data.small_table.lookup(small_state, symbol)
        }
    }

    /// The action list + reusability flag for a `(state, symbol)` pair.
    /// Mirrors `ts_language_table_entry`.
    pub fn actions(&self, state: StateId, symbol: Symbol) -> TableEntry<'_> {
        let value = self.raw_lookup(state, symbol);
        match self.0.action_table_entries.get(value as usize) {
            Some(entry) if entry.count > 0 => TableEntry {
                actions: &self.0.parse_actions
                    [entry.offset as usize..entry.offset as usize + entry.count as usize],
                is_reusable: entry.is_reusable,
            },
            _ => TableEntry::default(),
        }
    }

    /// The goto-table lookup for nonterminal symbols (after a reduce).
    /// Mirrors `ts_language_lookup` used for `symbol >= token_count`.
    pub fn goto_state(&self, state: StateId, symbol: Symbol) -> StateId {
        self.raw_lookup(state, symbol)
    }

    /// Mirrors `ts_language_next_state`: for terminals, the state reached by
    /// the last shift/recover action in the table entry (used to test
    /// whether inserting a missing token would make progress).
    pub fn next_state(&self, state: StateId, symbol: Symbol) -> StateId {
        if symbol == ERROR_SYMBOL || symbol == ERROR_REPEAT_SYMBOL {
            return 0;
        }
        if symbol < self.0.token_count {
            let entry = self.actions(state, symbol);
            match entry.actions.last() {
                Some(ParseAction::Shift { state, .. }) => *state,
                Some(ParseAction::Recover) => ERROR_STATE,
                _ => 0,
            }
        } else {
            self.goto_state(state, symbol)
        }
    }

    pub fn has_reduce_action(&self, state: StateId, symbol: Symbol) -> bool {
        self.actions(state, symbol).has_reduce_action()
    }

    pub fn alias_sequence(&self, production_id: u16) -> Option<&[Symbol]> {
        if production_id == 0 {
            return None;
        }
        let len = self.0.max_alias_sequence_length as usize;
        let start = production_id as usize * len;
        self.0.alias_sequences.get(start..start + len)
    }

    pub fn field_map(&self, production_id: u16) -> &[FieldMapEntry] {
        let Some(slice) = self.0.field_map_slices.get(production_id as usize) else {
            return &[];
        };
        &self.0.field_map_entries[slice.index as usize..(slice.index + slice.length) as usize]
    }

    pub fn field_id_for_name(&self, name: &str) -> Option<u16> {
        self.0
            .field_names
            .iter()
            .position(|n| n == name)
            .map(|i| i as u16 + 1)
    }

    pub fn field_name(&self, field_id: u16) -> Option<&str> {
        self.0
            .field_names
            .get(field_id.checked_sub(1)? as usize)
            .map(String::as_str)
    }

    pub fn lex_fn(&self) -> LexFn {
        self.0.lex_fn
    }

    pub fn keyword_capture_token(&self) -> Option<Symbol> {
        self.0.keyword_capture_token
    }

    pub fn keyword_lex_fn(&self) -> Option<LexFn> {
        self.0.keyword_lex_fn
    }

    pub fn external_scanner(&self) -> Option<&dyn ExternalScanner> {
        self.0.external_scanner.as_deref()
    }

    /// Which external tokens are valid to scan for in a given external lex
    /// state. `external_lex_state == 0` means "no external tokens valid
    /// here" (mirrors `current_lex_mode.external_lex_state == 0` in the
    /// reuse check). Real grammars compute a precise per-state bool matrix;
    /// this core doesn't model that matrix, so any nonzero state simply
    /// permits every external token the scanner declares.
    pub fn enabled_external_tokens(&self, external_lex_state: u16) -> Option<Vec<bool>> {
        if external_lex_state == 0 {
            return None;
        }
        Some(vec![true; self.0.external_token_count as usize])
    }

    pub fn abi_version(&self) -> u32 {
        self.0.abi_version
    }
}

/// Builder for a [`Language`]. Real languages are produced by the grammar
/// compiler (out of scope); this builder exists so tests and host embedders
/// can construct one directly from in-memory tables.
#[derive(Debug, Default)]
pub struct LanguageBuilder {
    data: LanguageBuilderData,
}

#[derive(Debug, Default)]
struct LanguageBuilderData {
    symbol_count: u16,
    token_count: u16,
    external_token_count: u16,
    large_state_count: u32,
    symbol_names: Vec<String>,
    symbol_metadata: Vec<SymbolMetadata>,
    lex_modes: Vec<LexMode>,
    dense_table: Vec<u16>,
    small_table_data: Vec<u16>,
    small_table_map: Vec<u32>,
    action_table_entries: Vec<ActionTableEntry>,
    parse_actions: Vec<ParseAction>,
    /// Raw per-production alias lists, keyed by production id. Flattened
    /// into `LanguageData::alias_sequences` only in `build()`, once the
    /// longest sequence (and hence the row stride) is known; see `production`.
    productions: std::collections::BTreeMap<u16, Vec<Symbol>>,
    max_alias_sequence_length: u16,
    field_map_slices: Vec<FieldMapSlice>,
    field_map_entries: Vec<FieldMapEntry>,
    field_names: Vec<String>,
    keyword_capture_token: Option<Symbol>,
    keyword_lex_fn: Option<LexFn>,
    lex_fn: Option<LexFn>,
    external_scanner: Option<Box<dyn ExternalScanner>>,
    abi_version: u32,
}

impl LanguageBuilder {
    pub fn new(symbol_count: u16, token_count: u16, large_state_count: u32) -> Self {
        let mut data = LanguageBuilderData {
            symbol_count,
            token_count,
            large_state_count,
            abi_version: LANGUAGE_VERSION,
            symbol_metadata: vec![SymbolMetadata::default(); symbol_count as usize],
            symbol_names: vec![String::new(); symbol_count as usize],
            ..Default::default()
        };
        // Table entry 0 is reserved for "no actions".
        data.action_table_entries.push(ActionTableEntry::default());
        LanguageBuilder { data }
    }

    pub fn symbol(mut self, symbol: Symbol, name: &str, metadata: SymbolMetadata) -> Self {
        self.data.symbol_names[symbol as usize] = name.to_string();
        self.data.symbol_metadata[symbol as usize] = metadata;
        self
    }

    pub fn lex_modes(mut self, modes: Vec<LexMode>) -> Self {
        self.data.lex_modes = modes;
        self
    }

    pub fn lex_fn(mut self, f: LexFn) -> Self {
        self.data.lex_fn = Some(f);
        self
    }

    pub fn keyword(mut self, capture_token: Symbol, lex_fn: LexFn) -> Self {
        self.data.keyword_capture_token = Some(capture_token);
        self.data.keyword_lex_fn = Some(lex_fn);
        self
    }

    pub fn external_scanner(mut self, scanner: Box<dyn ExternalScanner>, count: u16) -> Self {
        self.data.external_scanner = Some(scanner);
        self.data.external_token_count = count;
        self
    }

    /// Registers the action list reached for `(state, symbol)` in the dense
    /// (`state < large_state_count`) table.
    pub fn action(mut self, state: StateId, symbol: Symbol, actions: Vec<ParseAction>) -> Self {
        let is_reusable = !matches!(actions.first(), Some(ParseAction::Recover));
        let offset = self.data.parse_actions.len() as u32;
        let count = actions.len() as u32;
        self.data.parse_actions.extend(actions);
        let entry_idx = self.data.action_table_entries.len() as u16;
        self.data.action_table_entries.push(ActionTableEntry {
            offset,
            count,
            is_reusable,
        });
        self.set_dense(state, symbol, entry_idx);
        self
    }

    /// Registers a goto-table entry (the state reached after a reduce to a
    /// nonterminal) in the dense table.
    pub fn goto(mut self, state: StateId, symbol: Symbol, next_state: StateId) -> Self {
        self.set_dense(state, symbol, next_state);
        self
    }

    fn set_dense(&mut self, state: StateId, symbol: Symbol, value: u16) {
        let symbol_count = self.data.symbol_count as usize;
        let needed = (state as usize + 1) * symbol_count;
        if self.data.dense_table.len() < needed {
            self.data.dense_table.resize(needed, 0);
        }
        self.data.dense_table[state as usize * symbol_count + symbol as usize] = value;
    }

    pub fn production(mut self, production_id: u16, aliases: Vec<Symbol>) -> Self {
        self.data.max_alias_sequence_length =
            self.data.max_alias_sequence_length.max(aliases.len() as u16);
        self.data.productions.insert(production_id, aliases);
        self
    }

    pub fn field(mut self, production_id: u16, entries: Vec<FieldMapEntry>) -> Self {
        let index = self.data.field_map_entries.len() as u32;
        let length = entries.len() as u32;
        self.data.field_map_entries.extend(entries);
        let needed = production_id as usize + 1;
        if self.data.field_map_slices.len() < needed {
            self.data.field_map_slices.resize(needed, FieldMapSlice::default());
        }
        self.data.field_map_slices[production_id as usize] = FieldMapSlice { index, length };
        self
    }

    pub fn field_names(mut self, names: Vec<String>) -> Self {
        self.data.field_names = names;
        self
    }

    pub fn build(self) -> Language {
        let d = self.data;
        let stride = d.max_alias_sequence_length as usize;
        let mut alias_sequences = vec![0; d.productions.keys().next_back().map_or(0, |id| (*id as usize + 1) * stride)];
        for (production_id, aliases) in &d.productions {
            let start = *production_id as usize * stride;
            alias_sequences[start..start + aliases.len()].copy_from_slice(aliases);
        }
        Language(Arc::new(LanguageData {
            symbol_count: d.symbol_count,
            token_count: d.token_count,
            external_token_count: d.external_token_count,
            state_count: d.large_state_count + d.small_table_map.len() as u32,
            large_state_count: d.large_state_count,
            symbol_names: d.symbol_names,
            symbol_metadata: d.symbol_metadata,
            lex_modes: d.lex_modes,
            dense_table: d.dense_table,
            small_table: SmallParseTable {
                data: d.small_table_data,
                map: d.small_table_map,
            },
            action_table_entries: d.action_table_entries,
            parse_actions: d.parse_actions,
            alias_sequences,
            max_alias_sequence_length: d.max_alias_sequence_length,
            field_map_slices: d.field_map_slices,
            field_map_entries: d.field_map_entries,
            field_names: d.field_names,
            keyword_capture_token: d.keyword_capture_token,
            keyword_lex_fn: d.keyword_lex_fn,
            lex_fn: d.lex_fn.expect("language must have a lex_fn"),
            external_scanner: d.external_scanner,
            abi_version: d.abi_version,
        }))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("language was generated with an incompatible version of the grammar compiler")]
pub struct LanguageError;

pub fn check_language_version(language: &Language) -> Result<(), LanguageError> {
    if language.abi_version() < MIN_COMPATIBLE_LANGUAGE_VERSION
        || language.abi_version() > LANGUAGE_VERSION
    {
        Err(LanguageError)
    } else {
        Ok(())
    }
}
