//! Shared toy grammar used by the end-to-end scenario tests: `S -> A B`,
//! `A -> 'a'`, `B -> 'b'`. Mirrors the hand-rolled table in
//! `parser.rs`'s own unit tests, but lives here so more than one
//! integration test binary can build a [`Language`] from it.

use glr_cst::{
    FieldMapEntry, LanguageBuilder, Lexer, ParseAction, SymbolMetadata, BASE_STATE, END_SYMBOL,
};

pub const SYM_A_TOKEN: u16 = 1;
pub const SYM_B_TOKEN: u16 = 2;
pub const SYM_A: u16 = 3;
pub const SYM_B: u16 = 4;
pub const SYM_S: u16 = 5;

pub fn lex_fn(lexer: &mut Lexer<'_>, _state: u16) -> bool {
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

/// Builds the `S -> A B`, `A -> 'a'`, `B -> 'b'` language. Only accepts the
/// single sentence `"ab"`; it exists to drive the parser's public surface
/// end to end, not to model a realistic grammar.
pub fn toy_language() -> glr_cst::Language {
    use glr_cst::LexMode;

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
        // State numbering starts at BASE_STATE, the state the parser's base
        // stack node actually carries; state 0 is never visited at runtime.
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
