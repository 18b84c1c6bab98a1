//! End-to-end scenarios exercising the parser's public surface: a full
//! parse, tree/cursor navigation, reset-and-reparse, and the changed-range
//! diff between two trees. Grounded in the same toy grammar the core crate
//! uses for its own unit tests, lifted out here so it can be shared.

mod support;

use pretty_assertions::assert_eq;

use glr_cst::{changed_ranges, IncludedRangeError, Parser, ParseError, Range, StrInput};

#[test]
fn parses_and_builds_a_named_tree() {
    let mut parser = Parser::new();
    parser.set_language(support::toy_language()).unwrap();
    let tree = parser.parse(StrInput::new("ab"), None).unwrap();

    let root = tree.root_node();
    assert_eq!(root.kind(), "S");
    assert!(root.is_named());
    assert!(!root.is_error());
    assert_eq!(root.byte_range(), 0..2);
    assert_eq!(root.child_count(), 2);
    assert_eq!(root.named_child_count(), 2);

    let a = root.child(0).unwrap();
    assert_eq!(a.kind(), "A");
    assert_eq!(a.byte_range(), 0..1);
    assert_eq!(a.child_count(), 1);

    let b = root.child(1).unwrap();
    assert_eq!(b.kind(), "B");
    assert_eq!(b.byte_range(), 1..2);
    assert_eq!(b.child_count(), 1);

    assert_eq!(a.next_sibling().unwrap(), b);
    assert_eq!(b.prev_sibling().unwrap(), a);
    assert!(b.next_sibling().is_none());
    assert_eq!(a.parent().unwrap(), root);
}

#[test]
fn cursor_walks_children_in_order() {
    let mut parser = Parser::new();
    parser.set_language(support::toy_language()).unwrap();
    let tree = parser.parse(StrInput::new("ab"), None).unwrap();

    let mut cursor = tree.walk();
    assert!(cursor.goto_first_child());
    assert_eq!(cursor.node().kind(), "A");
    assert!(cursor.goto_next_sibling());
    assert_eq!(cursor.node().kind(), "B");
    assert!(!cursor.goto_next_sibling());
    assert!(cursor.goto_parent());
    assert_eq!(cursor.node().kind(), "S");
    assert!(!cursor.goto_parent());
}

#[test]
fn reparsing_unchanged_text_yields_the_same_shape() {
    let mut parser = Parser::new();
    parser.set_language(support::toy_language()).unwrap();
    let first = parser.parse(StrInput::new("ab"), None).unwrap();

    let second = parser.parse(StrInput::new("ab"), Some(&first)).unwrap();
    assert_eq!(second.root_node().kind(), "S");
    assert_eq!(second.root_node().byte_range(), 0..2);
    assert!(changed_ranges(&first, &second).is_empty());
}

#[test]
fn reset_clears_in_progress_state_between_parses() {
    let mut parser = Parser::new();
    parser.set_language(support::toy_language()).unwrap();

    let tree = parser.parse(StrInput::new("ab"), None).unwrap();
    assert_eq!(tree.root_node().kind(), "S");
    assert!(!parser.has_outstanding_parse());

    parser.reset();
    assert!(!parser.has_outstanding_parse());

    let tree2 = parser.parse(StrInput::new("ab"), None).unwrap();
    assert_eq!(tree2.root_node().kind(), "S");
}

#[test]
fn parsing_without_a_language_is_an_error() {
    let mut parser = Parser::new();
    let err = parser.parse(StrInput::new("ab"), None).unwrap_err();
    assert_eq!(err, ParseError::NoLanguage);
}

#[test]
fn included_ranges_must_be_sorted_and_disjoint() {
    let mut parser = Parser::new();
    parser.set_language(support::toy_language()).unwrap();

    let disjoint = [
        Range { start_byte: 0, end_byte: 1, start_point: Default::default(), end_point: Default::default() },
        Range { start_byte: 1, end_byte: 2, start_point: Default::default(), end_point: Default::default() },
    ];
    assert!(parser.set_included_ranges(&disjoint).is_ok());

    let overlapping = [
        Range { start_byte: 0, end_byte: 2, start_point: Default::default(), end_point: Default::default() },
        Range { start_byte: 1, end_byte: 3, start_point: Default::default(), end_point: Default::default() },
    ];
    assert_eq!(parser.set_included_ranges(&overlapping), Err(IncludedRangeError));
}
