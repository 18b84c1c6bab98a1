//! Component C6: the immutable parse tree, its node/cursor navigation API,
//! and the changed-range diff between two trees. Mirrors `tree.c`,
//! `tree_cursor.c` and `get_changed_ranges.c`, adapted from pointer-and-ABI
//! handles to lifetime-tied value types since there is no C library on the
//! other side of this crate.

use std::fmt;
use std::sync::Arc;

use crate::language::{Language, Symbol};
use crate::length::{Length, Point};
use crate::range::Range;
use crate::subtree::{self, Subtree, SubtreePool};

/// An edit to apply to a [`Tree`], matching the shape of `TSInputEdit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEdit {
    pub start_byte: u32,
    pub old_end_byte: u32,
    pub new_end_byte: u32,
    pub start_point: Point,
    pub old_end_point: Point,
    pub new_end_point: Point,
}

impl InputEdit {
    /// The signed shift to apply to any position after `old_end_byte` to map
    /// it back to its pre-edit coordinates.
    pub fn offset(&self) -> i32 {
        self.new_end_byte as i32 - self.old_end_byte as i32
    }

    fn to_subtree_edit(self) -> subtree::Edit {
        subtree::Edit {
            start: Length::new(self.start_byte, self.start_point),
            old_end: Length::new(self.old_end_byte, self.old_end_point),
            new_end: Length::new(self.new_end_byte, self.new_end_point),
        }
    }
}

const PARENT_CACHE_CAPACITY: usize = 32;

/// An optional, non-authoritative memoization of `node.parent()` lookups. A
/// miss always falls back to a root walk; this cache only saves repeated
/// work after deep descents. Keyed by the child's heap identity, so inline
/// leaves (which have no stable address) are never cached.
#[derive(Default)]
struct ParentCache {
    entries: Vec<CacheEntry>,
    next: usize,
}

struct CacheEntry {
    child_id: usize,
    parent: Subtree,
    parent_position: Length,
    alias_symbol: Symbol,
}

impl ParentCache {
    fn get(&self, child_id: usize) -> Option<(Subtree, Length, Symbol)> {
        self.entries
            .iter()
            .find(|e| e.child_id == child_id)
            .map(|e| (e.parent.clone(), e.parent_position, e.alias_symbol))
    }

    fn set(&mut self, child_id: usize, parent: Subtree, parent_position: Length, alias_symbol: Symbol) {
        let entry = CacheEntry { child_id, parent, parent_position, alias_symbol };
        if self.entries.len() < PARENT_CACHE_CAPACITY {
            self.entries.push(entry);
        } else {
            self.entries[self.next] = entry;
            self.next = (self.next + 1) % PARENT_CACHE_CAPACITY;
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.next = 0;
    }
}

/// An immutable parse tree: a root [`Subtree`], the language that produced
/// it, the included ranges that were visible to the parser, and a bounded
/// parent-lookup cache. Cloning is cheap (the root's refcount is atomic).
pub struct Tree {
    root: Subtree,
    language: Language,
    included_ranges: Vec<Range>,
    parent_cache: std::sync::Mutex<ParentCache>,
}

impl Tree {
    pub(crate) fn new(root: Subtree, language: Language, included_ranges: Vec<Range>) -> Tree {
        Tree { root, language, included_ranges, parent_cache: std::sync::Mutex::new(ParentCache::default()) }
    }

    /// The raw root subtree, for callers (the parser driver) that need to
    /// walk the previous tree directly rather than through the `Node` API.
    pub(crate) fn root_subtree(&self) -> &Subtree {
        &self.root
    }

    pub fn root_node(&self) -> Node<'_> {
        let position = self.root.padding();
        Node { tree: self, subtree: self.root.clone(), position, alias_symbol: 0 }
    }

    pub fn language(&self) -> &Language {
        &self.language
    }

    pub fn included_ranges(&self) -> &[Range] {
        &self.included_ranges
    }

    pub fn walk(&self) -> TreeCursor<'_> {
        self.root_node().walk()
    }

    /// Applies an edit in place: adjusts every included range past the edit
    /// and re-derives padding/size through the whole subtree, then
    /// invalidates the parent cache (§4.5, mirroring `ts_tree_edit`).
    pub fn edit(&mut self, edit: &InputEdit) {
        for range in &mut self.included_ranges {
            if range.end_byte >= edit.old_end_byte {
                if range.end_byte != u32::MAX {
                    range.end_byte = edit.new_end_byte + (range.end_byte - edit.old_end_byte);
                    range.end_point = edit.new_end_point + (range.end_point - edit.old_end_point);
                    if range.end_byte < edit.new_end_byte {
                        range.end_byte = u32::MAX;
                        range.end_point = Point::MAX;
                    }
                }
                if range.start_byte >= edit.old_end_byte {
                    range.start_byte = edit.new_end_byte + (range.start_byte - edit.old_end_byte);
                    range.start_point = edit.new_end_point + (range.start_point - edit.old_end_point);
                    if range.start_byte < edit.new_end_byte {
                        range.start_byte = u32::MAX;
                        range.start_point = Point::MAX;
                    }
                }
            }
        }

        let mut pool = SubtreePool::new();
        let root = std::mem::replace(&mut self.root, Subtree::Inline(placeholder_inline()));
        self.root = subtree::edit_subtree(&mut pool, root, &edit.to_subtree_edit());
        self.parent_cache.lock().unwrap().clear();
    }

    /// Writes a Graphviz dot-graph dump of the root subtree.
    pub fn print_dot_graph(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        subtree::print_dot_graph(&self.language, &self.root, out)
    }
}

fn placeholder_inline() -> crate::subtree::InlineSubtree {
    crate::subtree::InlineSubtree {
        symbol: 0,
        parse_state: 0,
        padding_bytes: 0,
        padding_row: 0,
        padding_column: 0,
        size_bytes: 0,
        lookahead_bytes: 0,
        flags: crate::subtree::Flags::empty(),
    }
}

impl Clone for Tree {
    fn clone(&self) -> Self {
        Tree {
            root: self.root.clone(),
            language: self.language.clone(),
            included_ranges: self.included_ranges.clone(),
            parent_cache: std::sync::Mutex::new(ParentCache::default()),
        }
    }
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{Tree {:?}}}", self.root_node())
    }
}

// Subtree refcounts are atomic (`Arc`), so a `Tree` is safe to share for
// read across threads; nothing here permits concurrent mutation.
unsafe impl Send for Tree {}
unsafe impl Sync for Tree {}

fn identity_key(subtree: &Subtree) -> Option<usize> {
    match subtree {
        Subtree::Heap(arc) => Some(Arc::as_ptr(arc) as usize),
        Subtree::Inline(_) => None,
    }
}

fn same_subtree(a: &Subtree, b: &Subtree) -> bool {
    match (a, b) {
        (Subtree::Heap(x), Subtree::Heap(y)) => Arc::ptr_eq(x, y),
        (Subtree::Inline(x), Subtree::Inline(y)) => x == y,
        _ => false,
    }
}

/// A single step of iteration over a subtree's structural children,
/// tracking the running position and the structural-child-index used to
/// resolve alias sequences. Mirrors `NodeChildIterator`/`CursorChildIterator`.
struct RawChildEntry {
    subtree: Subtree,
    position: Length,
    child_index: u32,
    structural_child_index: u32,
    visible: bool,
    alias_symbol: Symbol,
}

struct RawChildIter<'l> {
    children: &'l [Subtree],
    alias_sequence: Option<&'l [Symbol]>,
    position: Length,
    child_index: u32,
    structural_child_index: u32,
}

impl<'l> RawChildIter<'l> {
    fn new(parent: &'l Subtree, position: Length, language: &'l Language) -> Self {
        let children = parent.children();
        let alias_sequence = if children.is_empty() { None } else { language.alias_sequence(parent.production_id()) };
        RawChildIter { children, alias_sequence, position, child_index: 0, structural_child_index: 0 }
    }
}

impl Iterator for RawChildIter<'_> {
    type Item = RawChildEntry;

    fn next(&mut self) -> Option<RawChildEntry> {
        let index = self.child_index as usize;
        if index >= self.children.len() {
            return None;
        }
        let child = &self.children[index];
        let entry_position = self.position;
        let entry_child_index = self.child_index;
        let entry_structural_index = self.structural_child_index;

        let extra = child.is_extra();
        let mut alias_symbol = 0;
        if !extra {
            if let Some(seq) = self.alias_sequence {
                alias_symbol = seq.get(entry_structural_index as usize).copied().unwrap_or(0);
            }
            self.structural_child_index += 1;
        }
        let visible = child.is_visible() || alias_symbol != 0;

        self.position = self.position + child.size();
        self.child_index += 1;
        if (self.child_index as usize) < self.children.len() {
            self.position = self.position + self.children[self.child_index as usize].padding();
        }

        Some(RawChildEntry {
            subtree: child.clone(),
            position: entry_position,
            child_index: entry_child_index,
            structural_child_index: entry_structural_index,
            visible,
            alias_symbol,
        })
    }
}

/// A value-typed handle onto one node of a [`Tree`]: a subtree, the
/// position it starts at, and the alias symbol (if any) assigned by its
/// parent's production. Self-sufficient for child navigation; `parent` and
/// sibling lookups walk from the tree root.
#[derive(Clone)]
pub struct Node<'tree> {
    tree: &'tree Tree,
    subtree: Subtree,
    position: Length,
    alias_symbol: Symbol,
}

impl<'tree> Node<'tree> {
    fn effective_symbol(&self) -> Symbol {
        if self.alias_symbol != 0 { self.alias_symbol } else { self.subtree.symbol() }
    }

    pub fn kind(&self) -> &'tree str {
        self.tree.language.symbol_name(self.effective_symbol())
    }

    pub fn kind_id(&self) -> Symbol {
        self.effective_symbol()
    }

    pub fn is_named(&self) -> bool {
        if self.alias_symbol != 0 {
            self.tree.language.symbol_metadata(self.alias_symbol).named
        } else {
            self.subtree.is_named()
        }
    }

    pub fn is_missing(&self) -> bool {
        self.subtree.is_missing()
    }

    pub fn is_extra(&self) -> bool {
        self.subtree.is_extra()
    }

    pub fn is_error(&self) -> bool {
        self.subtree.is_error()
    }

    pub(crate) fn has_changes(&self) -> bool {
        self.subtree.has_changes()
    }

    pub(crate) fn parse_state(&self) -> u16 {
        self.subtree.parse_state()
    }

    pub fn start_byte(&self) -> u32 {
        self.position.bytes
    }

    pub fn end_byte(&self) -> u32 {
        (self.position + self.subtree.size()).bytes
    }

    pub fn byte_range(&self) -> std::ops::Range<u32> {
        self.start_byte()..self.end_byte()
    }

    pub fn start_position(&self) -> Point {
        self.position.point
    }

    pub fn end_position(&self) -> Point {
        (self.position + self.subtree.size()).point
    }

    pub fn child_count(&self) -> u32 {
        self.subtree.visible_child_count()
    }

    pub fn named_child_count(&self) -> u32 {
        self.subtree.named_child_count()
    }

    fn nth_relevant(&self, index: u32, include_anonymous: bool) -> Option<Node<'tree>> {
        let mut items = Vec::new();
        collect_relevant_children(self.tree, &self.subtree, self.position, include_anonymous, &mut items);
        items.into_iter().nth(index as usize).map(|e| self.make(e))
    }

    pub fn child(&self, index: u32) -> Option<Node<'tree>> {
        self.nth_relevant(index, true)
    }

    pub fn named_child(&self, index: u32) -> Option<Node<'tree>> {
        self.nth_relevant(index, false)
    }

    /// All visible (named or anonymous) structural children, with hidden
    /// rules spliced out and their own children promoted in their place.
    pub fn children(&self) -> NodeChildIterator<'tree> {
        let mut items = Vec::new();
        collect_relevant_children(self.tree, &self.subtree, self.position, true, &mut items);
        NodeChildIterator { tree: self.tree, items: items.into_iter() }
    }

    fn make(&self, entry: RelevantChild) -> Node<'tree> {
        Node { tree: self.tree, subtree: entry.subtree, position: entry.position, alias_symbol: entry.alias_symbol }
    }

    /// The field this node occupies at structural position `structural_child_index`
    /// within `production_id`, if any.
    fn structural_child(&self, target_index: u16) -> Option<RawChildEntry> {
        RawChildIter::new(&self.subtree, self.position, &self.tree.language)
            .find(|e| !e.subtree.is_extra() && e.structural_child_index == target_index as u32)
    }

    pub fn child_by_field_id(&self, field_id: u16) -> Option<Node<'tree>> {
        if field_id == 0 || self.subtree.child_count() == 0 {
            return None;
        }
        let entry = self
            .tree
            .language
            .field_map(self.subtree.production_id())
            .iter()
            .find(|e| e.field_id == field_id)?;
        let child = self.structural_child(entry.structural_child_index)?;
        let node = Node { tree: self.tree, subtree: child.subtree, position: child.position, alias_symbol: child.alias_symbol };
        if node.subtree.is_visible() || node.alias_symbol != 0 {
            Some(node)
        } else {
            // The field name refers to a hidden rule; report its first
            // visible descendant, as the C implementation does for
            // "inherited" field-map entries.
            node.child(0)
        }
    }

    pub fn child_by_field_name(&self, name: &str) -> Option<Node<'tree>> {
        let field_id = self.tree.language.field_id_for_name(name)?;
        self.child_by_field_id(field_id)
    }

    pub fn field_name_for_child(&self, child_index: u32) -> Option<&'tree str> {
        let entry = RawChildIter::new(&self.subtree, self.position, &self.tree.language)
            .filter(|e| !e.subtree.is_extra())
            .nth(child_index as usize)?;
        let field_id = self
            .tree
            .language
            .field_map(self.subtree.production_id())
            .iter()
            .find(|e| e.structural_child_index as u32 == entry.structural_child_index)?
            .field_id;
        self.tree.language.field_name(field_id)
    }

    pub fn parent(&self) -> Option<Node<'tree>> {
        if let Some(id) = identity_key(&self.subtree) {
            if let Some((parent, position, alias)) = self.tree.parent_cache.lock().unwrap().get(id) {
                return Some(Node { tree: self.tree, subtree: parent, position, alias_symbol: alias });
            }
        }

        let root = self.tree.root_node();
        if same_subtree(&root.subtree, &self.subtree) {
            return None;
        }

        let end_byte = self.end_byte();
        let mut node = root;
        let mut last_visible = node.clone();
        loop {
            let mut descended = false;
            for e in RawChildIter::new(&node.subtree, node.position, &self.tree.language) {
                if e.position.bytes > self.position.bytes || same_subtree(&e.subtree, &self.subtree) {
                    break;
                }
                if e.position.bytes + e.subtree.size().bytes >= end_byte {
                    let child = Node { tree: self.tree, subtree: e.subtree.clone(), position: e.position, alias_symbol: e.alias_symbol };
                    if e.visible {
                        if let Some(id) = identity_key(&child.subtree) {
                            self.tree.parent_cache.lock().unwrap().set(id, last_visible.subtree.clone(), last_visible.position, last_visible.alias_symbol);
                        }
                        last_visible = child.clone();
                    }
                    node = child;
                    descended = true;
                    break;
                }
            }
            if !descended {
                break;
            }
        }
        Some(last_visible)
    }

    fn sibling(&self, offset: i32, named_only: bool) -> Option<Node<'tree>> {
        let parent = self.parent()?;
        let mut items = Vec::new();
        collect_relevant_children(self.tree, &parent.subtree, parent.position, !named_only, &mut items);
        let index = items.iter().position(|e| e.position.bytes == self.position.bytes && same_subtree(&e.subtree, &self.subtree))?;
        let target = index as i64 + offset as i64;
        if target < 0 {
            return None;
        }
        items.into_iter().nth(target as usize).map(|e| self.make(e))
    }

    pub fn next_sibling(&self) -> Option<Node<'tree>> {
        self.sibling(1, false)
    }

    pub fn prev_sibling(&self) -> Option<Node<'tree>> {
        self.sibling(-1, false)
    }

    pub fn next_named_sibling(&self) -> Option<Node<'tree>> {
        self.sibling(1, true)
    }

    pub fn prev_named_sibling(&self) -> Option<Node<'tree>> {
        self.sibling(-1, true)
    }

    pub fn first_child_for_byte(&self, byte: u32) -> Option<Node<'tree>> {
        let mut current = self.clone();
        loop {
            let found = RawChildIter::new(&current.subtree, current.position, &self.tree.language)
                .find(|e| e.position.bytes + e.subtree.size().bytes > byte);
            match found {
                Some(e) if e.visible => return Some(self.make(RelevantChild { subtree: e.subtree, position: e.position, alias_symbol: e.alias_symbol })),
                Some(e) if e.subtree.visible_child_count() > 0 => {
                    current = Node { tree: self.tree, subtree: e.subtree, position: e.position, alias_symbol: e.alias_symbol };
                }
                _ => return None,
            }
        }
    }

    pub fn descendant_for_byte_range(&self, start: u32, end: u32) -> Option<Node<'tree>> {
        if end < self.start_byte() || self.end_byte() < start {
            return None;
        }
        let mut current = self.clone();
        loop {
            let next = RawChildIter::new(&current.subtree, current.position, &self.tree.language)
                .find(|e| e.position.bytes <= start && end <= e.position.bytes + e.subtree.size().bytes);
            match next {
                Some(e) => current = Node { tree: self.tree, subtree: e.subtree, position: e.position, alias_symbol: e.alias_symbol },
                None => break,
            }
        }
        Some(current)
    }

    pub fn descendant_for_point_range(&self, start: Point, end: Point) -> Option<Node<'tree>> {
        if end < self.start_position() || self.end_position() < start {
            return None;
        }
        let mut current = self.clone();
        loop {
            let next = RawChildIter::new(&current.subtree, current.position, &self.tree.language)
                .find(|e| e.position.point <= start && end <= (e.position + e.subtree.size()).point);
            match next {
                Some(e) => current = Node { tree: self.tree, subtree: e.subtree, position: e.position, alias_symbol: e.alias_symbol },
                None => break,
            }
        }
        Some(current)
    }

    pub fn walk(&self) -> TreeCursor<'tree> {
        TreeCursor { tree: self.tree, stack: vec![Frame { subtree: self.subtree.clone(), position: self.position, child_index: 0, structural_child_index: 0 }] }
    }
}

impl PartialEq for Node<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.position == other.position && same_subtree(&self.subtree, &other.subtree)
    }
}

impl Eq for Node<'_> {}

impl fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{Node {} {:?}}}", self.kind(), self.byte_range())
    }
}

struct RelevantChild {
    subtree: Subtree,
    position: Length,
    alias_symbol: Symbol,
}

/// Flattens `parent`'s structural children into the relevant (named-or-all)
/// sequence, descending into hidden rules and splicing their own children
/// in place. Mirrors `ts_node__is_relevant`/`ts_node__child`'s traversal,
/// collected eagerly rather than driven index-by-index: simpler to get
/// right, at the cost of the teacher's O(log i) amortized descent.
fn collect_relevant_children(tree: &Tree, parent: &Subtree, position: Length, include_anonymous: bool, out: &mut Vec<RelevantChild>) {
    for e in RawChildIter::new(parent, position, &tree.language) {
        let relevant = if include_anonymous {
            e.visible
        } else if e.alias_symbol != 0 {
            tree.language.symbol_metadata(e.alias_symbol).named
        } else {
            e.subtree.is_visible() && e.subtree.is_named()
        };
        if relevant {
            out.push(RelevantChild { subtree: e.subtree, position: e.position, alias_symbol: e.alias_symbol });
        } else if e.subtree.visible_child_count() > 0 {
            collect_relevant_children(tree, &e.subtree, e.position, include_anonymous, out);
        }
    }
}

pub struct NodeChildIterator<'tree> {
    tree: &'tree Tree,
    items: std::vec::IntoIter<RelevantChild>,
}

impl<'tree> Iterator for NodeChildIterator<'tree> {
    type Item = Node<'tree>;

    fn next(&mut self) -> Option<Node<'tree>> {
        self.items.next().map(|e| Node { tree: self.tree, subtree: e.subtree, position: e.position, alias_symbol: e.alias_symbol })
    }
}

#[derive(Clone)]
struct Frame {
    subtree: Subtree,
    position: Length,
    child_index: u32,
    structural_child_index: u32,
}

impl Frame {
    fn from_entry(e: &RawChildEntry) -> Frame {
        Frame { subtree: e.subtree.clone(), position: e.position, child_index: e.child_index, structural_child_index: e.structural_child_index }
    }
}

/// A stack of `{subtree, position, child_index, structural_child_index}`
/// frames from an arbitrary starting node down to the current one. Mirrors
/// `TSTreeCursor`.
pub struct TreeCursor<'tree> {
    tree: &'tree Tree,
    stack: Vec<Frame>,
}

impl<'tree> TreeCursor<'tree> {
    pub fn node(&self) -> Node<'tree> {
        let last = self.stack.last().expect("cursor stack is never empty");
        let mut alias_symbol = 0;
        if self.stack.len() > 1 {
            let parent = &self.stack[self.stack.len() - 2];
            if !last.subtree.is_extra() {
                if let Some(seq) = self.tree.language.alias_sequence(parent.subtree.production_id()) {
                    alias_symbol = seq.get(last.structural_child_index as usize).copied().unwrap_or(0);
                }
            }
        }
        Node { tree: self.tree, subtree: last.subtree.clone(), position: last.position, alias_symbol }
    }

    pub fn goto_first_child(&mut self) -> bool {
        loop {
            let last = self.stack.last().unwrap().clone();
            let mut descended = false;
            for e in RawChildIter::new(&last.subtree, last.position, &self.tree.language) {
                if e.visible {
                    self.stack.push(Frame::from_entry(&e));
                    return true;
                }
                if e.subtree.visible_child_count() > 0 {
                    self.stack.push(Frame::from_entry(&e));
                    descended = true;
                    break;
                }
            }
            if !descended {
                return false;
            }
        }
    }

    pub fn goto_next_sibling(&mut self) -> bool {
        let initial_stack = self.stack.clone();
        while self.stack.len() > 1 {
            let entry = self.stack.pop().unwrap();
            let parent = self.stack.last().unwrap().clone();
            let mut iter = RawChildIter::new(&parent.subtree, parent.position, &self.tree.language);
            iter.child_index = entry.child_index;
            iter.structural_child_index = entry.structural_child_index;
            iter.position = entry.position;
            // Replay the popped entry once so the iterator's internal
            // position/index fields advance past it, then resume from there.
            iter.next();

            for e in iter {
                if e.visible {
                    self.stack.push(Frame::from_entry(&e));
                    return true;
                }
                if e.subtree.visible_child_count() > 0 {
                    self.stack.push(Frame::from_entry(&e));
                    self.goto_first_child();
                    return true;
                }
            }
        }
        self.stack = initial_stack;
        false
    }

    pub fn goto_parent(&mut self) -> bool {
        if self.stack.len() < 2 {
            return false;
        }
        for i in (0..self.stack.len() - 1).rev() {
            let entry = &self.stack[i];
            let mut is_aliased = false;
            if i > 0 {
                let parent_entry = &self.stack[i - 1];
                if let Some(seq) = self.tree.language.alias_sequence(parent_entry.subtree.production_id()) {
                    is_aliased = seq.get(entry.structural_child_index as usize).copied().unwrap_or(0) != 0;
                }
            }
            if entry.subtree.is_visible() || is_aliased {
                self.stack.truncate(i + 1);
                return true;
            }
        }
        false
    }

    /// Descends to the visible child covering `goal_byte`, returning its
    /// visible-child index, or `-1` if none is found.
    pub fn goto_first_child_for_byte(&mut self, goal_byte: u32) -> i64 {
        let initial_len = self.stack.len();
        let mut visible_child_index: i64 = 0;
        loop {
            let last = self.stack.last().unwrap().clone();
            let mut descended = false;
            for e in RawChildIter::new(&last.subtree, last.position, &self.tree.language) {
                let end_byte = e.position.bytes + e.subtree.size().bytes;
                let at_goal = end_byte > goal_byte;
                let visible_child_count = e.subtree.visible_child_count();
                if at_goal {
                    if e.visible {
                        self.stack.push(Frame::from_entry(&e));
                        return visible_child_index;
                    }
                    if visible_child_count > 0 {
                        self.stack.push(Frame::from_entry(&e));
                        descended = true;
                        break;
                    }
                } else if e.visible {
                    visible_child_index += 1;
                } else {
                    visible_child_index += visible_child_count as i64;
                }
            }
            if !descended {
                break;
            }
        }

        if self.stack.len() > initial_len && self.goto_next_sibling() {
            return visible_child_index;
        }
        self.stack.truncate(initial_len);
        -1
    }

    pub fn field_id(&self) -> Option<u16> {
        for i in (1..self.stack.len()).rev() {
            let entry = &self.stack[i];
            let parent_entry = &self.stack[i - 1];
            if i != self.stack.len() - 1 {
                if entry.subtree.is_visible() {
                    break;
                }
                if let Some(seq) = self.tree.language.alias_sequence(parent_entry.subtree.production_id()) {
                    if seq.get(entry.structural_child_index as usize).copied().unwrap_or(0) != 0 {
                        break;
                    }
                }
            }
            if let Some(field) = self
                .tree
                .language
                .field_map(parent_entry.subtree.production_id())
                .iter()
                .find(|f| f.structural_child_index as u32 == entry.structural_child_index)
            {
                return Some(field.field_id);
            }
        }
        None
    }

    pub fn field_name(&self) -> Option<&'tree str> {
        self.tree.language.field_name(self.field_id()?)
    }
}

impl Clone for TreeCursor<'_> {
    fn clone(&self) -> Self {
        TreeCursor { tree: self.tree, stack: self.stack.clone() }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
enum Comparison {
    Matches,
    MayDiffer,
    Differs,
}

fn compare_nodes(old: &Node, new: &Node, diffs: &[std::ops::Range<u32>]) -> Comparison {
    if old.kind_id() != new.kind_id() || old.is_named() != new.is_named() {
        return Comparison::Differs;
    }
    let same_span = old.start_byte() == new.start_byte() && old.end_byte() == new.end_byte() && old.start_position() == new.start_position();
    // `parse_state` isn't comparable for equality across trees: an interior
    // node's own state is either the poison sentinel (no direct error
    // child) or `ERROR_STATE` (a direct error child), never a real shift
    // state, so the only meaningful comparison is "both carry a real state"
    // plus "both or neither sit at ERROR_STATE".
    let old_ps = old.parse_state();
    let new_ps = new.parse_state();
    let parse_state_compatible = old_ps != crate::language::ERROR_STATE
        && new_ps != crate::language::ERROR_STATE
        && (old_ps == crate::language::ERROR_STATE) == (new_ps == crate::language::ERROR_STATE);
    let matches = same_span
        && parse_state_compatible
        && !old.has_changes()
        && !new.has_changes()
        && !old.is_error()
        && !new.is_error()
        && !crate::range::intersects(diffs, old.byte_range());
    if matches { Comparison::Matches } else { Comparison::MayDiffer }
}

fn push_merged(out: &mut Vec<Range>, start_byte: u32, start_point: Point, end_byte: u32, end_point: Point) {
    if start_byte >= end_byte {
        return;
    }
    if let Some(last) = out.last_mut() {
        if last.end_byte >= start_byte {
            if end_byte > last.end_byte {
                last.end_byte = end_byte;
                last.end_point = end_point;
            }
            return;
        }
    }
    out.push(Range { start_byte, end_byte, start_point, end_point });
}

fn diff_nodes(old: &Node, new: &Node, diffs: &[std::ops::Range<u32>], out: &mut Vec<Range>) {
    match compare_nodes(old, new, diffs) {
        Comparison::Matches => {}
        Comparison::Differs => {
            let start_byte = old.start_byte().min(new.start_byte());
            let start_point = if old.start_position() <= new.start_position() { old.start_position() } else { new.start_position() };
            let end_byte = old.end_byte().min(new.end_byte());
            let end_point = if old.end_position() <= new.end_position() { old.end_position() } else { new.end_position() };
            push_merged(out, start_byte, start_point, end_byte, end_point);
        }
        Comparison::MayDiffer => {
            let old_children: Vec<Node> = old.children().collect();
            let new_children: Vec<Node> = new.children().collect();

            if old_children.is_empty() || new_children.is_empty() {
                let start_byte = old.start_byte().min(new.start_byte());
                let start_point = if old.start_position() <= new.start_position() { old.start_position() } else { new.start_position() };
                let end_byte = old.end_byte().max(new.end_byte());
                let end_point = if old.end_position() >= new.end_position() { old.end_position() } else { new.end_position() };
                push_merged(out, start_byte, start_point, end_byte, end_point);
                return;
            }

            let paired = old_children.len().min(new_children.len());
            for i in 0..paired {
                diff_nodes(&old_children[i], &new_children[i], diffs, out);
            }
            if old_children.len() != new_children.len() {
                let (tail, other_end_byte, other_end_point) = if old_children.len() > new_children.len() {
                    (&old_children[paired..], new.end_byte(), new.end_position())
                } else {
                    (&new_children[paired..], old.end_byte(), old.end_position())
                };
                if let (Some(first), Some(last)) = (tail.first(), tail.last()) {
                    let start_byte = first.start_byte().min(other_end_byte);
                    let start_point = if first.start_position() <= other_end_point { first.start_position() } else { other_end_point };
                    let end_byte = last.end_byte().max(other_end_byte);
                    let end_point = if last.end_position() >= other_end_point { last.end_position() } else { other_end_point };
                    push_merged(out, start_byte, start_point, end_byte, end_point);
                }
            }
        }
    }
}

/// The byte spans whose syntactic structure differs between `old` and
/// `new`, per §4.5.1. `old` must have been `edit`ed to align its
/// coordinates with `new` before calling this.
pub fn changed_ranges(old: &Tree, new: &Tree) -> Vec<Range> {
    let diffs = crate::range::symmetric_difference(&old.included_ranges, &new.included_ranges);
    let mut out = Vec::new();
    diff_nodes(&old.root_node(), &new.root_node(), &diffs, &mut out);

    let old_end = old.root_node().end_byte();
    let new_end = new.root_node().end_byte();
    if old_end != new_end {
        let min_end = old_end.min(new_end);
        let max_end = old_end.max(new_end);
        let (min_point, max_point) = if old_end <= new_end {
            (old.root_node().end_position(), new.root_node().end_position())
        } else {
            (new.root_node().end_position(), old.root_node().end_position())
        };
        push_merged(&mut out, min_end, min_point, max_end, max_point);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{LanguageBuilder, SymbolMetadata};
    use crate::subtree::SubtreePool;

    // S -> A B, A -> 'a', B -> 'b'
    const SYM_A: Symbol = 1;
    const SYM_B: Symbol = 2;
    const SYM_S: Symbol = 3;

    fn toy_language() -> Language {
        LanguageBuilder::new(4, 3, 0)
            .symbol(SYM_A, "a", SymbolMetadata { visible: true, named: true, extra: false })
            .symbol(SYM_B, "b", SymbolMetadata { visible: true, named: true, extra: false })
            .symbol(SYM_S, "s", SymbolMetadata { visible: true, named: true, extra: false })
            .lex_fn(|_, _| false)
            .build()
    }

    fn leaf(pool: &mut SubtreePool, language: &Language, symbol: Symbol, bytes: u32) -> Subtree {
        pool.new_leaf(language, symbol, Length::ZERO, Length::new(bytes, Point::new(0, bytes)), 0, 0, false, false)
    }

    fn build_tree() -> Tree {
        let language = toy_language();
        let mut pool = SubtreePool::new();
        let a = leaf(&mut pool, &language, SYM_A, 1);
        let b = leaf(&mut pool, &language, SYM_B, 1);
        let root = pool.new_node(&language, SYM_S, vec![a, b], 0);
        Tree::new(root, language, vec![Range::WHOLE_DOCUMENT])
    }

    #[test]
    fn root_node_reports_full_span() {
        let tree = build_tree();
        let root = tree.root_node();
        assert_eq!(root.byte_range(), 0..2);
        assert_eq!(root.child_count(), 2);
    }

    #[test]
    fn child_navigation_round_trips_to_parent() {
        let tree = build_tree();
        let root = tree.root_node();
        let first = root.child(0).unwrap();
        assert_eq!(first.kind(), "a");
        let parent = first.parent().unwrap();
        assert_eq!(parent, root);
    }

    #[test]
    fn next_sibling_walks_forward() {
        let tree = build_tree();
        let root = tree.root_node();
        let first = root.child(0).unwrap();
        let second = first.next_sibling().unwrap();
        assert_eq!(second.kind(), "b");
        assert!(second.next_sibling().is_none());
        assert_eq!(second.prev_sibling().unwrap(), first);
    }

    #[test]
    fn cursor_visits_children_in_order() {
        let tree = build_tree();
        let mut cursor = tree.walk();
        assert!(cursor.goto_first_child());
        assert_eq!(cursor.node().kind(), "a");
        assert!(cursor.goto_next_sibling());
        assert_eq!(cursor.node().kind(), "b");
        assert!(!cursor.goto_next_sibling());
        assert!(cursor.goto_parent());
        assert_eq!(cursor.node().kind(), "s");
    }

    #[test]
    fn identical_trees_have_no_changed_ranges() {
        let old = build_tree();
        let new = build_tree();
        assert!(changed_ranges(&old, &new).is_empty());
    }

    #[test]
    fn differing_leaf_is_reported() {
        let language = toy_language();
        let mut pool = SubtreePool::new();
        let a = leaf(&mut pool, &language, SYM_A, 1);
        let b_old = leaf(&mut pool, &language, SYM_B, 1);
        let old_root = pool.new_node(&language, SYM_S, vec![a.clone(), b_old], 0);
        let old = Tree::new(old_root, language.clone(), vec![Range::WHOLE_DOCUMENT]);

        let b_new = leaf(&mut pool, &language, SYM_B, 2);
        let new_root = pool.new_node(&language, SYM_S, vec![a, b_new], 0);
        let new = Tree::new(new_root, language, vec![Range::WHOLE_DOCUMENT]);

        let ranges = changed_ranges(&old, &new);
        assert!(!ranges.is_empty());
        assert_eq!(ranges[0].start_byte, 1);
    }
}
