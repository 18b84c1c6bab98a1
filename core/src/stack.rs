//! Component C4: the branching/merging GLR parse stack. Mirrors `stack.c`.
//!
//! Stack nodes form a DAG rather than a linear stack: a shift can add a link
//! to an existing node (when two versions coincide), and popping can reveal
//! versions that had previously been collapsed together. Nodes live in a
//! `Slab` arena and are manually refcounted, since many `StackHead`s and
//! sibling links can share a predecessor.

use bitflags::bitflags;
use smallvec::SmallVec;
use slab::Slab;

use crate::error_cost::ERROR_COST_PER_RECOVERY;
use crate::language::{StateId, Symbol, ERROR_STATE};
use crate::length::Length;
use crate::subtree::{Subtree, SubtreePool};

pub const MAX_LINK_COUNT: usize = 8;
pub const MAX_ITERATOR_COUNT: usize = 64;
pub const MAX_VERSION_COUNT: usize = 6;
pub const MAX_VERSION_COUNT_OVERFLOW: usize = 4;

pub type StackVersion = usize;

type NodeId = usize;

struct StackLink {
    predecessor: NodeId,
    subtree: Option<Subtree>,
    is_pending: bool,
}

struct StackNode {
    state: StateId,
    position: Length,
    links: SmallVec<[StackLink; MAX_LINK_COUNT]>,
    ref_count: u32,
    error_cost: u32,
    node_count: u32,
    dynamic_precedence: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackStatus {
    Active,
    Paused,
    Halted,
}

#[derive(Debug, Clone, Copy)]
pub struct StackSummaryEntry {
    pub position: Length,
    pub depth: u32,
    pub state: StateId,
}

struct StackHead {
    node: NodeId,
    last_external_token: Option<Subtree>,
    summary: Option<Vec<StackSummaryEntry>>,
    node_count_at_last_error: u32,
    lookahead_when_paused: Symbol,
    status: StackStatus,
}

pub struct StackSlice {
    pub subtrees: Vec<Subtree>,
    pub version: StackVersion,
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    struct StackAction: u8 {
        const NONE = 0;
        const STOP = 1;
        const POP = 2;
    }
}

struct NodeInfo {
    link_count: usize,
    state: StateId,
    position: Length,
}

struct StackIterator {
    node: NodeId,
    subtrees: Vec<Subtree>,
    subtree_count: u32,
    is_pending: bool,
}

pub struct Stack {
    nodes: Slab<StackNode>,
    heads: Vec<StackHead>,
    base_node: NodeId,
}

impl Stack {
    pub fn new() -> Self {
        let mut nodes = Slab::new();
        let base_node = nodes.insert(StackNode {
            state: crate::language::BASE_STATE,
            position: Length::ZERO,
            links: SmallVec::new(),
            ref_count: 1,
            error_cost: 0,
            node_count: 0,
            dynamic_precedence: 0,
        });
        let mut stack = Stack { nodes, base_node, heads: Vec::new() };
        stack.clear_heads();
        stack
    }

    fn retain_node(&mut self, id: NodeId) {
        self.nodes[id].ref_count += 1;
    }

    /// Iterative release mirroring `stack_node_release`'s manual
    /// tail-recursion: the first-predecessor chain is walked in a loop so
    /// dropping a long linear run of stack nodes can't overflow the stack.
    fn release_node(&mut self, pool: &mut SubtreePool, mut id: NodeId) {
        loop {
            let ref_count = {
                let node = &mut self.nodes[id];
                node.ref_count -= 1;
                node.ref_count
            };
            if ref_count > 0 {
                return;
            }

            let node = self.nodes.remove(id);
            let mut first_predecessor = None;
            for (i, link) in node.links.into_iter().enumerate() {
                if let Some(subtree) = link.subtree {
                    pool.release(subtree);
                }
                if i == 0 {
                    first_predecessor = Some(link.predecessor);
                } else {
                    self.release_node(pool, link.predecessor);
                }
            }

            match first_predecessor {
                Some(next) => id = next,
                None => return,
            }
        }
    }

    fn new_node(&mut self, previous: Option<NodeId>, subtree: Option<Subtree>, is_pending: bool, state: StateId) -> NodeId {
        let (position, error_cost, node_count, dynamic_precedence) = match previous {
            Some(prev) => {
                let p = &self.nodes[prev];
                (p.position, p.error_cost, p.node_count, p.dynamic_precedence)
            }
            None => (Length::ZERO, 0, 0, 0),
        };

        let mut node = StackNode {
            state,
            position,
            links: SmallVec::new(),
            ref_count: 1,
            error_cost,
            node_count,
            dynamic_precedence,
        };

        if let Some(prev) = previous {
            if let Some(subtree) = &subtree {
                node.error_cost += subtree.error_cost();
                node.position += subtree.total_size();
                node.node_count += subtree.node_count();
                node.dynamic_precedence += subtree.dynamic_precedence();
            }
            node.links.push(StackLink { predecessor: prev, subtree, is_pending });
        }

        self.nodes.insert(node)
    }

    fn subtree_is_equivalent(left: &Option<Subtree>, right: &Option<Subtree>) -> bool {
        match (left, right) {
            (None, None) => true,
            (Some(l), Some(r)) => {
                l.symbol() == r.symbol()
                    && ((l.error_cost() > 0 && r.error_cost() > 0)
                        || (l.padding() == r.padding()
                            && l.size() == r.size()
                            && l.child_count() == r.child_count()
                            && l.is_extra() == r.is_extra()
                            && l.external_scanner_state_eq(r)))
            }
            _ => false,
        }
    }

    /// Adds `link` to `target`'s predecessor set, merging recursively if an
    /// equivalent link to the same predecessor already exists. Mirrors
    /// `stack_node_add_link`.
    fn add_link(&mut self, pool: &mut SubtreePool, target: NodeId, link_predecessor: NodeId, link_subtree: Option<Subtree>, link_is_pending: bool) {
        if link_predecessor == target {
            return;
        }

        let existing_count = self.nodes[target].links.len();
        for i in 0..existing_count {
            let same_node = self.nodes[target].links[i].predecessor == link_predecessor;
            let equivalent = Self::subtree_is_equivalent(&self.nodes[target].links[i].subtree, &link_subtree);
            if !equivalent {
                continue;
            }

            if same_node {
                let existing_precedence = link_subtree.as_ref().map_or(0, Subtree::dynamic_precedence);
                let current_precedence = self.nodes[target].links[i].subtree.as_ref().map_or(0, Subtree::dynamic_precedence);
                if existing_precedence > current_precedence {
                    if let Some(s) = link_subtree {
                        let retained = pool.retain(&s);
                        if let Some(old) = self.nodes[target].links[i].subtree.take() {
                            pool.release(old);
                        }
                        self.nodes[target].links[i].subtree = Some(retained);
                        self.nodes[target].dynamic_precedence = self.nodes[link_predecessor].dynamic_precedence + existing_precedence;
                    }
                }
                return;
            }

            let predecessor_state = self.nodes[link_predecessor].state;
            let predecessor_position = self.nodes[link_predecessor].position;
            let existing_node = self.nodes[target].links[i].predecessor;
            if self.nodes[existing_node].state == predecessor_state
                && self.nodes[existing_node].position.bytes == predecessor_position.bytes
            {
                let sub_links: Vec<(NodeId, Option<Subtree>, bool)> = self.nodes[link_predecessor]
                    .links
                    .iter()
                    .map(|l| (l.predecessor, l.subtree.as_ref().map(|s| pool.retain(s)), l.is_pending))
                    .collect();
                for (pred, sub, pending) in sub_links {
                    self.add_link(pool, existing_node, pred, sub, pending);
                }
                let mut dynamic_precedence = self.nodes[link_predecessor].dynamic_precedence;
                if let Some(s) = &link_subtree {
                    dynamic_precedence += s.dynamic_precedence();
                }
                if dynamic_precedence > self.nodes[target].dynamic_precedence {
                    self.nodes[target].dynamic_precedence = dynamic_precedence;
                }
                if let Some(s) = link_subtree {
                    pool.release(s);
                }
                return;
            }
        }

        if self.nodes[target].links.len() == MAX_LINK_COUNT {
            if let Some(s) = link_subtree {
                pool.release(s);
            }
            return;
        }

        self.retain_node(link_predecessor);
        let mut node_count = self.nodes[link_predecessor].node_count;
        let mut dynamic_precedence = self.nodes[link_predecessor].dynamic_precedence;
        let subtree = link_subtree.map(|s| {
            let retained = pool.retain(&s);
            node_count += s.node_count();
            dynamic_precedence += s.dynamic_precedence();
            pool.release(s);
            retained
        });
        self.nodes[target].links.push(StackLink { predecessor: link_predecessor, subtree, is_pending: link_is_pending });
        if node_count > self.nodes[target].node_count {
            self.nodes[target].node_count = node_count;
        }
        if dynamic_precedence > self.nodes[target].dynamic_precedence {
            self.nodes[target].dynamic_precedence = dynamic_precedence;
        }
    }

    fn clear_heads(&mut self) {
        self.retain_node(self.base_node);
        self.heads.clear();
        self.heads.push(StackHead {
            node: self.base_node,
            last_external_token: None,
            summary: None,
            node_count_at_last_error: 0,
            lookahead_when_paused: 0,
            status: StackStatus::Active,
        });
    }

    pub fn clear(&mut self, pool: &mut SubtreePool) {
        for i in 0..self.heads.len() {
            self.release_head(pool, i);
        }
        self.clear_heads();
    }

    fn release_head(&mut self, pool: &mut SubtreePool, index: usize) {
        let head = &mut self.heads[index];
        if let Some(token) = head.last_external_token.take() {
            pool.release(token);
        }
        head.summary = None;
        let node = head.node;
        self.release_node(pool, node);
    }

    pub fn version_count(&self) -> usize {
        self.heads.len()
    }

    pub fn state(&self, version: StackVersion) -> StateId {
        self.nodes[self.heads[version].node].state
    }

    pub fn position(&self, version: StackVersion) -> Length {
        self.nodes[self.heads[version].node].position
    }

    pub fn last_external_token(&self, version: StackVersion) -> Option<&Subtree> {
        self.heads[version].last_external_token.as_ref()
    }

    pub fn set_last_external_token(&mut self, pool: &mut SubtreePool, version: StackVersion, token: Option<Subtree>) {
        let retained = token.map(|t| pool.retain(&t));
        let head = &mut self.heads[version];
        if let Some(old) = head.last_external_token.take() {
            pool.release(old);
        }
        head.last_external_token = retained;
    }

    pub fn error_cost(&self, version: StackVersion) -> u32 {
        let head = &self.heads[version];
        let node = &self.nodes[head.node];
        let mut result = node.error_cost;
        let unwound_error = node.state == ERROR_STATE && node.links.first().map_or(true, |l| l.subtree.is_none());
        if head.status == StackStatus::Paused || unwound_error {
            result += ERROR_COST_PER_RECOVERY;
        }
        result
    }

    pub fn node_count_since_error(&mut self, version: StackVersion) -> u32 {
        let node_id = self.heads[version].node;
        let node_count = self.nodes[node_id].node_count;
        let head = &mut self.heads[version];
        if node_count < head.node_count_at_last_error {
            head.node_count_at_last_error = node_count;
        }
        node_count - head.node_count_at_last_error
    }

    pub fn dynamic_precedence(&self, version: StackVersion) -> i32 {
        self.nodes[self.heads[version].node].dynamic_precedence
    }

    pub fn push(&mut self, version: StackVersion, subtree: Option<Subtree>, is_pending: bool, state: StateId) {
        let previous = self.heads[version].node;
        let has_subtree = subtree.is_some();
        let new_node = self.new_node(Some(previous), subtree, is_pending, state);
        if !has_subtree {
            self.heads[version].node_count_at_last_error = self.nodes[new_node].node_count;
        }
        self.heads[version].node = new_node;
    }

    fn add_version(&mut self, original_version: StackVersion, node: NodeId) -> StackVersion {
        let node_count_at_last_error = self.heads[original_version].node_count_at_last_error;
        let last_external_token = self.heads[original_version].last_external_token.clone();
        self.retain_node(node);
        self.heads.push(StackHead {
            node,
            node_count_at_last_error,
            last_external_token,
            status: StackStatus::Active,
            lookahead_when_paused: 0,
            summary: None,
        });
        self.heads.len() - 1
    }

    fn add_slice(&mut self, original_version: StackVersion, node: NodeId, subtrees: Vec<Subtree>, slices: &mut Vec<StackSlice>) {
        for slice in slices.iter().rev() {
            if self.heads[slice.version].node == node {
                let version = slice.version;
                slices.push(StackSlice { subtrees, version });
                return;
            }
        }
        let version = self.add_version(original_version, node);
        slices.push(StackSlice { subtrees, version });
    }

    fn iterate(
        &mut self,
        pool: &mut SubtreePool,
        version: StackVersion,
        include_subtrees: bool,
        mut callback: impl FnMut(&StackIterator, NodeInfo) -> StackAction,
    ) -> Vec<StackSlice> {
        let mut slices = Vec::new();
        let start_node = self.heads[version].node;
        let mut iterators = vec![StackIterator { node: start_node, subtrees: Vec::new(), subtree_count: 0, is_pending: true }];

        while !iterators.is_empty() {
            let size = iterators.len();
            let mut i = 0;
            while i < size.min(iterators.len()) {
                let node_id = iterators[i].node;
                let link_count = self.nodes[node_id].links.len();
                let info = NodeInfo { link_count, state: self.nodes[node_id].state, position: self.nodes[node_id].position };
                let action = callback(&iterators[i], info);
                let should_pop = action.contains(StackAction::POP);
                let should_stop = action.contains(StackAction::STOP) || link_count == 0;

                if should_pop {
                    let mut subtrees = std::mem::take(&mut iterators[i].subtrees);
                    if !should_stop {
                        subtrees = subtrees.iter().map(|s| pool.retain(s)).collect();
                    }
                    subtrees.reverse();
                    self.add_slice(version, node_id, subtrees, &mut slices);
                }

                if should_stop {
                    if !should_pop {
                        for s in iterators[i].subtrees.drain(..) {
                            pool.release(s);
                        }
                    }
                    iterators.remove(i);
                    continue;
                }

                let links: Vec<(NodeId, Option<Subtree>, bool)> = self.nodes[node_id]
                    .links
                    .iter()
                    .map(|l| (l.predecessor, l.subtree.as_ref().map(|s| pool.retain(s)), l.is_pending))
                    .collect();

                for j in 1..=link_count {
                    let (predecessor, subtree, is_pending) = if j == link_count {
                        links[0].clone_parts()
                    } else {
                        if iterators.len() >= MAX_ITERATOR_COUNT {
                            continue;
                        }
                        links[j].clone_parts()
                    };

                    let target_index = if j == link_count {
                        i
                    } else {
                        let cloned = StackIterator {
                            node: iterators[i].node,
                            subtrees: iterators[i].subtrees.iter().map(|s| pool.retain(s)).collect(),
                            subtree_count: iterators[i].subtree_count,
                            is_pending: iterators[i].is_pending,
                        };
                        iterators.push(cloned);
                        iterators.len() - 1
                    };

                    iterators[target_index].node = predecessor;
                    if let Some(subtree) = subtree {
                        let is_extra = subtree.is_extra();
                        if include_subtrees {
                            iterators[target_index].subtrees.push(pool.retain(&subtree));
                        }
                        if !is_extra {
                            iterators[target_index].subtree_count += 1;
                            if !is_pending {
                                iterators[target_index].is_pending = false;
                            }
                        }
                        pool.release(subtree);
                    } else {
                        iterators[target_index].subtree_count += 1;
                        iterators[target_index].is_pending = false;
                    }
                }

                i += 1;
            }
        }

        slices
    }

    pub fn pop_count(&mut self, pool: &mut SubtreePool, version: StackVersion, count: u32) -> Vec<StackSlice> {
        self.iterate(pool, version, true, |it, _info| {
            if it.subtree_count == count {
                StackAction::POP | StackAction::STOP
            } else {
                StackAction::NONE
            }
        })
    }

    pub fn pop_pending(&mut self, pool: &mut SubtreePool, version: StackVersion) -> Vec<StackSlice> {
        let mut slices = self.iterate(pool, version, false, |it, _| {
            if it.subtree_count >= 1 {
                if it.is_pending {
                    StackAction::POP | StackAction::STOP
                } else {
                    StackAction::STOP
                }
            } else {
                StackAction::NONE
            }
        });
        if let Some(first) = slices.first_mut() {
            self.renumber_version(pool, first.version, version);
            first.version = version;
        }
        slices
    }

    pub fn pop_error(&mut self, pool: &mut SubtreePool, version: StackVersion) -> Vec<Subtree> {
        let node = self.heads[version].node;
        let has_error_link = self.nodes[node]
            .links
            .iter()
            .any(|l| l.subtree.as_ref().is_some_and(Subtree::is_error));
        if !has_error_link {
            return Vec::new();
        }

        let mut found_error = false;
        let mut slices = self.iterate(pool, version, true, |it, _| {
            if !it.subtrees.is_empty() {
                if !found_error && it.subtrees[0].is_error() {
                    found_error = true;
                    StackAction::POP | StackAction::STOP
                } else {
                    StackAction::STOP
                }
            } else {
                StackAction::NONE
            }
        });
        if let Some(slice) = slices.pop() {
            self.renumber_version(pool, slice.version, version);
            return slice.subtrees;
        }
        Vec::new()
    }

    pub fn pop_all(&mut self, pool: &mut SubtreePool, version: StackVersion) -> Vec<StackSlice> {
        self.iterate(pool, version, true, |_, info| {
            if info.link_count == 0 {
                StackAction::POP
            } else {
                StackAction::NONE
            }
        })
    }

    pub fn record_summary(&mut self, pool: &mut SubtreePool, version: StackVersion, max_depth: u32) {
        let mut summary: Vec<StackSummaryEntry> = Vec::new();
        self.iterate(pool, version, false, |it, info| {
            let depth = it.subtree_count;
            if depth > max_depth {
                return StackAction::STOP;
            }
            let mut skip = false;
            for entry in summary.iter().rev() {
                if entry.depth < depth {
                    break;
                }
                if entry.depth == depth && entry.state == info.state {
                    skip = true;
                    break;
                }
            }
            if !skip {
                summary.push(StackSummaryEntry { position: info.position, depth, state: info.state });
            }
            StackAction::NONE
        });
        self.heads[version].summary = Some(summary);
    }

    pub fn get_summary(&self, version: StackVersion) -> Option<&[StackSummaryEntry]> {
        self.heads[version].summary.as_deref()
    }

    pub fn has_advanced_since_error(&self, version: StackVersion) -> bool {
        let head = &self.heads[version];
        let mut node_id = head.node;
        if self.nodes[node_id].error_cost == 0 {
            return true;
        }
        loop {
            let node = &self.nodes[node_id];
            let Some(first_link) = node.links.first() else { break };
            match &first_link.subtree {
                Some(subtree) => {
                    if subtree.total_size().bytes > 0 {
                        return true;
                    } else if node.node_count > head.node_count_at_last_error && subtree.error_cost() == 0 {
                        node_id = first_link.predecessor;
                        continue;
                    }
                }
                None => {}
            }
            break;
        }
        false
    }

    pub fn remove_version(&mut self, pool: &mut SubtreePool, version: StackVersion) {
        self.release_head(pool, version);
        self.heads.remove(version);
    }

    pub(crate) fn renumber_version(
        &mut self,
        pool: &mut SubtreePool,
        from: StackVersion,
        to: StackVersion,
    ) {
        if from == to {
            return;
        }
        debug_assert!(to < from);
        if self.heads[to].summary.is_none() && self.heads[from].summary.is_some() {
            let summary = self.heads[from].summary.take();
            self.heads[to].summary = summary;
        }
        self.release_head(pool, to);
        self.heads[to] = StackHead {
            node: self.heads[from].node,
            last_external_token: self.heads[from].last_external_token.take(),
            summary: self.heads[to].summary.take(),
            node_count_at_last_error: self.heads[from].node_count_at_last_error,
            lookahead_when_paused: self.heads[from].lookahead_when_paused,
            status: self.heads[from].status,
        };
        self.heads.remove(from);
    }

    pub fn swap_versions(&mut self, v1: StackVersion, v2: StackVersion) {
        self.heads.swap(v1, v2);
    }

    pub fn copy_version(&mut self, version: StackVersion) -> StackVersion {
        let node = self.heads[version].node;
        self.retain_node(node);
        let token = self.heads[version].last_external_token.clone();
        let head = StackHead {
            node,
            last_external_token: token,
            summary: None,
            node_count_at_last_error: self.heads[version].node_count_at_last_error,
            lookahead_when_paused: self.heads[version].lookahead_when_paused,
            status: self.heads[version].status,
        };
        self.heads.push(head);
        self.heads.len() - 1
    }

    pub fn can_merge(&self, version1: StackVersion, version2: StackVersion) -> bool {
        let h1 = &self.heads[version1];
        let h2 = &self.heads[version2];
        let n1 = &self.nodes[h1.node];
        let n2 = &self.nodes[h2.node];
        h1.status == StackStatus::Active
            && h2.status == StackStatus::Active
            && n1.state == n2.state
            && n1.position.bytes == n2.position.bytes
            && n1.error_cost == n2.error_cost
            && crate::subtree::external_scanner_state_eq_opt(h1.last_external_token.as_ref(), h2.last_external_token.as_ref())
    }

    pub fn merge(&mut self, pool: &mut SubtreePool, version1: StackVersion, version2: StackVersion) -> bool {
        if !self.can_merge(version1, version2) {
            return false;
        }
        let node1 = self.heads[version1].node;
        let node2 = self.heads[version2].node;
        let links: Vec<(NodeId, Option<Subtree>, bool)> = self.nodes[node2]
            .links
            .iter()
            .map(|l| (l.predecessor, l.subtree.as_ref().map(|s| pool.retain(s)), l.is_pending))
            .collect();
        for (predecessor, subtree, is_pending) in links {
            self.add_link(pool, node1, predecessor, subtree, is_pending);
        }
        if self.nodes[node1].state == ERROR_STATE {
            self.heads[version1].node_count_at_last_error = self.nodes[node1].node_count;
        }
        self.remove_version(pool, version2);
        true
    }

    pub fn halt(&mut self, version: StackVersion) {
        self.heads[version].status = StackStatus::Halted;
    }

    pub fn pause(&mut self, version: StackVersion, lookahead: Symbol) {
        let node = self.heads[version].node;
        let node_count = self.nodes[node].node_count;
        let head = &mut self.heads[version];
        head.status = StackStatus::Paused;
        head.lookahead_when_paused = lookahead;
        head.node_count_at_last_error = node_count;
    }

    pub fn resume(&mut self, version: StackVersion) -> Symbol {
        let head = &mut self.heads[version];
        debug_assert_eq!(head.status, StackStatus::Paused);
        let result = head.lookahead_when_paused;
        head.status = StackStatus::Active;
        head.lookahead_when_paused = 0;
        result
    }

    pub fn is_active(&self, version: StackVersion) -> bool {
        self.heads[version].status == StackStatus::Active
    }

    pub fn is_paused(&self, version: StackVersion) -> bool {
        self.heads[version].status == StackStatus::Paused
    }

    pub fn is_halted(&self, version: StackVersion) -> bool {
        self.heads[version].status == StackStatus::Halted
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Heads and the base node hold the only external references into
        // `nodes`; releasing them without a subtree pool would leak the
        // subtrees they reference, so `Parser` is responsible for calling
        // `clear`/`remove_version` with its pool before a `Stack` is dropped
        // in practice. As a backstop, drop whatever tree data remains.
        let mut fallback_pool = SubtreePool::new();
        for i in (0..self.heads.len()).rev() {
            self.release_head(&mut fallback_pool, i);
        }
    }
}

trait ClonePartsExt {
    fn clone_parts(&self) -> (NodeId, Option<Subtree>, bool);
}

impl ClonePartsExt for (NodeId, Option<Subtree>, bool) {
    fn clone_parts(&self) -> (NodeId, Option<Subtree>, bool) {
        (self.0, self.1.clone(), self.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{LanguageBuilder, SymbolMetadata};
    use crate::subtree::SubtreePool;

    fn toy_language() -> crate::language::Language {
        LanguageBuilder::new(3, 3, 1)
            .symbol(1, "a", SymbolMetadata { visible: true, named: true, extra: false })
            .symbol(2, "b", SymbolMetadata { visible: true, named: true, extra: false })
            .lex_fn(|_, _| false)
            .build()
    }

    fn leaf(pool: &mut SubtreePool, language: &crate::language::Language, symbol: Symbol) -> Subtree {
        pool.new_leaf(language, symbol, Length::ZERO, Length::new(1, crate::length::Point::new(0, 1)), 0, 0, false, false)
    }

    #[test]
    fn new_stack_has_one_version_at_base_state() {
        let stack = Stack::new();
        assert_eq!(stack.version_count(), 1);
        assert_eq!(stack.state(0), crate::language::BASE_STATE);
        assert_eq!(stack.position(0), Length::ZERO);
        assert!(stack.is_active(0));
    }

    #[test]
    fn push_advances_state_and_position() {
        let language = toy_language();
        let mut pool = SubtreePool::new();
        let mut stack = Stack::new();
        let a = leaf(&mut pool, &language, 1);
        stack.push(0, Some(a), false, 2);
        assert_eq!(stack.state(0), 2);
        assert_eq!(stack.position(0).bytes, 1);
    }

    #[test]
    fn pop_count_reveals_predecessor_state_and_position() {
        let language = toy_language();
        let mut pool = SubtreePool::new();
        let mut stack = Stack::new();
        let a = leaf(&mut pool, &language, 1);
        let b = leaf(&mut pool, &language, 2);
        stack.push(0, Some(a), false, 2);
        stack.push(0, Some(b), false, 3);

        let slices = stack.pop_count(&mut pool, 0, 2);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].subtrees.len(), 2);
        assert_eq!(slices[0].subtrees[0].symbol(), 1);
        assert_eq!(slices[0].subtrees[1].symbol(), 2);
        assert_eq!(stack.state(slices[0].version), crate::language::BASE_STATE);
        assert_eq!(stack.position(slices[0].version), Length::ZERO);

        for slice in slices {
            for s in slice.subtrees {
                pool.release(s);
            }
        }
        stack.clear(&mut pool);
    }

    #[test]
    fn copy_version_is_independent_after_push() {
        let language = toy_language();
        let mut pool = SubtreePool::new();
        let mut stack = Stack::new();
        let copy = stack.copy_version(0);
        assert_eq!(stack.version_count(), 2);

        let a = leaf(&mut pool, &language, 1);
        stack.push(copy, Some(a), false, 2);
        assert_eq!(stack.state(0), crate::language::BASE_STATE);
        assert_eq!(stack.state(copy), 2);

        stack.remove_version(&mut pool, copy);
        stack.clear(&mut pool);
    }

    #[test]
    fn pause_and_resume_round_trip_the_lookahead() {
        let mut stack = Stack::new();
        stack.pause(0, 7);
        assert!(stack.is_paused(0));
        let lookahead = stack.resume(0);
        assert_eq!(lookahead, 7);
        assert!(stack.is_active(0));
    }

    #[test]
    fn halt_marks_the_version_inactive() {
        let mut stack = Stack::new();
        stack.halt(0);
        assert!(stack.is_halted(0));
        assert!(!stack.is_active(0));
    }
}
