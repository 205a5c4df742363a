//! Control-flow graph (CFG) abstractions and utilities.

use crate::func_at::FuncAt;
use crate::{Block, FuncDefBody};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// The control-flow graph (CFG) of a function, as predecessor/successor maps
/// between its blocks (derived from their terminators).
///
/// Edges are deduplicated, i.e. a `Switch` with several cases targeting the
/// same block only results in one edge.
#[derive(Clone, Default)]
pub struct ControlFlowGraph {
    preds: FxHashMap<Block, SmallVec<[Block; 4]>>,
    succs: FxHashMap<Block, SmallVec<[Block; 2]>>,
}

impl ControlFlowGraph {
    pub fn compute(func_def_body: &FuncDefBody) -> Self {
        let mut cfg = Self::default();
        for &block in &func_def_body.layout {
            cfg.register_block(block);
            for succ in func_def_body.at(block).successors() {
                cfg.add_edge(block, succ);
            }
        }
        cfg
    }

    /// Ensure `block` is known to the CFG (even without any edges).
    pub fn register_block(&mut self, block: Block) {
        self.preds.entry(block).or_default();
        self.succs.entry(block).or_default();
    }

    pub fn preds(&self, block: Block) -> &[Block] {
        self.preds.get(&block).map_or(&[], |preds| &preds[..])
    }

    pub fn succs(&self, block: Block) -> &[Block] {
        self.succs.get(&block).map_or(&[], |succs| &succs[..])
    }

    /// Add the `from -> to` edge (a noop if it already exists).
    pub fn add_edge(&mut self, from: Block, to: Block) {
        let succs = self.succs.entry(from).or_default();
        if !succs.contains(&to) {
            succs.push(to);
        }
        let preds = self.preds.entry(to).or_default();
        if !preds.contains(&from) {
            preds.push(from);
        }
    }

    /// Remove all the outgoing edges of `block` (e.g. before replacing its terminator).
    pub fn remove_successor_edges(&mut self, block: Block) {
        let succs = self.succs.get_mut(&block).map(std::mem::take).unwrap_or_default();
        for succ in succs {
            if let Some(preds) = self.preds.get_mut(&succ) {
                preds.retain(|&mut pred| pred != block);
            }
        }
    }

    /// Replace all of `block`'s outgoing edges with `new_succs`.
    pub fn set_successor_edges(&mut self, block: Block, new_succs: impl IntoIterator<Item = Block>) {
        self.remove_successor_edges(block);
        for succ in new_succs {
            self.add_edge(block, succ);
        }
    }

    /// Blocks reachable from `entry`, in reverse post-order (RPO).
    ///
    /// RPO iteration over a CFG provides certain guarantees, most importantly
    /// that SSA definitions are visited before any of their uses.
    pub fn rev_post_order(&self, entry: Block) -> Vec<Block> {
        let mut post_order = Vec::new();
        let mut visited = FxHashSet::default();
        post_order_from(entry, &mut visited, &mut post_order, |block| self.succs(block).into());
        post_order.reverse();
        post_order
    }

    /// All blocks of `func_def_body`, in "structured order": a reverse post-order
    /// over the "structured successors" (see `structured_successors`), such that
    /// every construct header precedes the blocks in the construct, which in
    /// turn all precede the construct's merge block.
    ///
    /// Unreachable blocks (without any predecessors) are also included (after
    /// all the blocks reachable from the entry), so that every block is visited.
    pub fn structured_order(func_def_body: &FuncDefBody) -> Vec<Block> {
        let mut has_preds = FxHashSet::default();
        for &block in &func_def_body.layout {
            has_preds.extend(func_def_body.at(block).successors());
        }

        // NOTE the post-order is built back-to-front, so
        // the entry (traversed last) ends up first, once reversed.
        let entry = func_def_body.entry();
        let roots = func_def_body
            .layout
            .iter()
            .copied()
            .filter(|&block| block == entry || !has_preds.contains(&block));

        let mut post_order = Vec::with_capacity(func_def_body.layout.len());
        let mut visited = FxHashSet::default();
        for root in roots.rev() {
            post_order_from(root, &mut visited, &mut post_order, |block| {
                structured_successors(func_def_body.at(block))
            });
        }
        post_order.reverse();
        post_order
    }
}

/// Successors of a block for the purposes of structured traversal: the merge
/// block (and, for loops, the continue target) of its construct come first,
/// followed by the actual CFG successors.
///
/// Visiting the merge block first, in a depth-first traversal, results in it
/// being placed last (among the construct's blocks) in the reverse post-order.
pub fn structured_successors(func_at_block: FuncAt<'_, Block>) -> SmallVec<[Block; 4]> {
    let mut succs = SmallVec::new();
    if let Some(merge) = func_at_block.def().merge {
        succs.push(merge.merge_block());
        succs.extend(merge.continue_target());
    }
    for succ in func_at_block.successors() {
        if !succs.contains(&succ) {
            succs.push(succ);
        }
    }
    succs
}

/// Iterative depth-first traversal from `start`, appending every newly
/// visited block to `post_order` once all of its successors have been visited.
fn post_order_from(
    start: Block,
    visited: &mut FxHashSet<Block>,
    post_order: &mut Vec<Block>,
    mut succs_of: impl FnMut(Block) -> SmallVec<[Block; 4]>,
) {
    if !visited.insert(start) {
        return;
    }

    // Each stack entry tracks the next successor index left to visit.
    let mut stack = vec![(start, succs_of(start), 0)];
    while let Some((block, succs, next_idx)) = stack.last_mut() {
        match succs.get(*next_idx) {
            Some(&succ) => {
                *next_idx += 1;
                if visited.insert(succ) {
                    let succ_succs = succs_of(succ);
                    stack.push((succ, succ_succs, 0));
                }
            }
            None => {
                post_order.push(*block);
                stack.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FuncBuilder;
    use crate::{Context, ControlInst, Value};

    #[test]
    fn diamond_edges() {
        let cx = Context::new();
        let bool_ty = cx.type_bool();
        let mut b = FuncBuilder::new(&cx);
        let [entry, left, right, merge] = [(); 4].map(|()| b.new_block());
        let cond = b.op(entry, crate::Op::LogicalNot, bool_ty, [Value::Const(cx.const_bool(false))]);
        b.selection_merge(entry, merge);
        b.terminate(entry, ControlInst::branch_conditional(cond, left, right));
        b.terminate(left, ControlInst::branch(merge));
        b.terminate(right, ControlInst::branch(merge));
        b.terminate(merge, ControlInst::ret(None));
        let body = b.finish();

        let cfg = ControlFlowGraph::compute(&body);
        assert_eq!(cfg.succs(entry), [left, right]);
        assert_eq!(cfg.preds(merge), [left, right]);
        assert!(cfg.preds(entry).is_empty());

        let rpo = cfg.rev_post_order(entry);
        assert_eq!(rpo.first(), Some(&entry));
        assert_eq!(rpo.last(), Some(&merge));
    }

    #[test]
    fn switch_edges_are_deduplicated() {
        let cx = Context::new();
        let i32_ty = cx.type_int(32, true);
        let mut b = FuncBuilder::new(&cx);
        let [entry, case, merge] = [(); 3].map(|()| b.new_block());
        b.selection_merge(entry, merge);
        b.terminate(
            entry,
            ControlInst::switch(
                Value::Const(cx.const_int(i32_ty, 0)),
                merge,
                [(1, case), (2, case), (3, merge)],
            ),
        );
        b.terminate(case, ControlInst::branch(merge));
        b.terminate(merge, ControlInst::ret(None));
        let body = b.finish();

        let mut cfg = ControlFlowGraph::compute(&body);
        assert_eq!(cfg.succs(entry), [merge, case]);
        assert_eq!(cfg.preds(merge), [entry, case]);

        cfg.remove_successor_edges(entry);
        assert!(cfg.succs(entry).is_empty());
        assert_eq!(cfg.preds(merge), [case]);
        assert!(cfg.preds(case).is_empty());
    }

    #[test]
    fn structured_order_places_merge_after_construct() {
        let cx = Context::new();
        let bool_ty = cx.type_bool();
        let mut b = FuncBuilder::new(&cx);
        let [entry, header, body_block, cont, loop_merge, unreachable] =
            [(); 6].map(|()| b.new_block());
        b.terminate(entry, ControlInst::branch(header));
        b.loop_merge(header, loop_merge, cont);
        b.terminate(header, ControlInst::branch(body_block));
        let cond = b.op(body_block, crate::Op::LogicalNot, bool_ty, [Value::Const(cx.const_bool(true))]);
        b.terminate(body_block, ControlInst::branch_conditional(cond, loop_merge, cont));
        b.terminate(cont, ControlInst::branch(header));
        b.terminate(loop_merge, ControlInst::ret(None));
        b.terminate(unreachable, ControlInst::ret(None));
        let body = b.finish();

        let order = ControlFlowGraph::structured_order(&body);
        assert_eq!(order, [entry, header, body_block, cont, loop_merge, unreachable]);
    }

    #[test]
    fn deep_chains_do_not_recurse() {
        let cx = Context::new();
        let mut b = FuncBuilder::new(&cx);
        let blocks: Vec<_> = (0..10_000).map(|_| b.new_block()).collect();
        for pair in blocks.windows(2) {
            b.terminate(pair[0], ControlInst::branch(pair[1]));
        }
        b.terminate(blocks[blocks.len() - 1], ControlInst::ret(None));
        let body = b.finish();

        assert_eq!(ControlFlowGraph::structured_order(&body), blocks);
    }
}
