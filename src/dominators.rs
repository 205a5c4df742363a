//! Dominator tree, computed with the "simple, fast" iterative algorithm of
//! Cooper, Harvey and Kennedy (<https://www.cs.rice.edu/~keith/EMBED/dom.pdf>).

use crate::cfg::ControlFlowGraph;
use crate::Block;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;

#[derive(Copy, Clone)]
struct DominatorTreeNode {
    /// Immediate dominator (`None` only for the entry block).
    idom: Option<Block>,

    /// Position in the reverse post-order of the CFG.
    rpo_number: u32,

    /// Sequence number in a pre-order traversal of the dominator tree.
    pre_number: u32,

    /// Maximum sequence number of this node and all its children.
    pre_max: u32,
}

/// Dominator tree of the blocks reachable from the entry of a function.
#[derive(Clone)]
pub struct DominatorTree {
    entry: Block,
    nodes: FxHashMap<Block, DominatorTreeNode>,
}

impl DominatorTree {
    pub fn compute(cfg: &ControlFlowGraph, entry: Block) -> Self {
        let rpo = cfg.rev_post_order(entry);

        let mut nodes: FxHashMap<_, _> = rpo
            .iter()
            .enumerate()
            .map(|(i, &block)| {
                let node = DominatorTreeNode {
                    idom: None,
                    rpo_number: i as u32,
                    pre_number: 0,
                    pre_max: 0,
                };
                (block, node)
            })
            .collect();

        // The entry temporarily dominates itself, so that it counts as an
        // already processed predecessor (e.g. for loops back to the entry).
        if let Some(entry_node) = nodes.get_mut(&entry) {
            entry_node.idom = Some(entry);
        }

        let mut changed = true;
        while changed {
            changed = false;

            for &block in rpo.iter().skip(1) {
                // Only predecessors that are reachable and already processed.
                let mut processed_preds = cfg
                    .preds(block)
                    .iter()
                    .copied()
                    .filter(|pred| nodes.get(pred).map_or(false, |node| node.idom.is_some()));

                // At least one predecessor has been processed already,
                // since we are iterating in reverse post-order.
                let Some(mut new_idom) = processed_preds.next() else {
                    unreachable!("dominators: {block:?} reached without a processed predecessor");
                };
                for pred in processed_preds {
                    new_idom = common_dominator(&nodes, pred, new_idom);
                }

                let node = nodes.get_mut(&block).expect("dominators: block missing from RPO");
                if node.idom != Some(new_idom) {
                    node.idom = Some(new_idom);
                    changed = true;
                }
            }
        }

        if let Some(entry_node) = nodes.get_mut(&entry) {
            entry_node.idom = None;
        }

        // Pre-order numbering of the tree (children in RPO order), which makes
        // `dominates` queries constant-time.
        let mut children: FxHashMap<Block, Vec<Block>> = FxHashMap::default();
        for &block in &rpo {
            if let Some(idom) = nodes[&block].idom {
                children.entry(idom).or_default().push(block);
            }
        }
        let mut stack = vec![entry];
        let mut n = 0;
        while let Some(block) = stack.pop() {
            n += 1;
            if let Some(node) = nodes.get_mut(&block) {
                node.pre_number = n;
            }
            if let Some(block_children) = children.get(&block) {
                stack.extend(block_children.iter().rev());
            }
        }
        // Children come after their parent in RPO, so visiting in post-order
        // propagates `pre_max` all the way up.
        for &block in rpo.iter().rev() {
            let node = nodes[&block];
            let pre_max = node.pre_max.max(node.pre_number);
            nodes.get_mut(&block).expect("dominators: block missing from RPO").pre_max = pre_max;
            if let Some(idom) = node.idom {
                let idom_node = nodes.get_mut(&idom).expect("dominators: block missing from RPO");
                idom_node.pre_max = idom_node.pre_max.max(pre_max);
            }
        }

        Self { entry, nodes }
    }

    pub fn entry(&self) -> Block {
        self.entry
    }

    pub fn is_reachable(&self, block: Block) -> bool {
        self.nodes.contains_key(&block)
    }

    /// Returns the immediate dominator of the given block.
    ///
    /// Returns `None` for the entry block and unreachable blocks.
    pub fn immediate_dominator(&self, block: Block) -> Option<Block> {
        self.nodes.get(&block).and_then(|node| node.idom)
    }

    /// Determines whether `a` dominates `b` (which is always the case for `a == b`).
    ///
    /// Unreachable blocks are considered dominated by every block, as no
    /// execution can observe a violation of dominance in them.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        let Some(nb) = self.nodes.get(&b) else {
            return true;
        };
        match self.nodes.get(&a) {
            Some(na) => na.pre_number <= nb.pre_number && na.pre_max >= nb.pre_max,
            None => false,
        }
    }
}

/// Computes the common dominator of two blocks using only the `idom` links
/// (set so far) and the RPO numbering.
fn common_dominator(
    nodes: &FxHashMap<Block, DominatorTreeNode>,
    mut a: Block,
    mut b: Block,
) -> Block {
    loop {
        match nodes[&a].rpo_number.cmp(&nodes[&b].rpo_number) {
            Ordering::Less => b = nodes[&b].idom.expect("dominators: unprocessed block"),
            Ordering::Greater => a = nodes[&a].idom.expect("dominators: unprocessed block"),
            Ordering::Equal => return a,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FuncBuilder;
    use crate::{Context, ControlInst, Op, Value};

    #[test]
    fn diamond_and_loop() {
        let cx = Context::new();
        let bool_ty = cx.type_bool();
        let mut b = FuncBuilder::new(&cx);
        let [entry, left, right, join, header, latch, exit, dead] = [(); 8].map(|()| b.new_block());
        let cond = b.op(entry, Op::LogicalNot, bool_ty, [Value::Const(cx.const_bool(false))]);
        b.selection_merge(entry, join);
        b.terminate(entry, ControlInst::branch_conditional(cond, left, right));
        b.terminate(left, ControlInst::branch(join));
        b.terminate(right, ControlInst::branch(join));
        b.terminate(join, ControlInst::branch(header));
        b.loop_merge(header, exit, latch);
        b.terminate(header, ControlInst::branch_conditional(cond, exit, latch));
        b.terminate(latch, ControlInst::branch(header));
        b.terminate(exit, ControlInst::ret(None));
        b.terminate(dead, ControlInst::branch(exit));
        let body = b.finish();

        let cfg = ControlFlowGraph::compute(&body);
        let doms = DominatorTree::compute(&cfg, entry);

        assert_eq!(doms.immediate_dominator(entry), None);
        assert_eq!(doms.immediate_dominator(left), Some(entry));
        assert_eq!(doms.immediate_dominator(join), Some(entry));
        assert_eq!(doms.immediate_dominator(header), Some(join));
        assert_eq!(doms.immediate_dominator(latch), Some(header));
        assert_eq!(doms.immediate_dominator(exit), Some(header));
        assert_eq!(doms.immediate_dominator(dead), None);

        assert!(doms.dominates(entry, exit));
        assert!(doms.dominates(join, latch));
        assert!(doms.dominates(left, left));
        assert!(!doms.dominates(left, join));
        assert!(!doms.dominates(latch, header));
        assert!(!doms.dominates(dead, exit));
        assert!(doms.dominates(exit, dead));
        assert!(!doms.is_reachable(dead));
    }
}
