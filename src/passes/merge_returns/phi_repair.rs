//! Restoring SSA dominance after the CFG edits of the structured strategy.
//!
//! Adding edges (from redirected returns, or from predication headers) can
//! make a block lose some of its former dominators, and with them, the right to
//! use the values they define. Every block gaining such edges is marked, with
//! the block ending the region that used to dominate it, and once all edits are
//! done, `Phi`s are inserted into the marked blocks for any such values which
//! are still used below them.

use super::MergeReturns;
use crate::cfg::ControlFlowGraph;
use crate::def_use::User;
use crate::dominators::DominatorTree;
use crate::{Block, FxIndexMap, Inst, InstDef, InstKind, Value};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

#[derive(Default)]
pub(super) struct NewPhiMarks {
    /// Dominators from before any edits, used to find the region that used
    /// to dominate a newly marked block.
    original_doms: Option<DominatorTree>,

    /// Marked blocks, each with the last block of the region which dominated
    /// it before the edits (for blocks that had a single predecessor, that is
    /// exactly the predecessor).
    marks: FxIndexMap<Block, Block>,

    /// Blocks whose terminator was moved into another block (by splitting).
    moved_terminators: FxHashMap<Block, Block>,
}

impl NewPhiMarks {
    pub(super) fn new(original_doms: DominatorTree) -> Self {
        Self {
            original_doms: Some(original_doms),
            ..Self::default()
        }
    }

    pub(super) fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub(super) fn get(&self, block: Block) -> Option<Block> {
        self.marks.get(&block).copied()
    }

    /// Mark `block`, overwriting any previous mark.
    pub(super) fn mark(&mut self, block: Block, region_end: Block) {
        self.marks.insert(block, region_end);
    }

    /// The terminator of `from` was moved into `to`, which now ends any region
    /// that used to end in `from`.
    pub(super) fn terminator_moved(&mut self, from: Block, to: Block) {
        for region_end in self.marks.values_mut() {
            if *region_end == from {
                *region_end = to;
            }
        }
        self.moved_terminators.insert(from, to);
    }

    fn follow_moves(&self, mut block: Block) -> Block {
        while let Some(&to) = self.moved_terminators.get(&block) {
            block = to;
        }
        block
    }
}

impl MergeReturns<'_> {
    /// Mark `block` for `Phi` repair (unless already marked), ahead of adding
    /// a new incoming edge to it.
    pub(super) fn mark_for_new_phis(&mut self, block: Block) {
        if self.final_return_block == Some(block) || self.marks.get(block).is_some() {
            return;
        }
        let original_idom = self
            .marks
            .original_doms
            .as_ref()
            .and_then(|doms| doms.immediate_dominator(block));
        let region_end = match original_idom {
            Some(idom) => self.marks.follow_moves(idom),

            // Blocks created by the pass (or originally unreachable ones).
            None => match *self.cfg().preds(block) {
                [pred] => pred,
                _ => return,
            },
        };
        trace!(?block, ?region_end, "marked for new phis");
        self.marks.mark(block, region_end);
    }

    /// Insert `Phi`s into every marked block, for values whose uses are no
    /// longer dominated by their definition (due to the new edges).
    pub(super) fn add_new_phi_nodes(&mut self) {
        if self.marks.is_empty() {
            return;
        }

        // NOTE inserting `Phi`s doesn't change the CFG, so this stays valid.
        let doms = self.analyses.dominators(self.func_def_body).clone();

        for block in ControlFlowGraph::structured_order(self.func_def_body) {
            if let Some(region_end) = self.marks.get(block) {
                self.add_new_phi_nodes_for(&doms, block, region_end);
            }
        }
    }

    fn add_new_phi_nodes_for(&mut self, doms: &DominatorTree, block: Block, region_end: Block) {
        let Some(stop) = doms.immediate_dominator(block) else {
            return;
        };

        // Everything above `stop` still dominates `block`.
        let mut current = Some(region_end);
        while let Some(region_block) = current {
            if region_block == stop || region_block == block || !doms.is_reachable(region_block) {
                break;
            }
            let insts = self.func_def_body.blocks[region_block].insts.clone();
            for inst in insts {
                if self.func_def_body.insts[inst].output_type.is_some() {
                    self.create_phi_for_inst(doms, block, inst);
                }
            }
            current = doms.immediate_dominator(region_block);
        }
    }

    /// Blocks in which the output of `inst` is used (`Phi`s use their inputs
    /// at the end of the respective incoming blocks).
    fn use_blocks(&mut self, inst: Inst) -> SmallVec<[Block; 8]> {
        let func_def_body = &*self.func_def_body;
        let def_use = self.analyses.def_use(func_def_body);
        let used_value = Value::InstOutput(inst);

        let mut use_blocks = SmallVec::new();
        for user in def_use.inst_users(inst) {
            match user {
                User::Inst(user_inst) => {
                    let user_def = &func_def_body.insts[user_inst];
                    if let InstKind::Phi { .. } = user_def.kind {
                        use_blocks.extend(
                            user_def
                                .phi_incoming()
                                .filter(|&(v, _)| v == used_value)
                                .map(|(_, incoming)| incoming),
                        );
                    } else {
                        use_blocks.extend(def_use.def_block(user_inst));
                    }
                }
                User::Terminator(block) => use_blocks.push(block),
                User::Merge(_) => {}
            }
        }
        use_blocks
    }

    /// Insert a `Phi` at the start of `block`, merging the output of `inst`,
    /// if any of its uses dominated by `block` aren't also dominated by `inst`.
    fn create_phi_for_inst(&mut self, doms: &DominatorTree, block: Block, inst: Inst) {
        let Some(def_block) = self.def_use().def_block(inst) else {
            return;
        };
        let needs_phi =
            |use_block: Block| !doms.dominates(def_block, use_block) && doms.dominates(block, use_block);
        if !self.use_blocks(inst).into_iter().any(needs_phi) {
            return;
        }

        let ty = self.func_def_body.insts[inst]
            .output_type
            .expect("merge_returns: value without an output type");
        let undef = Value::Const(self.cx.const_undef(ty));
        let (inputs, incoming_blocks) = self
            .cfg()
            .preds(block)
            .iter()
            .map(|&pred| {
                let v = if doms.dominates(def_block, pred) {
                    Value::InstOutput(inst)
                } else {
                    undef
                };
                (v, pred)
            })
            .unzip();

        let idx = self.func_def_body.blocks[block].first_non_phi_idx(&self.func_def_body.insts);
        let phi = self.insert_inst(
            block,
            idx,
            InstDef {
                kind: InstKind::Phi { incoming_blocks },
                output_type: Some(ty),
                inputs,
            },
        );
        trace!(?inst, ?block, ?phi, "inserted phi");

        self.replace_uses(inst, Value::InstOutput(phi), needs_phi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FuncBuilder;
    use crate::{Context, ControlInst};

    #[test]
    fn moved_terminators_update_marks() {
        let cx = Context::new();
        let mut b = FuncBuilder::new(&cx);
        let [entry, a, c, d] = [(); 4].map(|()| b.new_block());
        b.terminate(entry, ControlInst::branch(a));
        b.terminate(a, ControlInst::branch(c));
        b.terminate(c, ControlInst::ret(None));
        b.terminate(d, ControlInst::ret(None));
        let body = b.finish();

        let doms = DominatorTree::compute(&ControlFlowGraph::compute(&body), entry);
        let mut marks = NewPhiMarks::new(doms);
        marks.mark(c, a);
        marks.terminator_moved(a, d);
        assert_eq!(marks.get(c), Some(d));
        assert_eq!(marks.follow_moves(a), d);
        assert_eq!(marks.follow_moves(entry), entry);
    }
}
