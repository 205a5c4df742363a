//! Merging returns while keeping the control-flow structured.
//!
//! There are three steps, all relying on the structured order of the blocks
//! (in which every construct header precedes the whole construct, and every
//! construct ends with its merge block):
//! 1. every return (and `unreachable`) is replaced by a branch to the merge
//!    block of the innermost loop, or failing that, the innermost construct of
//!    any kind (with the final return block used outside of all constructs),
//!    after storing the return value and setting the "returned" flag
//! 2. starting from those merge blocks, and continuing outwards, everything
//!    the original return skipped is guarded by the flag, either by breaking
//!    out of the enclosing loop when the flag is set, or by wrapping the code
//!    in a new selection construct only entered when the flag isn't set
//! 3. SSA dominance is restored by the `phi_repair` module
//!
//! For example, `if c { return a; } x = f(); return x;` ends up as (roughly):
//!
//! ```text
//! if c { slot = a; returned = true; }
//! if !returned { x = f(); slot = x; returned = true; }
//! return slot;
//! ```

use super::phi_repair::NewPhiMarks;
use super::MergeReturns;
use crate::cfg::ControlFlowGraph;
use crate::func_at::FuncAt;
use crate::{Block, ControlInst, ControlInstKind, Inst, InstDef, InstKind, Merge, Value};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::{debug, trace};

/// Innermost constructs enclosing some block (see `ConstructStack`).
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
struct ConstructState {
    /// Merge block of the innermost enclosing loop.
    loop_merge: Option<Block>,

    /// Merge block of the innermost enclosing construct (of any kind).
    current_merge: Option<Block>,
}

/// Constructs enclosing the current block of a walk in structured order.
///
/// The bottom of the stack represents the function body itself (outside of
/// all constructs), and is never popped.
#[derive(Clone)]
struct ConstructStack {
    states: Vec<ConstructState>,
}

impl ConstructStack {
    fn new() -> Self {
        Self {
            states: vec![ConstructState::default()],
        }
    }

    fn top(&self) -> ConstructState {
        self.states.last().copied().unwrap_or_default()
    }

    fn leave_innermost(&mut self) {
        if self.states.len() > 1 {
            self.states.pop();
        }
    }

    /// Leave all constructs merging at `block` (to be called upon reaching it).
    fn leave_constructs_merging_at(&mut self, block: Block) {
        while self.states.len() > 1 && self.top().current_merge == Some(block) {
            self.states.pop();
        }
    }

    /// Leave the loop merging at `loop_merge`, and everything nested in it.
    fn leave_loop(&mut self, loop_merge: Block) {
        while self.states.len() > 1 && self.top().loop_merge == Some(loop_merge) {
            self.states.pop();
        }
    }

    /// Enter the construct headed by `func_at_block` (if it is a header).
    fn enter_construct(&mut self, func_at_block: FuncAt<'_, Block>) {
        let Some(merge) = func_at_block.def().merge else {
            return;
        };
        let loop_merge = match merge {
            Merge::Loop { merge, .. } => Some(merge),
            Merge::Selection { .. } => self.top().loop_merge,
        };
        self.states.push(ConstructState {
            loop_merge,
            current_merge: Some(merge.merge_block()),
        });
    }
}

impl MergeReturns<'_> {
    pub(super) fn process_structured(&mut self, return_blocks: &[Block]) {
        let original_doms = self.analyses.dominators(self.func_def_body).clone();
        self.marks = NewPhiMarks::new(original_doms);
        self.order = ControlFlowGraph::structured_order(self.func_def_body);

        self.add_return_value();
        let final_block = self.create_final_return_block();
        let final_terminator = match self.return_value {
            Some(slot) => {
                let ret_value = self.append_inst(
                    final_block,
                    InstDef {
                        kind: InstKind::Load,
                        output_type: Some(self.ret_type),
                        inputs: [slot].into_iter().collect(),
                    },
                );
                ControlInst::ret(Some(Value::InstOutput(ret_value)))
            }
            None => ControlInst::ret(None),
        };
        self.set_terminator(final_block, final_terminator);

        let mut constructs = ConstructStack::new();
        for block in self.order.clone() {
            constructs.leave_constructs_merging_at(block);
            self.redirect_exit(block, constructs.top());
            constructs.enter_construct(self.func_def_body.at(block));
        }

        // NOTE predication inserts new blocks into `self.order`, which
        // then get visited as well (to keep the construct stack accurate).
        let return_blocks: FxHashSet<Block> = return_blocks.iter().copied().collect();
        let mut predicated = FxHashSet::default();
        let mut constructs = ConstructStack::new();
        self.order_cursor = 0;
        while let Some(&block) = self.order.get(self.order_cursor) {
            constructs.leave_constructs_merging_at(block);
            if return_blocks.contains(&block) {
                self.predicate_blocks(block, &constructs, &mut predicated);
            }
            constructs.enter_construct(self.func_def_body.at(block));

            self.order_cursor += 1;
        }
        debug!(predicated = predicated.len(), "predicated blocks");

        self.add_new_phi_nodes();
    }

    /// Redirect `block` to the innermost legal merge block (see `state`), if
    /// it returns (or is `unreachable`).
    fn redirect_exit(&mut self, block: Block, state: ConstructState) {
        let terminator = &self.func_def_body.blocks[block].terminator;
        if !(terminator.is_return() || terminator.kind == ControlInstKind::Unreachable) {
            return;
        }
        let target = state
            .loop_merge
            .or(state.current_merge)
            .unwrap_or_else(|| self.final_return_block());
        self.branch_to_block(block, target);
    }

    /// Predicate (or break out of constructs on) the blocks which used to be
    /// skipped by the return that `return_block` was redirected from.
    ///
    /// `constructs` describes the constructs enclosing `return_block`.
    fn predicate_blocks(
        &mut self,
        return_block: Block,
        constructs: &ConstructStack,
        predicated: &mut FxHashSet<Block>,
    ) {
        if predicated.contains(&return_block) {
            return;
        }

        let mut block = self
            .func_def_body
            .at(return_block)
            .unique_successor()
            .unwrap_or_else(|| {
                panic!("merge_returns: redirected return {return_block:?} must branch unconditionally")
            });

        let mut constructs = constructs.clone();
        let state = constructs.top();
        if state.current_merge == Some(block) {
            constructs.leave_innermost();
        } else if state.loop_merge == Some(block) {
            constructs.leave_loop(block);
        }

        let final_block = self.final_return_block();
        while block != final_block {
            if !predicated.insert(block) {
                break;
            }
            constructs.leave_constructs_merging_at(block);

            let state = constructs.top();
            let selection_merge = state
                .current_merge
                .filter(|_| self.options.selection_break);
            block = if let Some(loop_merge) = state.loop_merge {
                self.break_from_construct(block, loop_merge, predicated);
                constructs.leave_loop(loop_merge);
                loop_merge
            } else if let Some(merge) = selection_merge {
                self.break_from_construct(block, merge, predicated);
                constructs.leave_innermost();
                merge
            } else {
                // Skip over whole constructs, to the end of the merge chain.
                let mut tail = block;
                while let Some(merge) = self.func_def_body.blocks[tail].merge {
                    tail = merge.merge_block();
                }

                // NOTE this has to be found before predicating, as the new
                // header might be `tail` itself.
                let next = self
                    .func_def_body
                    .at(tail)
                    .unique_successor()
                    .unwrap_or_else(|| {
                        panic!(
                            "merge_returns: {tail:?} has multiple successors, \
                             but no merge annotation"
                        )
                    });
                self.predicate_block(block, tail, predicated);
                next
            };
        }
    }

    /// Make `block` branch to `merge` if the return flag is set (and continue
    /// to the rest of `block` otherwise).
    fn break_from_construct(&mut self, block: Block, merge: Block, predicated: &mut FxHashSet<Block>) {
        if let Some(Merge::Loop { .. }) = self.func_def_body.blocks[block].merge {
            self.split_loop_header(block);
        }

        let body = self.split_after_phis(block);
        predicated.insert(body);

        let returned = self.load_return_flag(block);
        self.prepare_new_edge(block, merge);
        self.set_terminator(block, ControlInst::branch_conditional(returned, merge, body));
        trace!(?block, ?merge, "break from construct");
    }

    /// Guard the blocks from `block` to `tail` (which ends its merge chain)
    /// with a new selection construct, only entered if the return flag isn't
    /// set, if `MergeReturnsOptions::requires_predication` agrees.
    fn predicate_block(&mut self, block: Block, tail: Block, predicated: &mut FxHashSet<Block>) {
        if !(self.options.requires_predication)(self.func_def_body.at(block), tail) {
            return;
        }

        if let Some(Merge::Loop { .. }) = self.func_def_body.blocks[block].merge {
            self.split_loop_header(block);
        }

        let body = self.split_after_phis(block);
        predicated.insert(body);
        let tail = if tail == block { body } else { tail };

        let new_merge = self.new_block_after(tail);
        predicated.insert(new_merge);
        self.move_terminator(tail, new_merge);
        self.marks.mark(new_merge, tail);

        let returned = self.load_return_flag(block);
        self.func_def_body.blocks[block].merge = Some(Merge::Selection { merge: new_merge });
        let func_def_body = &*self.func_def_body;
        self.analyses
            .def_use(func_def_body)
            .analyze_merge(func_def_body, block);
        self.set_terminator(
            block,
            ControlInst::branch_conditional(returned, new_merge, body),
        );
        trace!(?block, ?tail, ?new_merge, "predicated");
    }

    /// Split the loop `header`, leaving behind a "pre-header" with only the
    /// `Phi` inputs coming from outside the loop, and moving everything else
    /// (including the loop merge annotation) into a new header, which becomes
    /// the target of all the back-edges.
    fn split_loop_header(&mut self, header: Block) -> Block {
        let Some(Merge::Loop { merge, .. }) = self.func_def_body.blocks[header].merge else {
            unreachable!("merge_returns: {header:?} is not a loop header");
        };
        let latches = self.loop_latches(header, merge);

        let new_header = self.split_after_phis(header);
        let latches: SmallVec<[Block; 4]> = latches
            .into_iter()
            .map(|latch| if latch == header { new_header } else { latch })
            .collect();

        for &latch in &latches {
            let mut terminator = self.func_def_body.blocks[latch].terminator.clone();
            for target in &mut terminator.targets {
                if *target == header {
                    *target = new_header;
                }
            }
            self.set_terminator(latch, terminator);
        }

        let phis: SmallVec<[Inst; 4]> = self.func_def_body.blocks[header]
            .phis(&self.func_def_body.insts)
            .collect();
        let mut replaced_phis = SmallVec::<[(Inst, Inst); 4]>::new();
        for phi in phis {
            let phi_def = &self.func_def_body.insts[phi];
            let ty = phi_def.output_type;
            let (from_latches, from_outside): (SmallVec<[(Value, Block); 2]>, SmallVec<[_; 2]>) =
                phi_def
                    .phi_incoming()
                    .partition(|(_, pred)| latches.contains(pred));
            if from_latches.is_empty() {
                continue;
            }

            let (inputs, incoming_blocks) = from_outside.into_iter().unzip();
            self.func_def_body.insts[phi] = InstDef {
                kind: InstKind::Phi { incoming_blocks },
                output_type: ty,
                inputs,
            };
            self.analyze_inst(header, phi);

            let (inputs, incoming_blocks) = [(Value::InstOutput(phi), header)]
                .into_iter()
                .chain(from_latches)
                .unzip();
            let idx = self.func_def_body.blocks[new_header].first_non_phi_idx(&self.func_def_body.insts);
            let new_phi = self.insert_inst(
                new_header,
                idx,
                InstDef {
                    kind: InstKind::Phi { incoming_blocks },
                    output_type: ty,
                    inputs,
                },
            );
            replaced_phis.push((phi, new_phi));
        }

        // Only the new `Phi`s (via their pre-header inputs) still see the old ones.
        for (phi, new_phi) in replaced_phis {
            self.replace_uses(phi, Value::InstOutput(new_phi), |use_block| use_block != header);
        }

        trace!(?header, ?new_header, "split loop header");
        new_header
    }

    /// Predecessors of `header` reachable from it without leaving the loop
    /// (i.e. without going through `merge`), which are the back-edge sources.
    fn loop_latches(&mut self, header: Block, merge: Block) -> SmallVec<[Block; 4]> {
        let cfg = self.cfg();
        let mut in_loop = FxHashSet::default();
        let mut stack: SmallVec<[Block; 8]> = cfg.succs(header).into();
        while let Some(block) = stack.pop() {
            if block == merge || !in_loop.insert(block) {
                continue;
            }
            stack.extend(cfg.succs(block).iter().copied());
        }
        cfg.preds(header)
            .iter()
            .copied()
            .filter(|pred| in_loop.contains(pred))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FuncBuilder;
    use crate::{Context, ControlInst};

    #[test]
    fn construct_stack_tracks_nesting() {
        let cx = Context::new();
        let bool_ty = cx.type_bool();
        let mut b = FuncBuilder::new(&cx);
        let [header, body, if_merge, cont, loop_merge] = [(); 5].map(|()| b.new_block());
        let cond = b.op(header, crate::Op::LogicalNot, bool_ty, [Value::Const(cx.const_bool(true))]);
        b.loop_merge(header, loop_merge, cont);
        b.terminate(header, ControlInst::branch_conditional(cond, body, loop_merge));
        b.selection_merge(body, if_merge);
        b.terminate(body, ControlInst::branch_conditional(cond, if_merge, cont));
        b.terminate(if_merge, ControlInst::branch(cont));
        b.terminate(cont, ControlInst::branch(header));
        b.terminate(loop_merge, ControlInst::ret(None));
        let func = b.finish();

        let mut constructs = ConstructStack::new();
        constructs.enter_construct(func.at(header));
        constructs.enter_construct(func.at(body));
        assert_eq!(
            constructs.top(),
            ConstructState {
                loop_merge: Some(loop_merge),
                current_merge: Some(if_merge),
            }
        );

        // Leaving the loop also leaves the selection nested in it.
        let mut breaking = constructs.clone();
        breaking.leave_loop(loop_merge);
        assert_eq!(breaking.top(), ConstructState::default());

        constructs.leave_constructs_merging_at(if_merge);
        assert_eq!(constructs.top().current_merge, Some(loop_merge));
        constructs.leave_constructs_merging_at(loop_merge);
        constructs.leave_innermost();
        assert_eq!(constructs.states.len(), 1);
    }
}
