//! Structural validation of function bodies.
//!
//! This is not a full SPIR-V validator, only the subset of rules that CFG
//! transformations (such as `passes::merge_returns`) can realistically break:
//! terminator shapes, `Phi`/predecessor agreement, SSA dominance, and the
//! basic structured control-flow rules for merge blocks.

use crate::cfg::ControlFlowGraph;
use crate::dominators::DominatorTree;
use crate::{
    Block, Context, ControlInstKind, DeclDef, FuncDecl, FuncDefBody, FxIndexSet, Inst, InstKind,
    TypeDef, Value,
};
use rustc_hash::FxHashMap;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("function has no blocks")]
    EmptyFunction,

    #[error("{block:?} appears more than once in the function layout")]
    DuplicateBlock { block: Block },

    #[error("{block:?} is referenced but not part of the function layout")]
    UndefinedBlock { block: Block },

    #[error("{inst:?} is used but not defined in any block of the function")]
    UndefinedInst { inst: Inst },

    #[error(
        "{block:?}: `{kind}` terminator expects {expected_inputs} input(s) and \
         {expected_targets} target(s), found {found_inputs} and {found_targets}"
    )]
    TerminatorShape {
        block: Block,
        kind: &'static str,
        expected_inputs: usize,
        expected_targets: usize,
        found_inputs: usize,
        found_targets: usize,
    },

    #[error("{block:?}: `{kind}` does not match the function return type")]
    ReturnTypeMismatch { block: Block, kind: &'static str },

    #[error("entry {block:?} has predecessors {preds:?}")]
    EntryHasPredecessors { block: Block, preds: Vec<Block> },

    #[error("{block:?}: `Phi` {inst:?} follows a non-`Phi` instruction")]
    PhiNotFirst { block: Block, inst: Inst },

    #[error(
        "{block:?}: `Phi` {inst:?} has incoming blocks {incoming:?}, \
         but the predecessors are {preds:?}"
    )]
    PhiPredecessorMismatch {
        block: Block,
        inst: Inst,
        incoming: Vec<Block>,
        preds: Vec<Block>,
    },

    #[error("{inst:?} (defined in {def_block:?}) does not dominate its use in {use_block:?}")]
    UseNotDominated {
        inst: Inst,
        def_block: Block,
        use_block: Block,
    },

    #[error("{block:?}: {inst:?} is used before its definition")]
    UseBeforeDef { block: Block, inst: Inst },

    #[error("{merge:?} is the merge block of both {first_header:?} and {second_header:?}")]
    SharedMergeBlock {
        merge: Block,
        first_header: Block,
        second_header: Block,
    },

    #[error("header {header:?} does not dominate its merge block {merge:?}")]
    HeaderDoesNotDominateMerge { header: Block, merge: Block },

    #[error("merge block {merge:?} precedes its header {header:?} in structured order")]
    MergeBeforeHeader { header: Block, merge: Block },

    #[error("expected at most one return, found {} (in {blocks:?})", blocks.len())]
    MultipleReturns { blocks: Vec<Block> },
}

/// Validate `func_decl` (a noop for imports).
pub fn validate_func(cx: &Context, func_decl: &FuncDecl) -> Result<(), ValidationError> {
    match &func_decl.def {
        DeclDef::Imported(_) => Ok(()),
        DeclDef::Present(func_def_body) => {
            let returns_value = !matches!(cx[func_decl.ret_type], TypeDef::Void);
            validate_func_body(func_def_body, returns_value)
        }
    }
}

/// Validate a function body, for a function returning a value iff `returns_value`.
pub fn validate_func_body(
    func_def_body: &FuncDefBody,
    returns_value: bool,
) -> Result<(), ValidationError> {
    if func_def_body.layout.is_empty() {
        return Err(ValidationError::EmptyFunction);
    }

    // Layout, definitions and instruction positions.
    let mut layout_blocks = FxIndexSet::default();
    let mut inst_positions = FxHashMap::default();
    for &block in &func_def_body.layout {
        if !func_def_body.blocks.contains(block) {
            return Err(ValidationError::UndefinedBlock { block });
        }
        if !layout_blocks.insert(block) {
            return Err(ValidationError::DuplicateBlock { block });
        }
        for (idx, &inst) in func_def_body.blocks[block].insts.iter().enumerate() {
            inst_positions.insert(inst, (block, idx));
        }
    }

    for &block in &func_def_body.layout {
        let block_def = &func_def_body.blocks[block];
        let terminator = &block_def.terminator;

        let (kind, expected_inputs, expected_targets) = match &terminator.kind {
            ControlInstKind::Unreachable => ("unreachable", 0, 0),
            ControlInstKind::Return => ("return", 0, 0),
            ControlInstKind::ReturnValue => ("return_value", 1, 0),
            ControlInstKind::Branch => ("branch", 0, 1),
            ControlInstKind::BranchConditional => ("branch_conditional", 1, 2),
            ControlInstKind::Switch { case_literals } => ("switch", 1, 1 + case_literals.len()),
        };
        if terminator.inputs.len() != expected_inputs || terminator.targets.len() != expected_targets {
            return Err(ValidationError::TerminatorShape {
                block,
                kind,
                expected_inputs,
                expected_targets,
                found_inputs: terminator.inputs.len(),
                found_targets: terminator.targets.len(),
            });
        }
        let return_mismatch = match terminator.kind {
            ControlInstKind::Return => returns_value,
            ControlInstKind::ReturnValue => !returns_value,
            _ => false,
        };
        if return_mismatch {
            return Err(ValidationError::ReturnTypeMismatch { block, kind });
        }

        let merge_blocks = block_def
            .merge
            .into_iter()
            .flat_map(|merge| [Some(merge.merge_block()), merge.continue_target()])
            .flatten();
        for target in terminator.targets.iter().copied().chain(merge_blocks) {
            if !layout_blocks.contains(&target) {
                return Err(ValidationError::UndefinedBlock { block: target });
            }
        }

        let mut seen_non_phi = false;
        for &inst in &block_def.insts {
            match &func_def_body.insts[inst].kind {
                InstKind::Phi { incoming_blocks } => {
                    if seen_non_phi {
                        return Err(ValidationError::PhiNotFirst { block, inst });
                    }
                    for &incoming in incoming_blocks {
                        if !layout_blocks.contains(&incoming) {
                            return Err(ValidationError::UndefinedBlock { block: incoming });
                        }
                    }
                }
                _ => seen_non_phi = true,
            }
        }
    }

    let cfg = ControlFlowGraph::compute(func_def_body);
    let entry = func_def_body.entry();
    if !cfg.preds(entry).is_empty() {
        return Err(ValidationError::EntryHasPredecessors {
            block: entry,
            preds: cfg.preds(entry).to_vec(),
        });
    }
    let doms = DominatorTree::compute(&cfg, entry);

    // `Phi`s must have exactly one incoming value per predecessor.
    for &block in &func_def_body.layout {
        let preds = cfg.preds(block);
        for inst in func_def_body.blocks[block].phis(&func_def_body.insts) {
            let incoming: Vec<_> = func_def_body.insts[inst]
                .phi_incoming()
                .map(|(_, incoming)| incoming)
                .collect();
            let unique_incoming: FxIndexSet<_> = incoming.iter().copied().collect();
            let matches_preds = incoming.len() == preds.len()
                && unique_incoming.len() == incoming.len()
                && preds.iter().all(|pred| unique_incoming.contains(pred));
            if !matches_preds {
                return Err(ValidationError::PhiPredecessorMismatch {
                    block,
                    inst,
                    incoming,
                    preds: preds.to_vec(),
                });
            }
        }
    }

    // SSA dominance (with `Phi` inputs used at the end of their incoming block).
    let check_use = |v: Value, use_block: Block, use_idx: usize| -> Result<(), ValidationError> {
        let Value::InstOutput(inst) = v else {
            return Ok(());
        };
        let &(def_block, def_idx) = inst_positions
            .get(&inst)
            .ok_or(ValidationError::UndefinedInst { inst })?;
        if def_block == use_block {
            if def_idx >= use_idx {
                return Err(ValidationError::UseBeforeDef {
                    block: use_block,
                    inst,
                });
            }
        } else if !doms.dominates(def_block, use_block) {
            return Err(ValidationError::UseNotDominated {
                inst,
                def_block,
                use_block,
            });
        }
        Ok(())
    };
    for &block in &func_def_body.layout {
        let block_def = &func_def_body.blocks[block];
        for (idx, &inst) in block_def.insts.iter().enumerate() {
            let inst_def = &func_def_body.insts[inst];
            if let InstKind::Phi { .. } = inst_def.kind {
                for (v, incoming) in inst_def.phi_incoming() {
                    check_use(v, incoming, usize::MAX)?;
                }
            } else {
                for &v in &inst_def.inputs {
                    check_use(v, block, idx)?;
                }
            }
        }
        for &v in &block_def.terminator.inputs {
            check_use(v, block, usize::MAX)?;
        }
    }

    // Structured control-flow: merge blocks are unique to their header,
    // dominated by it, and come after it in structured order.
    let structured_order = ControlFlowGraph::structured_order(func_def_body);
    let order_idx: FxHashMap<_, _> = structured_order
        .iter()
        .enumerate()
        .map(|(i, &block)| (block, i))
        .collect();
    let mut merge_headers = FxHashMap::default();
    for &header in &func_def_body.layout {
        let Some(merge) = func_def_body.blocks[header].merge else {
            continue;
        };
        let merge = merge.merge_block();
        if let Some(first_header) = merge_headers.insert(merge, header) {
            return Err(ValidationError::SharedMergeBlock {
                merge,
                first_header,
                second_header: header,
            });
        }
        if doms.is_reachable(merge) && !doms.dominates(header, merge) {
            return Err(ValidationError::HeaderDoesNotDominateMerge { header, merge });
        }
        // NOTE blocks only reachable from unreachable cycles have no position.
        let out_of_order = match (order_idx.get(&merge), order_idx.get(&header)) {
            (Some(merge_idx), Some(header_idx)) => merge_idx < header_idx,
            _ => false,
        };
        if out_of_order {
            return Err(ValidationError::MergeBeforeHeader { header, merge });
        }
    }

    Ok(())
}

/// Check that at most one block of `func_def_body` returns.
pub fn validate_single_return(func_def_body: &FuncDefBody) -> Result<(), ValidationError> {
    let blocks: Vec<_> = func_def_body
        .layout
        .iter()
        .copied()
        .filter(|&block| func_def_body.blocks[block].terminator.is_return())
        .collect();
    if blocks.len() > 1 {
        return Err(ValidationError::MultipleReturns { blocks });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FuncBuilder;
    use crate::{ControlInst, Op};

    fn diamond(cx: &Context) -> (FuncDefBody, [Block; 4], Value) {
        let i32_ty = cx.type_int(32, true);
        let bool_ty = cx.type_bool();
        let mut b = FuncBuilder::new(cx);
        let [entry, left, right, merge] = [(); 4].map(|()| b.new_block());
        let x = Value::FuncParam { idx: 0 };
        let cond = b.op(entry, Op::SLessThan, bool_ty, [x, Value::Const(cx.const_int(i32_ty, 0))]);
        b.selection_merge(entry, merge);
        b.terminate(entry, ControlInst::branch_conditional(cond, left, right));
        let neg = b.op(left, Op::SNegate, i32_ty, [x]);
        b.terminate(left, ControlInst::branch(merge));
        b.terminate(right, ControlInst::branch(merge));
        let phi = b.phi(merge, i32_ty, [(neg, left), (x, right)]);
        b.terminate(merge, ControlInst::ret(Some(phi)));
        (b.finish(), [entry, left, right, merge], neg)
    }

    #[test]
    fn accepts_well_formed_diamond() {
        let cx = Context::new();
        let (body, ..) = diamond(&cx);
        validate_func_body(&body, true).unwrap();
        validate_single_return(&body).unwrap();
    }

    #[test]
    fn rejects_wrong_return_kind() {
        let cx = Context::new();
        let (body, [.., merge], _) = diamond(&cx);
        assert!(matches!(
            validate_func_body(&body, false),
            Err(ValidationError::ReturnTypeMismatch { block, .. }) if block == merge
        ));
    }

    #[test]
    fn rejects_phi_missing_predecessor() {
        let cx = Context::new();
        let (mut body, [_, _, right, merge], _) = diamond(&cx);
        let phi = body.blocks[merge].insts[0];
        body.insts[phi].inputs.pop();
        if let InstKind::Phi { incoming_blocks } = &mut body.insts[phi].kind {
            assert_eq!(incoming_blocks.pop(), Some(right));
        }
        assert!(matches!(
            validate_func_body(&body, true),
            Err(ValidationError::PhiPredecessorMismatch { inst, .. }) if inst == phi
        ));
    }

    #[test]
    fn rejects_use_outside_dominance() {
        let cx = Context::new();
        let (mut body, [.., merge], neg) = diamond(&cx);
        body.blocks[merge].terminator = ControlInst::ret(Some(neg));
        assert!(matches!(
            validate_func_body(&body, true),
            Err(ValidationError::UseNotDominated { use_block, .. }) if use_block == merge
        ));
    }

    #[test]
    fn rejects_multiple_returns() {
        let cx = Context::new();
        let (mut body, [_, left, ..], neg) = diamond(&cx);
        body.blocks[left].terminator = ControlInst::ret(Some(neg));
        assert!(matches!(
            validate_single_return(&body),
            Err(ValidationError::MultipleReturns { blocks }) if blocks.len() == 2
        ));
    }

    #[test]
    fn rejects_shared_merge_block() {
        let cx = Context::new();
        let (mut body, [entry, left, _, merge], _) = diamond(&cx);
        body.blocks[left].merge = Some(crate::Merge::Selection { merge });
        assert!(matches!(
            validate_func_body(&body, true),
            Err(ValidationError::SharedMergeBlock { first_header, second_header, .. })
                if first_header == entry && second_header == left
        ));
    }
}
