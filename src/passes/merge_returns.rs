//! Merging of all the returns in a function into a single one.
//!
//! Two strategies are used, depending on the module:
//! * unstructured (e.g. kernels): every `return` becomes a branch to a new
//!   final block, which selects the return value with a `Phi`
//! * structured (i.e. with the `Shader` capability): every `return` becomes a
//!   "break" to the nearest legal merge block, after storing the return value
//!   into a function-local "slot" and setting a "returned" flag, and any code
//!   which the original `return` would have skipped is predicated on that flag
//!   (see the `structured` module for the details)

use crate::analyses::Analyses;
use crate::cfg::ControlFlowGraph;
use crate::def_use::{DefUseIndex, User};
use crate::func_at::FuncAt;
use crate::{
    print, validate, Block, BlockDef, Context, ControlInst, ControlInstKind, DeclDef, FuncDefBody,
    Inst, InstDef, InstKind, Module, Type, TypeDef, Value,
};
use smallvec::SmallVec;
use std::mem;
use tracing::{debug, trace};

mod phi_repair;
mod structured;

use phi_repair::NewPhiMarks;

/// Whether `merge_returns` changed anything.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Status {
    Unchanged,
    Changed,
}

/// Policy deciding whether the code from `func_at_block` up to (and including)
/// `tail` needs to be guarded by the "returned" flag (see `MergeReturnsOptions`).
pub type RequiresPredicationFn = fn(func_at_block: FuncAt<'_, Block>, tail: Block) -> bool;

pub struct MergeReturnsOptions {
    /// Allow exiting a selection construct early (i.e. a conditional branch
    /// directly to its merge block, without a merge annotation), instead of
    /// always predicating the rest of the selection construct.
    ///
    /// Some consumers reject such conditional exits from selection constructs,
    /// so only enable this after confirming the target accepts them.
    pub selection_break: bool,

    /// Decides, during predication, whether a range of blocks needs a guard.
    pub requires_predication: RequiresPredicationFn,

    /// Validate every transformed function, panicking on failure.
    pub validate: bool,
}

impl Default for MergeReturnsOptions {
    fn default() -> Self {
        Self {
            selection_break: false,
            requires_predication: conservative_requires_predication,
            validate: cfg!(debug_assertions),
        }
    }
}

/// Guard everything, unless nothing would actually be skipped (i.e. the range
/// is a single block containing only `Phi`s and its terminator).
pub fn conservative_requires_predication(func_at_block: FuncAt<'_, Block>, tail: Block) -> bool {
    func_at_block.position != tail
        || func_at_block
            .insts()
            .any(|func_at_inst| !matches!(func_at_inst.def().kind, InstKind::Phi { .. }))
}

/// Blocks of `func_def_body` terminated by `return`/`return_value`, in layout order.
pub fn collect_return_blocks(func_def_body: &FuncDefBody) -> SmallVec<[Block; 4]> {
    func_def_body
        .layout
        .iter()
        .copied()
        .filter(|&block| func_def_body.blocks[block].terminator.is_return())
        .collect()
}

/// Rewrite every function in `module` with more than one return, to have
/// exactly one return (see also the module-level documentation).
///
/// Functions with at most one return are left untouched (and so are imports).
#[tracing::instrument(level = "debug", skip_all)]
pub fn merge_returns(module: &mut Module, options: &MergeReturnsOptions) -> Status {
    let cx = module.cx();
    let structured = module.is_structured();

    let mut status = Status::Unchanged;
    for (func, func_decl) in module.funcs.iter_mut() {
        let ret_type = func_decl.ret_type;
        let func_def_body = match &mut func_decl.def {
            DeclDef::Imported(_) => continue,
            DeclDef::Present(func_def_body) => func_def_body,
        };

        let return_blocks = collect_return_blocks(func_def_body);
        if return_blocks.len() <= 1 {
            continue;
        }
        debug!(?func, returns = return_blocks.len(), structured, "merging returns");

        let mut merger = MergeReturns::new(&cx, options, ret_type, func_def_body);
        if structured {
            merger.process_structured(&return_blocks);
        } else {
            merger.process_unstructured(&return_blocks);
        }
        status = Status::Changed;

        if options.validate {
            let result = validate::validate_func(&cx, func_decl).and_then(|()| match &func_decl.def {
                DeclDef::Present(func_def_body) => validate::validate_single_return(func_def_body),
                DeclDef::Imported(_) => Ok(()),
            });
            if let Err(err) = result {
                panic!(
                    "merge_returns: produced invalid function ({err}):\n{}",
                    print::printed(&cx, &(func, &*func_decl))
                );
            }
        }
    }
    status
}

/// State for merging the returns of a single function.
struct MergeReturns<'a> {
    cx: &'a Context,
    options: &'a MergeReturnsOptions,

    ret_type: Type,
    func_def_body: &'a mut FuncDefBody,
    analyses: Analyses,

    /// Blocks in structured order (only used by the structured strategy),
    /// with blocks created by splitting inserted next to their origin.
    order: Vec<Block>,

    /// Index in `order` of the block the predication walk is at (shifted
    /// whenever a block is inserted before it).
    order_cursor: usize,

    final_return_block: Option<Block>,

    /// Function-local `bool` variable, set once a return has been taken.
    return_flag: Option<Value>,

    /// Function-local variable holding the return value (if any).
    return_value: Option<Value>,

    marks: NewPhiMarks,
}

impl<'a> MergeReturns<'a> {
    fn new(
        cx: &'a Context,
        options: &'a MergeReturnsOptions,
        ret_type: Type,
        func_def_body: &'a mut FuncDefBody,
    ) -> Self {
        Self {
            cx,
            options,
            ret_type,
            func_def_body,
            analyses: Analyses::new(),
            order: vec![],
            order_cursor: 0,
            final_return_block: None,
            return_flag: None,
            return_value: None,
            marks: NewPhiMarks::default(),
        }
    }

    fn returns_value(&self) -> bool {
        !matches!(self.cx[self.ret_type], TypeDef::Void)
    }

    fn cfg(&mut self) -> &ControlFlowGraph {
        self.analyses.cfg(self.func_def_body)
    }

    fn cfg_mut(&mut self) -> &mut ControlFlowGraph {
        self.analyses.cfg_mut(self.func_def_body)
    }

    fn def_use(&mut self) -> &mut DefUseIndex {
        self.analyses.def_use(self.func_def_body)
    }

    fn final_return_block(&self) -> Block {
        self.final_return_block
            .expect("merge_returns: final return block used before being created")
    }

    fn analyze_inst(&mut self, block: Block, inst: Inst) {
        let func_def_body = &*self.func_def_body;
        self.analyses
            .def_use(func_def_body)
            .analyze_inst(func_def_body, block, inst);
    }

    fn analyze_block(&mut self, block: Block) {
        let func_def_body = &*self.func_def_body;
        self.analyses
            .def_use(func_def_body)
            .analyze_block(func_def_body, block);
    }

    /// Define `inst_def` and insert it into `block`, at position `idx`.
    fn insert_inst(&mut self, block: Block, idx: usize, inst_def: InstDef) -> Inst {
        let inst = self.func_def_body.insts.define(self.cx, inst_def);
        self.func_def_body.blocks[block].insts.insert(idx, inst);
        self.analyze_inst(block, inst);
        inst
    }

    fn append_inst(&mut self, block: Block, inst_def: InstDef) -> Inst {
        let idx = self.func_def_body.blocks[block].insts.len();
        self.insert_inst(block, idx, inst_def)
    }

    fn append_store(&mut self, block: Block, ptr: Value, value: Value) {
        self.append_inst(
            block,
            InstDef {
                kind: InstKind::Store,
                output_type: None,
                inputs: [ptr, value].into_iter().collect(),
            },
        );
    }

    /// Define a new (empty, `unreachable`) block, placed right after `after`
    /// (both in the function layout and, if present, the structured order).
    fn new_block_after(&mut self, after: Block) -> Block {
        let block = self.func_def_body.blocks.define(
            self.cx,
            BlockDef {
                insts: vec![],
                merge: None,
                terminator: ControlInst::unreachable(),
            },
        );
        self.func_def_body.insert_block_after(block, after);
        if let Some(idx) = self.order.iter().position(|&b| b == after) {
            self.order.insert(idx + 1, block);
            if idx < self.order_cursor {
                self.order_cursor += 1;
            }
        }
        self.cfg_mut().register_block(block);
        block
    }

    /// Replace the terminator of `block`, updating the CFG and def-use index.
    fn set_terminator(&mut self, block: Block, terminator: ControlInst) {
        let targets = terminator.targets.clone();
        self.func_def_body.blocks[block].terminator = terminator;
        self.cfg_mut().set_successor_edges(block, targets);

        let func_def_body = &*self.func_def_body;
        self.analyses
            .def_use(func_def_body)
            .analyze_terminator(func_def_body, block);
    }

    /// Move the terminator of `from` into `to`, leaving `from` to branch to `to`.
    ///
    /// The successors now reached through `to` have their `Phi`s updated, as
    /// well as any marks for `Phi` repair that named `from`.
    fn move_terminator(&mut self, from: Block, to: Block) {
        let terminator = mem::replace(
            &mut self.func_def_body.blocks[from].terminator,
            ControlInst::branch(to),
        );
        self.func_def_body.blocks[to].terminator = terminator;

        let succs: SmallVec<[Block; 4]> = self.cfg().succs(from).into();
        for &succ in &succs {
            let changed_phis = self
                .func_def_body
                .at_mut(succ)
                .replace_phi_incoming_block(from, to);
            for phi in changed_phis {
                self.analyze_inst(succ, phi);
            }
        }
        self.marks.terminator_moved(from, to);

        let cfg = self.cfg_mut();
        cfg.set_successor_edges(to, succs);
        cfg.set_successor_edges(from, [to]);

        let func_def_body = &*self.func_def_body;
        let def_use = self.analyses.def_use(func_def_body);
        def_use.analyze_terminator(func_def_body, from);
        def_use.analyze_terminator(func_def_body, to);
    }

    /// Split `block` right before its `at`-th instruction, moving the rest of
    /// its instructions (and its merge annotation and terminator) to a new
    /// block, placed right after it, which is returned.
    ///
    /// `block` keeps its label (and so all its predecessors), and ends up
    /// unconditionally branching to the new block.
    fn split_block(&mut self, block: Block, at: usize) -> Block {
        let new_block = self.new_block_after(block);

        let block_def = &mut self.func_def_body.blocks[block];
        let moved_insts = block_def.insts.split_off(at);
        let merge = block_def.merge.take();

        let new_block_def = &mut self.func_def_body.blocks[new_block];
        new_block_def.insts = moved_insts;
        new_block_def.merge = merge;

        self.move_terminator(block, new_block);
        self.analyze_block(block);
        self.analyze_block(new_block);

        trace!(?block, ?new_block, "split block");
        new_block
    }

    /// Split `block` after its `Phi`s, returning the new block.
    fn split_after_phis(&mut self, block: Block) -> Block {
        let at = self.func_def_body.blocks[block].first_non_phi_idx(&self.func_def_body.insts);
        self.split_block(block, at)
    }

    /// Account for a new `from -> to` edge that is about to be added: `to`'s
    /// `Phi`s get an `undef` input for `from`, and `to` is marked for `Phi`
    /// repair (as its dominator may change).
    fn prepare_new_edge(&mut self, from: Block, to: Block) {
        self.mark_for_new_phis(to);

        let phis: SmallVec<[Inst; 4]> = self.func_def_body.blocks[to]
            .phis(&self.func_def_body.insts)
            .collect();
        for phi in phis {
            let phi_def = &mut self.func_def_body.insts[phi];
            let ty = phi_def
                .output_type
                .expect("merge_returns: `Phi` without an output type");
            phi_def.inputs.push(Value::Const(self.cx.const_undef(ty)));
            if let InstKind::Phi { incoming_blocks } = &mut phi_def.kind {
                incoming_blocks.push(from);
            }
            self.analyze_inst(to, phi);
        }
    }

    /// Replace the terminator of `block` (a return, or any other block without
    /// successors) with a branch to `target`.
    ///
    /// For returns, the return value (if any) is stored into the return value
    /// slot, and the return flag is set, right before the branch.
    fn branch_to_block(&mut self, block: Block, target: Block) {
        let terminator = &self.func_def_body.blocks[block].terminator;
        if terminator.is_return() {
            let ret_value = match terminator.kind {
                ControlInstKind::ReturnValue => Some(terminator.inputs[0]),
                _ => None,
            };
            if let Some(ret_value) = ret_value {
                let slot = self
                    .return_value
                    .expect("merge_returns: returning a value without a return value slot");
                self.append_store(block, slot, ret_value);
            }
            let flag = self.add_return_flag();
            self.append_store(block, flag, Value::Const(self.cx.const_bool(true)));
        }

        self.prepare_new_edge(block, target);
        self.set_terminator(block, ControlInst::branch(target));
        trace!(?block, ?target, "redirected return");
    }

    /// Get (or create, at the start of the entry block) the return flag.
    fn add_return_flag(&mut self) -> Value {
        if let Some(flag) = self.return_flag {
            return flag;
        }
        let cx = self.cx;
        let entry = self.func_def_body.entry();
        let flag = self.insert_inst(
            entry,
            0,
            InstDef {
                kind: InstKind::Variable,
                output_type: Some(cx.type_function_ptr(cx.type_bool())),
                inputs: [Value::Const(cx.const_bool(false))].into_iter().collect(),
            },
        );
        let flag = Value::InstOutput(flag);
        self.return_flag = Some(flag);
        flag
    }

    /// Create (at the start of the entry block) the return value slot, if the
    /// function returns a value.
    fn add_return_value(&mut self) {
        if self.return_value.is_some() || !self.returns_value() {
            return;
        }
        let entry = self.func_def_body.entry();
        let slot = self.insert_inst(
            entry,
            0,
            InstDef {
                kind: InstKind::Variable,
                output_type: Some(self.cx.type_function_ptr(self.ret_type)),
                inputs: SmallVec::new(),
            },
        );
        self.return_value = Some(Value::InstOutput(slot));
    }

    /// Append a load of the return flag to `block`.
    fn load_return_flag(&mut self, block: Block) -> Value {
        let flag = self
            .return_flag
            .expect("merge_returns: return flag used before being created");
        let inst = self.append_inst(
            block,
            InstDef {
                kind: InstKind::Load,
                output_type: Some(self.cx.type_bool()),
                inputs: [flag].into_iter().collect(),
            },
        );
        Value::InstOutput(inst)
    }

    /// Append a new block to the function, to become the only returning block.
    fn create_final_return_block(&mut self) -> Block {
        let block = self.func_def_body.blocks.define(
            self.cx,
            BlockDef {
                insts: vec![],
                merge: None,
                terminator: ControlInst::unreachable(),
            },
        );
        self.func_def_body.layout.push(block);
        self.cfg_mut().register_block(block);
        self.final_return_block = Some(block);
        block
    }

    /// Replace every use of `old` with `new`, where the use takes place in a
    /// block for which `filter` returns `true` (for `Phi`s, uses take place
    /// at the end of the respective incoming block).
    fn replace_uses(&mut self, old: Inst, new: Value, mut filter: impl FnMut(Block) -> bool) {
        let old_value = Value::InstOutput(old);
        let users: SmallVec<[User; 8]> = self.def_use().inst_users(old).collect();
        for user in users {
            let user_block = self.def_use().user_block(user);
            let changed = match user {
                User::Inst(inst) => {
                    let InstDef { kind, inputs, .. } = &mut self.func_def_body.insts[inst];
                    let mut changed = false;
                    match kind {
                        InstKind::Phi { incoming_blocks } => {
                            for (v, &incoming) in inputs.iter_mut().zip(&incoming_blocks[..]) {
                                if *v == old_value && filter(incoming) {
                                    *v = new;
                                    changed = true;
                                }
                            }
                        }
                        _ => {
                            if user_block.map_or(false, &mut filter) {
                                for v in inputs.iter_mut().filter(|v| **v == old_value) {
                                    *v = new;
                                    changed = true;
                                }
                            }
                        }
                    }
                    changed
                }
                User::Terminator(block) => {
                    let mut changed = false;
                    if filter(block) {
                        let inputs = &mut self.func_def_body.blocks[block].terminator.inputs;
                        for v in inputs.iter_mut().filter(|v| **v == old_value) {
                            *v = new;
                            changed = true;
                        }
                    }
                    changed
                }
                User::Merge(_) => false,
            };
            if !changed {
                continue;
            }
            match (user, user_block) {
                (User::Inst(inst), Some(block)) => self.analyze_inst(block, inst),
                (User::Terminator(block), _) => {
                    let func_def_body = &*self.func_def_body;
                    self.analyses
                        .def_use(func_def_body)
                        .analyze_terminator(func_def_body, block);
                }
                _ => {}
            }
        }
    }

    fn process_unstructured(&mut self, return_blocks: &[Block]) {
        let final_block = self.create_final_return_block();

        let incoming: SmallVec<[(Value, Block); 4]> = return_blocks
            .iter()
            .filter_map(|&block| {
                let terminator = &self.func_def_body.blocks[block].terminator;
                match terminator.kind {
                    ControlInstKind::ReturnValue => Some((terminator.inputs[0], block)),
                    _ => None,
                }
            })
            .collect();

        let terminator = if incoming.is_empty() {
            ControlInst::ret(None)
        } else {
            let (inputs, incoming_blocks) = incoming.into_iter().unzip();
            let phi = self.append_inst(
                final_block,
                InstDef {
                    kind: InstKind::Phi { incoming_blocks },
                    output_type: Some(self.ret_type),
                    inputs,
                },
            );
            ControlInst::ret(Some(Value::InstOutput(phi)))
        };
        self.set_terminator(final_block, terminator);

        for &block in return_blocks {
            self.set_terminator(block, ControlInst::branch(final_block));
            trace!(?block, ?final_block, "redirected return");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FuncBuilder;
    use crate::{Context, Op};

    #[test]
    fn phi_only_single_blocks_skip_predication() {
        let cx = Context::new();
        let i32_ty = cx.type_int(32, true);
        let mut b = FuncBuilder::new(&cx);
        let [entry, phis_only, with_op, exit] = [(); 4].map(|()| b.new_block());
        let zero = Value::Const(cx.const_int(i32_ty, 0));
        b.terminate(entry, ControlInst::branch(phis_only));
        let phi = b.phi(phis_only, i32_ty, [(zero, entry)]);
        b.terminate(phis_only, ControlInst::branch(with_op));
        b.op(with_op, Op::IAdd, i32_ty, [phi, zero]);
        b.terminate(with_op, ControlInst::branch(exit));
        b.terminate(exit, ControlInst::ret(None));
        let body = b.finish();

        assert!(!conservative_requires_predication(body.at(phis_only), phis_only));
        assert!(conservative_requires_predication(body.at(with_op), with_op));
        assert!(conservative_requires_predication(body.at(phis_only), exit));
        assert_eq!(collect_return_blocks(&body)[..], [exit]);
    }

    #[test]
    fn new_blocks_keep_the_walk_in_place() {
        let cx = Context::new();
        let mut b = FuncBuilder::new(&cx);
        let [entry, a, c] = [(); 3].map(|()| b.new_block());
        b.terminate(entry, ControlInst::branch(a));
        b.terminate(a, ControlInst::branch(c));
        b.terminate(c, ControlInst::ret(None));
        let mut body = b.finish();

        let options = MergeReturnsOptions::default();
        let mut merger = MergeReturns::new(&cx, &options, cx.type_void(), &mut body);
        merger.order = vec![entry, a, c];
        merger.order_cursor = 1;

        // Inserting before the walk shifts it, to stay on `a`.
        let before = merger.new_block_after(entry);
        assert_eq!(merger.order, [entry, before, a, c]);
        assert_eq!(merger.order[merger.order_cursor], a);

        // Inserting after the walk leaves the new block to be visited next.
        let after = merger.new_block_after(a);
        assert_eq!(merger.order[merger.order_cursor], a);
        assert_eq!(merger.order[merger.order_cursor + 1], after);
        assert_eq!(body.layout, [entry, before, a, after, c]);
    }
}
