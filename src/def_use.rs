//! Def-use index for the instructions and blocks of a function.
//!
//! [`DefUseIndex`] records, for every instruction, the block that defines it
//! and every [`User`] of its output, and for every block, every [`User`] that
//! refers to it (as a branch target, `Phi` predecessor, or merge/continue block).
//!
//! Unlike the dominator tree, the index can be kept up to date incrementally:
//! after any edit to an instruction, terminator or merge annotation, call the
//! matching `analyze_*` method (which first forgets the previous uses).

use crate::visit::{InnerVisit, Visitor};
use crate::{Block, Const, FuncDefBody, FxIndexSet, Inst, Type};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Something that can use instruction outputs and/or blocks.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum User {
    Inst(Inst),

    /// The terminator of a block.
    Terminator(Block),

    /// The merge annotation of a (header) block.
    Merge(Block),
}

/// Uses recorded for a single `User`, kept around so that they can be
/// removed (from the reverse maps) before re-analyzing the `User`.
#[derive(Default)]
struct Uses {
    insts: SmallVec<[Inst; 2]>,
    blocks: SmallVec<[Block; 2]>,
}

#[derive(Default)]
struct UseCollector {
    uses: Uses,
}

impl Visitor<'_> for UseCollector {
    fn visit_type_use(&mut self, _ty: Type) {}
    fn visit_const_use(&mut self, _ct: Const) {}

    fn visit_block_use(&mut self, block: Block) {
        if !self.uses.blocks.contains(&block) {
            self.uses.blocks.push(block);
        }
    }
    fn visit_inst_output_use(&mut self, inst: Inst) {
        if !self.uses.insts.contains(&inst) {
            self.uses.insts.push(inst);
        }
    }
}

#[derive(Default)]
pub struct DefUseIndex {
    /// Block containing each instruction.
    def_blocks: FxHashMap<Inst, Block>,

    inst_users: FxHashMap<Inst, FxIndexSet<User>>,
    block_users: FxHashMap<Block, FxIndexSet<User>>,

    uses_by_user: FxHashMap<User, Uses>,
}

impl DefUseIndex {
    pub fn compute(func_def_body: &FuncDefBody) -> Self {
        let mut def_use = Self::default();
        for &block in &func_def_body.layout {
            def_use.analyze_block(func_def_body, block);
        }
        def_use
    }

    /// (Re)analyze every instruction of `block`, its merge and its terminator.
    pub fn analyze_block(&mut self, func_def_body: &FuncDefBody, block: Block) {
        for &inst in &func_def_body.blocks[block].insts {
            self.analyze_inst(func_def_body, block, inst);
        }
        self.analyze_merge(func_def_body, block);
        self.analyze_terminator(func_def_body, block);
    }

    /// (Re)analyze `inst`, now found in `block`.
    pub fn analyze_inst(&mut self, func_def_body: &FuncDefBody, block: Block, inst: Inst) {
        self.def_blocks.insert(inst, block);

        let mut collector = UseCollector::default();
        func_def_body.insts[inst].inner_visit_with(&mut collector);
        self.set_uses(User::Inst(inst), collector.uses);
    }

    pub fn analyze_terminator(&mut self, func_def_body: &FuncDefBody, block: Block) {
        let mut collector = UseCollector::default();
        func_def_body.blocks[block]
            .terminator
            .inner_visit_with(&mut collector);
        self.set_uses(User::Terminator(block), collector.uses);
    }

    pub fn analyze_merge(&mut self, func_def_body: &FuncDefBody, block: Block) {
        let mut collector = UseCollector::default();
        if let Some(merge) = &func_def_body.blocks[block].merge {
            merge.inner_visit_with(&mut collector);
        }
        self.set_uses(User::Merge(block), collector.uses);
    }

    /// Forget all the uses previously recorded for `user`.
    pub fn clear_user(&mut self, user: User) {
        let Some(uses) = self.uses_by_user.remove(&user) else {
            return;
        };
        for inst in uses.insts {
            if let Some(users) = self.inst_users.get_mut(&inst) {
                users.shift_remove(&user);
            }
        }
        for block in uses.blocks {
            if let Some(users) = self.block_users.get_mut(&block) {
                users.shift_remove(&user);
            }
        }
    }

    fn set_uses(&mut self, user: User, uses: Uses) {
        self.clear_user(user);
        for &inst in &uses.insts {
            self.inst_users.entry(inst).or_default().insert(user);
        }
        for &block in &uses.blocks {
            self.block_users
                .entry(block)
                .or_default()
                .insert(user);
        }
        if !uses.insts.is_empty() || !uses.blocks.is_empty() {
            self.uses_by_user.insert(user, uses);
        }
    }

    /// Block defining `inst`, if `inst` is known to the index.
    pub fn def_block(&self, inst: Inst) -> Option<Block> {
        self.def_blocks.get(&inst).copied()
    }

    /// Block in which the use by `user` takes place.
    ///
    /// Note that `Phi`s use their inputs at the end of the respective incoming
    /// blocks, which this does not account for (see `InstDef::phi_incoming`).
    pub fn user_block(&self, user: User) -> Option<Block> {
        match user {
            User::Inst(inst) => self.def_block(inst),
            User::Terminator(block) | User::Merge(block) => Some(block),
        }
    }

    /// Users of the output of `inst`, in the order they were (last) analyzed.
    pub fn inst_users(&self, inst: Inst) -> impl Iterator<Item = User> + '_ {
        self.inst_users.get(&inst).into_iter().flatten().copied()
    }

    /// Users referring to `block`.
    pub fn block_users(&self, block: Block) -> impl Iterator<Item = User> + '_ {
        self.block_users.get(&block).into_iter().flatten().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FuncBuilder;
    use crate::{Context, ControlInst, Op, Value};

    #[test]
    fn users_of_insts_and_blocks() {
        let cx = Context::new();
        let i32_ty = cx.type_int(32, true);
        let bool_ty = cx.type_bool();
        let mut b = FuncBuilder::new(&cx);
        let [entry, then, merge] = [(); 3].map(|()| b.new_block());
        let x = Value::FuncParam { idx: 0 };
        let sum = b.op(entry, Op::IAdd, i32_ty, [x, x]);
        let cond = b.op(entry, Op::SGreaterThan, bool_ty, [sum, x]);
        b.selection_merge(entry, merge);
        b.terminate(entry, ControlInst::branch_conditional(cond, then, merge));
        let doubled = b.op(then, Op::IAdd, i32_ty, [sum, sum]);
        b.terminate(then, ControlInst::branch(merge));
        let phi = b.phi(merge, i32_ty, [(sum, entry), (doubled, then)]);
        b.terminate(merge, ControlInst::ret(Some(phi)));
        let body = b.finish();

        let def_use = DefUseIndex::compute(&body);
        let inst_of = |v: Value| match v {
            Value::InstOutput(inst) => inst,
            _ => unreachable!(),
        };

        assert_eq!(def_use.def_block(inst_of(sum)), Some(entry));
        assert_eq!(def_use.def_block(inst_of(phi)), Some(merge));
        assert_eq!(
            def_use.inst_users(inst_of(sum)).collect::<Vec<_>>(),
            [
                User::Inst(inst_of(cond)),
                User::Inst(inst_of(doubled)),
                User::Inst(inst_of(phi))
            ]
        );
        assert_eq!(
            def_use.block_users(merge).collect::<Vec<_>>(),
            [User::Merge(entry), User::Terminator(entry), User::Terminator(then)]
        );
        assert_eq!(
            def_use.block_users(then).collect::<Vec<_>>(),
            [User::Terminator(entry), User::Inst(inst_of(phi))]
        );
        assert_eq!(
            def_use.inst_users(inst_of(phi)).collect::<Vec<_>>(),
            [User::Terminator(merge)]
        );
    }

    #[test]
    fn reanalysis_forgets_old_uses() {
        let cx = Context::new();
        let mut b = FuncBuilder::new(&cx);
        let [entry, a, c] = [(); 3].map(|()| b.new_block());
        b.terminate(entry, ControlInst::branch(a));
        b.terminate(a, ControlInst::ret(None));
        b.terminate(c, ControlInst::ret(None));
        let mut body = b.finish();

        let mut def_use = DefUseIndex::compute(&body);
        assert_eq!(def_use.block_users(a).count(), 1);

        body.blocks[entry].terminator = ControlInst::branch(c);
        def_use.analyze_terminator(&body, entry);
        assert_eq!(def_use.block_users(a).count(), 0);
        assert_eq!(
            def_use.block_users(c).collect::<Vec<_>>(),
            [User::Terminator(entry)]
        );
    }
}
