//! Convenience construction of function bodies.

use crate::{
    Block, BlockDef, Context, ControlInst, FuncDefBody, Inst, InstDef, InstKind, Merge, Op, Type,
    Value,
};
use smallvec::SmallVec;

/// Builder for a `FuncDefBody`, with blocks laid out in creation order (the
/// first block created being the entry).
///
/// Freshly created blocks end in `unreachable` until `terminate` is called.
pub struct FuncBuilder<'a> {
    cx: &'a Context,
    body: FuncDefBody,
}

impl<'a> FuncBuilder<'a> {
    pub fn new(cx: &'a Context) -> Self {
        Self {
            cx,
            body: FuncDefBody::new(),
        }
    }

    pub fn cx(&self) -> &'a Context {
        self.cx
    }

    pub fn new_block(&mut self) -> Block {
        let block = self.body.blocks.define(
            self.cx,
            BlockDef {
                insts: vec![],
                merge: None,
                terminator: ControlInst::unreachable(),
            },
        );
        self.body.layout.push(block);
        block
    }

    /// Append an instruction to `block` (after any existing instructions).
    pub fn inst(&mut self, block: Block, inst_def: InstDef) -> Inst {
        let inst = self.body.insts.define(self.cx, inst_def);
        self.body.blocks[block].insts.push(inst);
        inst
    }

    pub fn op(
        &mut self,
        block: Block,
        op: Op,
        output_type: Type,
        inputs: impl IntoIterator<Item = Value>,
    ) -> Value {
        Value::InstOutput(self.inst(
            block,
            InstDef {
                kind: InstKind::Op(op),
                output_type: Some(output_type),
                inputs: inputs.into_iter().collect(),
            },
        ))
    }

    /// Add a `Phi` to `block`, after any existing `Phi`s.
    pub fn phi(&mut self, block: Block, ty: Type, incoming: impl IntoIterator<Item = (Value, Block)>) -> Value {
        let (inputs, incoming_blocks): (SmallVec<_>, SmallVec<_>) = incoming.into_iter().unzip();
        let inst = self.body.insts.define(
            self.cx,
            InstDef {
                kind: InstKind::Phi { incoming_blocks },
                output_type: Some(ty),
                inputs,
            },
        );
        let block_def = &mut self.body.blocks[block];
        let idx = block_def.first_non_phi_idx(&self.body.insts);
        block_def.insts.insert(idx, inst);
        Value::InstOutput(inst)
    }

    /// Add an input to an existing `Phi` (e.g. for loop back-edges, whose
    /// values are only defined after the `Phi` itself).
    pub fn add_phi_incoming(&mut self, phi: Value, value: Value, pred: Block) {
        let Value::InstOutput(inst) = phi else {
            panic!("{phi:?} is not a `Phi`");
        };
        let phi_def = &mut self.body.insts[inst];
        match &mut phi_def.kind {
            InstKind::Phi { incoming_blocks } => incoming_blocks.push(pred),
            kind => panic!("{inst:?} is not a `Phi`, but {kind:?}"),
        }
        phi_def.inputs.push(value);
    }

    /// Add a function-local variable holding values of type `pointee`.
    pub fn variable(&mut self, block: Block, pointee: Type, initializer: Option<Value>) -> Value {
        let ptr_type = self.cx.type_function_ptr(pointee);
        Value::InstOutput(self.inst(
            block,
            InstDef {
                kind: InstKind::Variable,
                output_type: Some(ptr_type),
                inputs: initializer.into_iter().collect(),
            },
        ))
    }

    pub fn load(&mut self, block: Block, ty: Type, ptr: Value) -> Value {
        Value::InstOutput(self.inst(
            block,
            InstDef {
                kind: InstKind::Load,
                output_type: Some(ty),
                inputs: [ptr].into_iter().collect(),
            },
        ))
    }

    pub fn store(&mut self, block: Block, ptr: Value, value: Value) {
        self.inst(
            block,
            InstDef {
                kind: InstKind::Store,
                output_type: None,
                inputs: [ptr, value].into_iter().collect(),
            },
        );
    }

    pub fn terminate(&mut self, block: Block, terminator: ControlInst) {
        self.body.blocks[block].terminator = terminator;
    }

    pub fn selection_merge(&mut self, header: Block, merge: Block) {
        self.body.blocks[header].merge = Some(Merge::Selection { merge });
    }

    pub fn loop_merge(&mut self, header: Block, merge: Block, continue_target: Block) {
        self.body.blocks[header].merge = Some(Merge::Loop {
            merge,
            continue_target,
        });
    }

    pub fn finish(self) -> FuncDefBody {
        self.body
    }
}
