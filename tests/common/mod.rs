//! Reference interpreter, used to compare functions before and after a pass.

#![allow(dead_code)]

use retmerge::builder::FuncBuilder;
use retmerge::spv::{Capability, Dialect};
use retmerge::{
    Block, ConstKind, Context, ControlInstKind, DeclDef, Func, FuncDecl, FuncDefBody, FuncParam,
    Inst, InstKind, Module, ModuleDialect, Op, Type, Value,
};
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Runtime value.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Val {
    Bool(bool),
    Int(i64),

    /// Index into the interpreter's memory.
    Ptr(usize),

    Undef,
}

/// Executing more blocks than this is treated as an infinite loop.
const STEP_LIMIT: usize = 10_000;

/// Run `func_def_body` on `args`, returning the returned value (if any).
///
/// Panics on anything that would be undefined behavior (e.g. reaching an
/// `unreachable`, or branching on `undef`).
pub fn run(cx: &Context, func_def_body: &FuncDefBody, args: &[Val]) -> Option<Val> {
    let mut values = FxHashMap::<Inst, Val>::default();
    let mut memory = vec![];

    let eval = |values: &FxHashMap<Inst, Val>, v: Value| match v {
        Value::Const(ct) => match cx[ct].kind {
            ConstKind::Bool(b) => Val::Bool(b),
            ConstKind::Int(x) => Val::Int(x),
            ConstKind::Undef => Val::Undef,
        },
        Value::FuncParam { idx } => args[idx as usize],
        Value::InstOutput(inst) => *values
            .get(&inst)
            .unwrap_or_else(|| panic!("{inst:?} used before being computed")),
    };

    let mut prev: Option<Block> = None;
    let mut block = func_def_body.entry();
    for _ in 0..STEP_LIMIT {
        let block_def = &func_def_body.blocks[block];

        // All `Phi`s read their inputs before any of them is updated.
        let phi_values: Vec<_> = block_def
            .phis(&func_def_body.insts)
            .map(|phi| {
                let pred = prev.unwrap_or_else(|| panic!("{phi:?} in the entry block"));
                let (v, _) = func_def_body.insts[phi]
                    .phi_incoming()
                    .find(|&(_, incoming)| incoming == pred)
                    .unwrap_or_else(|| panic!("{phi:?} has no input for {pred:?}"));
                (phi, eval(&values, v))
            })
            .collect();
        values.extend(phi_values);

        for &inst in &block_def.insts {
            let inst_def = &func_def_body.insts[inst];
            if let InstKind::Phi { .. } = inst_def.kind {
                continue;
            }
            let inputs: Vec<_> = inst_def.inputs.iter().map(|&v| eval(&values, v)).collect();
            let output = match &inst_def.kind {
                InstKind::Phi { .. } => unreachable!(),
                InstKind::Variable => {
                    memory.push(inputs.first().copied().unwrap_or(Val::Undef));
                    Val::Ptr(memory.len() - 1)
                }
                InstKind::Load => match inputs[0] {
                    Val::Ptr(ptr) => memory[ptr],
                    v => panic!("{inst:?}: load through {v:?}"),
                },
                InstKind::Store => {
                    match inputs[0] {
                        Val::Ptr(ptr) => memory[ptr] = inputs[1],
                        v => panic!("{inst:?}: store through {v:?}"),
                    }
                    continue;
                }
                &InstKind::Op(op) => eval_op(op, &inputs),
            };
            values.insert(inst, output);
        }

        let terminator = &block_def.terminator;
        let next = match &terminator.kind {
            ControlInstKind::Unreachable => panic!("{block:?}: reached `unreachable`"),
            ControlInstKind::Return => return None,
            ControlInstKind::ReturnValue => return Some(eval(&values, terminator.inputs[0])),
            ControlInstKind::Branch => terminator.targets[0],
            ControlInstKind::BranchConditional => match eval(&values, terminator.inputs[0]) {
                Val::Bool(true) => terminator.targets[0],
                Val::Bool(false) => terminator.targets[1],
                v => panic!("{block:?}: branching on {v:?}"),
            },
            ControlInstKind::Switch { case_literals } => match eval(&values, terminator.inputs[0]) {
                Val::Int(x) => case_literals
                    .iter()
                    .position(|&literal| literal == x)
                    .map_or(terminator.targets[0], |case_idx| terminator.targets[case_idx + 1]),
                v => panic!("{block:?}: switching on {v:?}"),
            },
        };
        prev = Some(block);
        block = next;
    }
    panic!("step limit exceeded")
}

fn eval_op(op: Op, inputs: &[Val]) -> Val {
    // Arithmetic on `undef` stays `undef` (only observing it is an error).
    if op != Op::Select && inputs.contains(&Val::Undef) {
        return Val::Undef;
    }
    match (op, inputs) {
        (Op::IAdd, &[Val::Int(a), Val::Int(b)]) => Val::Int(a.wrapping_add(b)),
        (Op::ISub, &[Val::Int(a), Val::Int(b)]) => Val::Int(a.wrapping_sub(b)),
        (Op::IMul, &[Val::Int(a), Val::Int(b)]) => Val::Int(a.wrapping_mul(b)),
        (Op::SNegate, &[Val::Int(a)]) => Val::Int(a.wrapping_neg()),
        (Op::IEqual, &[Val::Int(a), Val::Int(b)]) => Val::Bool(a == b),
        (Op::INotEqual, &[Val::Int(a), Val::Int(b)]) => Val::Bool(a != b),
        (Op::SLessThan, &[Val::Int(a), Val::Int(b)]) => Val::Bool(a < b),
        (Op::SGreaterThan, &[Val::Int(a), Val::Int(b)]) => Val::Bool(a > b),
        (Op::LogicalNot, &[Val::Bool(a)]) => Val::Bool(!a),
        (Op::LogicalAnd, &[Val::Bool(a), Val::Bool(b)]) => Val::Bool(a && b),
        (Op::LogicalOr, &[Val::Bool(a), Val::Bool(b)]) => Val::Bool(a || b),
        (Op::Select, &[Val::Bool(c), a, b]) => {
            if c {
                a
            } else {
                b
            }
        }
        _ => panic!("invalid operands for `{}`: {inputs:?}", op.name()),
    }
}

pub fn shader_dialect() -> ModuleDialect {
    ModuleDialect::Spv(Dialect::with_capabilities([Capability::Shader]))
}

pub fn kernel_dialect() -> ModuleDialect {
    ModuleDialect::Spv(Dialect::with_capabilities([
        Capability::Addresses,
        Capability::Kernel,
    ]))
}

/// Signature and body builder for a test function.
pub struct TestFunc {
    pub ret_type: fn(&Context) -> Type,
    pub params: fn(&Context) -> Vec<Type>,
    pub build: fn(&mut FuncBuilder<'_>),
}

impl TestFunc {
    pub fn body(&self, cx: &Context) -> FuncDefBody {
        let mut b = FuncBuilder::new(cx);
        (self.build)(&mut b);
        b.finish()
    }

    pub fn decl(&self, cx: &Context) -> FuncDecl {
        FuncDecl {
            ret_type: (self.ret_type)(cx),
            params: (self.params)(cx)
                .into_iter()
                .map(|ty| FuncParam { ty })
                .collect(),
            def: DeclDef::Present(self.body(cx)),
        }
    }

    /// A module containing only this function.
    pub fn module(&self, dialect: ModuleDialect) -> (Module, Func) {
        let cx = Rc::new(Context::new());
        let mut module = Module::new(cx.clone(), dialect);
        let func = module.funcs.define(&cx, self.decl(&cx));
        (module, func)
    }
}

pub fn body_of(module: &Module, func: Func) -> &FuncDefBody {
    match &module.funcs[func].def {
        DeclDef::Present(func_def_body) => func_def_body,
        DeclDef::Imported(_) => unreachable!(),
    }
}

pub fn i32_type(cx: &Context) -> Type {
    cx.type_int(32, true)
}

pub fn int(cx: &Context, x: i64) -> Value {
    Value::Const(cx.const_int(i32_type(cx), x))
}

pub fn param(idx: u32) -> Value {
    Value::FuncParam { idx }
}

pub fn inst_of(v: Value) -> Inst {
    match v {
        Value::InstOutput(inst) => inst,
        _ => panic!("{v:?} is not an instruction output"),
    }
}
