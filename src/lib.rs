//! Return merging for shader-oriented IR with structured control-flow.
//!
//! Functions are lists of basic blocks, whose terminators form the control-flow
//! graph (CFG), and whose optional [`Merge`] annotations declare structured
//! selection/loop constructs (in the manner of SPIR-V's `OpSelectionMerge` and
//! `OpLoopMerge`).
//!
//! The main transformation, [`passes::merge_returns`], rewrites every function
//! with multiple `return`s so that it has exactly one, while keeping the CFG
//! structured (when required by the module's [`ModuleDialect`]).

use smallvec::SmallVec;
use std::hash::BuildHasherDefault;

mod context;
pub use context::{Block, Const, Context, Entity, EntityDefs, Func, Inst, InternInCx, InternedStr, Type};

pub mod analyses;
pub mod builder;
pub mod cfg;
pub mod def_use;
pub mod dominators;
pub mod func_at;
pub mod print;
pub mod spv;
pub mod validate;
pub mod visit;
pub mod passes {
    // NOTE inline `mod` to avoid adding APIs here, it's just namespacing.

    pub mod merge_returns;
}

pub type FxIndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
pub type FxIndexSet<V> = indexmap::IndexSet<V, BuildHasherDefault<rustc_hash::FxHasher>>;

// HACK this only serves to disallow modifying the `cx` field of `Module`.
mod sealed {
    use super::*;
    use std::rc::Rc;

    pub struct Module {
        /// Context used for everything interned (and all entity allocation),
        /// in this module.
        cx: Rc<Context>,

        pub dialect: ModuleDialect,

        pub funcs: EntityDefs<Func>,
    }

    impl Module {
        pub fn new(cx: Rc<Context>, dialect: ModuleDialect) -> Self {
            Self {
                cx,

                dialect,

                funcs: Default::default(),
            }
        }

        pub fn cx(&self) -> Rc<Context> {
            self.cx.clone()
        }

        pub fn cx_ref(&self) -> &Rc<Context> {
            &self.cx
        }
    }
}
pub use sealed::Module;

impl Module {
    /// Whether functions in this module must keep their control-flow structured
    /// (i.e. every construct has a single, declared, merge block).
    pub fn is_structured(&self) -> bool {
        match &self.dialect {
            ModuleDialect::Spv(dialect) => dialect.capabilities.contains(&spv::Capability::Shader),
        }
    }
}

pub enum ModuleDialect {
    Spv(spv::Dialect),
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TypeDef {
    Void,
    Bool,
    Int {
        width: u32,
        signed: bool,
    },
    Ptr {
        storage_class: StorageClass,
        pointee: Type,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum StorageClass {
    /// Function-local memory, as allocated by `InstKind::Variable`.
    Function,
    Private,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ConstDef {
    pub ty: Type,
    pub kind: ConstKind,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum ConstKind {
    Bool(bool),
    Int(i64),

    /// Placeholder value, e.g. for `Phi` inputs on edges that never observe it.
    Undef,
}

// Type/constant "manager" helpers (all of these intern, so they're idempotent).
impl Context {
    pub fn type_void(&self) -> Type {
        self.intern(TypeDef::Void)
    }

    pub fn type_bool(&self) -> Type {
        self.intern(TypeDef::Bool)
    }

    pub fn type_int(&self, width: u32, signed: bool) -> Type {
        self.intern(TypeDef::Int { width, signed })
    }

    /// Pointer to `pointee`, in function-local storage.
    pub fn type_function_ptr(&self, pointee: Type) -> Type {
        self.intern(TypeDef::Ptr {
            storage_class: StorageClass::Function,
            pointee,
        })
    }

    pub fn const_bool(&self, value: bool) -> Const {
        let ty = self.type_bool();
        self.intern(ConstDef {
            ty,
            kind: ConstKind::Bool(value),
        })
    }

    pub fn const_int(&self, ty: Type, value: i64) -> Const {
        self.intern(ConstDef {
            ty,
            kind: ConstKind::Int(value),
        })
    }

    pub fn const_undef(&self, ty: Type) -> Const {
        self.intern(ConstDef {
            ty,
            kind: ConstKind::Undef,
        })
    }
}

/// Declarations (e.g. `FuncDecl`) can contain a full definition,
/// or only be an import of a definition (e.g. from another module).
pub enum DeclDef<D> {
    Imported(Import),
    Present(D),
}

/// An identifier (e.g. a link name, or "symbol") for an import declaration.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Import {
    LinkName(InternedStr),
}

pub struct FuncDecl {
    pub ret_type: Type,

    pub params: SmallVec<[FuncParam; 2]>,

    pub def: DeclDef<FuncDefBody>,
}

pub struct FuncParam {
    pub ty: Type,
}

pub struct FuncDefBody {
    pub insts: EntityDefs<Inst>,
    pub blocks: EntityDefs<Block>,

    /// Order of the blocks in the function, starting with the entry block.
    ///
    /// Every block defined in `blocks` appears exactly once.
    pub layout: Vec<Block>,
}

impl FuncDefBody {
    pub fn new() -> Self {
        Self {
            insts: EntityDefs::new(),
            blocks: EntityDefs::new(),
            layout: vec![],
        }
    }

    pub fn entry(&self) -> Block {
        self.layout[0]
    }

    /// Insert `new_block` into the layout, right after `after`.
    pub fn insert_block_after(&mut self, new_block: Block, after: Block) {
        let idx = self
            .layout
            .iter()
            .position(|&b| b == after)
            .unwrap_or_else(|| panic!("{after:?} is missing from the function layout"));
        self.layout.insert(idx + 1, new_block);
    }
}

impl Default for FuncDefBody {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BlockDef {
    /// Instructions in the block, with any `InstKind::Phi`s always first.
    pub insts: Vec<Inst>,

    /// If present, this block is the header of a structured construct.
    pub merge: Option<Merge>,

    pub terminator: ControlInst,
}

impl BlockDef {
    /// Index of the first non-`Phi` instruction (or `insts.len()` if none).
    pub fn first_non_phi_idx(&self, insts: &EntityDefs<Inst>) -> usize {
        self.insts
            .iter()
            .position(|&inst| !matches!(insts[inst].kind, InstKind::Phi { .. }))
            .unwrap_or(self.insts.len())
    }

    pub fn phis<'a>(&'a self, insts: &'a EntityDefs<Inst>) -> impl Iterator<Item = Inst> + 'a {
        self.insts
            .iter()
            .copied()
            .take_while(move |&inst| matches!(insts[inst].kind, InstKind::Phi { .. }))
    }
}

/// Structured control-flow annotation, making its block a construct "header".
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Merge {
    /// `if`-`else`/`switch` construct, reconverging at `merge`.
    Selection { merge: Block },

    /// Loop construct, exited by branching ("breaking") to `merge`, with
    /// back-edges only allowed from the continue construct (`continue_target`).
    Loop { merge: Block, continue_target: Block },
}

impl Merge {
    pub fn merge_block(self) -> Block {
        match self {
            Self::Selection { merge } | Self::Loop { merge, .. } => merge,
        }
    }

    pub fn continue_target(self) -> Option<Block> {
        match self {
            Self::Selection { .. } => None,
            Self::Loop {
                continue_target, ..
            } => Some(continue_target),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InstDef {
    pub kind: InstKind,

    pub output_type: Option<Type>,

    pub inputs: SmallVec<[Value; 2]>,
}

impl InstDef {
    /// `(value, predecessor)` pairs of a `Phi` (empty for other instructions).
    pub fn phi_incoming(&self) -> impl Iterator<Item = (Value, Block)> + '_ {
        let incoming_blocks: &[Block] = match &self.kind {
            InstKind::Phi { incoming_blocks } => incoming_blocks,
            _ => &[],
        };
        self.inputs.iter().copied().zip(incoming_blocks.iter().copied())
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum InstKind {
    /// SSA merge of values: `inputs[i]` is the value when control-flow arrives
    /// from `incoming_blocks[i]`.
    Phi { incoming_blocks: SmallVec<[Block; 2]> },

    /// Function-local variable (its output is a pointer), with an optional
    /// initializer as its only input.
    Variable,

    /// Load through the pointer in `inputs[0]`.
    Load,

    /// Store `inputs[1]` through the pointer in `inputs[0]` (no output).
    Store,

    Op(Op),
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Op {
    IAdd,
    ISub,
    IMul,
    SNegate,
    IEqual,
    INotEqual,
    SLessThan,
    SGreaterThan,
    LogicalNot,
    LogicalAnd,
    LogicalOr,
    Select,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Self::IAdd => "i_add",
            Self::ISub => "i_sub",
            Self::IMul => "i_mul",
            Self::SNegate => "s_negate",
            Self::IEqual => "i_equal",
            Self::INotEqual => "i_not_equal",
            Self::SLessThan => "s_less_than",
            Self::SGreaterThan => "s_greater_than",
            Self::LogicalNot => "logical_not",
            Self::LogicalAnd => "logical_and",
            Self::LogicalOr => "logical_or",
            Self::Select => "select",
        }
    }
}

/// Block terminator, i.e. the control-flow instruction which leaves a block.
#[derive(Clone, Debug)]
pub struct ControlInst {
    pub kind: ControlInstKind,

    pub inputs: SmallVec<[Value; 2]>,

    pub targets: SmallVec<[Block; 4]>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ControlInstKind {
    /// Reaching this point in the control-flow is undefined behavior.
    Unreachable,

    /// Leave the current function, without a value.
    Return,

    /// Leave the current function, returning `inputs[0]`.
    ReturnValue,

    /// Unconditional branch to `targets[0]`.
    Branch,

    /// Branch to `targets[0]` if `inputs[0]` is `true`, `targets[1]` otherwise.
    BranchConditional,

    /// Branch on the integer `inputs[0]`: `targets[0]` is the default, while
    /// `targets[i + 1]` is taken when the selector equals `case_literals[i]`.
    Switch { case_literals: SmallVec<[i64; 4]> },
}

impl ControlInst {
    pub fn unreachable() -> Self {
        Self {
            kind: ControlInstKind::Unreachable,
            inputs: SmallVec::new(),
            targets: SmallVec::new(),
        }
    }

    pub fn ret(value: Option<Value>) -> Self {
        Self {
            kind: if value.is_some() {
                ControlInstKind::ReturnValue
            } else {
                ControlInstKind::Return
            },
            inputs: value.into_iter().collect(),
            targets: SmallVec::new(),
        }
    }

    pub fn branch(target: Block) -> Self {
        Self {
            kind: ControlInstKind::Branch,
            inputs: SmallVec::new(),
            targets: [target].into_iter().collect(),
        }
    }

    pub fn branch_conditional(cond: Value, on_true: Block, on_false: Block) -> Self {
        Self {
            kind: ControlInstKind::BranchConditional,
            inputs: [cond].into_iter().collect(),
            targets: [on_true, on_false].into_iter().collect(),
        }
    }

    pub fn switch(selector: Value, default: Block, cases: impl IntoIterator<Item = (i64, Block)>) -> Self {
        let (case_literals, case_targets): (SmallVec<[i64; 4]>, SmallVec<[Block; 4]>) =
            cases.into_iter().unzip();
        Self {
            kind: ControlInstKind::Switch { case_literals },
            inputs: [selector].into_iter().collect(),
            targets: [default].into_iter().chain(case_targets).collect(),
        }
    }

    /// Whether this is `Return` or `ReturnValue`.
    pub fn is_return(&self) -> bool {
        matches!(self.kind, ControlInstKind::Return | ControlInstKind::ReturnValue)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, derive_more::From)]
pub enum Value {
    Const(Const),

    #[from(ignore)]
    FuncParam {
        idx: u32,
    },

    InstOutput(Inst),
}
