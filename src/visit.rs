use crate::func_at::FuncAt;
use crate::{
    Block, BlockDef, Const, ConstDef, ControlInst, DeclDef, FuncDecl, FuncDefBody, FuncParam,
    Inst, InstDef, InstKind, Merge, Type, TypeDef, Value,
};

// FIXME `Sized` bound shouldn't be needed but removing it requires
// writing `impl Visitor<'a> + ?Sized` in `fn inner_visit_with` signatures.
pub trait Visitor<'a>: Sized {
    // Context-interned leaves (no default provided).
    fn visit_type_use(&mut self, ty: Type);
    fn visit_const_use(&mut self, ct: Const);

    // Function-local leaves (noop default behavior).
    fn visit_block_use(&mut self, _block: Block) {}
    fn visit_inst_output_use(&mut self, _inst: Inst) {}
    fn visit_func_param_use(&mut self, _idx: u32) {}

    // Non-leaves (defaulting to calling `.inner_visit_with(self)`).
    fn visit_type_def(&mut self, ty_def: &'a TypeDef) {
        ty_def.inner_visit_with(self);
    }
    fn visit_const_def(&mut self, ct_def: &'a ConstDef) {
        ct_def.inner_visit_with(self);
    }
    fn visit_func_decl(&mut self, func_decl: &'a FuncDecl) {
        func_decl.inner_visit_with(self);
    }
    fn visit_block_def(&mut self, func_at_block: FuncAt<'a, Block>) {
        func_at_block.inner_visit_with(self);
    }
    fn visit_inst_def(&mut self, inst_def: &'a InstDef) {
        inst_def.inner_visit_with(self);
    }
    fn visit_merge(&mut self, merge: &'a Merge) {
        merge.inner_visit_with(self);
    }
    fn visit_control_inst(&mut self, control_inst: &'a ControlInst) {
        control_inst.inner_visit_with(self);
    }
    fn visit_value_use(&mut self, v: &'a Value) {
        v.inner_visit_with(self);
    }
}

/// Trait implemented on "visitable" types, to further "explore" a type by
/// visiting its "interior" (i.e. variants and/or fields).
///
/// That is, an `impl InnerVisit for X` will call the relevant `Visitor` method
/// for each `X` field, effectively performing a single level of a deep visit.
/// Also, if `Visitor::visit_X` exists for a given `X`, its default should be to
/// call `X::inner_visit_with` (i.e. so that visiting is mostly-deep by default).
pub trait InnerVisit {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>);
}

impl InnerVisit for TypeDef {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        match *self {
            Self::Void | Self::Bool | Self::Int { .. } => {}
            Self::Ptr {
                storage_class: _,
                pointee,
            } => visitor.visit_type_use(pointee),
        }
    }
}

impl InnerVisit for ConstDef {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        let Self { ty, kind: _ } = *self;

        visitor.visit_type_use(ty);
    }
}

impl InnerVisit for FuncDecl {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        let Self {
            ret_type,
            params,
            def,
        } = self;

        visitor.visit_type_use(*ret_type);
        for param in params {
            param.inner_visit_with(visitor);
        }
        match def {
            DeclDef::Imported(_) => {}
            DeclDef::Present(func_def_body) => func_def_body.inner_visit_with(visitor),
        }
    }
}

impl InnerVisit for FuncParam {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        let Self { ty } = *self;

        visitor.visit_type_use(ty);
    }
}

impl InnerVisit for FuncDefBody {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        for &block in &self.layout {
            visitor.visit_block_def(self.at(block));
        }
    }
}

impl<'a> FuncAt<'a, Block> {
    // NOTE(inherent) not `InnerVisit` because the lifetime of the visited
    // data comes from `FuncAt` itself, not from `&self`.
    pub fn inner_visit_with(self, visitor: &mut impl Visitor<'a>) {
        let BlockDef {
            insts,
            merge,
            terminator,
        } = self.def();

        for &inst in insts {
            visitor.visit_inst_def(self.at(inst).def());
        }
        if let Some(merge) = merge {
            visitor.visit_merge(merge);
        }
        visitor.visit_control_inst(terminator);
    }
}

impl InnerVisit for InstDef {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        let Self {
            kind,
            output_type,
            inputs,
        } = self;

        match kind {
            InstKind::Phi { incoming_blocks } => {
                for &block in incoming_blocks {
                    visitor.visit_block_use(block);
                }
            }
            InstKind::Variable | InstKind::Load | InstKind::Store | InstKind::Op(_) => {}
        }
        if let Some(ty) = *output_type {
            visitor.visit_type_use(ty);
        }
        for v in inputs {
            visitor.visit_value_use(v);
        }
    }
}

impl InnerVisit for Merge {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        match *self {
            Self::Selection { merge } => visitor.visit_block_use(merge),
            Self::Loop {
                merge,
                continue_target,
            } => {
                visitor.visit_block_use(merge);
                visitor.visit_block_use(continue_target);
            }
        }
    }
}

impl InnerVisit for ControlInst {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        let Self {
            kind: _,
            inputs,
            targets,
        } = self;

        for v in inputs {
            visitor.visit_value_use(v);
        }
        for &target in targets {
            visitor.visit_block_use(target);
        }
    }
}

impl InnerVisit for Value {
    fn inner_visit_with<'a>(&'a self, visitor: &mut impl Visitor<'a>) {
        match *self {
            Self::Const(ct) => visitor.visit_const_use(ct),
            Self::FuncParam { idx } => visitor.visit_func_param_use(idx),
            Self::InstOutput(inst) => visitor.visit_inst_output_use(inst),
        }
    }
}
