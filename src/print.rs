//! Deterministic plain-text rendering of functions (for tests, logs and debugging).
//!
//! The format is line-based, with one block per paragraph:
//!
//! ```text
//! func0(i32) -> i32 {
//!   block0:
//!     v0 = s_greater_than param0, 0 : bool
//!     selection_merge block2
//!     branch_conditional v0, block1, block2
//!   ...
//! }
//! ```

use crate::{
    Const, ConstKind, Context, ControlInst, ControlInstKind, DeclDef, Func, FuncDecl, FuncDefBody,
    Import, InstDef, InstKind, Merge, Module, StorageClass, Type, TypeDef, Value,
};
use itertools::Itertools as _;
use std::fmt::{self, Write as _};

/// `fmt::Display` adapter for anything printable (given a `Context`).
pub struct Printed<'a, T: ?Sized> {
    cx: &'a Context,
    value: &'a T,
}

pub trait Print {
    fn print(&self, cx: &Context, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<'a, T: Print + ?Sized> fmt::Display for Printed<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.print(self.cx, f)
    }
}

pub fn printed<'a, T: Print + ?Sized>(cx: &'a Context, value: &'a T) -> Printed<'a, T> {
    Printed { cx, value }
}

/// Render every function in `module`, in definition order.
pub fn print_module(module: &Module) -> String {
    let cx = module.cx_ref();
    let mut out = String::new();
    for (func, func_decl) in module.funcs.iter() {
        // Writing to a `String` can't fail.
        let _ = writeln!(out, "{}", printed(cx, &(func, func_decl)));
    }
    out
}

/// Render a single function body (without any signature).
pub fn print_func_body(cx: &Context, func_def_body: &FuncDefBody) -> String {
    printed(cx, func_def_body).to_string()
}

impl Print for Type {
    fn print(&self, cx: &Context, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match cx[*self] {
            TypeDef::Void => f.write_str("void"),
            TypeDef::Bool => f.write_str("bool"),
            TypeDef::Int { width, signed } => {
                write!(f, "{}{width}", if signed { "i" } else { "u" })
            }
            TypeDef::Ptr {
                storage_class,
                pointee,
            } => {
                let storage_class = match storage_class {
                    StorageClass::Function => "function",
                    StorageClass::Private => "private",
                };
                write!(f, "ptr<{storage_class}, {}>", printed(cx, &pointee))
            }
        }
    }
}

impl Print for Const {
    fn print(&self, cx: &Context, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ct_def = &cx[*self];
        match ct_def.kind {
            ConstKind::Bool(b) => write!(f, "{b}"),
            ConstKind::Int(x) => write!(f, "{x}"),
            ConstKind::Undef => write!(f, "undef<{}>", printed(cx, &ct_def.ty)),
        }
    }
}

impl Print for Value {
    fn print(&self, cx: &Context, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const(ct) => ct.print(cx, f),
            Self::FuncParam { idx } => write!(f, "param{idx}"),
            Self::InstOutput(inst) => write!(f, "{inst:?}"),
        }
    }
}

impl Print for (Func, &FuncDecl) {
    fn print(&self, cx: &Context, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (func, func_decl) = *self;
        write!(
            f,
            "{func:?}({}) -> {}",
            func_decl
                .params
                .iter()
                .map(|param| printed(cx, &param.ty))
                .format(", "),
            printed(cx, &func_decl.ret_type),
        )?;
        match &func_decl.def {
            DeclDef::Imported(Import::LinkName(name)) => {
                write!(f, " = import {:?}", &cx[*name])
            }
            DeclDef::Present(func_def_body) => {
                write!(f, " ")?;
                func_def_body.print(cx, f)
            }
        }
    }
}

impl Print for FuncDefBody {
    fn print(&self, cx: &Context, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{{")?;
        for &block in &self.layout {
            let block_def = &self.blocks[block];
            writeln!(f, "  {block:?}:")?;
            for &inst in &block_def.insts {
                write!(f, "    ")?;
                if self.insts[inst].output_type.is_some() {
                    write!(f, "{inst:?} = ")?;
                }
                self.insts[inst].print(cx, f)?;
                writeln!(f)?;
            }
            if let Some(merge) = &block_def.merge {
                write!(f, "    ")?;
                merge.print(cx, f)?;
                writeln!(f)?;
            }
            write!(f, "    ")?;
            block_def.terminator.print(cx, f)?;
            writeln!(f)?;
        }
        write!(f, "}}")
    }
}

impl Print for InstDef {
    fn print(&self, cx: &Context, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs = self.inputs.iter().map(|v| printed(cx, v));
        match &self.kind {
            InstKind::Phi { .. } => write!(
                f,
                "phi {}",
                self.phi_incoming()
                    .format_with(", ", |(v, block), f| f(&format_args!(
                        "[{}, {block:?}]",
                        printed(cx, &v)
                    )))
            )?,
            InstKind::Variable => write!(f, "variable({})", inputs.format(", "))?,
            InstKind::Load => write!(f, "load {}", inputs.format(", "))?,
            InstKind::Store => write!(f, "store {}", inputs.format(", "))?,
            InstKind::Op(op) => write!(f, "{} {}", op.name(), inputs.format(", "))?,
        }
        if let Some(ty) = &self.output_type {
            write!(f, " : {}", printed(cx, ty))?;
        }
        Ok(())
    }
}

impl Print for Merge {
    fn print(&self, _cx: &Context, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Selection { merge } => write!(f, "selection_merge {merge:?}"),
            Self::Loop {
                merge,
                continue_target,
            } => write!(f, "loop_merge {merge:?}, continue {continue_target:?}"),
        }
    }
}

impl Print for ControlInst {
    fn print(&self, cx: &Context, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs = self.inputs.iter().map(|v| printed(cx, v));
        let targets = self.targets.iter().map(|target| format!("{target:?}"));
        match &self.kind {
            ControlInstKind::Unreachable => f.write_str("unreachable"),
            ControlInstKind::Return => f.write_str("return"),
            ControlInstKind::ReturnValue => write!(f, "return_value {}", inputs.format(", ")),
            ControlInstKind::Branch => write!(f, "branch {}", targets.format(", ")),
            ControlInstKind::BranchConditional => write!(
                f,
                "branch_conditional {}",
                inputs.map(|v| v.to_string()).chain(targets).format(", ")
            ),
            ControlInstKind::Switch { case_literals } => {
                write!(f, "switch {}", inputs.format(", "))?;
                let mut targets = self.targets.iter();
                if let Some(default) = targets.next() {
                    write!(f, ", default {default:?}")?;
                }
                for (literal, target) in case_literals.iter().zip(targets) {
                    write!(f, ", {literal} => {target:?}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FuncBuilder;
    use crate::{ControlInst, Op};

    #[test]
    fn prints_blocks_in_layout_order() {
        let cx = Context::new();
        let i32_ty = cx.type_int(32, true);
        let bool_ty = cx.type_bool();
        let mut b = FuncBuilder::new(&cx);
        let [entry, then, merge] = [(); 3].map(|()| b.new_block());
        let x = Value::FuncParam { idx: 0 };
        let cond = b.op(entry, Op::SGreaterThan, bool_ty, [x, Value::Const(cx.const_int(i32_ty, 0))]);
        b.selection_merge(entry, merge);
        b.terminate(entry, ControlInst::branch_conditional(cond, then, merge));
        b.terminate(then, ControlInst::branch(merge));
        let phi = b.phi(
            merge,
            i32_ty,
            [(x, entry), (Value::Const(cx.const_undef(i32_ty)), then)],
        );
        b.terminate(merge, ControlInst::ret(Some(phi)));
        let body = b.finish();

        let expected = "\
{
  block0:
    v0 = s_greater_than param0, 0 : bool
    selection_merge block2
    branch_conditional v0, block1, block2
  block1:
    branch block2
  block2:
    v1 = phi [param0, block0], [undef<i32>, block1] : i32
    return_value v1
}";
        assert_eq!(print_func_body(&cx, &body), expected);
    }
}
