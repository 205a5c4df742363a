//! Traversal helpers for intra-function entities.
//!
//! `FuncAt<P>`/`FuncAtMut<P>` are like `(&FuncDefBody, P)`/`(&mut FuncDefBody, P`)
//! (where `P` is some type describing a "position" in the function), except:
//! * they only borrow the `EntityDefs` fields of `FuncDefBody`
//!   * this can prevent borrow conflicts, especially when mutating other fields
//!     (such as the block `layout`)
//!   * it also avoids accidentally accessing parts of the function definition
//!     without going through `P` (as `EntityDefs` requires keys for any access)
//! * they're dedicated types with inherent methods and trait `impl`s

use crate::{Block, BlockDef, EntityDefs, FuncDefBody, Inst, InstDef, InstKind};
use smallvec::SmallVec;

/// Immutable traversal (i.e. visiting) helper for intra-function entities.
///
/// The point/position type `P` should be an entity or a shallow entity wrapper.
#[derive(Copy, Clone)]
pub struct FuncAt<'a, P: Copy> {
    pub insts: &'a EntityDefs<Inst>,
    pub blocks: &'a EntityDefs<Block>,

    pub position: P,
}

impl<'a, P: Copy> FuncAt<'a, P> {
    /// Reposition to `new_position`.
    pub fn at<P2: Copy>(self, new_position: P2) -> FuncAt<'a, P2> {
        FuncAt {
            insts: self.insts,
            blocks: self.blocks,
            position: new_position,
        }
    }
}

impl<'a> FuncAt<'a, Inst> {
    pub fn def(self) -> &'a InstDef {
        &self.insts[self.position]
    }
}

impl<'a> FuncAt<'a, Block> {
    pub fn def(self) -> &'a BlockDef {
        &self.blocks[self.position]
    }

    /// Iterate over all instructions in the block (not including the terminator).
    pub fn insts(self) -> impl Iterator<Item = FuncAt<'a, Inst>> + 'a {
        self.def().insts.iter().map(move |&inst| self.at(inst))
    }

    pub fn phis(self) -> impl Iterator<Item = FuncAt<'a, Inst>> + 'a {
        self.insts()
            .take_while(|func_at_inst| matches!(func_at_inst.def().kind, InstKind::Phi { .. }))
    }

    /// Distinct successors, in terminator target order.
    pub fn successors(self) -> SmallVec<[Block; 2]> {
        let mut successors = SmallVec::new();
        for &target in &self.def().terminator.targets {
            if !successors.contains(&target) {
                successors.push(target);
            }
        }
        successors
    }

    /// The only successor of this block, if it has exactly one.
    pub fn unique_successor(self) -> Option<Block> {
        match self.successors()[..] {
            [successor] => Some(successor),
            _ => None,
        }
    }
}

/// Mutable traversal (i.e. transforming) helper for intra-function entities.
///
/// The point/position type `P` should be an entity or a shallow entity wrapper.
pub struct FuncAtMut<'a, P: Copy> {
    pub insts: &'a mut EntityDefs<Inst>,
    pub blocks: &'a mut EntityDefs<Block>,

    pub position: P,
}

impl<'a, P: Copy> FuncAtMut<'a, P> {
    /// Reposition to `new_position`.
    pub fn at<P2: Copy>(self, new_position: P2) -> FuncAtMut<'a, P2> {
        FuncAtMut {
            insts: self.insts,
            blocks: self.blocks,
            position: new_position,
        }
    }
}

impl<'a> FuncAtMut<'a, Inst> {
    pub fn def(self) -> &'a mut InstDef {
        &mut self.insts[self.position]
    }
}

impl<'a> FuncAtMut<'a, Block> {
    pub fn def(self) -> &'a mut BlockDef {
        &mut self.blocks[self.position]
    }

    /// Replace `old_pred` with `new_pred` in every `Phi` of this block,
    /// returning the `Phi`s that were changed.
    pub fn replace_phi_incoming_block(self, old_pred: Block, new_pred: Block) -> SmallVec<[Inst; 4]> {
        let FuncAtMut {
            insts,
            blocks,
            position: block,
        } = self;

        let mut changed = SmallVec::new();
        for inst in blocks[block].phis(insts).collect::<SmallVec<[_; 4]>>() {
            if let InstKind::Phi { incoming_blocks } = &mut insts[inst].kind {
                let mut any = false;
                for incoming in incoming_blocks.iter_mut().filter(|b| **b == old_pred) {
                    *incoming = new_pred;
                    any = true;
                }
                if any {
                    changed.push(inst);
                }
            }
        }
        changed
    }
}

impl FuncDefBody {
    /// Start immutably traversing the function at `position`.
    pub fn at<P: Copy>(&self, position: P) -> FuncAt<'_, P> {
        FuncAt {
            insts: &self.insts,
            blocks: &self.blocks,
            position,
        }
    }

    /// Start mutably traversing the function at `position`.
    pub fn at_mut<P: Copy>(&mut self, position: P) -> FuncAtMut<'_, P> {
        FuncAtMut {
            insts: &mut self.insts,
            blocks: &mut self.blocks,
            position,
        }
    }
}
