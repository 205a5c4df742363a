//! Lazily computed (and explicitly invalidated) per-function analyses.

use crate::cfg::ControlFlowGraph;
use crate::def_use::DefUseIndex;
use crate::dominators::DominatorTree;
use crate::FuncDefBody;

/// Cache of the analyses of a single function body.
///
/// Nothing here observes edits to the function body itself: CFG edits have to
/// go through `cfg_mut` (which also drops the dominator tree), and def-use
/// changes through the incremental `DefUseIndex::analyze_*` methods.
#[derive(Default)]
pub struct Analyses {
    cfg: Option<ControlFlowGraph>,
    dominators: Option<DominatorTree>,
    def_use: Option<DefUseIndex>,
}

impl Analyses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cfg(&mut self, func_def_body: &FuncDefBody) -> &ControlFlowGraph {
        self.cfg
            .get_or_insert_with(|| ControlFlowGraph::compute(func_def_body))
    }

    /// The CFG, for incremental updates, which invalidate the dominator tree.
    pub fn cfg_mut(&mut self, func_def_body: &FuncDefBody) -> &mut ControlFlowGraph {
        self.invalidate_dominators();
        self.cfg
            .get_or_insert_with(|| ControlFlowGraph::compute(func_def_body))
    }

    /// The dominator tree, computed from the (cached) CFG if needed.
    pub fn dominators(&mut self, func_def_body: &FuncDefBody) -> &DominatorTree {
        let cfg = self
            .cfg
            .get_or_insert_with(|| ControlFlowGraph::compute(func_def_body));
        self.dominators
            .get_or_insert_with(|| DominatorTree::compute(cfg, func_def_body.entry()))
    }

    pub fn def_use(&mut self, func_def_body: &FuncDefBody) -> &mut DefUseIndex {
        self.def_use
            .get_or_insert_with(|| DefUseIndex::compute(func_def_body))
    }

    pub fn invalidate_dominators(&mut self) {
        self.dominators = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FuncBuilder;
    use crate::{Context, ControlInst};

    #[test]
    fn cfg_edits_drop_dominators() {
        let cx = Context::new();
        let mut b = FuncBuilder::new(&cx);
        let [entry, a, c] = [(); 3].map(|()| b.new_block());
        b.terminate(entry, ControlInst::branch(a));
        b.terminate(a, ControlInst::branch(c));
        b.terminate(c, ControlInst::ret(None));
        let mut body = b.finish();

        let mut analyses = Analyses::new();
        assert_eq!(analyses.dominators(&body).immediate_dominator(c), Some(a));

        body.blocks[entry].terminator = ControlInst::branch(c);
        analyses.cfg_mut(&body).set_successor_edges(entry, [c]);
        assert_eq!(analyses.dominators(&body).immediate_dominator(c), Some(entry));
        assert!(!analyses.dominators(&body).is_reachable(a));
    }
}
