use daggy::petgraph::{
    algo::dominators::simple_fast,
    prelude::{
        DfsPostOrder,
        StableGraph,
    },
    stable_graph::NodeIndex,
    Directed,
};
use index_vec::IndexVec;
use rustc_hash::{
    FxHashMap,
    FxHashSet,
};
use smallvec::SmallVec;

use crate::codegen::machine::InstrRef;

index_vec::define_index_type! {
    pub struct BasicBlockId = u32;

    DISPLAY_FORMAT = "bb{}";
}

#[derive(Debug, Clone)]
pub struct Cfg {
    entry_block: BasicBlockId,
    graph: StableGraph<(), (), Directed>,
    node_to_block_map: FxHashMap<NodeIndex, BasicBlockId>,
    block_to_node_map: FxHashMap<BasicBlockId, NodeIndex>,
    reverse_postorder: Vec<BasicBlockId>,
    idoms: FxHashMap<BasicBlockId, BasicBlockId>,
    dom_depths: FxHashMap<BasicBlockId, u32>,
    loop_depths: FxHashMap<BasicBlockId, u32>,
}

impl Cfg {
    pub fn build(bbs: &IndexVec<BasicBlockId, BasicBlock>) -> Self {
        let mut cfg = Self::new(BasicBlockId::new(0));
        for bb_id in bbs.indices() {
            let node = cfg.graph.add_node(());
            cfg.node_to_block_map.insert(node, bb_id);
            cfg.block_to_node_map.insert(bb_id, node);
        }
        for (bb_id, bb) in bbs.iter_enumerated() {
            for successor_id in &bb.succs {
                cfg.graph.add_edge(
                    cfg.block_to_node_map[&bb_id],
                    cfg.block_to_node_map[successor_id],
                    (),
                );
            }
        }
        cfg.compute_reverse_postorder();
        cfg.compute_dominators();
        cfg.compute_loop_depths(bbs);
        cfg
    }

    pub fn new(entry_block: BasicBlockId) -> Self {
        Self {
            entry_block,
            graph: StableGraph::new(),
            node_to_block_map: FxHashMap::default(),
            block_to_node_map: FxHashMap::default(),
            reverse_postorder: Vec::new(),
            idoms: FxHashMap::default(),
            dom_depths: FxHashMap::default(),
            loop_depths: FxHashMap::default(),
        }
    }

    pub const fn entry_block(&self) -> BasicBlockId {
        self.entry_block
    }

    /// Reachable blocks, every block after its immediate dominator.
    pub fn reverse_postorder(&self) -> &[BasicBlockId] {
        &self.reverse_postorder
    }

    pub fn idom(&self, bb: BasicBlockId) -> Option<BasicBlockId> {
        self.idoms.get(&bb).copied()
    }

    pub fn dom_depth(&self, bb: BasicBlockId) -> u32 {
        self.dom_depths.get(&bb).copied().unwrap_or_default()
    }

    pub fn loop_depth(&self, bb: BasicBlockId) -> u32 {
        self.loop_depths.get(&bb).copied().unwrap_or_default()
    }

    pub fn dominates(&self, dominator: BasicBlockId, bb: BasicBlockId) -> bool {
        let mut current = Some(bb);
        while let Some(block) = current {
            if block == dominator {
                return true;
            }
            current = self.idom(block);
        }
        false
    }

    fn entry_node(&self) -> NodeIndex {
        self.block_to_node_map[&self.entry_block]
    }

    fn compute_reverse_postorder(&mut self) {
        let mut dfs = DfsPostOrder::new(&self.graph, self.entry_node());
        let mut postorder = Vec::with_capacity(self.node_to_block_map.len());
        while let Some(node) = dfs.next(&self.graph) {
            postorder.push(self.node_to_block_map[&node]);
        }
        postorder.reverse();
        self.reverse_postorder = postorder;
    }

    fn compute_dominators(&mut self) {
        let dominators = simple_fast(&self.graph, self.entry_node());
        for &bb in &self.reverse_postorder {
            let idom = dominators
                .immediate_dominator(self.block_to_node_map[&bb])
                .map(|node| self.node_to_block_map[&node]);
            let depth = idom.map_or(0, |idom| self.dom_depths[&idom] + 1);
            if let Some(idom) = idom {
                self.idoms.insert(bb, idom);
            }
            self.dom_depths.insert(bb, depth);
        }
    }

    /// Every natural loop a block belongs to adds one to its depth.
    fn compute_loop_depths(&mut self, bbs: &IndexVec<BasicBlockId, BasicBlock>) {
        let mut bodies: FxHashMap<BasicBlockId, FxHashSet<BasicBlockId>> = FxHashMap::default();
        for &header in &self.reverse_postorder {
            for &latch in &bbs[header].preds {
                if !self.dominates(header, latch) {
                    continue;
                }
                let body = bodies.entry(header).or_insert_with(|| {
                    let mut body = FxHashSet::default();
                    body.insert(header);
                    body
                });
                let mut stack = vec![latch];
                while let Some(bb) = stack.pop() {
                    if body.insert(bb) {
                        stack.extend(bbs[bb].preds.iter().copied());
                    }
                }
            }
        }
        for body in bodies.values() {
            for &bb in body {
                *self.loop_depths.entry(bb).or_default() += 1;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BasicBlockId,
    pub instructions: Vec<InstrRef>,
    /// Phi input `i` flows in from `preds[i]`.
    pub(crate) preds: SmallVec<[BasicBlockId; 2]>,
    pub(crate) succs: SmallVec<[BasicBlockId; 2]>,
}

impl BasicBlock {
    pub fn new(id: BasicBlockId) -> Self {
        Self {
            id,
            instructions: Vec::new(),
            preds: SmallVec::new(),
            succs: SmallVec::new(),
        }
    }

    pub fn preds(&self) -> &[BasicBlockId] {
        &self.preds
    }

    pub fn succs(&self) -> &[BasicBlockId] {
        &self.succs
    }
}
