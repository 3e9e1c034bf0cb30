use itertools::Itertools;
use tracing::{
    debug,
    trace,
};

use crate::codegen::{
    machine::{
        InstrRef,
        TargetMachine,
    },
    register_allocator::{
        LrgId,
        RegAlloc,
    },
};

impl<TM: TargetMachine> RegAlloc<'_, TM> {
    /// Joins the two live ranges of every split that can be removed without hurting colorability.
    ///
    /// Runs between building the interference graph and coloring it. A split is removed if its
    /// live ranges do not interfere and the union keeps fewer neighbours than allowed registers.
    /// Splits inside a single live range are always removed.
    ///
    /// Returns the number of removed splits.
    pub(super) fn coalesce(&mut self) -> usize {
        let mut removed = 0;
        let mut joined = false;
        let blocks = self.func.basic_blocks.indices().collect_vec();
        for bb in blocks {
            let instrs = self.func.basic_blocks[bb].instructions.clone();
            for split in instrs {
                if !self.func.instr(split).is_split() {
                    continue;
                }
                let input = self.func.inputs(split)[0];
                let (Some(def_lrg), Some(input_lrg)) = (self.lrg(split), self.lrg(input)) else {
                    continue;
                };
                if def_lrg == input_lrg {
                    self.lrgs[def_lrg].forget(split);
                } else {
                    let Some(neighbors) = self.joined_neighbors(def_lrg, input_lrg) else {
                        continue;
                    };
                    self.lrgs[def_lrg].forget(split);
                    self.lrgs[input_lrg].forget(split);
                    self.join(def_lrg, input_lrg, neighbors);
                    joined = true;
                }
                self.remove_split(split, input);
                removed += 1;
            }
        }
        if joined {
            self.unify();
        }
        if removed > 0 {
            debug!("Coalesced {removed} splits");
        }
        removed
    }

    /// Neighbours of the union of `a` and `b`, if the union stays trivially colorable.
    fn joined_neighbors(&self, a: LrgId, b: LrgId) -> Option<Vec<LrgId>> {
        if self.lrgs[a].neighbors().contains(&b) {
            return None;
        }
        let mask = self.lrgs[a].mask.intersect(self.lrgs[b].mask);
        let neighbors = self.lrgs[a]
            .neighbors()
            .iter()
            .chain(self.lrgs[b].neighbors())
            .copied()
            .unique()
            .collect_vec();
        (neighbors.len() < mask.cardinality() as usize).then_some(neighbors)
    }

    fn join(&mut self, a: LrgId, b: LrgId, neighbors: Vec<LrgId>) {
        let leader = self.lrgs.union(a, b);
        let loser = if leader == a { b } else { a };
        trace!("Joining {loser} into {leader}");
        for neighbor in &neighbors {
            self.lrgs[*neighbor].replace_neighbor(loser, leader);
        }
        self.lrgs[leader].set_neighbors(neighbors);
        self.lrgs[loser].set_neighbors(Vec::new());
    }

    fn remove_split(&mut self, split: InstrRef, input: InstrRef) {
        trace!("Coalescing {split} into {input}");
        self.func.replace_all_uses(split, input);
        self.func.remove(split);
        self.lrg_map.remove(split);
    }
}
