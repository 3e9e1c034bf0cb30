use bitvec::vec::BitVec;
use cranelift_entity::EntityRef;
use index_vec::IndexVec;
use itertools::Itertools;
use smallvec::SmallVec;
use tracing::{
    debug,
    trace,
};

use crate::{
    codegen::{
        machine::{
            function::BasicBlockId,
            reg::{
                RegNum,
                RegisterMask,
                RegisterMaskRw,
            },
            InstrRef,
            TargetMachine,
        },
        register_allocator::{
            FailureKind,
            LrgId,
            RegAlloc,
        },
    },
    FxIndexMap,
    FxIndexSet,
};

const MAX_RISK_SCORE: u32 = 1_000_000;
const NEUTRAL_RISK_SCORE: u32 = 1_000;

/// Scratch state of the interference graph builder, reused across rounds.
#[derive(Debug, Default)]
pub(super) struct Scratch {
    /// Live range to the def that is live at the end of each block.
    live_outs: IndexVec<BasicBlockId, FxIndexMap<LrgId, InstrRef>>,
    live: FxIndexMap<LrgId, InstrRef>,
    /// Triangular bit matrix, row `i` holds the neighbours with an id greater than `i`.
    matrix: Vec<BitVec>,
    work: FxIndexSet<BasicBlockId>,
}

impl Scratch {
    fn reset(&mut self, blocks: usize, lrgs: usize) {
        self.live_outs = (0..blocks).map(|_| FxIndexMap::default()).collect();
        self.live.clear();
        self.matrix.clear();
        self.matrix.resize(lrgs, BitVec::new());
        self.work.clear();
    }

    fn add_edge(&mut self, a: LrgId, b: LrgId) {
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let row = &mut self.matrix[low.index()];
        if row.len() <= high.index() {
            row.resize(high.index() + 1, false);
        }
        row.set(high.index(), true);
    }
}

/// Outcome of looking at the color of one split along a bias chain.
enum Bias {
    Take(RegNum),
    /// Colored with a register that is not available, stop following this side.
    Cutoff,
    Advance,
}

impl<TM: TargetMachine> RegAlloc<'_, TM> {
    /// Computes liveness and the interference graph in one backwards pass over the blocks.
    ///
    /// Blocks are revisited until no live-out set grows anymore. Single register constraints are
    /// applied to the masks of the live ranges directly instead of adding edges.
    pub(super) fn build_interference_graph(&mut self) -> bool {
        self.ifg
            .reset(self.func.basic_blocks.len(), self.lrgs.len());
        for bb in self.func.cfg().reverse_postorder() {
            self.ifg.work.insert(*bb);
        }
        while let Some(bb) = self.ifg.work.pop() {
            self.interfere_block(bb);
        }
        if self.success() {
            self.convert_to_adjacency();
        }
        self.success()
    }

    fn interfere_block(&mut self, bb: BasicBlockId) {
        trace!("Building interference for {bb}");
        self.ifg.live = self.ifg.live_outs[bb].clone();
        let instrs = self.func.basic_blocks[bb].instructions.clone();
        for instr in instrs.into_iter().rev() {
            self.interfere_instr(instr);
        }
        let preds = self.func.basic_blocks[bb].preds.clone();
        for (idx, pred) in preds.into_iter().enumerate() {
            self.merge_live_out(bb, idx, pred);
        }
    }

    fn interfere_instr(&mut self, instr: InstrRef) {
        let lrg = self.lrg(instr);
        if let Some(lrg) = lrg {
            self.self_conflict(instr, lrg);
            // Phis stay live up to the block head, where they turn into their inputs.
            if self.func.instr(instr).is_phi() {
                return;
            }
            self.ifg.live.swap_remove(&lrg);
        }

        if let Some(kill) = self.func.instr(instr).kill_mask() {
            self.kill(instr, kill);
        }

        if let Some(lrg) = lrg {
            self.interfere_def(instr, lrg);
        }

        let inputs: SmallVec<[InstrRef; 3]> = self.func.inputs(instr).into();
        for (idx, input) in inputs.into_iter().enumerate() {
            let Some(input_lrg) = self.lrg(input) else {
                continue;
            };
            self.self_conflict(input, input_lrg);
            let single = self
                .func
                .instr(instr)
                .input_mask(idx)
                .filter(|mask| mask.is_singleton());
            if let Some(mask) = single {
                self.deny_single_use(input, mask);
            }
            self.ifg.live.insert(input_lrg, input);
        }
    }

    /// A def interferes with everything live after it. A single register def keeps its register
    /// and takes it away from the others.
    fn interfere_def(&mut self, def: InstrRef, lrg: LrgId) {
        let single = self
            .func
            .output_mask(def)
            .is_some_and(RegisterMask::is_singleton);
        let live = self.ifg.live.keys().copied().collect_vec();
        for other in live {
            if other == lrg || !self.lrgs[lrg].mask.overlaps(self.lrgs[other].mask) {
                continue;
            }
            if single {
                let Some(reg) = self.lrgs[lrg].mask.first_register() else {
                    continue;
                };
                let before = self.lrgs[other].mask;
                if !self.lrgs[other].clear(reg) {
                    self.fail_empty(other, before);
                }
            } else {
                self.ifg.add_edge(lrg, other);
            }
        }
    }

    /// A use that must be in exactly one register takes it away from every other live value whose
    /// def could have been placed there.
    fn deny_single_use(&mut self, input: InstrRef, mask: RegisterMask) {
        let Some(reg) = mask.first_register() else {
            return;
        };
        let live = self
            .ifg
            .live
            .iter()
            .map(|(lrg, def)| (*lrg, *def))
            .collect_vec();
        for (other, def) in live {
            if def == input {
                continue;
            }
            if !self
                .func
                .output_mask(def)
                .is_some_and(|out| out.overlaps(mask))
            {
                continue;
            }
            let before = self.lrgs[other].mask;
            if !self.lrgs[other].clear(reg) {
                self.fail_empty(other, before);
            }
        }
    }

    fn kill(&mut self, killer: InstrRef, kill: RegisterMask) {
        let live = self.ifg.live.keys().copied().collect_vec();
        for other in live {
            if !self.lrgs[other].mask.overlaps(kill) {
                continue;
            }
            // Clonables with a remote use fail themselves and get recloned next to the use.
            if self.func.instr(killer).is_clone() && self.has_remote_use(killer) {
                if let Some(lrg) = self.lrg(killer) {
                    self.fail(lrg, FailureKind::HardConflict);
                }
            } else {
                let before = self.lrgs[other].mask;
                if !self.lrgs[other].subtract(kill) {
                    self.fail_empty(other, before);
                }
            }
        }
    }

    fn has_remote_use(&self, def: InstrRef) -> bool {
        match self.func.users(def) {
            [] => false,
            [user] => {
                let idx = self
                    .func
                    .inputs(*user)
                    .iter()
                    .position(|input| *input == def)
                    .unwrap_or_default();
                self.func.use_block(*user, idx) != self.func.block_of(def)
            }
            _ => true,
        }
    }

    fn self_conflict(&mut self, def: InstrRef, lrg: LrgId) {
        let prior = self.ifg.live.get(&lrg).copied();
        self.mark_self_conflict(lrg, prior, def);
    }

    /// Two different defs of the same live range are live at once.
    fn mark_self_conflict(&mut self, lrg: LrgId, prior: Option<InstrRef>, def: InstrRef) {
        let Some(prior) = prior.filter(|prior| *prior != def) else {
            return;
        };
        trace!("{lrg} conflicts with itself at {prior} and {def}");
        self.lrgs[lrg].mark_self_conflict(prior);
        self.lrgs[lrg].mark_self_conflict(def);
        self.fail(lrg, FailureKind::SelfConflict);
    }

    /// Pushes the live set at the head of `bb` into the live-out set of its `idx`-th predecessor.
    fn merge_live_out(&mut self, bb: BasicBlockId, idx: usize, pred: BasicBlockId) {
        let live = self
            .ifg
            .live
            .iter()
            .map(|(lrg, def)| (*lrg, *def))
            .collect_vec();
        for (lrg, mut def) in live {
            if self.func.instr(def).is_phi() && self.func.block_of(def) == bb {
                def = self.func.inputs(def)[idx];
            }
            match self.ifg.live_outs[pred].get(&lrg).copied() {
                None => {
                    self.ifg.live_outs[pred].insert(lrg, def);
                    self.ifg.work.insert(pred);
                }
                prior => self.mark_self_conflict(lrg, prior, def),
            }
        }
    }

    fn convert_to_adjacency(&mut self) {
        for (low, row) in self.ifg.matrix.iter().enumerate() {
            let low = LrgId::new(low);
            for high in row.iter_ones() {
                let high = LrgId::new(high);
                self.lrgs[low].add_neighbor(high);
                self.lrgs[high].add_neighbor(low);
            }
        }
    }

    /// Colors the interference graph.
    ///
    /// The color stack is split into three parts: `[0, sptr)` is removed from the graph,
    /// `[sptr, swork)` is trivially colorable but still in the graph and the rest is unknown.
    pub(super) fn color(&mut self) -> bool {
        let mut stack = self.lrgs.leaders().collect_vec();
        let mut swork = 0;
        for idx in 0..stack.len() {
            if self.lrgs[stack[idx]].is_low_degree() {
                stack.swap(swork, idx);
                swork += 1;
            }
        }

        let mut sptr = 0;
        while sptr < stack.len() {
            self.pick_color(&mut stack, sptr, swork);
            let lrg = stack[sptr];
            sptr += 1;
            swork = swork.max(sptr);
            let neighbors = self.lrgs[lrg].neighbors().to_vec();
            for neighbor in neighbors {
                if !self.lrgs[neighbor].remove_neighbor(lrg) {
                    continue;
                }
                if let Some(pos) = stack[swork..].iter().position(|other| *other == neighbor) {
                    stack.swap(swork, swork + pos);
                    swork += 1;
                }
            }
        }

        while sptr > 0 {
            sptr -= 1;
            let lrg = stack[sptr];
            let neighbors = self.lrgs[lrg].neighbors().to_vec();
            for neighbor in neighbors {
                self.lrgs[neighbor].reinsert_neighbor(lrg);
            }
            let mut rmask = self.lrgs[lrg].mask.to_rw();
            for neighbor in &self.lrgs[lrg].adj {
                if let Some(reg) = self.lrgs[*neighbor].reg {
                    rmask.clear(reg);
                }
            }
            let Some(first) = rmask.first_register() else {
                self.lrgs[lrg].reg = None;
                self.fail(lrg, FailureKind::UncolorableAtRisk);
                continue;
            };
            let reg = if rmask.cardinality() > 1 {
                self.bias_color(lrg, rmask).unwrap_or(first)
            } else {
                first
            };
            trace!("Colored {lrg} with {reg}");
            self.lrgs[lrg].reg = Some(reg);
        }
        self.success()
    }

    /// Moves the next live range to remove to `sptr`.
    fn pick_color(&self, stack: &mut [LrgId], sptr: usize, swork: usize) {
        if sptr == swork {
            let risky = self.pick_risky(stack, sptr);
            debug!("Picked {} as at-risk", stack[risky]);
            stack.swap(sptr, risky);
        }
        let mut best = sptr;
        for idx in sptr + 1..swork {
            if self.better_lrg(stack[best], stack[idx]) {
                best = idx;
            }
        }
        stack.swap(sptr, best);
    }

    /// Whether `candidate` should be removed from the graph before `best`.
    ///
    /// Removed first means colored last, so single register live ranges go last and split related
    /// ones with many choices go first.
    fn better_lrg(&self, best: LrgId, candidate: LrgId) -> bool {
        let (best, candidate) = (&self.lrgs[best], &self.lrgs[candidate]);
        if best.is_single() != candidate.is_single() {
            return best.is_single();
        }
        if best.has_split() != candidate.has_split() {
            return candidate.has_split();
        }
        best.size() < candidate.size()
    }

    fn pick_risky(&self, stack: &[LrgId], sptr: usize) -> usize {
        let mut best = sptr;
        let mut best_score = self.risky_score(stack[best]);
        for (idx, lrg) in stack.iter().enumerate().skip(sptr + 1) {
            if best_score == MAX_RISK_SCORE {
                break;
            }
            let score = self.risky_score(*lrg);
            if score > best_score {
                best = idx;
                best_score = score;
            }
        }
        best
    }

    /// How good a victim `lrg` is if it fails to color.
    fn risky_score(&self, lrg: LrgId) -> u32 {
        let lrg = &self.lrgs[lrg];
        if let Some(def) = lrg.mach_def {
            let instr = self.func.instr(def);
            if !lrg.multi_def && instr.is_clone() {
                let far = lrg.mach_use.map_or(true, |user| {
                    self.func.block_of(user) != self.func.block_of(def)
                        || self.func.position(user) > self.func.position(def) + 1
                });
                if far {
                    return MAX_RISK_SCORE;
                }
            }
            if instr.is_callee_save() {
                let reg = lrg.mask.first_register().unwrap_or_default();
                return MAX_RISK_SCORE - 2 - u32::from(reg);
            }
        }
        let saved_to_return = lrg
            .split_def
            .and_then(|link| self.func.inputs(link.split).first().copied())
            .is_some_and(|input| self.func.instr(input).is_callee_save())
            && lrg
                .split_use
                .and_then(|link| self.func.users(link.split).first().copied())
                .is_some_and(|user| self.func.instr(user).is_ret());
        if saved_to_return {
            return MAX_RISK_SCORE - 1;
        }
        NEUTRAL_RISK_SCORE
    }

    /// Follows the split chains of `lrg` in both directions looking for a register already given to
    /// a related live range.
    fn bias_color(&mut self, lrg: LrgId, mut rmask: RegisterMaskRw) -> Option<RegNum> {
        let mut def = self.lrgs[lrg].split_def.map(|link| link.split);
        let mut user = self.lrgs[lrg].split_use.map(|link| link.split);
        let mut hops = 0;
        while def.is_some() || user.is_some() {
            if hops >= self.config.bias_hops {
                break;
            }
            hops += 1;

            let mut def_idx = None;
            if let Some(split) = def {
                match self.bias_of(split, rmask) {
                    Bias::Take(reg) => return Some(reg),
                    Bias::Cutoff => def = None,
                    Bias::Advance => {
                        def_idx = self.biasable(split);
                        if def_idx.is_none() {
                            def = None;
                        }
                    }
                }
            }
            if let Some(split) = user {
                match self.bias_of(split, rmask) {
                    Bias::Take(reg) => return Some(reg),
                    Bias::Cutoff => user = None,
                    Bias::Advance => {
                        if self.biasable(split).is_none() {
                            user = None;
                        }
                    }
                }
            }

            if let Some(split) = def {
                if let Some(reg) = self.bias_color_neighbors(split, &mut rmask) {
                    return Some(reg);
                }
                let next = def_idx.and_then(|idx| self.func.inputs(split).get(idx).copied());
                def = next.filter(|input| self.lrg(*input).is_some());
            }
            if let Some(split) = user {
                if let Some(reg) = self.bias_color_neighbors(split, &mut rmask) {
                    return Some(reg);
                }
                let next = self.func.users(split).first().copied();
                user = next.filter(|next| self.biasable(*next).is_some());
            }
        }
        rmask.first_register()
    }

    fn bias_of(&mut self, split: InstrRef, rmask: RegisterMaskRw) -> Bias {
        match self.lrg(split).and_then(|lrg| self.lrgs[lrg].reg) {
            Some(reg) if rmask.contains(reg) => Bias::Take(reg),
            Some(_) => Bias::Cutoff,
            None => Bias::Advance,
        }
    }

    /// Input index to follow up a bias chain through `instr`, if it copies its value at all.
    fn biasable(&self, instr: InstrRef) -> Option<usize> {
        let node = self.func.instr(instr);
        if node.is_split() {
            Some(0)
        } else if node.is_phi() {
            Some(
                self.func
                    .backedge_index(self.func.block_of(instr))
                    .unwrap_or_default(),
            )
        } else {
            node.two_address()
        }
    }

    /// Trims `rmask` by the registers the neighbours of `split` have or must get. Returns the
    /// register if only one is left.
    fn bias_color_neighbors(
        &mut self,
        split: InstrRef,
        rmask: &mut RegisterMaskRw,
    ) -> Option<RegNum> {
        let lrg = self.lrg(split)?;
        for neighbor in &self.lrgs[lrg].adj {
            let neighbor = &self.lrgs[*neighbor];
            let reg = match neighbor.reg {
                Some(reg) => Some(reg),
                None if neighbor.is_single() => neighbor.mask.first_register(),
                None => None,
            };
            if let Some(reg) = reg {
                rmask.clear(reg);
                if rmask.is_singleton() {
                    return rmask.first_register();
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use crate::{
        codegen::{
            machine::{
                abi::CallingConvention,
                backend::Backend as _,
                BasicBlockId,
                Function,
                FunctionBuilder,
                InstrRef,
                Instr as MInstr,
                PhysicalRegister as _,
                PseudoInstr,
            },
            register_allocator::{
                FailureKind,
                RegAlloc,
                RegAllocConfig,
            },
            targets::{
                calling_convention::systemv::SystemV,
                x86_64::{
                    Backend,
                    Instr,
                    PhysicalRegister,
                    Target,
                },
            },
        },
        test::{
            loop_function,
            straight_line_function,
            swap_loop_function,
        },
    };

    #[test]
    #[traced_test]
    fn should_add_edges_between_overlapping_live_values() {
        let mut builder = FunctionBuilder::<Target>::new("edges");
        let a = builder.instr(Instr::MOV64ri { immediate: 1 }, &[]);
        let b = builder.instr(Instr::MOV64ri { immediate: 2 }, &[]);
        let sum = builder.instr(Instr::ADD64rr, &[a, b]);
        builder.ret(Some(sum));
        let mut function = builder.build();
        let mut alloc = RegAlloc::new(&mut function, RegAllocConfig::new());
        assert!(alloc.build_live_ranges());
        assert!(alloc.build_interference_graph());
        let (la, lb) = (alloc.lrg(a).unwrap(), alloc.lrg(b).unwrap());
        assert_eq!(alloc.lrgs[la].neighbors(), &[lb]);
        assert_eq!(alloc.lrgs[lb].neighbors(), &[la]);

        assert!(alloc.color());
        assert_eq!(alloc.lrgs[la].reg, Some(PhysicalRegister::RAX.index()));
        assert_eq!(alloc.lrgs[lb].reg, Some(PhysicalRegister::RCX.index()));
    }

    #[test]
    #[traced_test]
    fn should_deny_single_register_defs_instead_of_interfering() {
        let mut builder = FunctionBuilder::<Target>::new("division");
        let a = builder.instr(Instr::MOV64ri { immediate: 7 }, &[]);
        let b = builder.instr(Instr::MOV64ri { immediate: 3 }, &[]);
        let x = builder.instr(Instr::MOV64ri { immediate: 9 }, &[]);
        let div = builder.instr(Instr::IDIV64r, &[a, b]);
        let results = builder.projections(div);
        let sum = builder.instr(Instr::ADD64rr, &[results[0], x]);
        builder.ret(Some(sum));
        let mut function = builder.build();
        let mut alloc = RegAlloc::new(&mut function, RegAllocConfig::new());
        assert!(alloc.build_live_ranges());
        assert!(alloc.build_interference_graph());
        let lx = alloc.lrg(x).unwrap();
        let quotient = alloc.lrg(results[0]).unwrap();
        let remainder = alloc.lrg(results[1]).unwrap();
        let mask = alloc.lrgs[lx].mask;
        assert!(!mask.contains(PhysicalRegister::RAX.index()));
        assert!(!mask.contains(PhysicalRegister::RDX.index()));
        assert!(!alloc.lrgs[lx].neighbors().contains(&quotient));
        assert!(!alloc.lrgs[lx].neighbors().contains(&remainder));
        let lb = alloc.lrg(b).unwrap();
        assert!(alloc.lrgs[lx].neighbors().contains(&lb));
    }

    #[test]
    #[traced_test]
    fn should_subtract_kills_from_values_live_across_calls() {
        let mut builder = FunctionBuilder::<Target>::new("kills");
        let x = builder.instr(Instr::MOV64ri { immediate: 5 }, &[]);
        let call = builder.instr(Instr::CALL64 { callee: "g", args: 0 }, &[]);
        let sum = builder.instr(Instr::ADD64rr, &[call, x]);
        builder.ret(Some(sum));
        let mut function = builder.build();
        let mut alloc = RegAlloc::new(&mut function, RegAllocConfig::new());
        assert!(alloc.build_live_ranges());
        assert!(alloc.build_interference_graph());
        let lx = alloc.lrg(x).unwrap();
        assert_eq!(alloc.lrgs[lx].mask, SystemV::callee_save());
        assert!(alloc.lrgs[lx].neighbors().is_empty());
    }

    #[test]
    #[traced_test]
    fn should_propagate_liveness_around_loops() {
        let mut function = loop_function();
        let mut alloc = RegAlloc::new(&mut function, RegAllocConfig::new());
        assert!(alloc.build_live_ranges());
        assert!(alloc.build_interference_graph());
        let [entry, header, body] = [0, 1, 2].map(BasicBlockId::new);
        let counter = alloc.func.basic_blocks[header].instructions[0];
        let [init, next] = [0, 1].map(|idx| alloc.func.inputs(counter)[idx]);
        let lrg = alloc.lrg(counter).unwrap();
        assert_eq!(alloc.ifg.live_outs[entry].get(&lrg), Some(&init));
        assert_eq!(alloc.ifg.live_outs[body].get(&lrg), Some(&next));
        assert_eq!(alloc.ifg.live_outs[header].get(&lrg), Some(&counter));
    }

    #[test]
    #[traced_test]
    fn should_detect_self_conflicts() {
        let mut function = swap_loop_function();
        let mut alloc = RegAlloc::new(&mut function, RegAllocConfig::new());
        assert!(alloc.build_live_ranges());
        assert!(!alloc.build_interference_graph());
        let header = alloc.func.basic_blocks[BasicBlockId::new(1)].instructions.clone();
        let (a, b) = (header[1], header[2]);
        let lrg = alloc.lrg(a).unwrap();
        assert_eq!(alloc.lrg(b), Some(lrg));
        assert!(alloc.failed.contains(&lrg));
        assert_eq!(alloc.lrgs[lrg].failure, Some(FailureKind::SelfConflict));
        assert!(alloc.lrgs[lrg].self_conflicts.contains(&a));
        assert!(alloc.lrgs[lrg].self_conflicts.contains(&b));
        assert!(logs_contain("failed: SelfConflict"));
    }

    #[test]
    #[traced_test]
    fn should_prefer_callee_saves_as_risky_victims() {
        let mut function = straight_line_function();
        let mut alloc = RegAlloc::new(&mut function, RegAllocConfig::new());
        alloc.insert_callee_saves();
        assert!(alloc.build_live_ranges());
        assert!(alloc.build_interference_graph());
        let rbx = alloc
            .func
            .instructions()
            .find(|instr| {
                matches!(
                    alloc.func.instr(*instr),
                    MInstr::Pseudo(PseudoInstr::CalleeSave(reg)) if *reg == PhysicalRegister::RBX.index()
                )
            })
            .unwrap();
        let ret = alloc
            .func
            .instructions()
            .find(|instr| alloc.func.instr(*instr).is_ret())
            .unwrap();
        let value = alloc.func.inputs(ret)[0];
        let saved = alloc.lrg(rbx).unwrap();
        let value = alloc.lrg(value).unwrap();
        assert_eq!(alloc.risky_score(saved), 1_000_000 - 2 - 3);
        assert_eq!(alloc.risky_score(value), 1_000);
        assert!(alloc.color());
        assert_eq!(alloc.lrgs[saved].reg, Some(PhysicalRegister::RBX.index()));
    }

    /// `1 + split(p1)`, the split gets a register of its own unless biased towards `p1`.
    fn split_param_function() -> (Function<Target>, InstrRef, InstrRef) {
        let mut builder = FunctionBuilder::<Target>::new("bias");
        builder.param();
        let param = builder.param();
        let constant = builder.instr(Instr::MOV64ri { immediate: 1 }, &[]);
        let sum = builder.instr(Instr::ADD64rr, &[constant, param]);
        builder.ret(Some(sum));
        let mut function = builder.build();
        let split = function.insert_at(BasicBlockId::new(0), 3, Backend::split("test", 0), &[param]);
        function.set_input(sum, 1, split);
        (function, param, split)
    }

    #[test]
    #[traced_test]
    fn should_bias_splits_towards_their_source() {
        let (mut function, param, split) = split_param_function();
        let mut alloc = RegAlloc::new(&mut function, RegAllocConfig::new());
        assert!(alloc.build_live_ranges());
        assert!(alloc.build_interference_graph());
        let (source, copy) = (alloc.lrg(param).unwrap(), alloc.lrg(split).unwrap());
        assert_ne!(source, copy);
        assert_eq!(alloc.lrgs[copy].split_def.map(|link| link.split), Some(split));
        assert!(alloc.lrgs[copy].mask.cardinality() > 2);
        assert!(alloc.color());
        assert_eq!(alloc.lrgs[source].reg, Some(PhysicalRegister::RSI.index()));
        assert_eq!(alloc.lrgs[copy].reg, alloc.lrgs[source].reg);
    }

    #[test]
    #[traced_test]
    fn should_take_the_first_free_register_without_bias_hops() {
        let (mut function, param, split) = split_param_function();
        let config = RegAllocConfig {
            bias_hops: 0,
            ..RegAllocConfig::new()
        };
        let mut alloc = RegAlloc::new(&mut function, config);
        assert!(alloc.build_live_ranges());
        assert!(alloc.build_interference_graph());
        assert!(alloc.color());
        let (source, copy) = (alloc.lrg(param).unwrap(), alloc.lrg(split).unwrap());
        assert_eq!(alloc.lrgs[source].reg, Some(PhysicalRegister::RSI.index()));
        assert_eq!(alloc.lrgs[copy].reg, Some(PhysicalRegister::RCX.index()));
    }
}
