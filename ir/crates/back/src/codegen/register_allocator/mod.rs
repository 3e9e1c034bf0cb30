//! Iterated graph coloring register allocation.
//!
//! Every round rebuilds the live ranges and the interference graph from scratch and tries to color
//! it. Live ranges that cannot be allocated are split by inserting copies and the next round starts
//! over on the modified instruction graph.

use std::fmt::{
    Display,
    Formatter,
};

pub use coalescer::Coalescer;
use itertools::Itertools;
pub use lrg::{
    Lrg,
    LrgId,
};
use slotmap::SecondaryMap;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{
    debug,
    info,
};
pub use verifier::{
    VerifyError,
    Verifier,
};

use crate::{
    codegen::machine::{
        abi::CallingConvention,
        instr::PseudoInstr,
        reg::{
            RegNum,
            RegisterMask,
        },
        Function,
        Instr,
        InstrRef,
        TargetMachine,
    },
    FxIndexSet,
};

mod build_lrg;
mod coalesce;
mod coalescer;
mod ifg;
mod lrg;
mod split;
mod verifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegAllocConfig {
    /// Coloring rounds before giving up. Failures of every round but the last are split.
    pub max_rounds: u8,
    /// Maximum number of split hops followed when biasing a color.
    pub bias_hops: u8,
    pub remove_noop_splits: bool,
    /// Run the [`Verifier`] after allocating each function.
    pub verify: bool,
}

impl RegAllocConfig {
    pub const fn new() -> Self {
        Self {
            max_rounds: 7,
            bias_hops: 10,
            remove_noop_splits: true,
            verify: false,
        }
    }

    pub const fn verified() -> Self {
        Self {
            verify: true,
            ..Self::new()
        }
    }
}

impl Default for RegAllocConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegAllocStats {
    pub rounds: u8,
    pub splits_inserted: usize,
    /// Splits joined away before coloring.
    pub splits_coalesced: usize,
    /// No-op splits removed after coloring.
    pub splits_removed: usize,
    /// Splits left after removing no-ops, each one is a real move.
    pub spills: usize,
    /// Surviving splits weighted by `8^loop_depth`.
    pub spill_cost: u64,
    pub stack_slots: u32,
}

impl Display for RegAllocStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} rounds, {} splits inserted, {} coalesced, {} removed, {} spills (cost {}), {} stack slots",
            self.rounds,
            self.splits_inserted,
            self.splits_coalesced,
            self.splits_removed,
            self.spills,
            self.spill_cost,
            self.stack_slots
        )
    }
}

#[derive(Debug, Error)]
pub enum RegAllocError {
    #[error("register allocation of `{function}` did not converge after {rounds} rounds, still failing: {failed:?}")]
    DidNotConverge {
        function: String,
        rounds: u8,
        failed: Vec<LrgId>,
    },
    #[error("{instr} in `{function}` has an operand that fits no register or stack slot")]
    Unsatisfiable { function: String, instr: InstrRef },
    #[error("{lrg} in `{function}` is clobbered while it lives in registers no split can copy")]
    Unsplittable { function: String, lrg: LrgId },
    #[error("allocation of `{function}` is invalid: {}", .errors.iter().join("; "))]
    Verification {
        function: String,
        errors: Vec<VerifyError>,
    },
}

/// Why a live range could not be allocated this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The register constraints of its defs and uses leave no register.
    HardConflict,
    /// Two different defs of the live range are live at the same time.
    SelfConflict,
    /// Every allowed register is taken by a neighbour.
    UncolorableAtRisk,
    /// Lost its last register while only allowed registers a split cannot target, such as the
    /// flags.
    Unsplittable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Building,
    Coloring,
    Splitting,
    Done,
    Fatal,
}

/// State of one register allocation run over a function.
pub struct RegAlloc<'func, TM: TargetMachine> {
    func: &'func mut Function<TM>,
    config: RegAllocConfig,
    lrgs: lrg::Lrgs,
    lrg_map: SecondaryMap<InstrRef, LrgId>,
    failed: FxIndexSet<LrgId>,
    ifg: ifg::Scratch,
    stats: RegAllocStats,
}

impl<'func, TM: TargetMachine> RegAlloc<'func, TM> {
    pub fn new(func: &'func mut Function<TM>, config: RegAllocConfig) -> Self {
        Self {
            func,
            config,
            lrgs: lrg::Lrgs::default(),
            lrg_map: SecondaryMap::new(),
            failed: FxIndexSet::default(),
            ifg: ifg::Scratch::default(),
            stats: RegAllocStats::default(),
        }
    }

    /// Allocates registers in at most [`max_rounds`](RegAllocConfig::max_rounds) rounds.
    ///
    /// Values that only live in registers a split cannot copy to must not be live across an
    /// instruction clobbering them. A flags result has to be consumed before the next flag
    /// clobber, otherwise [`RegAllocError::Unsplittable`] is returned.
    pub fn run(mut self) -> Result<RegAllocStats, RegAllocError> {
        info!("Running register allocator for function {}", self.func.name);
        if !self.func.has_cfg() {
            self.func.build_cfg();
        }
        self.check_constraints()?;
        self.insert_callee_saves();
        let mut round = 0;
        let mut phase = Phase::Building;
        loop {
            phase = match phase {
                Phase::Building => {
                    debug!("Starting round {round}");
                    self.reset();
                    if self.build_live_ranges() && self.build_interference_graph() {
                        self.stats.splits_coalesced += self.coalesce();
                        Phase::Coloring
                    } else {
                        Phase::Splitting
                    }
                }
                Phase::Coloring => {
                    if self.color() {
                        Phase::Done
                    } else {
                        Phase::Splitting
                    }
                }
                Phase::Splitting => {
                    if round + 1 >= self.config.max_rounds || self.unsplittable().is_some() {
                        Phase::Fatal
                    } else {
                        self.split_failed(round);
                        round += 1;
                        Phase::Building
                    }
                }
                Phase::Done => {
                    self.stats.rounds = round + 1;
                    self.assign_registers();
                    if self.config.remove_noop_splits {
                        let mut coalescer = Coalescer::new(self.func);
                        coalescer.run();
                        self.stats.splits_removed = coalescer.removed;
                        self.stats.spills = coalescer.spills;
                        self.stats.spill_cost = coalescer.spill_cost;
                    } else {
                        self.count_spills();
                    }
                    self.count_stack_slots();
                    info!("Allocated registers for {}: {}", self.func.name, self.stats);
                    debug!("{}", self.func);
                    return Ok(self.stats);
                }
                Phase::Fatal => {
                    let function = self.func.name.clone();
                    if let Some(lrg) = self.unsplittable() {
                        return Err(RegAllocError::Unsplittable { function, lrg });
                    }
                    let failed = self.failed.iter().copied().sorted().collect_vec();
                    return Err(RegAllocError::DidNotConverge {
                        function,
                        rounds: round + 1,
                        failed,
                    });
                }
            };
        }
    }

    /// An operand with an empty mask cannot be satisfied by any amount of splitting.
    fn check_constraints(&self) -> Result<(), RegAllocError> {
        for instr in self.func.instructions() {
            let node = self.func.instr(instr);
            let inputs = (0..self.func.inputs(instr).len()).filter_map(|idx| node.input_mask(idx));
            let outputs = (0..node.output_count()).filter_map(|idx| node.output_mask(idx));
            if inputs.chain(outputs).any(RegisterMask::is_empty) {
                return Err(RegAllocError::Unsatisfiable {
                    function: self.func.name.clone(),
                    instr,
                });
            }
        }
        Ok(())
    }

    fn unsplittable(&self) -> Option<LrgId> {
        self.failed
            .iter()
            .copied()
            .sorted()
            .find(|lrg| self.lrgs[*lrg].failure == Some(FailureKind::Unsplittable))
    }

    fn reset(&mut self) {
        self.lrgs.clear();
        self.lrg_map.clear();
        self.failed.clear();
    }

    /// Leader of the live range defined by `instr`, if it has one.
    pub(crate) fn lrg(&mut self, instr: InstrRef) -> Option<LrgId> {
        let lrg = *self.lrg_map.get(instr)?;
        let leader = self.lrgs.find(lrg);
        if leader != lrg {
            self.lrg_map.insert(instr, leader);
        }
        Some(leader)
    }

    fn new_lrg(&mut self, instr: InstrRef) -> LrgId {
        if let Some(lrg) = self.lrg(instr) {
            return lrg;
        }
        let lrg = self.lrgs.create();
        self.lrg_map.insert(instr, lrg);
        lrg
    }

    /// Puts `instr` into the live range of `lrg`, merging with the one it already has.
    fn union_into(&mut self, lrg: LrgId, instr: InstrRef) -> LrgId {
        let leader = match self.lrg_map.get(instr).copied() {
            Some(other) => self.lrgs.union(lrg, other),
            None => self.lrgs.find(lrg),
        };
        self.lrg_map.insert(instr, leader);
        leader
    }

    /// Records that `lrg` has no register left after losing some of `before`.
    pub(crate) fn fail_empty(&mut self, lrg: LrgId, before: RegisterMask) {
        let kind = if before.overlaps(TM::split_mask()) {
            FailureKind::HardConflict
        } else {
            FailureKind::Unsplittable
        };
        self.fail(lrg, kind);
    }

    pub(crate) fn fail(&mut self, lrg: LrgId, kind: FailureKind) {
        let lrg = self.lrgs.find(lrg);
        let failure = &mut self.lrgs[lrg].failure;
        if failure.is_none() || kind == FailureKind::Unsplittable {
            *failure = Some(kind);
        }
        if self.failed.insert(lrg) {
            debug!("{lrg} failed: {kind:?}");
        }
    }

    fn success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Rolls every live range reference up to its leader.
    fn unify(&mut self) {
        let instrs = self.lrg_map.keys().collect_vec();
        for instr in instrs {
            self.lrg(instr);
        }
        let failed = std::mem::take(&mut self.failed);
        self.failed = failed.into_iter().map(|lrg| self.lrgs.find(lrg)).collect();
    }

    /// Loop depth of the block of `instr` if it is a split.
    fn split_depth(&self, instr: InstrRef) -> Option<u32> {
        self.func
            .instr(instr)
            .is_split()
            .then(|| self.func.loop_depth(self.func.block_of(instr)))
    }

    /// Defines the entry value of every callee-save register and keeps it alive until each return.
    fn insert_callee_saves(&mut self) {
        if self.func.instructions().any(|instr| self.func.instr(instr).is_callee_save()) {
            return;
        }
        let entry = self.func.cfg().entry_block();
        let pos = self.func.params().len();
        let callee_saves: SmallVec<[(RegNum, InstrRef); 6]> = TM::CallingConvention::callee_save()
            .iter()
            .enumerate()
            .map(|(offset, reg)| {
                let def = self.func.insert_at(
                    entry,
                    pos + offset,
                    Instr::Pseudo(PseudoInstr::CalleeSave(reg)),
                    &[],
                );
                (reg, def)
            })
            .collect();
        let rets = self
            .func
            .instructions()
            .filter(|instr| self.func.instr(*instr).is_ret())
            .collect_vec();
        for ret in rets {
            for (reg, def) in &callee_saves {
                if let Instr::Pseudo(PseudoInstr::Ret { callee_saves, .. }) = self.func.instr_mut(ret) {
                    callee_saves.push(*reg);
                }
                self.func.push_input(ret, *def);
            }
        }
    }

    /// Writes the color of every live range back to the instructions defining it.
    fn assign_registers(&mut self) {
        self.func.regs.clear();
        let instrs = self.func.instructions().collect_vec();
        for instr in instrs {
            let Some(lrg) = self.lrg(instr) else {
                continue;
            };
            if let Some(reg) = self.lrgs[lrg].reg {
                self.func.regs.insert(instr, reg);
            }
        }
    }

    fn count_spills(&mut self) {
        for instr in self.func.instructions() {
            if self.func.instr(instr).is_split() {
                self.stats.spills += 1;
                self.stats.spill_cost += spill_cost(self.func.loop_depth(self.func.block_of(instr)));
            }
        }
    }

    fn count_stack_slots(&mut self) {
        let reg_count = TM::reg_count();
        self.stats.stack_slots = self
            .func
            .regs
            .values()
            .filter(|reg| **reg >= reg_count)
            .unique()
            .count()
            .try_into()
            .unwrap_or(u32::MAX);
    }
}

pub(crate) fn spill_cost(loop_depth: u32) -> u64 {
    1_u64.checked_shl(loop_depth * 3).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use crate::{
        codegen::{
            machine::{
                abi::CallingConvention,
                BasicBlockId,
                FunctionBuilder,
                PhysicalRegister as _,
                TargetMachine as _,
            },
            register_allocator::{
                RegAlloc,
                RegAllocConfig,
                RegAllocError,
                Verifier,
            },
            targets::{
                calling_convention::systemv::SystemV,
                x86_64::{
                    Instr,
                    PhysicalRegister,
                    Target,
                    CC,
                },
            },
        },
        test::{
            call_clobber_function,
            loop_function,
            straight_line_function,
            swap_loop_function,
        },
    };

    #[test]
    #[traced_test]
    fn should_color_straight_line_code_without_splits() {
        let mut function = straight_line_function();
        let stats = RegAlloc::new(&mut function, RegAllocConfig::new()).run().unwrap();
        assert_eq!(stats.rounds, 1);
        assert_eq!(stats.splits_inserted, 0);
        assert_eq!(stats.stack_slots, 0);
        assert_eq!(Verifier::new(&function).verify(), vec![]);
        let ret = function
            .instructions()
            .find(|instr| function.instr(*instr).is_ret())
            .unwrap();
        let value = function.inputs(ret)[0];
        assert_eq!(function.reg(value), Some(PhysicalRegister::RAX.index()));
    }

    #[test]
    #[traced_test]
    fn should_split_values_killed_by_a_call() {
        let mut function = call_clobber_function();
        let stats = RegAlloc::new(&mut function, RegAllocConfig::new()).run().unwrap();
        assert!(stats.rounds > 1);
        assert!(stats.splits_inserted > 0);
        assert_eq!(Verifier::new(&function).verify(), vec![]);
        let caller_save = SystemV::caller_save();
        let call = function
            .instructions()
            .find(|instr| function.instr(*instr).is_call())
            .unwrap();
        let call_pos = function.position(call);
        let crossing = function
            .instructions()
            .filter(|instr| function.instr(*instr).is_split() && function.position(*instr) < call_pos)
            .filter(|instr| {
                function
                    .users(*instr)
                    .iter()
                    .any(|user| function.position(*user) > call_pos)
            })
            .collect::<Vec<_>>();
        assert!(!crossing.is_empty(), "{function}");
        for split in crossing {
            assert!(!caller_save.contains(function.reg(split).unwrap()), "{function}");
        }
    }

    #[test]
    #[traced_test]
    fn should_split_self_conflicting_phis() {
        let mut function = swap_loop_function();
        let stats = RegAlloc::new(&mut function, RegAllocConfig::new()).run().unwrap();
        assert!(stats.splits_inserted > 0);
        assert!(logs_contain("SelfConflict"));
        assert_eq!(Verifier::new(&function).verify(), vec![]);
        let header = &function.basic_blocks[BasicBlockId::new(1)];
        let (a, b) = (header.instructions[1], header.instructions[2]);
        assert!(function.instr(a).is_phi() && function.instr(b).is_phi());
        assert_ne!(function.reg(a), function.reg(b));
    }

    #[test]
    #[traced_test]
    fn should_allocate_loops() {
        let mut function = loop_function();
        RegAlloc::new(&mut function, RegAllocConfig::new()).run().unwrap();
        assert_eq!(Verifier::new(&function).verify(), vec![]);
    }

    #[test]
    #[traced_test]
    fn should_give_up_after_max_rounds() {
        let mut function = call_clobber_function();
        let config = RegAllocConfig {
            max_rounds: 0,
            ..RegAllocConfig::new()
        };
        let err = RegAlloc::new(&mut function, config).run().unwrap_err();
        let message = err.to_string();
        let RegAllocError::DidNotConverge {
            function,
            rounds,
            failed,
        } = err
        else {
            panic!("unexpected error {message}");
        };
        assert_eq!(function, "call_clobber");
        assert_eq!(rounds, 1);
        assert!(!failed.is_empty());
        assert!(message.contains("did not converge after 1 rounds"), "{message}");
        for lrg in &failed {
            assert!(message.contains(&lrg.to_string()), "{message}");
        }
    }

    #[test]
    #[traced_test]
    fn should_not_split_in_the_last_round() {
        let mut function = call_clobber_function();
        let config = RegAllocConfig {
            max_rounds: 1,
            ..RegAllocConfig::new()
        };
        let err = RegAlloc::new(&mut function, config).run().unwrap_err();
        assert!(matches!(err, RegAllocError::DidNotConverge { rounds: 1, .. }), "{err}");
        assert!(!logs_contain("Splitting V"));
        assert!(!logs_contain("Starting round 1"));
        assert!(!function.instructions().any(|instr| function.instr(instr).is_split()));
    }

    #[test]
    #[traced_test]
    fn should_report_rounds_up_to_the_limit() {
        let mut function = call_clobber_function();
        let config = RegAllocConfig {
            max_rounds: 2,
            ..RegAllocConfig::new()
        };
        match RegAlloc::new(&mut function, config).run() {
            Ok(stats) => assert!(stats.rounds <= 2),
            Err(RegAllocError::DidNotConverge { rounds, .. }) => assert_eq!(rounds, 2),
            Err(err) => panic!("unexpected error {err}"),
        }
        assert!(!logs_contain("Starting round 2"));
    }

    #[test]
    #[traced_test]
    fn should_reject_flags_live_across_a_flag_clobber() {
        let mut builder = FunctionBuilder::<Target>::new("flags");
        let then = builder.create_block();
        let exit = builder.create_block();
        let a = builder.param();
        let flags = builder.instr(Instr::CMP64ri { immediate: 0 }, &[a]);
        let zero = builder.instr(Instr::MOV64r0, &[]);
        let sum = builder.instr(Instr::ADD64rr, &[zero, a]);
        builder.instr(
            Instr::JCC {
                cc: CC::Eq,
                target: exit,
            },
            &[flags],
        );
        builder.jmp(then);

        builder.switch_to_block(then);
        builder.ret(Some(sum));

        builder.switch_to_block(exit);
        builder.ret(None);
        let mut function = builder.build();

        let err = RegAlloc::new(&mut function, RegAllocConfig::new())
            .run()
            .unwrap_err();
        assert!(
            matches!(&err, RegAllocError::Unsplittable { function, .. } if function == "flags"),
            "{err}"
        );
        assert!(err.to_string().contains("is clobbered"), "{err}");
        assert!(logs_contain("Unsplittable"));
        assert!(!logs_contain("Starting round 1"));
    }

    #[test]
    #[traced_test]
    fn should_pass_arguments_in_stack_slots() {
        let mut builder = FunctionBuilder::<Target>::new("stack_args");
        let params = (0..8).map(|_| builder.param()).collect::<Vec<_>>();
        builder.ret(None);
        let mut function = builder.build();
        let stats = RegAlloc::new(&mut function, RegAllocConfig::new()).run().unwrap();
        assert_eq!(stats.stack_slots, 2);
        let reg_count = Target::reg_count();
        assert_eq!(function.reg(params[6]), Some(reg_count));
        assert_eq!(function.reg(params[7]), Some(reg_count + 1));
    }

    #[test]
    #[traced_test]
    fn should_reject_parameters_past_the_stack_slots() {
        let mut builder = FunctionBuilder::<Target>::new("many_params");
        let params = (0..120).map(|_| builder.param()).collect::<Vec<_>>();
        builder.ret(None);
        let mut function = builder.build();
        let err = RegAlloc::new(&mut function, RegAllocConfig::new())
            .run()
            .unwrap_err();
        let message = err.to_string();
        let RegAllocError::Unsatisfiable { function, instr } = err else {
            panic!("unexpected error {message}");
        };
        assert_eq!(function, "many_params");
        // The seventh parameter takes the first stack slot, right after the registers.
        let first_unfit = 128 - usize::from(Target::reg_count()) + 6;
        assert_eq!(instr, params[first_unfit]);
        assert!(message.contains("fits no register or stack slot"), "{message}");
    }

    #[test]
    #[traced_test]
    fn should_keep_noop_splits_when_disabled() {
        let mut function = call_clobber_function();
        let config = RegAllocConfig {
            remove_noop_splits: false,
            ..RegAllocConfig::new()
        };
        let stats = RegAlloc::new(&mut function, config).run().unwrap();
        assert_eq!(stats.splits_removed, 0);
        let splits = function
            .instructions()
            .filter(|instr| function.instr(*instr).is_split())
            .count();
        assert_eq!(stats.spills, splits);
        assert_eq!(
            Verifier::new(&function)
                .check_noop_splits(false)
                .verify(),
            vec![]
        );
    }

    #[test]
    #[traced_test]
    fn should_fix_division_operands() {
        let mut builder = FunctionBuilder::<Target>::new("div");
        let a = builder.param();
        let b = builder.param();
        let div = builder.instr(Instr::IDIV64r, &[a, b]);
        let results = builder.projections(div);
        let div2 = builder.instr(Instr::IDIV64r, &[results[1], b]);
        let results2 = builder.projections(div2);
        let sum = builder.instr(Instr::ADD64rr, &[results2[0], results[0]]);
        builder.ret(Some(sum));
        let mut function = builder.build();
        let stats = RegAlloc::new(&mut function, RegAllocConfig::new()).run().unwrap();
        assert!(stats.splits_inserted > 0);
        assert_eq!(Verifier::new(&function).verify(), vec![]);
        assert_eq!(function.reg(results[0]), Some(PhysicalRegister::RAX.index()));
        assert_eq!(function.reg(results[1]), Some(PhysicalRegister::RDX.index()));
    }
}
