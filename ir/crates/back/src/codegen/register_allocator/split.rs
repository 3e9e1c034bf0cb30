use itertools::Itertools;
use smallvec::{
    smallvec,
    SmallVec,
};
use tracing::{
    debug,
    trace,
};

use crate::{
    codegen::{
        machine::{
            backend::Backend,
            function::BasicBlockId,
            InstrRef,
            RegisterMask,
            TargetMachine,
        },
        register_allocator::{
            LrgId,
            RegAlloc,
        },
    },
    FxIndexSet,
};

impl<TM: TargetMachine> RegAlloc<'_, TM> {
    /// Splits every failed live range, in id order.
    pub(super) fn split_failed(&mut self, round: u8) {
        let failed = self.failed.iter().copied().sorted().collect_vec();
        for lrg in failed {
            self.split(round, lrg);
        }
        let removed = self.func.remove_dead_copies();
        trace!("Removed {removed} dead copies after splitting");
    }

    fn split(&mut self, round: u8, lrg: LrgId) {
        let info = &self.lrgs[lrg];
        debug!(
            "Splitting {lrg} ({:?}) with mask {}",
            info.failure,
            info.mask.display::<TM>()
        );
        let self_conflicting = !info.self_conflicts.is_empty();
        let colorable = !info.mask.is_empty();
        let multi_def = info.multi_def;
        let (defs, uses) = (info.one_reg_defs, info.one_reg_uses);

        if self_conflicting {
            self.split_self_conflict(round, lrg);
        } else if colorable {
            self.split_by_loop(round, lrg);
        } else if (!multi_def || uses == 1) && defs <= 1 && uses <= 1 && defs + uses > 0 {
            self.split_empty_mask_simple(round, lrg);
        } else {
            let grouped =
                !multi_def && defs <= 1 && uses > 2 && self.split_empty_mask_by_use(round, lrg);
            if !grouped {
                self.split_broad(round, lrg);
            }
        }
    }

    /// Splits after the single register def and before the single register use.
    fn split_empty_mask_simple(&mut self, round: u8, lrg: LrgId) {
        let info = &self.lrgs[lrg];
        let (one_reg_defs, one_reg_uses) = (info.one_reg_defs, info.one_reg_uses);
        let (mach_def, mach_use, use_idx) = (info.mach_def, info.mach_use, info.use_idx);
        let single_user = mach_def.is_some_and(|def| self.func.users(def).len() == 1);

        if let Some(def) = mach_def {
            if one_reg_defs == 1 && !self.func.instr(def).is_clone() {
                self.insert_after_and_replace("def/empty1", round, lrg, def, false);
            }
        }
        if one_reg_uses == 1 || (one_reg_defs == 1 && single_user) {
            let Some(user) = mach_use.filter(|user| self.func.contains(*user)) else {
                return;
            };
            if use_idx < self.func.inputs(user).len() {
                self.insert_before(user, use_idx, "use/empty1", round, lrg, true);
            }
        }
    }

    /// Groups the uses of a single def by the register class they need and splits once per class.
    ///
    /// Returns `false` if grouping does not pay off.
    fn split_empty_mask_by_use(&mut self, round: u8, lrg: LrgId) -> bool {
        let Some(def) = self.lrgs[lrg].mach_def else {
            return false;
        };
        let users = self.func.users(def).iter().copied().unique().collect_vec();
        let calls = users
            .iter()
            .filter(|user| self.func.instr(**user).is_call())
            .count();
        let mut classes: Vec<RegisterMask> = Vec::new();
        loop {
            let mut done = true;
            for user in &users {
                for (idx, input) in self.func.inputs(*user).iter().enumerate() {
                    if *input != def {
                        continue;
                    }
                    if let Some(mask) = self.func.instr(*user).input_mask(idx) {
                        done &= put_into_reg_class(&mut classes, mask);
                    }
                }
            }
            if done {
                break;
            }
        }
        if classes.len() <= 1 || calls > 1 {
            return false;
        }

        trace!("Splitting {lrg} into {} register classes", classes.len());
        for class in classes {
            let (bb, pos) = self.func.position_after(def);
            let split = self.make_split(def, "popular", round, lrg, bb, pos);
            let users = self.func.users(def).iter().copied().unique().collect_vec();
            for user in users {
                if user == split || self.func.instr(user).is_phi() {
                    continue;
                }
                for idx in 0..self.func.inputs(user).len() {
                    let wants_class = self
                        .func
                        .instr(user)
                        .input_mask(idx)
                        .is_some_and(|mask| mask.overlaps(class));
                    if self.func.inputs(user)[idx] == def && wants_class {
                        self.func.set_input(user, idx, split);
                    }
                }
            }
        }
        true
    }

    /// Splits after every def and before every single register use, or before every use if there
    /// is no such use.
    fn split_broad(&mut self, round: u8, lrg: LrgId) {
        let members = self.find_all_lrg(lrg);
        let constrained_uses = self.lrgs[lrg].one_reg_uses > 0;
        for n in &members {
            if !self.func.contains(*n) || self.lrg(*n) != Some(lrg) {
                continue;
            }
            let instr = self.func.instr(*n);
            if !instr.is_clone() && !instr.is_split() {
                self.insert_after_and_replace("def/broad", round, lrg, *n, true);
            }
        }
        for n in members {
            if !self.func.contains(n) || self.func.instr(n).is_split() {
                continue;
            }
            for idx in 0..self.func.inputs(n).len() {
                let input = self.func.inputs(n)[idx];
                if !self.lrg_same(input, lrg) {
                    continue;
                }
                let single = self
                    .func
                    .instr(n)
                    .input_mask(idx)
                    .is_some_and(RegisterMask::is_singleton);
                if single || !constrained_uses {
                    self.insert_before(n, idx, "use/broad", round, lrg, true);
                }
            }
        }
    }

    /// Self conflicts come from phis and two-address instructions extending a live range past
    /// another def of it. Splits around them.
    fn split_self_conflict(&mut self, round: u8, lrg: LrgId) {
        let conflicts = self.lrgs[lrg]
            .self_conflicts
            .iter()
            .copied()
            .sorted()
            .collect_vec();
        for def in conflicts {
            if !self.func.contains(def) {
                continue;
            }
            let users = self.func.users(def).iter().copied().unique().collect_vec();
            for user in users {
                if self.func.instr(user).is_phi() {
                    let bb = self.func.block_of(user);
                    let backedge = self.func.backedge_index(bb);
                    let deeper = self.func.cfg().dom_depth(self.func.block_of(def))
                        > self.func.cfg().dom_depth(bb);
                    for idx in 0..self.func.inputs(user).len() {
                        if self.func.inputs(user)[idx] != def || (backedge == Some(idx) && deeper) {
                            continue;
                        }
                        self.insert_before(user, idx, "use/self/use", round, lrg, true);
                    }
                } else if let Some(idx) = self.func.instr(user).two_address() {
                    if self.func.inputs(user)[idx] == def {
                        self.insert_before(user, idx, "use/self/use", round, lrg, true);
                    }
                }
            }

            if self.func.instr(def).is_phi() {
                let split = self.insert_after_and_replace("def/self", round, lrg, def, false);
                if self.func.users(split).is_empty() {
                    self.func.remove(split);
                    self.stats.splits_inserted -= 1;
                }
                self.insert_before(def, 0, "use/self/phi", round, lrg, true);
            }
            if let Some(idx) = self.func.instr(def).two_address() {
                self.insert_before(def, idx, "use/self/two", round, lrg, true);
            }
        }
    }

    /// Splits around the outermost loop containing a def or use of `lrg`. If all of them are at the
    /// same depth, splits around every def and use.
    fn split_by_loop(&mut self, round: u8, lrg: LrgId) {
        let members = self.find_all_lrg(lrg);

        let mut min = u32::MAX;
        let mut max = 0;
        for n in &members {
            let n = *n;
            if self.lrg(n) == Some(lrg) {
                self.fold_depth(&mut min, &mut max, n, self.func.block_of(n));
            }
            let inputs: SmallVec<[InstrRef; 3]> = self.func.inputs(n).into();
            if self.func.instr(n).is_phi() {
                let preds = self.func.basic_blocks[self.func.block_of(n)].preds.clone();
                for (input, pred) in inputs.into_iter().zip(preds) {
                    self.fold_depth(&mut min, &mut max, input, pred);
                }
            } else {
                for input in inputs {
                    if self.lrg_same(input, lrg) {
                        self.fold_depth(&mut min, &mut max, n, self.func.block_of(n));
                    }
                }
            }
        }
        trace!("{lrg} spans loop depths {min}..={max}");

        for n in members {
            if !self.func.contains(n) || self.func.instr(n).is_split() {
                continue;
            }
            let is_def = self.lrg(n) == Some(lrg);
            let instr = self.func.instr(n);
            if is_def
                && instr.two_address() == Some(0)
                && instr.commutes()
                && self.func.inputs(n).len() > 1
                && self.func.users(self.func.inputs(n)[1]).len() == 1
            {
                self.func.swap_inputs(n, 0, 1);
            }

            let depth = self.func.loop_depth(self.func.block_of(n));
            let at_boundary = min == max || depth <= min;
            if is_def
                && at_boundary
                && !self.func.instr(n).is_clone()
                && !self.has_adjacent_split(n)
            {
                self.insert_after_and_replace("def/loop", round, lrg, n, true);
            }

            if self.func.instr(n).is_phi() {
                let bb = self.func.block_of(n);
                let backedge = self.func.backedge_index(bb);
                for idx in 0..self.func.inputs(n).len() {
                    let input = self.func.inputs(n)[idx];
                    let pred = self.func.basic_blocks[bb].preds[idx];
                    if self.func.instr(input).is_split()
                        || !(min == max || self.func.loop_depth(pred) <= min)
                    {
                        continue;
                    }
                    // Never split the backedge into a phi of the same loop.
                    if backedge == Some(idx)
                        && self.func.instr(input).is_phi()
                        && self.func.block_of(input) == bb
                    {
                        continue;
                    }
                    self.insert_before(n, idx, "use/loop/phi", round, lrg, true);
                }
            } else {
                for idx in 0..self.func.inputs(n).len() {
                    let input = self.func.inputs(n)[idx];
                    if !self.lrg_same(input, lrg) {
                        continue;
                    }
                    if min == max || self.func.instr(input).is_clone() || depth <= min {
                        self.insert_before(n, idx, "use/loop/use", round, lrg, false);
                    }
                }
            }
        }
    }

    /// The single user of `def` is already a split next to it.
    fn has_adjacent_split(&mut self, def: InstrRef) -> bool {
        let users = self.func.users(def);
        if users.len() != 1 {
            return false;
        }
        let user = users[0];
        self.func.instr(user).is_split() && self.same_block_no_clobber(user)
    }

    fn fold_depth(&self, min: &mut u32, max: &mut u32, n: InstrRef, bb: BasicBlockId) {
        if self.func.instr(n).is_split() {
            return;
        }
        let mut depth = self.func.loop_depth(bb);
        if depth < *min {
            depth = self.loop_entry_depth(n, bb).unwrap_or(depth);
        }
        *min = (*min).min(depth);
        *max = (*max).max(depth);
    }

    /// Copies and clones at the tail of a block that only enters a deeper loop count as part of that
    /// loop, splitting around them would not shorten anything.
    fn loop_entry_depth(&self, n: InstrRef, bb: BasicBlockId) -> Option<u32> {
        let [succ] = self.func.basic_blocks[bb].succs() else {
            return None;
        };
        let header_depth = self.func.loop_depth(*succ);
        if !self.func.is_loop_header(*succ) || header_depth <= self.func.loop_depth(bb) {
            return None;
        }
        let end = self.func.position_before_terminators(bb);
        for instr in self.func.basic_blocks[bb].instructions[..end].iter().rev() {
            if *instr == n {
                return Some(header_depth);
            }
            let node = self.func.instr(*instr);
            if !(node.is_clone() || node.is_split()) {
                break;
            }
        }
        None
    }

    /// Whether `value` belongs to `lrg`, looking through splits without a live range.
    fn lrg_same(&mut self, value: InstrRef, lrg: LrgId) -> bool {
        let mut value = value;
        loop {
            match self.lrg(value) {
                Some(other) => return other == lrg,
                None if self.func.instr(value).is_split() => value = self.func.inputs(value)[0],
                None => return false,
            }
        }
    }

    /// Collects every def of `lrg` and every instruction reading one of them.
    fn find_all_lrg(&mut self, lrg: LrgId) -> Vec<InstrRef> {
        let info = &self.lrgs[lrg];
        let mut members: FxIndexSet<InstrRef> = info
            .mach_def
            .into_iter()
            .chain(info.mach_use)
            .chain(info.self_conflicts.iter().copied())
            .filter(|member| self.func.contains(*member))
            .collect();
        let mut next = 0;
        while let Some(n) = members.get_index(next).copied() {
            next += 1;
            if self.lrg(n) != Some(lrg) {
                continue;
            }
            let inputs: SmallVec<[InstrRef; 3]> = self.func.inputs(n).into();
            for input in inputs {
                if self.lrg(input) == Some(lrg) {
                    members.insert(input);
                }
            }
            members.extend(self.func.users(n).iter().copied());
        }
        members.into_iter().collect()
    }

    /// Inserts a copy of input `idx` of `user` right before it is read.
    ///
    /// With `skip`, a split of a split in the same block is avoided: if the input is already a
    /// split used only here the copy is not inserted at all, otherwise the new copy reads the
    /// split's source directly.
    fn insert_before(
        &mut self,
        user: InstrRef,
        idx: usize,
        kind: &'static str,
        round: u8,
        lrg: LrgId,
        skip: bool,
    ) {
        let def = self.func.inputs(user)[idx];
        let use_block = self.func.use_block(user, idx);
        let same_block_split =
            self.func.instr(def).is_split() && use_block == self.func.block_of(def);
        if skip && same_block_split {
            let single = self
                .func
                .instr(user)
                .input_mask(idx)
                .is_some_and(RegisterMask::is_singleton);
            if self.func.users(def).len() == 1 && !single {
                return;
            }
        }
        let (bb, pos) = self.func.position_before_use(user, idx);
        let split = self.make_split(def, kind, round, lrg, bb, pos);
        self.func.set_input(user, idx, split);
        if skip && same_block_split {
            let source = self.func.inputs(def)[0];
            self.func.set_input(split, 0, source);
            if self.func.users(def).is_empty() {
                self.func.remove(def);
            }
        }
    }

    /// Inserts a split right after `def` and points the users of `def` at it.
    ///
    /// Unless `must` is set, users that are splits in the same block with nothing clobbering the
    /// register in between keep reading `def`.
    fn insert_after_and_replace(
        &mut self,
        kind: &'static str,
        round: u8,
        lrg: LrgId,
        def: InstrRef,
        must: bool,
    ) -> InstrRef {
        let (bb, pos) = self.func.position_after(def);
        let split = self.func.insert_at(bb, pos, TM::Backend::split(kind, round), &[def]);
        self.lrg_map.insert(split, lrg);
        self.stats.splits_inserted += 1;
        let users = self.func.users(def).iter().copied().unique().collect_vec();
        for user in users {
            if user == split {
                continue;
            }
            if !must && self.func.instr(user).is_split() && self.same_block_no_clobber(user) {
                continue;
            }
            for idx in 0..self.func.inputs(user).len() {
                if self.func.inputs(user)[idx] == def {
                    self.func.set_input(user, idx, split);
                }
            }
        }
        split
    }

    /// Creates a split of `def` at `bb:pos`, or a fresh copy of `def` if it can be recomputed.
    fn make_split(
        &mut self,
        def: InstrRef,
        kind: &'static str,
        round: u8,
        lrg: LrgId,
        bb: BasicBlockId,
        pos: usize,
    ) -> InstrRef {
        let (instr, inputs): (_, SmallVec<[InstrRef; 3]>) = if self.func.instr(def).is_clone() {
            (self.func.instr(def).clone(), self.func.inputs(def).into())
        } else {
            (TM::Backend::split(kind, round), smallvec![def])
        };
        let split = self.func.insert_at(bb, pos, instr, &inputs);
        self.lrg_map.insert(split, lrg);
        self.stats.splits_inserted += 1;
        split
    }

    /// Whether `split` reads a value defined earlier in the same block without anything in between
    /// touching the register of that value.
    fn same_block_no_clobber(&mut self, split: InstrRef) -> bool {
        let def = self.func.inputs(split)[0];
        let bb = self.func.block_of(def);
        if bb != self.func.block_of(split) {
            return false;
        }
        let def0 = if self.func.instr(def).is_proj() {
            self.func.inputs(def)[0]
        } else {
            def
        };
        let Some(def_lrg) = self.lrg(def) else {
            return false;
        };
        let info = &self.lrgs[def_lrg];
        let Some(def_reg) = info.reg.or_else(|| info.mask.first_register()) else {
            return false;
        };
        let pos = self.func.position(split);
        let before = self.func.basic_blocks[bb].instructions[..pos].to_vec();
        for instr in before.into_iter().rev() {
            if instr == def0 {
                return true;
            }
            let node = self.func.instr(instr);
            if node.is_proj() && self.func.inputs(instr).first() == Some(&def0) {
                continue;
            }
            if node.kill_mask().is_some_and(|kill| kill.contains(def_reg)) {
                return false;
            }
            match self.lrg(instr) {
                Some(other) if other == def_lrg => return false,
                Some(other) if self.lrgs[other].reg == Some(def_reg) => return false,
                _ => {}
            }
        }
        false
    }
}

/// Puts `mask` into the first class it overlaps. Returns `false` if a class had to be narrowed,
/// in which case earlier uses need another pass.
fn put_into_reg_class(classes: &mut Vec<RegisterMask>, mask: RegisterMask) -> bool {
    for class in classes.iter_mut() {
        if class.intersect(mask) == *class {
            return true;
        }
        if class.overlaps(mask) {
            *class = class.intersect(mask);
            return false;
        }
    }
    classes.push(mask);
    true
}
