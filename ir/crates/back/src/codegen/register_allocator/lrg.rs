use std::ops::{
    Index,
    IndexMut,
};

use cranelift_entity::{
    entity_impl,
    PrimaryMap,
};

use crate::{
    codegen::{
        machine::{
            reg::{
                RegNum,
                RegisterMask,
            },
            InstrRef,
        },
        register_allocator::FailureKind,
    },
    FxIndexSet,
};

/// Identifier of a live range.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct LrgId(u32);

entity_impl!(LrgId, "V");

/// A split instruction that belongs to a live range, with the loop depth of its block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct SplitLink {
    pub split: InstrRef,
    pub loop_depth: u32,
}

/// Prefers the split in the deeper loop.
fn deeper(current: Option<SplitLink>, other: Option<SplitLink>) -> Option<SplitLink> {
    match (current, other) {
        (None, other) => other,
        (Some(current), Some(other)) if current.loop_depth < other.loop_depth => Some(other),
        (current, _) => current,
    }
}

/// A live range: the defs and uses that have to end up in the same register.
#[derive(Debug, Clone)]
pub struct Lrg {
    leader: Option<LrgId>,
    /// Assigned register, `None` while uncolored.
    pub(crate) reg: Option<RegNum>,
    pub(crate) mask: RegisterMask,
    pub(crate) one_reg_defs: u16,
    pub(crate) one_reg_uses: u16,
    pub(crate) multi_def: bool,
    pub(crate) multi_use: bool,
    /// Some def, a single register one if there is any.
    pub(crate) mach_def: Option<InstrRef>,
    /// Some use, a single register one if there is any.
    pub(crate) mach_use: Option<InstrRef>,
    pub(crate) use_idx: usize,
    pub(crate) split_def: Option<SplitLink>,
    pub(crate) split_use: Option<SplitLink>,
    pub(crate) self_conflicts: FxIndexSet<InstrRef>,
    /// Neighbours in the interference graph. The first `adj_len` are still in the graph while
    /// simplifying.
    pub(crate) adj: Vec<LrgId>,
    pub(crate) adj_len: usize,
    pub(crate) failure: Option<FailureKind>,
}

impl Lrg {
    fn new() -> Self {
        Self {
            leader: None,
            reg: None,
            mask: RegisterMask::FULL,
            one_reg_defs: 0,
            one_reg_uses: 0,
            multi_def: false,
            multi_use: false,
            mach_def: None,
            mach_use: None,
            use_idx: 0,
            split_def: None,
            split_use: None,
            self_conflicts: FxIndexSet::default(),
            adj: Vec::new(),
            adj_len: 0,
            failure: None,
        }
    }

    pub const fn is_leader(&self) -> bool {
        self.leader.is_none()
    }

    /// Returns `false` once no register is left.
    pub fn and(&mut self, mask: RegisterMask) -> bool {
        self.mask = self.mask.intersect(mask);
        !self.mask.is_empty()
    }

    pub fn subtract(&mut self, mask: RegisterMask) -> bool {
        self.mask = self.mask.subtract(mask);
        !self.mask.is_empty()
    }

    pub fn clear(&mut self, reg: RegNum) -> bool {
        self.mask = self.mask.without(reg);
        !self.mask.is_empty()
    }

    pub(crate) fn record_def(
        &mut self,
        def: InstrRef,
        mask: RegisterMask,
        split_depth: Option<u32>,
    ) -> bool {
        let single = mask.is_singleton();
        if self.mach_def.is_some_and(|current| current != def) {
            self.multi_def = true;
        }
        if self.mach_def.is_none() || single {
            self.mach_def = Some(def);
        }
        if single {
            self.one_reg_defs += 1;
        }
        if let Some(loop_depth) = split_depth {
            self.split_def = deeper(self.split_def, Some(SplitLink { split: def, loop_depth }));
        }
        self.and(mask)
    }

    pub(crate) fn record_use(
        &mut self,
        user: InstrRef,
        idx: usize,
        mask: RegisterMask,
        split_depth: Option<u32>,
    ) -> bool {
        let single = mask.is_singleton();
        if self.mach_use.is_some_and(|current| current != user) {
            self.multi_use = true;
        }
        if self.mach_use.is_none() || single {
            self.mach_use = Some(user);
            self.use_idx = idx;
        }
        if single {
            self.one_reg_uses += 1;
        }
        if let Some(loop_depth) = split_depth {
            self.split_use = deeper(self.split_use, Some(SplitLink { split: user, loop_depth }));
        }
        self.and(mask)
    }

    pub fn mark_self_conflict(&mut self, def: InstrRef) {
        self.self_conflicts.insert(def);
    }

    pub const fn has_split(&self) -> bool {
        self.split_def.is_some() || self.split_use.is_some()
    }

    /// Number of registers still allowed.
    pub const fn size(&self) -> u32 {
        self.mask.cardinality()
    }

    pub const fn is_single(&self) -> bool {
        self.mask.is_singleton()
    }

    /// Fewer live neighbours than allowed registers, so some register is always left.
    pub fn is_low_degree(&self) -> bool {
        self.adj_len < self.size() as usize
    }

    pub fn neighbors(&self) -> &[LrgId] {
        &self.adj[..self.adj_len]
    }

    pub(crate) fn add_neighbor(&mut self, lrg: LrgId) {
        self.adj.push(lrg);
        self.adj_len = self.adj.len();
    }

    /// Moves `lrg` behind the live part of the neighbour list.
    ///
    /// Returns `true` if this live range just became trivially colorable.
    pub(crate) fn remove_neighbor(&mut self, lrg: LrgId) -> bool {
        let Some(idx) = self.neighbors().iter().position(|neighbor| *neighbor == lrg) else {
            return false;
        };
        let old_len = self.adj_len;
        self.adj_len -= 1;
        self.adj.swap(idx, self.adj_len);
        old_len == self.size() as usize
    }

    /// Undoes [`Lrg::remove_neighbor`]. Neighbours are reinserted in reverse removal order, so
    /// `lrg` is always the first removed entry.
    pub(crate) fn reinsert_neighbor(&mut self, lrg: LrgId) {
        debug_assert_eq!(self.adj.get(self.adj_len), Some(&lrg));
        self.adj_len += 1;
    }

    pub(crate) fn set_neighbors(&mut self, adj: Vec<LrgId>) {
        self.adj = adj;
        self.adj_len = self.adj.len();
    }

    /// Points the edge to `old` at `new` instead. Only valid before simplifying starts.
    pub(crate) fn replace_neighbor(&mut self, old: LrgId, new: LrgId) {
        self.adj.retain(|neighbor| *neighbor != old);
        if !self.adj.contains(&new) {
            self.adj.push(new);
        }
        self.adj_len = self.adj.len();
    }

    /// Drops every reference to `instr`, which is about to be removed.
    pub(crate) fn forget(&mut self, instr: InstrRef) {
        if self.mach_def == Some(instr) {
            self.mach_def = None;
        }
        if self.mach_use == Some(instr) {
            self.mach_use = None;
        }
        if self.split_def.is_some_and(|link| link.split == instr) {
            self.split_def = None;
        }
        if self.split_use.is_some_and(|link| link.split == instr) {
            self.split_use = None;
        }
    }

    fn absorb(&mut self, other: &Self) {
        match (self.mach_def, other.mach_def) {
            (None, other_def) => self.mach_def = other_def,
            (Some(def), Some(other_def)) => {
                if def != other_def {
                    self.multi_def = true;
                }
                if self.one_reg_defs == 0 {
                    self.mach_def = Some(other_def);
                } else if def == other_def {
                    self.one_reg_defs -= 1;
                }
            }
            (Some(_), None) => {}
        }
        self.one_reg_defs += other.one_reg_defs;
        self.multi_def |= other.multi_def;

        match (self.mach_use, other.mach_use) {
            (None, other_use) => {
                self.mach_use = other_use;
                self.use_idx = other.use_idx;
            }
            (Some(user), Some(other_use)) => {
                if user != other_use {
                    self.multi_use = true;
                }
                if self.one_reg_uses == 0 {
                    self.mach_use = Some(other_use);
                    self.use_idx = other.use_idx;
                } else if user == other_use {
                    self.one_reg_uses -= 1;
                }
            }
            (Some(_), None) => {}
        }
        self.one_reg_uses += other.one_reg_uses;
        self.multi_use |= other.multi_use;

        self.split_def = deeper(self.split_def, other.split_def);
        self.split_use = deeper(self.split_use, other.split_use);
        self.mask = self.mask.intersect(other.mask);
    }
}

/// Arena of live ranges with union-find over their ids.
#[derive(Debug, Default)]
pub struct Lrgs {
    lrgs: PrimaryMap<LrgId, Lrg>,
}

impl Lrgs {
    pub fn clear(&mut self) {
        self.lrgs.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.lrgs.len()
    }

    pub fn create(&mut self) -> LrgId {
        self.lrgs.push(Lrg::new())
    }

    /// Returns the leader of `lrg`, compressing the path to it.
    pub fn find(&mut self, lrg: LrgId) -> LrgId {
        let mut leader = lrg;
        while let Some(next) = self.lrgs[leader].leader {
            leader = next;
        }
        let mut current = lrg;
        while let Some(next) = self.lrgs[current].leader {
            if next == leader {
                break;
            }
            self.lrgs[current].leader = Some(leader);
            current = next;
        }
        leader
    }

    /// Merges the classes of `a` and `b`. The lower id stays the leader.
    ///
    /// An empty mask on the result is left for the caller to record as a failure.
    pub fn union(&mut self, a: LrgId, b: LrgId) -> LrgId {
        let a = self.find(a);
        let b = self.find(b);
        if a == b {
            return a;
        }
        let (leader, other) = if a < b { (a, b) } else { (b, a) };
        let absorbed = self.lrgs[other].clone();
        self.lrgs[leader].absorb(&absorbed);
        self.lrgs[other].leader = Some(leader);
        leader
    }

    pub fn leaders(&self) -> impl Iterator<Item = LrgId> + '_ {
        self.lrgs
            .iter()
            .filter(|(_, lrg)| lrg.is_leader())
            .map(|(id, _)| id)
    }
}

impl Index<LrgId> for Lrgs {
    type Output = Lrg;

    fn index(&self, index: LrgId) -> &Self::Output {
        &self.lrgs[index]
    }
}

impl IndexMut<LrgId> for Lrgs {
    fn index_mut(&mut self, index: LrgId) -> &mut Self::Output {
        &mut self.lrgs[index]
    }
}
