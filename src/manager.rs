//! The BDD manager: node store, hash-consing, apply engine, lifecycle.
//!
//! All diagrams live in one arena of [`Node`]s addressed by dense integer
//! ids. Every node is created through [`State::make_node`], which enforces
//! the reduction rule and hash-conses against the unique table, so two
//! logically equal functions always share one root id. The recursive
//! operations memoize through a bounded [`OpCache`] and keep their in-flight
//! intermediate results alive on an explicit protection stack, because a
//! collection can trigger inside any allocation.
//!
//! The manager is single-owner: one logical thread drives all operations.
//! Interior mutability (one `RefCell` around the whole state) is what lets
//! handles participate in reference counting from `Clone`/`Drop`.

use std::cell::RefCell;
use std::cmp::min;
use std::fmt;
use std::fmt::Write;

use log::debug;
use num_bigint::BigUint;

use crate::bdd::Bdd;
use crate::cache::OpCache;
use crate::error::{MemOut, Result};
use crate::node::{Node, NodeId, FALSE, MAX_RC, TRUE};
use crate::types::{Level, Var};
use crate::unique::UniqueTable;

/// Binary and projection opcodes, used as operation-cache keys.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum Op {
    And = 0,
    Or = 1,
    Iff = 2,
    Not = 3,
    AndProj = 4,
    OrProj = 5,
}

const UNIQUE_BITS: u32 = 16;
const CACHE_BITS: u32 = 16;
const INITIAL_NODES: usize = 1024;
const DEFAULT_MAX_NODES: usize = 1 << 24;

struct State {
    nodes: Vec<Node>,
    unique: UniqueTable,
    cache: OpCache,
    /// Reclaimed and never-used slots, lowest index on top.
    free_nodes: Vec<NodeId>,
    /// Protection stack: in-flight intermediate results that are not yet
    /// owned by any handle but must survive a collection.
    bdd_stack: Vec<NodeId>,
    var2level: Vec<u32>,
    level2var: Vec<u32>,
    /// Positive and negative single-variable diagrams, two per variable.
    var2bdd: Vec<NodeId>,
    max_num_nodes: usize,
    mark: Vec<u32>,
    mark_level: u32,
    /// Set by `make_node` when the returned id is a fresh allocation.
    is_new_node: bool,
    /// While a swap is rewriting nodes, collection is off and the arena may
    /// transiently grow past the ceiling.
    reordering: bool,
    level2nodes: Vec<Vec<NodeId>>,
    /// Internal parent counts, live only during reordering.
    reorder_rc: Vec<u32>,
    /// Live node count maintained across swaps (the sift cost metric).
    reorder_size: usize,
}

impl State {
    fn new(num_vars: usize) -> Self {
        let mut state = Self {
            nodes: vec![Node::terminal(), Node::terminal()],
            unique: UniqueTable::new(UNIQUE_BITS),
            cache: OpCache::new(CACHE_BITS),
            free_nodes: Vec::new(),
            bdd_stack: Vec::new(),
            var2level: Vec::new(),
            level2var: Vec::new(),
            var2bdd: Vec::new(),
            max_num_nodes: DEFAULT_MAX_NODES,
            mark: vec![0; 2],
            mark_level: 0,
            is_new_node: false,
            reordering: false,
            level2nodes: Vec::new(),
            reorder_rc: Vec::new(),
            reorder_size: 0,
        };
        state.unique.ensure_capacity(2);
        state.alloc_free_nodes(INITIAL_NODES + 2 * num_vars);
        state
    }

    fn is_const(&self, b: NodeId) -> bool {
        b <= TRUE
    }
    fn level(&self, b: NodeId) -> u32 {
        self.nodes[b as usize].level
    }
    fn lo(&self, b: NodeId) -> NodeId {
        self.nodes[b as usize].lo
    }
    fn hi(&self, b: NodeId) -> NodeId {
        self.nodes[b as usize].hi
    }
    fn var(&self, b: NodeId) -> u32 {
        self.level2var[self.level(b) as usize]
    }
    fn num_levels(&self) -> u32 {
        self.level2var.len() as u32
    }
    /// The positive diagram of the variable currently at level `l`.
    fn level2bdd(&self, l: u32) -> NodeId {
        self.var2bdd[2 * self.level2var[l as usize] as usize]
    }

    fn push(&mut self, b: NodeId) {
        self.bdd_stack.push(b);
    }
    fn pop(&mut self, n: usize) {
        let len = self.bdd_stack.len();
        self.bdd_stack.truncate(len - n);
    }

    fn inc_ref(&mut self, b: NodeId) {
        self.nodes[b as usize].inc_ref();
    }
    fn dec_ref(&mut self, b: NodeId) {
        self.nodes[b as usize].dec_ref();
    }

    /// Registers variables `0..=v`, assigning each new one the next level
    /// from the bottom and pinning its two single-variable diagrams.
    fn reserve_var(&mut self, v: u32) -> Result<()> {
        while self.var2level.len() <= v as usize {
            let var = self.var2level.len() as u32;
            let lvl = self.level2var.len() as u32;
            self.var2level.push(lvl);
            self.level2var.push(var);
            let pos = self.make_node(lvl, FALSE, TRUE)?;
            self.nodes[pos as usize].refcount = MAX_RC;
            self.var2bdd.push(pos);
            let neg = self.make_node(lvl, TRUE, FALSE)?;
            self.nodes[neg as usize].refcount = MAX_RC;
            self.var2bdd.push(neg);
        }
        Ok(())
    }

    // -- node construction ---------------------------------------------------

    /// The single canonicalization choke point: every node in the system is
    /// created here.
    fn make_node(&mut self, lvl: u32, lo: NodeId, hi: NodeId) -> Result<NodeId> {
        self.is_new_node = false;
        if lo == hi {
            return Ok(lo);
        }
        debug_assert!(self.is_const(lo) || lvl < self.level(lo));
        debug_assert!(self.is_const(hi) || lvl < self.level(hi));
        if let Some(id) = self.unique.find(&self.nodes, lvl, lo, hi) {
            return Ok(id);
        }
        let id = self.alloc_node()?;
        self.nodes[id as usize] = Node::new(lvl, lo, hi);
        self.unique.insert(&self.nodes, id);
        self.is_new_node = true;
        Ok(id)
    }

    fn alloc_node(&mut self) -> Result<NodeId> {
        if let Some(id) = self.free_nodes.pop() {
            return Ok(id);
        }
        if self.nodes.len() < self.max_num_nodes || self.reordering {
            self.alloc_free_nodes(self.nodes.len() / 2 + 1);
        } else {
            self.gc();
        }
        self.free_nodes.pop().ok_or(MemOut)
    }

    /// Extends the arena by up to `n` free slots, clamped to the ceiling
    /// (except mid-reorder, where rebuilt nodes precede reclaimed ones).
    fn alloc_free_nodes(&mut self, n: usize) {
        let mut target = self.nodes.len() + n;
        if !self.reordering {
            target = target.min(self.max_num_nodes.max(self.nodes.len()));
        }
        for id in (self.nodes.len()..target).rev() {
            self.free_nodes.push(id as NodeId);
        }
        self.nodes.resize(target, Node::free());
        self.unique.ensure_capacity(target);
        self.mark.resize(target, 0);
    }

    // -- mark bits -----------------------------------------------------------

    fn init_mark(&mut self) {
        self.mark.resize(self.nodes.len(), 0);
        self.mark_level = self.mark_level.wrapping_add(1);
        if self.mark_level == 0 {
            self.mark.fill(0);
            self.mark_level = 1;
        }
    }
    fn set_mark(&mut self, b: NodeId) {
        self.mark[b as usize] = self.mark_level;
    }
    fn is_marked(&self, b: NodeId) -> bool {
        self.mark[b as usize] == self.mark_level
    }

    // -- garbage collection --------------------------------------------------

    /// Mark-and-sweep over the arena. Roots: terminals, every node with a
    /// positive refcount (externally held or pinned), and the protection
    /// stack. Unreachable slots go back to the free list; the operation
    /// cache is dropped wholesale and the unique table rebuilt from the
    /// survivors.
    fn gc(&mut self) {
        let live_before = self.nodes.len() - self.free_nodes.len();
        self.free_nodes.clear();
        self.init_mark();

        let mut todo: Vec<NodeId> = Vec::new();
        self.set_mark(FALSE);
        self.set_mark(TRUE);
        for i in 2..self.nodes.len() {
            let n = &self.nodes[i];
            if !n.is_free() && n.refcount > 0 {
                self.set_mark(i as NodeId);
                todo.push(i as NodeId);
            }
        }
        for k in 0..self.bdd_stack.len() {
            let b = self.bdd_stack[k];
            if !self.is_marked(b) {
                self.set_mark(b);
                todo.push(b);
            }
        }
        while let Some(b) = todo.pop() {
            if self.is_const(b) {
                continue;
            }
            for c in [self.lo(b), self.hi(b)] {
                if !self.is_marked(c) {
                    self.set_mark(c);
                    todo.push(c);
                }
            }
        }

        // Sweep descending so the lowest reclaimed index is reused first.
        for i in (2..self.nodes.len()).rev() {
            if !self.is_marked(i as NodeId) {
                self.nodes[i] = Node::free();
                self.free_nodes.push(i as NodeId);
            }
        }

        self.cache.clear();
        self.unique.clear();
        for i in 2..self.nodes.len() {
            if !self.nodes[i].is_free() {
                self.unique.insert(&self.nodes, i as NodeId);
            }
        }

        debug!(
            "gc: {} -> {} live nodes ({} free)",
            live_before,
            self.nodes.len() - self.free_nodes.len(),
            self.free_nodes.len()
        );
        debug_assert!(self.well_formed());
    }

    // -- apply engine --------------------------------------------------------

    fn apply_const(&self, a: NodeId, b: NodeId, op: Op) -> NodeId {
        debug_assert!(self.is_const(a) && self.is_const(b));
        let decided = match op {
            Op::And => a == TRUE && b == TRUE,
            Op::Or => a == TRUE || b == TRUE,
            Op::Iff => a == b,
            _ => unreachable!("no constant table for {:?}", op),
        };
        if decided {
            TRUE
        } else {
            FALSE
        }
    }

    /// Cofactors of `b` with respect to the level `lvl`: a node above or
    /// below that level does not branch there and supplies itself unchanged.
    fn cofactors(&self, b: NodeId, lvl: u32) -> (NodeId, NodeId) {
        if !self.is_const(b) && self.level(b) == lvl {
            (self.lo(b), self.hi(b))
        } else {
            (b, b)
        }
    }

    fn apply_rec(&mut self, a: NodeId, b: NodeId, op: Op) -> Result<NodeId> {
        match op {
            Op::And => {
                if a == b {
                    return Ok(a);
                }
                if a == FALSE || b == FALSE {
                    return Ok(FALSE);
                }
                if a == TRUE {
                    return Ok(b);
                }
                if b == TRUE {
                    return Ok(a);
                }
            }
            Op::Or => {
                if a == b {
                    return Ok(a);
                }
                if a == TRUE || b == TRUE {
                    return Ok(TRUE);
                }
                if a == FALSE {
                    return Ok(b);
                }
                if b == FALSE {
                    return Ok(a);
                }
            }
            Op::Iff => {
                if a == b {
                    return Ok(TRUE);
                }
                if a == TRUE {
                    return Ok(b);
                }
                if b == TRUE {
                    return Ok(a);
                }
            }
            _ => unreachable!("{:?} is not an apply opcode", op),
        }
        if self.is_const(a) && self.is_const(b) {
            return Ok(self.apply_const(a, b, op));
        }
        if let Some(r) = self.cache.get(a, b, op as u8) {
            return Ok(r);
        }
        // Terminals sit at the sentinel level, so the minimum always picks a
        // decision node.
        let lvl = min(self.level(a), self.level(b));
        let (a0, a1) = self.cofactors(a, lvl);
        let (b0, b1) = self.cofactors(b, lvl);
        let r0 = self.apply_rec(a0, b0, op)?;
        self.push(r0);
        let r1 = self.apply_rec(a1, b1, op)?;
        self.push(r1);
        let r = self.make_node(lvl, r0, r1)?;
        self.pop(2);
        self.cache.insert(a, b, op as u8, r);
        Ok(r)
    }

    /// Negation as a structural recursion (`ite(b, false, true)` semantics);
    /// there is no complemented-edge representation.
    fn mk_not_rec(&mut self, b: NodeId) -> Result<NodeId> {
        if b == TRUE {
            return Ok(FALSE);
        }
        if b == FALSE {
            return Ok(TRUE);
        }
        if let Some(r) = self.cache.get(b, b, Op::Not as u8) {
            return Ok(r);
        }
        let r0 = self.mk_not_rec(self.lo(b))?;
        self.push(r0);
        let r1 = self.mk_not_rec(self.hi(b))?;
        self.push(r1);
        let r = self.make_node(self.level(b), r0, r1)?;
        self.pop(2);
        self.cache.insert(b, b, Op::Not as u8, r);
        Ok(r)
    }

    /// General if-then-else. The two-operand specializations fall through to
    /// the cached binary opcodes; only the genuinely ternary case recurses.
    fn mk_ite_rec(&mut self, a: NodeId, b: NodeId, c: NodeId) -> Result<NodeId> {
        if a == TRUE {
            return Ok(b);
        }
        if a == FALSE {
            return Ok(c);
        }
        if b == c {
            return Ok(b);
        }
        if b == TRUE && c == FALSE {
            return Ok(a);
        }
        if b == TRUE {
            return self.apply_rec(a, c, Op::Or);
        }
        if c == FALSE {
            return self.apply_rec(a, b, Op::And);
        }
        if b == FALSE {
            let na = self.mk_not_rec(a)?;
            self.push(na);
            let r = self.apply_rec(na, c, Op::And);
            self.pop(1);
            return r;
        }
        if c == TRUE {
            let na = self.mk_not_rec(a)?;
            self.push(na);
            let r = self.apply_rec(na, b, Op::Or);
            self.pop(1);
            return r;
        }
        let lvl = min(self.level(a), min(self.level(b), self.level(c)));
        let (a0, a1) = self.cofactors(a, lvl);
        let (b0, b1) = self.cofactors(b, lvl);
        let (c0, c1) = self.cofactors(c, lvl);
        let r0 = self.mk_ite_rec(a0, b0, c0)?;
        self.push(r0);
        let r1 = self.mk_ite_rec(a1, b1, c1)?;
        self.push(r1);
        let r = self.make_node(lvl, r0, r1)?;
        self.pop(2);
        Ok(r)
    }

    // -- quantification ------------------------------------------------------

    /// Projects out the variable at level `l`, fused with the conjunction or
    /// disjunction carried by the projection opcode. Doing the combination
    /// inside the projection pass keeps intermediate diagrams bounded.
    fn mk_quant_rec(&mut self, l: u32, b: NodeId, op: Op) -> Result<NodeId> {
        if self.is_const(b) {
            return Ok(b);
        }
        let lvl = self.level(b);
        if lvl > l {
            // The projected level sits above this node, so `b` is
            // independent of it.
            Ok(b)
        } else if lvl == l {
            let inner = match op {
                Op::AndProj => Op::And,
                Op::OrProj => Op::Or,
                _ => unreachable!("{:?} is not a projection opcode", op),
            };
            self.apply_rec(self.lo(b), self.hi(b), inner)
        } else {
            let a = self.level2bdd(l);
            if let Some(r) = self.cache.get(a, b, op as u8) {
                return Ok(r);
            }
            let r0 = self.mk_quant_rec(l, self.lo(b), op)?;
            self.push(r0);
            let r1 = self.mk_quant_rec(l, self.hi(b), op)?;
            self.push(r1);
            let r = self.make_node(lvl, r0, r1)?;
            self.pop(2);
            self.cache.insert(a, b, op as u8, r);
            Ok(r)
        }
    }

    fn mk_quant(&mut self, vars: &[Var], b: NodeId, op: Op) -> Result<NodeId> {
        let mut levels: Vec<u32> = vars
            .iter()
            .map(|v| {
                let v = v.id() as usize;
                assert!(v < self.var2level.len(), "Unknown variable x{}", v);
                self.var2level[v]
            })
            .collect();
        // Project the deepest level first; every later pass then stops
        // higher up the diagram.
        levels.sort_unstable_by(|x, y| y.cmp(x));
        levels.dedup();
        let mut r = b;
        for l in levels {
            self.push(r);
            let q = self.mk_quant_rec(l, r, op);
            self.pop(1);
            r = q?;
        }
        Ok(r)
    }

    // -- top-level driver ----------------------------------------------------

    /// Runs one public operation. On exhaustion the protection stack is
    /// unwound, the order is re-optimized, and the operation retried once;
    /// a second failure surfaces to the caller.
    fn run(&mut self, f: impl Fn(&mut State) -> Result<NodeId>) -> Result<NodeId> {
        debug_assert!(self.bdd_stack.is_empty());
        match f(self) {
            Ok(r) => Ok(r),
            Err(MemOut) => {
                self.bdd_stack.clear();
                self.try_reorder()?;
                let r = f(self);
                if r.is_err() {
                    self.bdd_stack.clear();
                }
                r
            }
        }
    }

    // -- reordering ----------------------------------------------------------

    /// Sifts every variable to its locally best level, cheapest-to-improve
    /// first. Only legal between operations: the protection stack must be
    /// empty, and the operation cache is unconditionally invalidated.
    fn try_reorder(&mut self) -> Result<()> {
        assert!(
            self.bdd_stack.is_empty(),
            "Reordering with an operation in flight"
        );
        self.gc();
        self.init_level2nodes();
        let size_before = self.reorder_size;
        self.reordering = true;

        let mut vars: Vec<u32> = (0..self.var2level.len() as u32).collect();
        vars.sort_by_key(|&v| {
            let lvl = self.var2level[v as usize] as usize;
            std::cmp::Reverse(self.level2nodes[lvl].len())
        });
        for v in vars {
            self.sift_var(v)?;
        }

        self.reordering = false;
        self.level2nodes.clear();
        self.reorder_rc.clear();
        self.cache.clear();
        debug!("reorder: {} -> {} live nodes", size_before, self.reorder_size);
        debug_assert!(self.well_formed());
        Ok(())
    }

    /// Builds the per-level node lists and internal parent counts. Runs
    /// right after a collection, so every non-free node is live.
    fn init_level2nodes(&mut self) {
        self.level2nodes = vec![Vec::new(); self.level2var.len()];
        self.reorder_rc = vec![0; self.nodes.len()];
        self.reorder_size = 0;
        for i in 2..self.nodes.len() {
            if self.nodes[i].is_free() {
                continue;
            }
            let Node { level, lo, hi, .. } = self.nodes[i];
            self.nodes[i].index = self.level2nodes[level as usize].len() as u32;
            self.level2nodes[level as usize].push(i as NodeId);
            self.reorder_size += 1;
            if !self.is_const(lo) {
                self.reorder_rc[lo as usize] += 1;
            }
            if !self.is_const(hi) {
                self.reorder_rc[hi as usize] += 1;
            }
        }
    }

    /// Moves variable `v` through every level and parks it where the live
    /// node count was smallest; a tie reverts to the starting position.
    fn sift_var(&mut self, v: u32) -> Result<()> {
        let num_levels = self.level2var.len();
        if num_levels <= 1 {
            return Ok(());
        }
        let start = self.var2level[v as usize] as usize;
        let mut pos = start;
        let mut best_cost = self.reorder_size;
        let mut best_pos = pos;
        debug!("sift x{} from level {} (cost {})", v, start, best_cost);

        while pos > 0 {
            self.sift_up(pos - 1)?;
            pos -= 1;
            if self.reorder_size < best_cost {
                best_cost = self.reorder_size;
                best_pos = pos;
            }
        }
        while pos + 1 < num_levels {
            self.sift_up(pos)?;
            pos += 1;
            if self.reorder_size < best_cost {
                best_cost = self.reorder_size;
                best_pos = pos;
            }
        }
        while pos > best_pos {
            self.sift_up(pos - 1)?;
            pos -= 1;
        }
        debug_assert_eq!(self.var2level[v as usize] as usize, pos);
        Ok(())
    }

    /// Exchanges level `lvl` with the level below it, rewriting affected
    /// nodes in place so externally held ids stay valid.
    fn sift_up(&mut self, lvl: usize) -> Result<()> {
        let upper = std::mem::take(&mut self.level2nodes[lvl]);
        let lower = std::mem::take(&mut self.level2nodes[lvl + 1]);

        // Split the upper level: a node with no child below is untangled
        // from the swap and only changes level; the rest are rebuilt.
        let mut solitary = Vec::with_capacity(upper.len());
        let mut tangled = Vec::new();
        for &n in &upper {
            let node = &self.nodes[n as usize];
            let lo_below = !self.is_const(node.lo) && self.level(node.lo) == (lvl + 1) as u32;
            let hi_below = !self.is_const(node.hi) && self.level(node.hi) == (lvl + 1) as u32;
            if lo_below || hi_below {
                tangled.push(n);
            } else {
                solitary.push(n);
            }
        }

        // Everything at both levels changes its key.
        for &n in upper.iter().chain(lower.iter()) {
            self.unique.remove(&self.nodes, n);
        }

        // Relabel: the lower level rises, solitary upper nodes sink. The two
        // groups land on different levels, so their keys cannot collide.
        let mut new_upper = Vec::with_capacity(lower.len() + tangled.len());
        let mut new_lower = Vec::with_capacity(solitary.len());
        for &m in &lower {
            self.nodes[m as usize].level = lvl as u32;
            self.nodes[m as usize].index = new_upper.len() as u32;
            new_upper.push(m);
            self.unique.insert(&self.nodes, m);
        }
        for &n in &solitary {
            self.nodes[n as usize].level = (lvl + 1) as u32;
            self.nodes[n as usize].index = new_lower.len() as u32;
            new_lower.push(n);
            self.unique.insert(&self.nodes, n);
        }
        self.level2nodes[lvl] = new_upper;
        self.level2nodes[lvl + 1] = new_lower;

        // Rebuild each tangled node around the rising variable. The rebuilt
        // key cannot clash with a relabeled or previously rebuilt node: a
        // clash would force the old node's two children to share all their
        // cofactors, which the reduction rule already forbids.
        for n in tangled {
            let node = self.nodes[n as usize];
            let (f00, f01) = self.cofactors(node.lo, lvl as u32);
            let (f10, f11) = self.cofactors(node.hi, lvl as u32);
            let l = self.reorder_make_node((lvl + 1) as u32, f00, f10)?;
            let h = self.reorder_make_node((lvl + 1) as u32, f01, f11)?;
            if !self.is_const(l) {
                self.reorder_rc[l as usize] += 1;
            }
            if !self.is_const(h) {
                self.reorder_rc[h as usize] += 1;
            }
            {
                let nn = &mut self.nodes[n as usize];
                nn.level = lvl as u32;
                nn.lo = l;
                nn.hi = h;
            }
            self.nodes[n as usize].index = self.level2nodes[lvl].len() as u32;
            self.level2nodes[lvl].push(n);
            self.unique.insert(&self.nodes, n);
            self.drop_parent(node.lo);
            self.drop_parent(node.hi);
        }

        let vu = self.level2var[lvl] as usize;
        let vd = self.level2var[lvl + 1] as usize;
        self.level2var.swap(lvl, lvl + 1);
        self.var2level.swap(vu, vd);
        Ok(())
    }

    /// `make_node` plus the reorder bookkeeping for a fresh allocation.
    fn reorder_make_node(&mut self, lvl: u32, lo: NodeId, hi: NodeId) -> Result<NodeId> {
        let r = self.make_node(lvl, lo, hi)?;
        if self.is_new_node {
            if self.reorder_rc.len() < self.nodes.len() {
                self.reorder_rc.resize(self.nodes.len(), 0);
            }
            self.nodes[r as usize].index = self.level2nodes[lvl as usize].len() as u32;
            self.level2nodes[lvl as usize].push(r);
            self.reorder_size += 1;
            if !self.is_const(lo) {
                self.reorder_rc[lo as usize] += 1;
            }
            if !self.is_const(hi) {
                self.reorder_rc[hi as usize] += 1;
            }
        }
        Ok(r)
    }

    /// One internal parent of `b` went away; reclaim the subgraph that
    /// becomes unreferenced (externally pinned nodes stay).
    fn drop_parent(&mut self, b: NodeId) {
        let mut stack = vec![b];
        while let Some(c) = stack.pop() {
            if self.is_const(c) {
                continue;
            }
            self.reorder_rc[c as usize] -= 1;
            if self.reorder_rc[c as usize] == 0 && self.nodes[c as usize].refcount == 0 {
                let node = self.nodes[c as usize];
                self.unique.remove(&self.nodes, c);
                self.level_list_remove(c);
                self.nodes[c as usize] = Node::free();
                self.free_nodes.push(c);
                self.reorder_size -= 1;
                stack.push(node.lo);
                stack.push(node.hi);
            }
        }
    }

    /// Constant-time removal from a per-level list via the aux index slot.
    fn level_list_remove(&mut self, c: NodeId) {
        let lvl = self.nodes[c as usize].level as usize;
        let idx = self.nodes[c as usize].index as usize;
        let list = &mut self.level2nodes[lvl];
        debug_assert_eq!(list[idx], c);
        list.swap_remove(idx);
        if idx < list.len() {
            let moved = list[idx];
            self.nodes[moved as usize].index = idx as u32;
        }
    }

    // -- counting ------------------------------------------------------------

    /// Counts satisfying (`z = 0`) or falsifying (`z = 1`) assignments over
    /// all registered variables. Memoized per node and topological, so the
    /// cost is linear in the diagram, not in the number of paths. An edge
    /// skipping levels multiplies by 2 per skipped level (don't-cares), and
    /// the levels above the root contribute the same way.
    fn count(&mut self, b: NodeId, z: u32) -> BigUint {
        if self.is_const(b) {
            let one = if b == TRUE { 1 - z } else { z };
            return BigUint::from(one);
        }
        let bottom = self.num_levels();
        self.init_mark();
        let mut counts: Vec<BigUint> = vec![BigUint::ZERO; self.nodes.len()];
        counts[FALSE as usize] = BigUint::from(z);
        counts[TRUE as usize] = BigUint::from(1 - z);
        self.set_mark(FALSE);
        self.set_mark(TRUE);
        let mut todo: Vec<NodeId> = vec![b];
        while let Some(&r) = todo.last() {
            if self.is_marked(r) {
                todo.pop();
            } else if !self.is_marked(self.lo(r)) {
                todo.push(self.lo(r));
            } else if !self.is_marked(self.hi(r)) {
                todo.push(self.hi(r));
            } else {
                let lvl = self.level(r);
                let (lo, hi) = (self.lo(r), self.hi(r));
                let llo = if self.is_const(lo) { bottom } else { self.level(lo) };
                let lhi = if self.is_const(hi) { bottom } else { self.level(hi) };
                let c = (&counts[lo as usize] << (llo - lvl - 1))
                    + (&counts[hi as usize] << (lhi - lvl - 1));
                counts[r as usize] = c;
                self.set_mark(r);
                todo.pop();
            }
        }
        &counts[b as usize] << self.level(b)
    }

    // -- diagnostics ---------------------------------------------------------

    /// Structural sanity: reduction rule, level monotonicity, and unique
    /// table membership for every live node.
    fn well_formed(&self) -> bool {
        for i in 2..self.nodes.len() {
            let n = &self.nodes[i];
            if n.is_free() {
                continue;
            }
            if n.lo == n.hi {
                return false;
            }
            if !(self.is_const(n.lo) || n.level < self.level(n.lo)) {
                return false;
            }
            if !(self.is_const(n.hi) || n.level < self.level(n.hi)) {
                return false;
            }
            if self.unique.find(&self.nodes, n.level, n.lo, n.hi) != Some(i as NodeId) {
                return false;
            }
        }
        true
    }

    fn bracket(&self, b: NodeId, out: &mut String) {
        if b == FALSE {
            out.push_str("(0)");
        } else if b == TRUE {
            out.push_str("(1)");
        } else {
            write!(out, "@{}:(x{}, ", b, self.var(b)).unwrap();
            self.bracket(self.hi(b), out);
            out.push_str(", ");
            self.bracket(self.lo(b), out);
            out.push(')');
        }
    }
}

/// The BDD manager. See the [module docs](self) for the architecture.
///
/// All operations go through `&self`; handles returned by the `mk_*`
/// constructors borrow the manager and keep their root alive until dropped.
pub struct BddManager {
    state: RefCell<State>,
}

impl BddManager {
    /// Creates a manager with `num_vars` variables registered up front.
    /// Further variables are registered on first use by [`mk_var`][Self::mk_var].
    pub fn new(num_vars: usize) -> Self {
        let manager = Self {
            state: RefCell::new(State::new(num_vars)),
        };
        if num_vars > 0 {
            manager
                .state
                .borrow_mut()
                .reserve_var(num_vars as u32 - 1)
                .expect("initial variables exceed the node ceiling");
        }
        manager
    }

    /// Hard ceiling on the node store. An operation that still cannot
    /// allocate after a collection fails with [`MemOut`].
    pub fn set_max_num_nodes(&self, n: usize) {
        self.state.borrow_mut().max_num_nodes = n;
    }

    /// Number of registered variables.
    pub fn num_vars(&self) -> usize {
        self.state.borrow().var2level.len()
    }

    /// Number of allocated (not yet reclaimed) nodes, terminals included.
    pub fn num_nodes(&self) -> usize {
        let state = self.state.borrow();
        state.nodes.len() - state.free_nodes.len()
    }

    /// Current level of a variable.
    pub fn level_of(&self, v: impl Into<Var>) -> Level {
        let v = v.into();
        let state = self.state.borrow();
        let v = v.id() as usize;
        assert!(v < state.var2level.len(), "Unknown variable x{}", v);
        Level::new(state.var2level[v])
    }

    /// Variable currently at a level.
    pub fn var_at(&self, l: Level) -> Var {
        let state = self.state.borrow();
        let l = l.index() as usize;
        assert!(l < state.level2var.len(), "No level {}", l);
        Var::new(state.level2var[l])
    }

    fn handle(&self, root: NodeId) -> Bdd<'_> {
        Bdd::new(self, root)
    }

    /// The TRUE terminal. Never collected.
    pub fn mk_true(&self) -> Bdd<'_> {
        self.handle(TRUE)
    }

    /// The FALSE terminal. Never collected.
    pub fn mk_false(&self) -> Bdd<'_> {
        self.handle(FALSE)
    }

    /// The diagram of variable `v`, registering `v` (and everything below
    /// it) if new.
    pub fn mk_var(&self, v: impl Into<Var>) -> Result<Bdd<'_>> {
        let v = v.into();
        let root = {
            let mut state = self.state.borrow_mut();
            state.reserve_var(v.id())?;
            state.var2bdd[2 * v.id() as usize]
        };
        Ok(self.handle(root))
    }

    /// The diagram of the negation of variable `v`.
    pub fn mk_nvar(&self, v: impl Into<Var>) -> Result<Bdd<'_>> {
        let v = v.into();
        let root = {
            let mut state = self.state.borrow_mut();
            state.reserve_var(v.id())?;
            state.var2bdd[2 * v.id() as usize + 1]
        };
        Ok(self.handle(root))
    }

    /// Logical conjunction.
    pub fn mk_and(&self, a: &Bdd, b: &Bdd) -> Result<Bdd<'_>> {
        debug!("mk_and({}, {})", a.id(), b.id());
        let (ra, rb) = (self.root_of(a), self.root_of(b));
        let r = self.state.borrow_mut().run(|s| s.apply_rec(ra, rb, Op::And))?;
        Ok(self.handle(r))
    }

    /// Logical disjunction.
    pub fn mk_or(&self, a: &Bdd, b: &Bdd) -> Result<Bdd<'_>> {
        debug!("mk_or({}, {})", a.id(), b.id());
        let (ra, rb) = (self.root_of(a), self.root_of(b));
        let r = self.state.borrow_mut().run(|s| s.apply_rec(ra, rb, Op::Or))?;
        Ok(self.handle(r))
    }

    /// Logical equivalence.
    pub fn mk_iff(&self, a: &Bdd, b: &Bdd) -> Result<Bdd<'_>> {
        debug!("mk_iff({}, {})", a.id(), b.id());
        let (ra, rb) = (self.root_of(a), self.root_of(b));
        let r = self.state.borrow_mut().run(|s| s.apply_rec(ra, rb, Op::Iff))?;
        Ok(self.handle(r))
    }

    /// Logical negation.
    pub fn mk_not(&self, b: &Bdd) -> Result<Bdd<'_>> {
        debug!("mk_not({})", b.id());
        let rb = self.root_of(b);
        let r = self.state.borrow_mut().run(|s| s.mk_not_rec(rb))?;
        Ok(self.handle(r))
    }

    /// If-then-else combinator: `(c ∧ t) ∨ (¬c ∧ e)`.
    pub fn mk_ite(&self, c: &Bdd, t: &Bdd, e: &Bdd) -> Result<Bdd<'_>> {
        debug!("mk_ite({}, {}, {})", c.id(), t.id(), e.id());
        let (rc, rt, re) = (self.root_of(c), self.root_of(t), self.root_of(e));
        let r = self.state.borrow_mut().run(|s| s.mk_ite_rec(rc, rt, re))?;
        Ok(self.handle(r))
    }

    /// Existential projection of one variable.
    pub fn mk_exists(&self, v: impl Into<Var>, b: &Bdd) -> Result<Bdd<'_>> {
        self.mk_exists_many(&[v.into()], b)
    }

    /// Universal projection of one variable.
    pub fn mk_forall(&self, v: impl Into<Var>, b: &Bdd) -> Result<Bdd<'_>> {
        self.mk_forall_many(&[v.into()], b)
    }

    /// Existential projection of a set of variables.
    pub fn mk_exists_many(&self, vars: &[Var], b: &Bdd) -> Result<Bdd<'_>> {
        debug!("mk_exists_many({:?}, {})", vars, b.id());
        let rb = self.root_of(b);
        let r = self
            .state
            .borrow_mut()
            .run(|s| s.mk_quant(vars, rb, Op::OrProj))?;
        Ok(self.handle(r))
    }

    /// Universal projection of a set of variables.
    pub fn mk_forall_many(&self, vars: &[Var], b: &Bdd) -> Result<Bdd<'_>> {
        debug!("mk_forall_many({:?}, {})", vars, b.id());
        let rb = self.root_of(b);
        let r = self
            .state
            .borrow_mut()
            .run(|s| s.mk_quant(vars, rb, Op::AndProj))?;
        Ok(self.handle(r))
    }

    /// Number of satisfying assignments over all registered variables.
    pub fn dnf_size(&self, b: &Bdd) -> BigUint {
        let rb = self.root_of(b);
        self.state.borrow_mut().count(rb, 0)
    }

    /// Number of falsifying assignments over all registered variables.
    pub fn cnf_size(&self, b: &Bdd) -> BigUint {
        let rb = self.root_of(b);
        self.state.borrow_mut().count(rb, 1)
    }

    /// Runs a mark/sweep collection now. Normally collections are triggered
    /// by allocation pressure; this is for tests and size-sensitive callers.
    pub fn collect_garbage(&self) {
        self.state.borrow_mut().gc();
    }

    /// Re-optimizes the variable order by sifting. Invalidates the
    /// operation cache; node ids (and therefore handles) stay valid.
    pub fn try_reorder(&self) -> Result<()> {
        self.state.borrow_mut().try_reorder()
    }

    /// Structural invariant check (reduction rule, level monotonicity,
    /// hash-consing consistency) over the whole arena.
    pub fn check_invariants(&self) -> bool {
        self.state.borrow().well_formed()
    }

    /// Structural dump of one diagram: `@id:(xV, high, low)`, terminals as
    /// `(0)`/`(1)`. Diagnostic format, not a stable serialization.
    pub fn to_bracket_string(&self, b: &Bdd) -> String {
        let rb = self.root_of(b);
        let mut out = String::new();
        self.state.borrow().bracket(rb, &mut out);
        out
    }

    fn root_of(&self, b: &Bdd) -> NodeId {
        assert!(
            std::ptr::eq(self, b.manager()),
            "Handle belongs to a different manager"
        );
        b.id()
    }

    pub(crate) fn inc_ref_node(&self, b: NodeId) {
        self.state.borrow_mut().inc_ref(b);
    }

    pub(crate) fn dec_ref_node(&self, b: NodeId) {
        self.state.borrow_mut().dec_ref(b);
    }

    pub(crate) fn node_var(&self, b: NodeId) -> Var {
        let state = self.state.borrow();
        assert!(!state.is_const(b), "Terminals have no decision variable");
        Var::new(state.var(b))
    }

    pub(crate) fn node_lo(&self, b: NodeId) -> NodeId {
        let state = self.state.borrow();
        assert!(!state.is_const(b), "Terminals have no children");
        state.lo(b)
    }

    pub(crate) fn node_hi(&self, b: NodeId) -> NodeId {
        let state = self.state.borrow();
        assert!(!state.is_const(b), "Terminals have no children");
        state.hi(b)
    }

    pub(crate) fn make_handle(&self, root: NodeId) -> Bdd<'_> {
        self.handle(root)
    }
}

impl Default for BddManager {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for BddManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("BddManager")
            .field("num_vars", &state.var2level.len())
            .field("capacity", &state.nodes.len())
            .field("live", &(state.nodes.len() - state.free_nodes.len()))
            .finish()
    }
}

impl fmt::Display for BddManager {
    /// Dumps the live node table and the current variable order.
    /// Diagnostic format, not a stable serialization.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        write!(f, "order:")?;
        for &v in &state.level2var {
            write!(f, " x{}", v)?;
        }
        writeln!(f)?;
        for i in 2..state.nodes.len() {
            let n = &state.nodes[i];
            if n.is_free() {
                continue;
            }
            writeln!(
                f,
                "@{} := x{} ? @{} : @{} [rc={}]",
                i,
                state.level2var[n.level as usize],
                n.hi,
                n.lo,
                n.refcount
            )?;
        }
        Ok(())
    }
}
