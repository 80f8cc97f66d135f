//! The externally owned handle to a diagram.

use std::fmt;
use std::hash::{Hash, Hasher};

use num_bigint::BigUint;

use crate::manager::BddManager;
use crate::node::{NodeId, FALSE, TRUE};
use crate::types::Var;

/// A reference-counted handle to one diagram root.
///
/// A handle keeps its root (and everything below it) alive across garbage
/// collections: `Clone` increments the root's reference count, dropping the
/// handle decrements it. Two handles compare equal iff they share a root id,
/// which by canonicity means they denote the same Boolean function.
///
/// Handles borrow their manager, so they cannot outlive it, and every
/// operation on them goes back through it.
pub struct Bdd<'m> {
    root: NodeId,
    manager: &'m BddManager,
}

impl<'m> Bdd<'m> {
    pub(crate) fn new(manager: &'m BddManager, root: NodeId) -> Self {
        manager.inc_ref_node(root);
        Self { root, manager }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.root
    }

    pub(crate) fn manager(&self) -> &'m BddManager {
        self.manager
    }

    /// Is this the TRUE terminal?
    pub fn is_true(&self) -> bool {
        self.root == TRUE
    }

    /// Is this the FALSE terminal?
    pub fn is_false(&self) -> bool {
        self.root == FALSE
    }

    /// Is this one of the two terminals?
    pub fn is_const(&self) -> bool {
        self.root <= TRUE
    }

    /// The root's decision variable. Panics on a terminal.
    pub fn var(&self) -> Var {
        self.manager.node_var(self.root)
    }

    /// The low branch (decision variable = false). Panics on a terminal.
    pub fn lo(&self) -> Bdd<'m> {
        self.manager.make_handle(self.manager.node_lo(self.root))
    }

    /// The high branch (decision variable = true). Panics on a terminal.
    pub fn hi(&self) -> Bdd<'m> {
        self.manager.make_handle(self.manager.node_hi(self.root))
    }

    /// Number of satisfying assignments over all registered variables.
    pub fn dnf_size(&self) -> BigUint {
        self.manager.dnf_size(self)
    }

    /// Number of falsifying assignments over all registered variables.
    pub fn cnf_size(&self) -> BigUint {
        self.manager.cnf_size(self)
    }
}

impl Clone for Bdd<'_> {
    fn clone(&self) -> Self {
        Self::new(self.manager, self.root)
    }
}

impl Drop for Bdd<'_> {
    fn drop(&mut self) {
        self.manager.dec_ref_node(self.root);
    }
}

impl PartialEq for Bdd<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.manager, other.manager) && self.root == other.root
    }
}

impl Eq for Bdd<'_> {}

impl Hash for Bdd<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.root.hash(state);
    }
}

impl fmt::Debug for Bdd<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bdd(@{})", self.root)
    }
}

impl fmt::Display for Bdd<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.manager.to_bracket_string(self))
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::manager::BddManager;

    #[test]
    fn test_clone_tracks_refcount() {
        let m = BddManager::new(2);
        let x = m.mk_var(0).unwrap();
        let y = m.mk_var(1).unwrap();

        let f = m.mk_and(&x, &y).unwrap();
        let g = f.clone();
        drop(f);
        // The clone still pins the root: a collection must not touch it.
        m.collect_garbage();
        let rebuilt = m.mk_and(&x, &y).unwrap();
        assert_eq!(rebuilt, g);
    }

    #[test]
    fn test_eq_is_canonical_identity() {
        let m = BddManager::new(2);
        let x = m.mk_var(0).unwrap();
        let y = m.mk_var(1).unwrap();

        let f = m.mk_or(&x, &y).unwrap();
        let g = m.mk_or(&y, &x).unwrap();
        assert_eq!(f, g);
        assert_ne!(f, x);
    }

    #[test]
    fn test_children() {
        let m = BddManager::new(2);
        let x = m.mk_var(0).unwrap();
        let y = m.mk_var(1).unwrap();
        let f = m.mk_and(&x, &y).unwrap();

        assert_eq!(f.var().id(), 0);
        assert!(f.lo().is_false());
        assert_eq!(f.hi(), y);
        assert!(!f.is_const());
    }

    #[test]
    #[should_panic(expected = "Terminals have no children")]
    fn test_terminal_children_panic() {
        let m = BddManager::new(0);
        let t = m.mk_true();
        let _ = t.lo();
    }

    #[test]
    #[should_panic(expected = "different manager")]
    fn test_mixed_managers_panic() {
        let m1 = BddManager::new(1);
        let m2 = BddManager::new(1);
        let a = m1.mk_var(0).unwrap();
        let b = m2.mk_var(0).unwrap();
        let _ = m1.mk_and(&a, &b);
    }

    #[test]
    fn test_display() {
        let m = BddManager::new(1);
        let x = m.mk_var(0).unwrap();
        let s = x.to_string();
        assert!(s.contains("x0"));
        assert!(s.contains("(1)"));
        assert!(s.contains("(0)"));
    }
}
