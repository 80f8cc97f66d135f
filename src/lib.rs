//! # robdd: canonical Binary Decision Diagrams
//!
//! **`robdd`** is a manager-centric engine for **reduced ordered Binary
//! Decision Diagrams (BDDs)**: a canonical graph representation of Boolean
//! functions, built for the symbolic-reasoning workloads (equivalence
//! checking, quantifier elimination, model counting) where canonicity is the
//! whole point.
//!
//! ## Key properties
//!
//! - **Canonical by construction**: all nodes are hash-consed through the
//!   manager's unique table, so two logically equal functions always share
//!   one root. Equality of [`Bdd`] handles *is* logical equivalence.
//! - **Bounded memory**: reference-counted handles, mark/sweep garbage
//!   collection, and a configurable hard ceiling on the node store. The one
//!   checked failure is [`MemOut`].
//! - **Dynamic variable order**: variable identity is decoupled from its
//!   level, and the manager can re-optimize the order by sifting without
//!   invalidating any handle.
//! - **Memoized operations**: apply, if-then-else, and the fused
//!   quantify-and-combine recursions all go through a bounded operation
//!   cache, keeping them linear-ish in the size of the shared graph.
//!
//! ## Basic usage
//!
//! ```rust
//! use robdd::BddManager;
//!
//! let m = BddManager::new(2);
//!
//! let x0 = m.mk_var(0).unwrap();
//! let x1 = m.mk_var(1).unwrap();
//!
//! // f = x0 AND (NOT x1)
//! let nx1 = m.mk_not(&x1).unwrap();
//! let f = m.mk_and(&x0, &nx1).unwrap();
//!
//! assert!(!f.is_false()); // satisfiable
//! assert!(!f.is_true());  // not a tautology
//! assert_eq!(f.dnf_size(), 1u32.into()); // exactly one satisfying assignment
//!
//! // Canonicity: rebuilding the same function yields the same handle.
//! let g = m.mk_and(&m.mk_not(&x1).unwrap(), &x0).unwrap();
//! assert_eq!(f, g);
//! ```
//!
//! ## Components
//!
//! - [`manager`]: the [`BddManager`]: node store, unique table, apply
//!   engine, quantification, garbage collection, reordering, counting.
//! - [`bdd`]: the [`Bdd`] handle clients hold.
//! - [`unique`] / [`cache`]: the hash-consing index and operation cache.
//! - [`node`] / [`types`]: node layout and the `Var`/`Level` identifiers.
//!
//! The manager is a single-owner structure: drive it from one logical thread.

pub mod bdd;
pub mod cache;
pub mod error;
pub mod manager;
pub mod node;
pub mod types;
pub mod unique;
pub mod utils;

pub use bdd::Bdd;
pub use error::{MemOut, Result};
pub use manager::BddManager;
pub use types::{Level, Var};
