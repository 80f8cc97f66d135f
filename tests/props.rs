//! End-to-end properties of the engine: canonicity, quantifier semantics,
//! counting identities, and lifecycle safety under collection pressure.

use num_bigint::BigUint;
use test_log::test;

use robdd::{Bdd, BddManager, MemOut, Var};

/// Walks a diagram under the given assignment (indexed by variable id).
fn eval(b: &Bdd, assignment: &[bool]) -> bool {
    let mut cur = b.clone();
    while !cur.is_const() {
        let v = cur.var().id() as usize;
        cur = if assignment[v] { cur.hi() } else { cur.lo() };
    }
    cur.is_true()
}

/// Checks `b` against a truth function over `n` variables.
fn assert_truth_table(b: &Bdd, n: usize, expected: impl Fn(&[bool]) -> bool) {
    for bits in 0..1u32 << n {
        let a: Vec<bool> = (0..n).map(|i| bits >> i & 1 == 1).collect();
        assert_eq!(eval(b, &a), expected(&a), "assignment {:?}", a);
    }
}

/// Reachable reduction + ordering invariants, checked through the handle
/// surface alone: no node has equal children, and variable levels strictly
/// increase along every path.
fn assert_reduced_and_ordered(m: &BddManager, b: &Bdd) {
    fn walk(m: &BddManager, b: &Bdd) {
        if b.is_const() {
            return;
        }
        let (lo, hi) = (b.lo(), b.hi());
        assert_ne!(lo, hi, "unreduced node for {}", b.var());
        for child in [&lo, &hi] {
            if !child.is_const() {
                assert!(
                    m.level_of(b.var()) < m.level_of(child.var()),
                    "level order violated: {} above {}",
                    b.var(),
                    child.var()
                );
            }
        }
        walk(m, &lo);
        walk(m, &hi);
    }
    walk(m, b);
    assert!(m.check_invariants());
}

#[test]
fn canonicity_equivalent_formulas_share_roots() {
    let m = BddManager::new(3);
    let x = m.mk_var(0).unwrap();
    let y = m.mk_var(1).unwrap();
    let z = m.mk_var(2).unwrap();

    // Distribution, De Morgan, double negation, absorption.
    let and_or = m.mk_and(&x, &m.mk_or(&y, &z).unwrap()).unwrap();
    let or_and = m
        .mk_or(&m.mk_and(&x, &y).unwrap(), &m.mk_and(&x, &z).unwrap())
        .unwrap();
    assert_eq!(and_or, or_and);

    let lhs = m.mk_not(&m.mk_or(&x, &y).unwrap()).unwrap();
    let rhs = m
        .mk_and(&m.mk_not(&x).unwrap(), &m.mk_not(&y).unwrap())
        .unwrap();
    assert_eq!(lhs, rhs);

    assert_eq!(m.mk_not(&m.mk_not(&z).unwrap()).unwrap(), z);
    assert_eq!(m.mk_or(&x, &m.mk_and(&x, &y).unwrap()).unwrap(), x);

    // Inequivalent functions never collide.
    assert_ne!(m.mk_and(&x, &y).unwrap(), m.mk_or(&x, &y).unwrap());
}

#[test]
fn idempotence() {
    let m = BddManager::new(3);
    let x = m.mk_var(0).unwrap();
    let y = m.mk_var(1).unwrap();
    let b = m.mk_iff(&x, &m.mk_not(&y).unwrap()).unwrap();

    assert_eq!(m.mk_and(&b, &b).unwrap(), b);
    assert_eq!(m.mk_or(&b, &b).unwrap(), b);
    assert_eq!(m.mk_not(&m.mk_not(&b).unwrap()).unwrap(), b);
}

#[test]
fn structural_invariants_on_a_pile_of_formulas() {
    let m = BddManager::new(4);
    let vars: Vec<Bdd> = (0..4u32).map(|i| m.mk_var(i).unwrap()).collect();

    let mut formulas: Vec<Bdd> = vars.clone();
    // A deterministic mix of operations layered on top of each other.
    for round in 0..6usize {
        let a = formulas[round % formulas.len()].clone();
        let b = formulas[(round * 7 + 3) % formulas.len()].clone();
        let f = match round % 3 {
            0 => m.mk_and(&a, &m.mk_not(&b).unwrap()).unwrap(),
            1 => m.mk_or(&m.mk_iff(&a, &b).unwrap(), &a).unwrap(),
            _ => m.mk_ite(&a, &b, &m.mk_not(&a).unwrap()).unwrap(),
        };
        formulas.push(f);
    }

    for f in &formulas {
        assert_reduced_and_ordered(&m, f);
    }
}

#[test]
fn ite_matches_truth_table() {
    let m = BddManager::new(3);
    let c = m.mk_var(0).unwrap();
    let t = m.mk_var(1).unwrap();
    let e = m.mk_var(2).unwrap();

    let f = m.mk_ite(&c, &t, &e).unwrap();
    assert_truth_table(&f, 3, |a| if a[0] { a[1] } else { a[2] });

    // ITE expressed through the other combinators agrees.
    let nc = m.mk_not(&c).unwrap();
    let g = m
        .mk_or(&m.mk_and(&c, &t).unwrap(), &m.mk_and(&nc, &e).unwrap())
        .unwrap();
    assert_eq!(f, g);
}

#[test]
fn exists_is_or_of_cofactors() {
    let m = BddManager::new(4);
    let x1 = m.mk_var(1).unwrap();
    let x2 = m.mk_var(2).unwrap();
    let x3 = m.mk_var(3).unwrap();

    // b = ITE(x0, g, h) with g, h independent of x0, plus a variable that
    // sits above the quantified one to exercise the skip path.
    let g = m.mk_iff(&x1, &x2).unwrap();
    let h = m.mk_and(&x2, &x3).unwrap();
    let b = m.mk_ite(&m.mk_var(0).unwrap(), &g, &h).unwrap();

    let ex = m.mk_exists(0, &b).unwrap();
    let fa = m.mk_forall(0, &b).unwrap();
    assert_eq!(ex, m.mk_or(&g, &h).unwrap());
    assert_eq!(fa, m.mk_and(&g, &h).unwrap());

    // Semantic cross-check against the cofactor definition.
    assert_truth_table(&ex, 4, |a| {
        let f = |x0: bool| {
            if x0 {
                a[1] == a[2]
            } else {
                a[2] && a[3]
            }
        };
        f(false) || f(true)
    });
    assert_truth_table(&fa, 4, |a| {
        let f = |x0: bool| {
            if x0 {
                a[1] == a[2]
            } else {
                a[2] && a[3]
            }
        };
        f(false) && f(true)
    });

    // Quantifying a variable the diagram does not depend on is the identity.
    assert_eq!(m.mk_exists(3, &g).unwrap(), g);
    assert_eq!(m.mk_forall(3, &g).unwrap(), g);
}

#[test]
fn exists_of_conjunction_is_exact_handle() {
    let m = BddManager::new(2);
    let x0 = m.mk_var(0).unwrap();
    let x1 = m.mk_var(1).unwrap();
    let f = m.mk_and(&x0, &x1).unwrap();

    // Not just equivalent: the very same root.
    assert_eq!(m.mk_exists(0, &f).unwrap(), x1);
    assert_eq!(m.mk_exists(1, &f).unwrap(), x0);
}

#[test]
fn multi_variable_projection() {
    let m = BddManager::new(5);
    let vars: Vec<Bdd> = (0..5u32).map(|i| m.mk_var(i).unwrap()).collect();

    // f = (x0 ∧ x1) ∨ (x2 ∧ x3 ∧ ¬x4)
    let c1 = m.mk_and(&vars[0], &vars[1]).unwrap();
    let c2 = m
        .mk_and(
            &m.mk_and(&vars[2], &vars[3]).unwrap(),
            &m.mk_not(&vars[4]).unwrap(),
        )
        .unwrap();
    let f = m.mk_or(&c1, &c2).unwrap();

    // Projecting out the second cube's support leaves x0 ∧ x1 ∨ TRUE-able
    // part: ∃x2x3x4. f == (x0 ∧ x1) ∨ ∃x2x3x4.(x2 ∧ x3 ∧ ¬x4) == TRUE-free.
    let q = m
        .mk_exists_many(&[Var::new(2), Var::new(3), Var::new(4)], &f)
        .unwrap();
    assert!(q.is_true()); // the second cube is satisfiable on its own

    // Universal projection keeps only what holds for every x2, x3, x4.
    let u = m
        .mk_forall_many(&[Var::new(2), Var::new(3), Var::new(4)], &f)
        .unwrap();
    assert_eq!(u, c1);
}

#[test]
fn counting_identities() {
    let m = BddManager::new(5);
    let x = m.mk_var(0).unwrap();
    let y = m.mk_var(2).unwrap();
    let z = m.mk_var(4).unwrap();

    let f = m
        .mk_or(&m.mk_and(&x, &y).unwrap(), &m.mk_iff(&y, &z).unwrap())
        .unwrap();

    // Brute force over all 2^5 assignments.
    let mut expected = 0u32;
    for bits in 0..32u32 {
        let a: Vec<bool> = (0..5).map(|i| bits >> i & 1 == 1).collect();
        if (a[0] && a[2]) || (a[2] == a[4]) {
            expected += 1;
        }
    }
    assert_eq!(f.dnf_size(), BigUint::from(expected));

    // dnf + cnf partition the assignment space.
    assert_eq!(f.dnf_size() + f.cnf_size(), BigUint::from(32u32));

    // ...and so do the counts of a function and its complement.
    let nf = m.mk_not(&f).unwrap();
    assert_eq!(f.dnf_size() + nf.dnf_size(), BigUint::from(32u32));

    assert_eq!(m.mk_true().dnf_size(), BigUint::from(1u32));
    assert_eq!(m.mk_true().cnf_size(), BigUint::from(0u32));
    assert_eq!(m.mk_false().dnf_size(), BigUint::from(0u32));
}

#[test]
fn gc_triggered_mid_sequence_preserves_held_handles() {
    let m = BddManager::new(10);
    // A tight ceiling, so collections fire from allocation pressure inside
    // the apply recursion rather than from explicit calls.
    m.set_max_num_nodes(2200);

    let vars: Vec<Bdd> = (0..10u32).map(|i| m.mk_var(i).unwrap()).collect();
    let parity = {
        let mut acc = m.mk_false();
        for v in &vars {
            acc = m.mk_ite(v, &m.mk_not(&acc).unwrap(), &acc).unwrap();
        }
        acc
    };

    // Churn: build and immediately drop a distinct cube per round. Dropped
    // cubes pile up as garbage until the free list runs dry, so collections
    // run while `parity` is the only thing worth keeping.
    for round in 0..600u32 {
        let mut cube = m.mk_true();
        for (j, v) in vars.iter().enumerate() {
            let lit = if round >> j & 1 == 1 {
                v.clone()
            } else {
                m.mk_not(v).unwrap()
            };
            cube = m.mk_and(&cube, &lit).unwrap();
        }
    }

    // The held handle still denotes the parity function.
    assert_truth_table(&parity, 10, |a| {
        a.iter().filter(|&&bit| bit).count() % 2 == 1
    });
    assert!(m.check_invariants());
}

#[test]
fn mem_out_is_surfaced_and_recoverable() {
    let m = BddManager::new(10);
    m.set_max_num_nodes(96);

    let mut kept: Vec<Bdd> = Vec::new();
    let mut saw_mem_out = false;
    'outer: for i in 0..400u32 {
        let mut cube = m.mk_true();
        for j in 0..10u32 {
            let lit = if (i.wrapping_mul(2654435761) >> j) & 1 == 1 {
                m.mk_var(j).unwrap()
            } else {
                m.mk_nvar(j).unwrap()
            };
            match m.mk_and(&cube, &lit) {
                Ok(next) => cube = next,
                Err(MemOut) => {
                    saw_mem_out = true;
                    break 'outer;
                }
            }
        }
        kept.push(cube);
    }
    assert!(saw_mem_out, "the node ceiling never triggered");

    // Releasing live handles makes the manager usable again.
    kept.clear();
    m.collect_garbage();
    let x = m.mk_var(0).unwrap();
    let y = m.mk_var(1).unwrap();
    let f = m.mk_and(&x, &y).unwrap();
    assert_eq!(f.dnf_size(), BigUint::from(256u32)); // 2^8 free variables
    assert!(m.check_invariants());
}

#[test]
fn reorder_keeps_handles_and_semantics() {
    let m = BddManager::new(8);
    // (x0 ∧ x4) ∨ (x1 ∧ x5) ∨ (x2 ∧ x6) ∨ (x3 ∧ x7): the classic case where
    // pairing the variables up shrinks the diagram dramatically.
    let mut f = m.mk_false();
    for i in 0..4u32 {
        let a = m.mk_var(i).unwrap();
        let b = m.mk_var(i + 4).unwrap();
        f = m.mk_or(&f, &m.mk_and(&a, &b).unwrap()).unwrap();
    }

    let count_before = f.dnf_size();
    let size_before = m.num_nodes();
    m.try_reorder().unwrap();

    assert!(m.check_invariants());
    assert!(m.num_nodes() <= size_before);
    assert_truth_table(&f, 8, |a| {
        (a[0] && a[4]) || (a[1] && a[5]) || (a[2] && a[6]) || (a[3] && a[7])
    });
    // Counts are order-independent.
    assert_eq!(f.dnf_size(), count_before);

    // The level maps stay mutually inverse.
    for v in 0..8u32 {
        assert_eq!(m.var_at(m.level_of(v)), Var::new(v));
    }

    // Canonicity under the new order: a rebuild lands on the same root.
    let mut g = m.mk_false();
    for i in 0..4u32 {
        let a = m.mk_var(i).unwrap();
        let b = m.mk_var(i + 4).unwrap();
        g = m.mk_or(&g, &m.mk_and(&a, &b).unwrap()).unwrap();
    }
    assert_eq!(f, g);
}

#[test]
fn operations_after_reorder_agree_with_fresh_manager() {
    let m = BddManager::new(6);
    let mut f = m.mk_false();
    for i in 0..3u32 {
        let a = m.mk_var(i).unwrap();
        let b = m.mk_var(i + 3).unwrap();
        f = m.mk_or(&f, &m.mk_and(&a, &b).unwrap()).unwrap();
    }
    m.try_reorder().unwrap();

    // Quantify and combine on the reordered manager.
    // ∃x0x3. f == TRUE: picking x0 = x3 = 1 satisfies the first pair.
    let q = m
        .mk_exists_many(&[Var::new(0), Var::new(3)], &f)
        .unwrap();
    assert!(q.is_true());

    let u = m
        .mk_forall_many(&[Var::new(0), Var::new(3)], &f)
        .unwrap();
    assert_truth_table(&u, 6, |a| (a[1] && a[4]) || (a[2] && a[5]));
}
