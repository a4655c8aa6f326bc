use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gradwalk::{Buffer, DType, Graph, Layout, TensorError, TensorId};

fn random(rng: &mut StdRng, n: usize, lo: f32, hi: f32) -> Vec<f32> {
    (0..n).map(|_| rng.random_range(lo..hi)).collect()
}

/// Compares the backward pass against central differences of the loss that
/// `build` computes from a single input of `shape`.
fn check_gradient(shape: &[usize], x0: &[f32], build: impl Fn(&mut Graph, TensorId) -> TensorId) {
    let loss_at = |x: &[f32]| {
        let mut g = Graph::new();
        let v = g.leaf(shape, x.to_vec(), false).unwrap();
        let l = build(&mut g, v);
        g.values(l)[0]
    };

    let mut g = Graph::new();
    let v = g.leaf(shape, x0.to_vec(), true).unwrap();
    let l = build(&mut g, v);
    g.backward(l);
    let analytic = g.grad(v).unwrap();

    let h = 1e-2;
    for i in 0..x0.len() {
        let mut plus = x0.to_vec();
        plus[i] += h;
        let mut minus = x0.to_vec();
        minus[i] -= h;
        let numeric = (loss_at(&plus) - loss_at(&minus)) / (2.0 * h);
        assert_abs_diff_eq!(analytic[i], numeric, epsilon = 1e-2 * (1.0 + numeric.abs()));
    }
}

#[test]
fn test_leaf_creation() {
    let mut g = Graph::new();
    let t = g.leaf(&[2, 2], vec![1.0, 2.0, 3.0, 4.0], false).unwrap();
    assert_eq!(g.tensor(t).shape(), &[2, 2]);
    assert_eq!(g.tensor(t).dtype(), DType::F32);
    assert_eq!(g.values(t), vec![1.0, 2.0, 3.0, 4.0]);
    assert!(g.grad(t).is_none());
}

#[test]
fn test_leaf_shape_mismatch_is_an_error() {
    let mut g = Graph::new();
    let err = g.leaf(&[2, 2], vec![1.0, 2.0, 3.0], false).unwrap_err();
    assert_eq!(
        err,
        TensorError::LengthMismatch {
            shape: vec![2, 2],
            expected: 4,
            actual: 3
        }
    );
    assert!(matches!(g.leaf(&[], vec![], false), Err(TensorError::UnsupportedRank(0))));
}

#[test]
fn test_strided_leaf_gradient_follows_its_layout() {
    let mut g = Graph::new();
    // every other element of a 6-element buffer, as a [3] vector
    let layout = Layout::strided(&[3], &[2], 0).unwrap();
    let x = g.leaf_strided(layout, vec![1.0, 9.0, 2.0, 9.0, 3.0, 9.0], true).unwrap();
    assert_eq!(g.values(x), vec![1.0, 2.0, 3.0]);

    let w = g.leaf(&[3], vec![10.0, 20.0, 30.0], false).unwrap();
    let y = g.mul(x, w).unwrap();
    let s = g.sum(y).unwrap();
    g.backward(s);

    assert_eq!(g.grad(x).unwrap(), vec![10.0, 20.0, 30.0]);
    assert_eq!(
        g.tensor(x).grad_buffer().unwrap(),
        &[10.0, 0.0, 20.0, 0.0, 30.0, 0.0]
    );
}

#[test]
fn test_forward_values_through_broadcasting() {
    let mut g = Graph::new();
    let a = g.leaf(&[2, 1], vec![2.0, 4.0], false).unwrap();
    let b = g.leaf(&[3], vec![1.0, 2.0, 4.0], false).unwrap();
    let q = g.div(a, b).unwrap();
    assert_eq!(g.tensor(q).shape(), &[2, 3]);
    assert_eq!(g.values(q), vec![2.0, 1.0, 0.5, 4.0, 2.0, 1.0]);

    let d = g.sub(b, a).unwrap();
    assert_eq!(g.values(d), vec![-1.0, 0.0, 2.0, -3.0, -2.0, 0.0]);

    let n = g.neg(d).unwrap();
    let s = g.sum(n).unwrap();
    assert_eq!(g.values(s), vec![4.0]);
}

#[test]
fn test_integer_pipeline_stays_integer() {
    let mut g = Graph::new();
    let a = g.leaf_typed(&[2, 2], vec![1i32, 2, 3, 4], false).unwrap();
    let b = g.leaf_typed(&[2], vec![10i32, 20], false).unwrap();
    let c = g.add(a, b).unwrap();
    let m = g.matmul(c, a).unwrap();
    let s = g.sum(m).unwrap();
    assert_eq!(g.tensor(s).data(), &Buffer::I32(vec![394]));
    assert!(!g.tensor(s).should_grad());
}

#[test]
fn test_product_and_quotient_match_finite_differences() {
    let mut rng = StdRng::seed_from_u64(17);
    let x0 = random(&mut rng, 6, 0.5, 1.5);
    let other = random(&mut rng, 3, 0.5, 1.5);

    check_gradient(&[2, 3], &x0, |g, x| {
        let o = g.leaf(&[3], other.clone(), false).unwrap();
        let p = g.mul(x, o).unwrap();
        let q = g.div(p, x).unwrap();
        let r = g.div(o, x).unwrap();
        let t = g.add(q, r).unwrap();
        let u = g.mul(t, x).unwrap();
        g.sum(u).unwrap()
    });
}

#[test]
fn test_subtraction_matches_finite_differences() {
    let mut rng = StdRng::seed_from_u64(3);
    let x0 = random(&mut rng, 4, -1.0, 1.0);

    check_gradient(&[4, 1], &x0, |g, x| {
        let k = g.leaf(&[3], vec![1.0, 2.0, 3.0], false).unwrap();
        let d = g.sub(k, x).unwrap();
        let sq = g.mul(d, d).unwrap();
        g.sum(sq).unwrap()
    });
}

#[test]
fn test_batched_matmul_matches_finite_differences() {
    let mut rng = StdRng::seed_from_u64(42);
    let a0 = random(&mut rng, 2 * 3 * 4, -1.0, 1.0);
    let b0 = random(&mut rng, 4 * 2, -1.0, 1.0);

    // gradient with respect to the batched left operand
    check_gradient(&[2, 3, 4], &a0, |g, a| {
        let b = g.leaf(&[4, 2], b0.clone(), false).unwrap();
        let c = g.matmul(a, b).unwrap();
        let sq = g.mul(c, c).unwrap();
        g.sum(sq).unwrap()
    });

    // gradient with respect to the right operand shared by both batches
    check_gradient(&[4, 2], &b0, |g, b| {
        let a = g.leaf(&[2, 3, 4], a0.clone(), false).unwrap();
        let c = g.matmul(a, b).unwrap();
        let sq = g.mul(c, c).unwrap();
        g.sum(sq).unwrap()
    });
}

#[test]
fn test_vector_matmul_matches_finite_differences() {
    let mut rng = StdRng::seed_from_u64(5);
    let v0 = random(&mut rng, 3, -1.0, 1.0);
    let m0 = random(&mut rng, 2 * 3 * 2, -1.0, 1.0);

    check_gradient(&[3], &v0, |g, v| {
        let m = g.leaf(&[2, 3, 2], m0.clone(), false).unwrap();
        let y = g.matmul(v, m).unwrap();
        let sq = g.mul(y, y).unwrap();
        g.sum(sq).unwrap()
    });

    check_gradient(&[2], &v0[..2], |g, w| {
        let m = g.leaf(&[2, 3, 2], m0.clone(), false).unwrap();
        let y = g.matmul(m, w).unwrap();
        let sq = g.mul(y, y).unwrap();
        g.sum(sq).unwrap()
    });
}

#[test]
fn test_training_loop_converges() {
    let mut rng = StdRng::seed_from_u64(11);
    let xs = random(&mut rng, 8 * 3, -1.0, 1.0);
    let true_w = [0.5f32, -1.0, 2.0];
    let ys: Vec<f32> = xs
        .chunks(3)
        .map(|row| row.iter().zip(true_w).map(|(x, w)| x * w).sum())
        .collect();

    let mut w = vec![0.0f32; 3];
    let mut losses = Vec::new();
    for _ in 0..1000 {
        let mut g = Graph::new();
        let x = g.leaf(&[8, 3], xs.clone(), false).unwrap();
        let y = g.leaf(&[8, 1], ys.clone(), false).unwrap();
        let wt = g.leaf(&[3, 1], w.clone(), true).unwrap();
        let pred = g.matmul(x, wt).unwrap();
        let err = g.sub(pred, y).unwrap();
        let sq = g.mul(err, err).unwrap();
        let loss = g.sum(sq).unwrap();
        g.backward(loss);

        losses.push(g.values(loss)[0]);
        let grad = g.grad(wt).unwrap();
        for (wi, gi) in w.iter_mut().zip(grad) {
            *wi -= 0.05 * gi;
        }
    }

    let last = losses[losses.len() - 1];
    assert!(last < losses[0]);
    assert!(last < 1e-3, "loss stayed at {last}");
    for (got, want) in w.iter().zip(true_w) {
        assert_abs_diff_eq!(*got, want, epsilon = 1e-2);
    }
}
