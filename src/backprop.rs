//! Reverse-mode backward pass.
//!
//! # The walk
//!
//! A backward pass starts at a root tensor, seeds its gradient with ones and
//! pushes gradients back along the recorded operations until every tracked
//! input has received its share. It runs in two iterative passes over the
//! graph's [`Workspace`]:
//!
//! 1. **Counting.** Every tensor reachable from the root through a
//!    propagating operation is visited once. For each one the pass counts how
//!    many propagating results consume it and validates everything the
//!    gradient rules will later rely on. Nothing is written yet, so a failed
//!    check leaves every gradient untouched.
//! 2. **Propagation.** The root is pushed. Each popped tensor that tracks
//!    gradients and has a rule adds its contribution into each
//!    gradient-tracking operand. An operand is pushed once its last consumer
//!    has contributed, so it forwards its complete gradient exactly once, on
//!    trees and on graphs where one tensor feeds several results alike.
//!
//! Negate, broadcast, transpose and transpose-all are recorded but have no
//! rule; gradients stop at their results.
//!
//! # Workspaces and chains
//!
//! The workspace is kept between passes. Passes with the same
//! [`ChainToken`](crate::ChainToken) reuse its blocks, so after the first
//! training step the walk no longer allocates. See [`crate::workspace`].
//!
//! # Example
//!
//! ```rust
//! use gradwalk::Graph;
//!
//! let mut g = Graph::new();
//! let x = g.leaf(&[2, 3], vec![1.0; 6], true).unwrap();
//! let w = g.leaf(&[3, 1], vec![1.0, 2.0, 3.0], true).unwrap();
//! let y = g.matmul(x, w).unwrap();
//! let loss = g.sum(y).unwrap();
//!
//! for _ in 0..3 {
//!     g.zero_grad();
//!     g.backward(loss);
//! }
//! assert_eq!(g.grad(x).unwrap(), vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
//! assert_eq!(g.grad(w).unwrap(), vec![2.0, 2.0, 2.0]);
//! assert_eq!(g.workspace().stats().runs, 3);
//! ```

pub mod matmul;
pub mod rules;
pub mod scalar;

use log::{debug, trace, warn};

use crate::error::BackwardError;
use crate::tensors::{Graph, Tensor, TensorId};
use crate::workspace::{ChainToken, Workspace};

use self::scalar::{ScalarOp, apply_scalar};

impl Graph {
    /// Accumulates the gradient of `root` into every tracked tensor it
    /// depends on.
    ///
    /// # Panics
    /// Panics with the diagnostic if the pass cannot run; see
    /// [`Graph::try_backward`] for the conditions.
    pub fn backward(&mut self, root: TensorId) {
        if let Err(e) = self.try_backward(root) {
            panic!("backward failed: {e}");
        }
    }

    /// Like [`Graph::backward`], but returns precondition failures instead
    /// of panicking.
    ///
    /// # Errors
    /// Fails if the root is unknown, not `f32` or has no gradient buffer; if
    /// a tracked tensor on the way has no gradient buffer; or if a recorded
    /// operation no longer matches its operands' shapes. No gradient is
    /// written in any of these cases.
    pub fn try_backward(&mut self, root: TensorId) -> Result<(), BackwardError> {
        walk(&mut self.workspace, &mut self.nodes, self.id, root)
    }
}

/// [`Graph::backward`] over a caller-owned workspace.
///
/// # Panics
/// Panics with the diagnostic if the pass cannot run.
pub fn backward_with(workspace: &mut Workspace, graph: &mut Graph, root: TensorId) {
    if let Err(e) = try_backward_with(workspace, graph, root) {
        panic!("backward failed: {e}");
    }
}

/// [`Graph::try_backward`] over a caller-owned workspace.
///
/// # Errors
/// Same conditions as [`Graph::try_backward`].
pub fn try_backward_with(workspace: &mut Workspace, graph: &mut Graph, root: TensorId) -> Result<(), BackwardError> {
    walk(workspace, &mut graph.nodes, graph.id, root)
}

fn walk(ws: &mut Workspace, nodes: &mut [Tensor], graph: u64, root: TensorId) -> Result<(), BackwardError> {
    let r = nodes.get(root.index()).ok_or(BackwardError::UnknownTensor(root))?;
    rules::require_grad(root, r)?;

    let token = ChainToken {
        graph,
        root,
        grad_generation: r.grad_generation,
    };
    ws.begin(token, nodes.len());

    if let Err(e) = count_consumers(ws, nodes, root) {
        debug!("backward from {root:?} rejected: {e}");
        ws.abandon();
        return Err(e);
    }

    let r = &mut nodes[root.index()];
    if let Some(g) = r.grad.as_mut() {
        apply_scalar(g, &r.layout, ScalarOp::Set, 1.0);
    }

    ws.set_walking();
    ws.push(root);
    while !ws.is_empty() {
        let id = ws.pop();
        let t = &nodes[id.index()];
        if !propagates(t) {
            continue;
        }
        let op = t.op;
        trace!("propagating through {id:?} ({:?})", op.kind());

        for (slot, operand) in op.operand_slots().into_iter().enumerate() {
            let Some(operand) = operand else { continue };
            if !nodes[operand.index()].should_grad {
                continue;
            }
            if let Err(e) = rules::propagate(nodes, id, slot, operand) {
                ws.abandon();
                return Err(e);
            }
            if ws.consume(operand) {
                ws.push(operand);
            }
        }
    }

    ws.finish()
}

/// First pass: per-tensor consumer counts plus validation.
fn count_consumers(ws: &mut Workspace, nodes: &[Tensor], root: TensorId) -> Result<(), BackwardError> {
    ws.push(root);
    while !ws.is_empty() {
        let id = ws.pop();
        let t = &nodes[id.index()];
        if !t.should_grad {
            continue;
        }
        match t.op.kind() {
            None => continue,
            Some(kind) if !kind.has_grad_rule() => {
                warn!("{kind:?} has no gradient rule; gradient stops at {id:?}");
                continue;
            }
            Some(_) => {}
        }

        rules::validate(nodes, id)?;
        for operand in t.op.operands() {
            if nodes[operand.index()].should_grad && ws.add_consumer(operand) {
                ws.push(operand);
            }
        }
    }
    Ok(())
}

fn propagates(t: &Tensor) -> bool {
    t.should_grad && t.op.kind().is_some_and(|k| k.has_grad_rule())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkspaceState;

    #[test]
    fn root_is_seeded_with_ones() {
        let mut g = Graph::new();
        let x = g.leaf(&[2, 2], vec![1.0; 4], true).unwrap();
        let y = g.add(x, x).unwrap();
        g.backward(y);
        assert_eq!(g.grad(y).unwrap(), vec![1.0; 4]);
        assert_eq!(g.grad(x).unwrap(), vec![2.0; 4]);
    }

    #[test]
    fn leaf_root_only_gets_seeded() {
        let mut g = Graph::new();
        let x = g.leaf(&[3], vec![0.0; 3], true).unwrap();
        g.backward(x);
        assert_eq!(g.grad(x).unwrap(), vec![1.0; 3]);
        assert_eq!(g.workspace().state(), WorkspaceState::Drained);
    }

    #[test]
    fn integer_root_is_rejected() {
        let mut g = Graph::new();
        let x = g.leaf_typed(&[1], vec![1i32], false).unwrap();
        assert!(matches!(g.try_backward(x), Err(BackwardError::NotFloat { .. })));
    }

    #[test]
    fn untracked_root_is_rejected() {
        let mut g = Graph::new();
        let x = g.leaf(&[1], vec![1.0], false).unwrap();
        assert_eq!(g.try_backward(x), Err(BackwardError::MissingGradient(x)));
    }

    #[test]
    fn unknown_root_is_rejected() {
        let mut g = Graph::new();
        let _ = g.leaf(&[1], vec![1.0], true).unwrap();
        let other = TensorId::from_raw(9);
        assert_eq!(g.try_backward(other), Err(BackwardError::UnknownTensor(other)));
    }

    #[test]
    #[should_panic(expected = "backward failed")]
    fn backward_panics_on_failure() {
        let mut g = Graph::new();
        let x = g.leaf(&[1], vec![1.0], false).unwrap();
        g.backward(x);
    }

    #[test]
    fn failed_pass_writes_nothing_and_resets_the_chain() {
        let mut g = Graph::new();
        let a = g.leaf(&[2], vec![1.0, 2.0], true).unwrap();
        let b = g.leaf(&[2], vec![3.0, 4.0], true).unwrap();
        let c = g.mul(a, b).unwrap();
        let s = g.sum(c).unwrap();
        g.release_grad(b).unwrap();

        assert_eq!(g.try_backward(s), Err(BackwardError::MissingGradient(b)));
        assert_eq!(g.grad(a).unwrap(), vec![0.0, 0.0]);
        assert_eq!(g.grad(s).unwrap(), vec![0.0]);
        assert_eq!(g.workspace().state(), WorkspaceState::Idle);
        assert!(g.workspace().is_empty());
    }

    #[test]
    fn caller_owned_workspace() {
        let mut g = Graph::new();
        let x = g.leaf(&[2], vec![1.0, 2.0], true).unwrap();
        let s = g.sum(x).unwrap();
        let mut ws = Workspace::new();
        backward_with(&mut ws, &mut g, s);
        assert_eq!(g.grad(x).unwrap(), vec![1.0, 1.0]);
        assert_eq!(ws.stats().runs, 1);
        assert_eq!(g.workspace().stats().runs, 0);
    }

    #[test]
    fn no_rule_ops_stop_the_gradient() {
        let mut g = Graph::new();
        let x = g.leaf(&[2], vec![1.0, 2.0], true).unwrap();
        let n = g.neg(x).unwrap();
        let s = g.sum(n).unwrap();
        g.backward(s);
        assert_eq!(g.grad(n).unwrap(), vec![1.0, 1.0]);
        assert_eq!(g.grad(x).unwrap(), vec![0.0, 0.0]);
    }
}
