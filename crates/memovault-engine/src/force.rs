//! The per-thunk force protocol ("black-holing").
//!
//! A cell's slot is the sole serialization point: `force` atomically claims
//! `Unforced → Evaluating`, the winner evaluates outside any lock, and losers
//! block until the winner publishes. Every forcer of the same thunk observes
//! one canonical result or one canonical failure, never a mix.
//!
//! Re-entering a thunk that is already being forced *on the same logical
//! call stack* is an evaluation cycle and surfaces as [`EvalError::Cycle`];
//! a thunk merely being evaluated concurrently on another thread is not a
//! cycle and is simply waited for.

use std::cell::RefCell;

use memovault_values::code::CodeShape;
use memovault_values::{Claim, EvalError, ObjectId, Thunk, Value, ValueRef};

use crate::utils::defer;

thread_local! {
    /// Cells currently being forced by this thread, outermost first.
    static FORCE_STACK: RefCell<Vec<ObjectId>> = const { RefCell::new(Vec::new()) };
}

fn on_own_stack(id: ObjectId) -> bool {
    FORCE_STACK.with(|stack| stack.borrow().contains(&id))
}

/// Tunables for the force protocol.
#[derive(Debug, Clone, Copy)]
pub struct ForcePolicy {
    /// Allow duplicate evaluation of provably cheap thunks instead of
    /// waiting on another thread's in-flight evaluation. The waiter protocol
    /// is a work-saving optimization, not a correctness requirement, when the
    /// duplicated work is a constant leaf.
    pub cheap_duplicate_eval: bool,
}

impl Default for ForcePolicy {
    fn default() -> Self {
        ForcePolicy {
            cheap_duplicate_eval: true,
        }
    }
}

fn is_cheap(thunk: &Thunk) -> bool {
    matches!(&*thunk.code.shape, CodeShape::Leaf(_))
}

/// Force a cell, evaluating its thunk with `eval` if this caller wins the
/// claim. Returns the one canonical outcome for the cell.
pub fn force<F>(cell: &ValueRef, policy: &ForcePolicy, eval: F) -> Result<Value, EvalError>
where
    F: FnOnce(&Thunk) -> Result<Value, EvalError>,
{
    let mut eval = Some(eval);
    loop {
        match cell.try_claim() {
            Claim::Ready(outcome) => return outcome,
            Claim::Claimed(thunk) => {
                let eval = eval.take().expect("claim can only be won once");
                return run_claimed(cell, &thunk, eval);
            }
            Claim::InFlight(thunk) => {
                if on_own_stack(cell.id()) {
                    // Our own forcing chain re-entered this thunk; waiting
                    // would deadlock on ourselves.
                    return Err(EvalError::Cycle);
                }
                if policy.cheap_duplicate_eval && is_cheap(&thunk) {
                    let eval = eval.take().expect("claim can only be won once");
                    return run_duplicate(cell, &thunk, eval);
                }
                cell.wait_while_evaluating();
                // Re-inspect: the slot now holds a result, or was handed to
                // yet another claimant.
            }
        }
    }
}

fn run_claimed<F>(cell: &ValueRef, thunk: &Thunk, eval: F) -> Result<Value, EvalError>
where
    F: FnOnce(&Thunk) -> Result<Value, EvalError>,
{
    FORCE_STACK.with(|stack| stack.borrow_mut().push(cell.id()));
    let _stack_guard = defer(|| {
        FORCE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    });

    // If the evaluation unwinds, waiters must observe a failure rather than
    // block forever on a slot stuck in `Evaluating`.
    let mut abort_guard = defer(|| {
        cell.fulfill(Err(EvalError::Aborted));
    });
    let outcome = eval(thunk);
    abort_guard.disarm();

    cell.fulfill(outcome)
}

/// Duplicate evaluation of a cheap thunk while another thread owns the slot.
/// Whoever publishes first wins; both observe the stored canonical result.
fn run_duplicate<F>(cell: &ValueRef, thunk: &Thunk, eval: F) -> Result<Value, EvalError>
where
    F: FnOnce(&Thunk) -> Result<Value, EvalError>,
{
    FORCE_STACK.with(|stack| stack.borrow_mut().push(cell.id()));
    let _stack_guard = defer(|| {
        FORCE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    });

    let outcome = eval(thunk);
    cell.fulfill(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use memovault_values::{CodeId, CodeRef, EnvFrame, ValueCell};

    fn thunk_cell(shape: CodeShape) -> ValueRef {
        ValueCell::thunk(CodeRef::new(CodeId::fresh(), shape), EnvFrame::root(vec![]))
    }

    fn opaque() -> CodeShape {
        // `Node` is never considered cheap.
        CodeShape::Node {
            op: 0,
            children: vec![],
        }
    }

    #[test]
    fn forcing_twice_evaluates_once() {
        let cell = thunk_cell(opaque());
        let policy = ForcePolicy::default();
        let evals = AtomicUsize::new(0);

        let first = force(&cell, &policy, |_| {
            evals.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int(42))
        })
        .unwrap();
        let second = force(&cell, &policy, |_| {
            evals.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int(42))
        })
        .unwrap();

        assert_eq!(first.as_int(), Some(42));
        assert_eq!(second.as_int(), Some(42));
        assert_eq!(evals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_forcers_observe_one_computation() {
        let cell = thunk_cell(opaque());
        let evals = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let cell = cell.clone();
                let evals = evals.clone();
                scope.spawn(move || {
                    let policy = ForcePolicy::default();
                    let value = force(&cell, &policy, |_| {
                        evals.fetch_add(1, Ordering::SeqCst);
                        // Widen the race window.
                        std::thread::sleep(std::time::Duration::from_millis(10));
                        Ok(Value::Int(7))
                    })
                    .unwrap();
                    assert_eq!(value.as_int(), Some(7));
                });
            }
        });

        assert_eq!(evals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn self_reference_is_a_cycle_not_a_hang() {
        let cell = thunk_cell(opaque());
        let policy = ForcePolicy::default();

        let result = force(&cell, &policy, |_| {
            // The evaluation of this thunk demands the thunk itself.
            force(&cell, &policy, |_| unreachable!("inner force must not evaluate"))
        });
        assert_eq!(result, Err(EvalError::Cycle));

        // The cycle is memoized as this thunk's failure.
        let replay = force(&cell, &policy, |_| unreachable!());
        assert_eq!(replay, Err(EvalError::Cycle));
    }

    #[test]
    fn failures_are_replayed_to_later_forcers() {
        let cell = thunk_cell(opaque());
        let policy = ForcePolicy::default();

        let error = force(&cell, &policy, |_| Err(EvalError::Throw("boom".into())))
            .unwrap_err();
        let replayed = force(&cell, &policy, |_| unreachable!()).unwrap_err();
        assert_eq!(error, replayed);
    }

    #[test]
    fn panicking_evaluation_fails_the_cell_instead_of_hanging_waiters() {
        let cell = thunk_cell(opaque());
        let policy = ForcePolicy::default();

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = force(&cell, &policy, |_| -> Result<Value, EvalError> {
                panic!("evaluator bug")
            });
        }));
        assert!(panicked.is_err());

        let outcome = force(&cell, &policy, |_| unreachable!()).unwrap_err();
        assert_eq!(outcome, EvalError::Aborted);
    }

    #[test]
    fn cheap_thunks_may_evaluate_twice_but_agree() {
        use std::sync::mpsc;

        let cell = thunk_cell(CodeShape::Leaf([1; 32]));
        let policy = ForcePolicy {
            cheap_duplicate_eval: true,
        };

        // Claim the cell on a thread that stalls mid-evaluation.
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        std::thread::scope(|scope| {
            let owner = {
                let cell = cell.clone();
                scope.spawn(move || {
                    force(&cell, &ForcePolicy::default(), |_| {
                        entered_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(Value::Int(5))
                    })
                })
            };
            entered_rx.recv().unwrap();

            // A cheap-path forcer does not wait for the stalled owner.
            let duplicate = force(&cell, &policy, |_| Ok(Value::Int(5))).unwrap();
            assert_eq!(duplicate.as_int(), Some(5));

            release_tx.send(()).unwrap();
            // The stalled owner observes the canonical first-published value.
            let original = owner.join().unwrap().unwrap();
            assert_eq!(original.as_int(), Some(5));
        });
    }
}
