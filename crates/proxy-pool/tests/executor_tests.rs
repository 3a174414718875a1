//! Tests for the bounded parallel executor
//!
//! This module tests:
//! - Input-order preservation under out-of-order completion
//! - Progress callback monotonicity
//! - Per-item failure values
//! - Cancellation semantics

use std::time::Duration;

use proxy_pool::{CancelToken, ParallelExecutor};

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn results_land_at_input_index() {
    let executor = ParallelExecutor::new(4);
    // Later items finish first; indices must still line up.
    let delays = vec![80u64, 60, 40, 20, 10];
    let outcome = executor
        .run(
            delays.clone(),
            |delay| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay
            },
            None,
            None,
        )
        .await;

    assert!(!outcome.cancelled);
    assert_eq!(outcome.completed, delays.len());
    let collected: Vec<u64> = outcome.results.into_iter().map(Option::unwrap).collect();
    assert_eq!(collected, delays);
}

#[tokio::test]
async fn small_batches_run_serially_in_order() {
    let executor = ParallelExecutor::new(8);
    let outcome = executor
        .run(vec!["a", "b"], |s| async move { s.to_uppercase() }, None, None)
        .await;
    assert_eq!(
        outcome.results,
        vec![Some("A".to_string()), Some("B".to_string())]
    );
}

// ============================================================================
// Progress
// ============================================================================

#[tokio::test]
async fn progress_is_a_complete_monotone_sequence() {
    let executor = ParallelExecutor::new(3);
    let items: Vec<u64> = vec![30, 5, 25, 10, 20, 15, 1];
    let mut observed: Vec<(usize, usize)> = Vec::new();

    let mut on_progress = |completed: usize, total: usize| observed.push((completed, total));
    let outcome = executor
        .run(
            items,
            |delay| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay
            },
            Some(&mut on_progress),
            None,
        )
        .await;

    assert_eq!(outcome.completed, 7);
    let expected: Vec<(usize, usize)> = (1..=7).map(|i| (i, 7)).collect();
    assert_eq!(observed, expected);
}

// ============================================================================
// Failure values
// ============================================================================

#[tokio::test]
async fn per_item_failures_do_not_abort_the_batch() {
    let executor = ParallelExecutor::new(4);
    let outcome = executor
        .run(
            vec![1u32, 2, 3, 4, 5],
            |n| async move { n % 2 == 0 },
            None,
            None,
        )
        .await;
    assert_eq!(
        outcome.results,
        vec![Some(false), Some(true), Some(false), Some(true), Some(false)]
    );
    assert_eq!(outcome.completed, 5);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn cancel_mid_batch_keeps_completed_prefix() {
    let executor = ParallelExecutor::new(2);
    let token = CancelToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        canceller.cancel();
    });

    let outcome = executor
        .run(
            vec![1u64, 2, 3, 4, 5, 6, 7, 8],
            |n| async move {
                tokio::time::sleep(Duration::from_millis(n * 25)).await;
                n
            },
            None,
            Some(&token),
        )
        .await;

    assert!(outcome.cancelled);
    assert!(outcome.completed < 8, "cancel should stop the batch early");
    let kept: usize = outcome.results.iter().filter(|r| r.is_some()).count();
    assert_eq!(kept, outcome.completed);
}

#[tokio::test]
async fn token_state_is_observable() {
    let token = CancelToken::new();
    assert!(!token.is_cancelled());
    token.cancel();
    assert!(token.is_cancelled());
    // A clone observes the same state.
    assert!(token.clone().is_cancelled());
}
