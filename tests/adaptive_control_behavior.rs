//! Behavior-driven tests for adaptive rate and concurrency control.
//!
//! These tests verify HOW the controller, the shared token bucket and the
//! stage executor react to throttling, using tokio's paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use secmap_core::{
    Adjustment, AdaptiveController, Bounds, ControllerConfig, LookupError, LookupPipeline,
    Resolution, RetryPolicy, RunMetrics, Stage, StageExecutor, TokenBucket, UnresolvedReason,
};
use tokio::time::Instant;

fn pipeline_for(controller: &Arc<AdaptiveController>, metrics: &Arc<RunMetrics>) -> LookupPipeline {
    LookupPipeline::new(
        Arc::clone(controller),
        Arc::clone(metrics),
        RetryPolicy::immediate(1),
        RetryPolicy::immediate(1),
    )
    .with_jitter(Duration::ZERO, Duration::ZERO)
}

fn without_pacing(mut config: ControllerConfig) -> ControllerConfig {
    let zero = Bounds::new(Duration::ZERO, Duration::ZERO, Duration::ZERO);
    config.identity.delay = zero;
    config.sector.delay = zero;
    config
}

// =============================================================================
// Controller: Back-off and Scale-up
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_a_window_is_throttled_every_knob_backs_off_one_step() {
    // Given: A controller at its defaults
    let controller = AdaptiveController::with_limiter(ControllerConfig::default());

    // When: A window with 10 of 120 calls throttled closes
    let adjustment = controller.observe_window(120, 10);

    // Then: Workers, delays and rate each move one step toward safety
    assert_eq!(
        adjustment,
        Adjustment::BackedOff {
            throttled_streak: 1,
            stopped: false,
        }
    );
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.identity_workers, 1);
    assert_eq!(snapshot.sector_workers, 2);
    assert_eq!(snapshot.identity_delay_ms, 260);
    assert_eq!(snapshot.sector_delay_ms, 300);
    assert!((snapshot.global_rate - 1.3).abs() < 1e-9);
    assert!((controller.limiter().rate() - 1.3).abs() < 1e-9);

    // And: A cooldown of the configured length is pending
    let remaining = controller.cooldown_remaining().expect("cooldown pending");
    assert_eq!(remaining, Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn when_windows_stay_healthy_the_controller_scales_up_only_to_its_ceilings() {
    // Given: A controller that has backed off twice
    let controller = AdaptiveController::with_limiter(ControllerConfig::default());
    controller.observe_window(120, 60);
    controller.observe_window(120, 60);

    // When: Many healthy windows follow
    let adjustments: Vec<_> = (0..30).map(|_| controller.observe_window(120, 0)).collect();

    // Then: Every third healthy window scales up
    assert_eq!(adjustments[0], Adjustment::Healthy { healthy_streak: 1 });
    assert_eq!(adjustments[1], Adjustment::Healthy { healthy_streak: 2 });
    assert_eq!(adjustments[2], Adjustment::ScaledUp);

    // And: Knobs settle at their maxima and minima, never beyond
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.identity_workers, 4);
    assert_eq!(snapshot.sector_workers, 5);
    assert_eq!(snapshot.identity_delay_ms, 80);
    assert_eq!(snapshot.sector_delay_ms, 100);
    assert!((snapshot.global_rate - 1.5).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn when_a_healthy_window_interrupts_throttling_the_breaker_count_restarts() {
    // Given: Five consecutive throttled windows, one short of the breaker
    let controller = AdaptiveController::with_limiter(ControllerConfig::default());
    for _ in 0..5 {
        controller.observe_window(120, 20);
    }

    // When: One healthy window closes, then five more throttled ones
    controller.observe_window(120, 0);
    for _ in 0..5 {
        controller.observe_window(120, 20);
    }

    // Then: The run is still allowed to continue
    assert!(!controller.is_stopped());

    // When: A sixth consecutive throttled window closes
    let adjustment = controller.observe_window(120, 20);

    // Then: The breaker trips
    assert_eq!(
        adjustment,
        Adjustment::BackedOff {
            throttled_streak: 6,
            stopped: true,
        }
    );
    assert!(controller.is_stopped());
}

#[test]
fn when_a_window_is_empty_it_is_ignored() {
    let controller = AdaptiveController::with_limiter(ControllerConfig::default());

    assert_eq!(controller.observe_window(0, 0), Adjustment::Ignored);
    assert_eq!(controller.snapshot().healthy_streak, 0);
}

// =============================================================================
// Limiter and Pipeline: Pacing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_many_workers_share_the_limiter_the_global_rate_holds() {
    // Given: Four workers sharing a 2/s bucket with a burst of 2
    let mut config = without_pacing(ControllerConfig::default());
    config.identity.workers = Bounds::new(4, 1, 4);
    config.rate = Bounds::new(2.0, 0.5, 2.0);
    config.burst = 2;
    let controller = Arc::new(AdaptiveController::with_limiter(config));
    let metrics = Arc::new(RunMetrics::new());
    let pipeline = pipeline_for(&controller, &metrics);
    let executor = StageExecutor::new(Arc::clone(&controller), Arc::clone(&metrics));

    // When: Twenty instant lookups run
    let started = Instant::now();
    let results = executor
        .run(Stage::Identity, (0..20).collect(), |item: u32| {
            let pipeline = &pipeline;
            async move {
                match pipeline
                    .call(Stage::Identity, || async move { Ok::<_, LookupError>(item) })
                    .await
                {
                    Ok(value) => Resolution::Resolved(value),
                    Err(reason) => Resolution::Unresolved(reason),
                }
            }
        })
        .await;

    // Then: The burst goes out at once and the rest at the refill rate
    assert_eq!(results.len(), 20);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(9), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "elapsed {elapsed:?}");
    assert_eq!(metrics.snapshot().requests_total, 20);
}

#[tokio::test(start_paused = true)]
async fn when_a_cooldown_is_pending_calls_wait_it_out() {
    // Given: A throttled window has just closed
    let controller = Arc::new(AdaptiveController::with_limiter(without_pacing(
        ControllerConfig::default(),
    )));
    let metrics = Arc::new(RunMetrics::new());
    let pipeline = pipeline_for(&controller, &metrics);
    controller.observe_window(120, 30);

    // When: A call is made
    let started = Instant::now();
    let value = pipeline
        .call(Stage::Sector, || async { Ok::<_, LookupError>("XOM") })
        .await
        .expect("call succeeds");

    // Then: It went out only after the cooldown
    assert_eq!(value, "XOM");
    assert!(started.elapsed() >= Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn when_the_breaker_has_tripped_calls_are_not_made() {
    // Given: A controller that has stopped
    let mut config = without_pacing(ControllerConfig::default());
    config.max_throttled_windows = 1;
    let controller = Arc::new(AdaptiveController::with_limiter(config));
    let metrics = Arc::new(RunMetrics::new());
    let pipeline = pipeline_for(&controller, &metrics);
    controller.observe_window(10, 10);
    let calls = AtomicUsize::new(0);

    // When: A call is attempted
    let result = pipeline
        .call(Stage::Identity, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, LookupError>(()) }
        })
        .await;

    // Then: It ends as stopped without reaching the provider
    assert_eq!(result, Err(UnresolvedReason::StoppedDueToThrottle));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(metrics.snapshot().requests_total, 0);
}

#[tokio::test(start_paused = true)]
async fn when_the_rate_is_lowered_waits_grow_accordingly() {
    // Given: An empty bucket at 2/s
    let bucket = TokenBucket::new(2.0, 1);
    bucket.acquire().await;

    // When: The rate drops to 0.5/s
    bucket.set_rate(0.5);
    let started = Instant::now();
    bucket.acquire().await;

    // Then: The next token takes about two seconds
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(1_900), "waited {waited:?}");
    assert!(waited <= Duration::from_millis(2_100), "waited {waited:?}");
}
