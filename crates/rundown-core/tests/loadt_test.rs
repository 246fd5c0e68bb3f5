// Load-test adapter: fresh operators per iteration, warm-up exclusion, and
// threshold evaluation over the counters.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use rundown_core::{load_group, loadt, Options, RundownError};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn load_test_counts_iterations() {
    let group = Arc::new(
        load_group(&["testdata/book/quick.yml".to_string()], &Options::new()).await.unwrap(),
    );
    let config = loadt::LoadtConfig {
        concurrent: 2,
        duration: Duration::from_millis(300),
        warm_up: Duration::from_millis(50),
        max_rps: 0,
    };

    let result = loadt::run_load_test(group, &config, CancellationToken::new()).await.unwrap();

    assert!(result.succeeded > 0, "no succeeded iterations");
    assert_eq!(result.failed, 0, "some iterations failed");
    assert_eq!(result.total, result.succeeded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn max_rps_paces_iterations() {
    let group = Arc::new(
        load_group(&["testdata/book/quick.yml".to_string()], &Options::new()).await.unwrap(),
    );
    let config = loadt::LoadtConfig {
        concurrent: 2,
        duration: Duration::from_millis(500),
        warm_up: Duration::ZERO,
        max_rps: 4,
    };

    let result =
        loadt::run_load_test(group, &config, CancellationToken::new()).await.unwrap();
    // Four starts per second for half a second, plus scheduling slack.
    assert!(result.total <= 5, "total was {}", result.total);
}

#[tokio::test]
async fn threshold_passes_and_violates() {
    let ok = loadt::LoadtResult { succeeded: 11, ..Default::default() };
    assert!(ok.check_threshold("succeeded > 10").is_ok());

    let bad = loadt::LoadtResult { failed: 10, ..Default::default() };
    let err = bad.check_threshold("failed < 10").unwrap_err();
    assert!(matches!(err, RundownError::ThresholdViolated { .. }));

    let empty = loadt::LoadtResult::default();
    assert!(empty.check_threshold("").is_ok());
}
