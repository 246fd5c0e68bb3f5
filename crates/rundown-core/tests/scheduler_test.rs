// Scheduler: stable IDs over the set, selection options, and the concurrency
// bound over parallel operators.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use rundown_core::{load_group, Capturer, Concurrency, Options, Shuffle};

fn sleep_books() -> Vec<String> {
    ["a", "b", "c", "d"]
        .iter()
        .map(|s| format!("testdata/book/sleep_{s}.yml"))
        .collect()
}

/// Tracks how many runbooks are in flight at once.
#[derive(Default)]
struct InFlight {
    current: AtomicIsize,
    max: AtomicIsize,
}

impl Capturer for InFlight {
    fn on_runbook_start(&self, _id: &str, _desc: &str, _path: Option<&std::path::Path>) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn on_runbook_end(&self, _id: &str, _s: usize, _f: usize, _sk: usize) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn group_ids_are_unique_and_stable() {
    let group = load_group(&sleep_books(), &Options::new()).await.unwrap();
    let ids: Vec<String> = group.operators().iter().map(|o| o.id().to_string()).collect();
    assert_eq!(ids.len(), 4);

    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 4);

    // Reloading the same set reproduces the same IDs.
    let again = load_group(&sleep_books(), &Options::new()).await.unwrap();
    let ids_again: Vec<String> = again.operators().iter().map(|o| o.id().to_string()).collect();
    assert_eq!(ids, ids_again);
}

#[tokio::test]
async fn glob_pattern_expands_to_matching_books() {
    let group =
        load_group(&["testdata/book/sleep_*.yml".to_string()], &Options::new()).await.unwrap();
    assert_eq!(group.len(), 4);
}

#[tokio::test]
async fn sample_takes_first_k() {
    let opts = Options::new().sample(2);
    let group = load_group(&sleep_books(), &opts).await.unwrap();
    assert_eq!(group.selected_indices().unwrap().len(), 2);
}

#[tokio::test]
async fn label_filter_admits_only_matching_books() {
    let opts = Options::new().run_label("sleepy");
    let group = load_group(&sleep_books(), &opts).await.unwrap();
    // Only sleep_a and sleep_b carry the label.
    assert_eq!(group.selected_indices().unwrap().len(), 2);
}

#[tokio::test]
async fn path_filter_admits_by_regex() {
    let opts = Options::new().run_match("sleep_(a|c)");
    let group = load_group(&sleep_books(), &opts).await.unwrap();
    assert_eq!(group.selected_indices().unwrap().len(), 2);
}

#[tokio::test]
async fn seeded_shuffle_is_deterministic() {
    let opts = Options::new().shuffle(Shuffle::Seed(7));
    let first = load_group(&sleep_books(), &opts).await.unwrap().selected_indices().unwrap();
    let second = load_group(&sleep_books(), &opts).await.unwrap().selected_indices().unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn shards_partition_the_set() {
    let mut total = 0;
    for index in 0..3 {
        let opts = Options::new().shard(index, 3);
        let group = load_group(&sleep_books(), &opts).await.unwrap();
        total += group.selected_indices().unwrap().len();
    }
    assert_eq!(total, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_bound_is_respected() {
    let in_flight = Arc::new(InFlight::default());
    let opts = Options::new()
        .concurrent(Concurrency::Max(2))
        .capturer(in_flight.clone());

    let mut group = load_group(&sleep_books(), &opts).await.unwrap();
    let result = group.run_all(CancellationToken::new()).await.unwrap();

    assert_eq!(result.results.len(), 4);
    assert!(result.ok());
    let max = in_flight.max.load(Ordering::SeqCst);
    assert!(max <= 2, "max in-flight was {max}");
    assert!(max >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_mode_never_overlaps() {
    let in_flight = Arc::new(InFlight::default());
    let opts = Options::new().capturer(in_flight.clone());

    let mut group = load_group(&sleep_books(), &opts).await.unwrap();
    let result = group.run_all(CancellationToken::new()).await.unwrap();

    assert_eq!(result.succeeded(), 4);
    assert_eq!(in_flight.max.load(Ordering::SeqCst), 1);
}

/// Records runbook start order.
#[derive(Default)]
struct StartOrder {
    order: Mutex<Vec<String>>,
}

impl Capturer for StartOrder {
    fn on_runbook_start(&self, _id: &str, desc: &str, _path: Option<&std::path::Path>) {
        self.order.lock().push(desc.to_string());
    }
}

#[tokio::test]
async fn sequential_runs_in_admission_order() {
    let order = Arc::new(StartOrder::default());
    let opts = Options::new().capturer(order.clone());
    let mut group = load_group(&sleep_books(), &opts).await.unwrap();
    group.run_all(CancellationToken::new()).await.unwrap();
    assert_eq!(*order.order.lock(), vec!["Sleep A", "Sleep B", "Sleep C", "Sleep D"]);
}
