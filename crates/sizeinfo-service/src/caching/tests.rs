use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture};
use serde_json::json;
use sizeinfo_test::{MockResponse, SizeInfoServer};
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::download::SizeInfoFetcher;
use crate::normalize::RawPayload;

use super::*;

type Outcome = Result<RawPayload, FetchError>;

#[derive(Default)]
struct FakeState {
    calls: AtomicUsize,
    outcomes: Mutex<HashMap<(String, String), VecDeque<Outcome>>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

/// A fetcher that counts its calls and answers with scripted outcomes.
///
/// Unscripted garments fail with a `404` status.
#[derive(Clone, Default)]
struct FakeFetcher {
    state: Arc<FakeState>,
}

impl FakeFetcher {
    /// Queues outcomes for a garment. The last one is repeated forever.
    fn script(&self, garment_id: &str, brand: &str, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state
            .outcomes
            .lock()
            .unwrap()
            .entry((garment_id.to_owned(), brand.to_owned()))
            .or_default()
            .extend(outcomes);
    }

    /// Blocks all following requests until permits are added to the returned semaphore.
    fn close_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.state.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    async fn wait_for_calls(&self, calls: usize) {
        while self.calls() < calls {
            tokio::task::yield_now().await;
        }
    }
}

impl SizeInfoFetcher for FakeFetcher {
    fn fetch<'a>(&'a self, garment_id: &'a str, brand: &'a str) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            self.state.calls.fetch_add(1, Ordering::SeqCst);

            let gate = self.state.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.acquire().await.unwrap().forget();
            }

            let mut outcomes = self.state.outcomes.lock().unwrap();
            let queue = outcomes.get_mut(&(garment_id.to_owned(), brand.to_owned()));
            match queue {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some(queue) => queue.front().cloned().unwrap(),
                None => Err(FetchError::Status(404)),
            }
        })
    }
}

struct PanickingFetcher;

fn explode() -> Outcome {
    panic!("fetcher exploded")
}

impl SizeInfoFetcher for PanickingFetcher {
    fn fetch<'a>(&'a self, _garment_id: &'a str, _brand: &'a str) -> BoxFuture<'a, Outcome> {
        Box::pin(async { explode() })
    }
}

fn payload(size: &str) -> Outcome {
    Ok(RawPayload {
        size_info: Some(json!(size)),
        ..Default::default()
    })
}

fn manager() -> (SizeInfoManager<FakeFetcher>, FakeFetcher) {
    let fetcher = FakeFetcher::default();
    (SizeInfoManager::new(fetcher.clone()), fetcher)
}

#[tokio::test]
async fn test_concurrent_lookups_coalesce() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G1", "ACME", [payload(r#"[{"尺寸":"S"}]"#)]);

    let results = future::join_all((0..10).map(|_| manager.lookup("G1", "ACME"))).await;

    assert_eq!(fetcher.calls(), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
    }

    let stats = manager.request_stats("G1", "ACME").unwrap();
    assert_eq!(stats.attempts, 10);
    assert_eq!(stats.successes, 1);
    assert_eq!(manager.status().in_flight, 0);
}

#[tokio::test]
async fn test_concurrent_failures_coalesce() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G1", "ACME", [Err(FetchError::Status(500))]);

    let results = future::join_all((0..5).map(|_| manager.lookup("G1", "ACME"))).await;

    assert_eq!(fetcher.calls(), 1);
    for result in results {
        assert_eq!(result, Err(FetchError::Status(500)));
    }
    assert!(!manager.has_data("G1", "ACME"));

    let stats = manager.request_stats("G1", "ACME").unwrap();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.recent_errors.len(), 1);
    assert_eq!(stats.recent_errors[0].message, "HTTP error! status: 500");

    // failures are not cached
    manager.lookup("G1", "ACME").await.unwrap_err();
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coalescing_across_threads() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G1", "ACME", [payload("[]")]);
    let gate = fetcher.close_gate();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.lookup("G1", "ACME").await })
        })
        .collect();

    while manager
        .request_stats("G1", "ACME")
        .is_none_or(|stats| stats.attempts < 16)
    {
        tokio::task::yield_now().await;
    }
    gate.add_permits(1);

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_cache_hit() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G1", "ACME", [payload("[]")]);

    let first = manager.lookup("G1", "ACME").await.unwrap();
    assert!(manager.has_data("G1", "ACME"));
    let second = manager.lookup("G1", "ACME").await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_has_data_does_not_count() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();

    assert!(!manager.has_data("G1", "ACME"));
    assert!(manager.request_stats("G1", "ACME").is_none());
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_invalidate() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G1", "ACME", [payload("[]")]);
    fetcher.script("G2", "ACME", [payload("[]")]);

    manager.lookup("G1", "ACME").await.unwrap();
    manager.lookup("G2", "ACME").await.unwrap();

    manager.invalidate("G1", "ACME");
    assert!(!manager.has_data("G1", "ACME"));
    assert!(manager.has_data("G2", "ACME"));

    manager.lookup("G1", "ACME").await.unwrap();
    assert_eq!(fetcher.calls(), 3);

    // stats survive single invalidations
    assert_eq!(manager.request_stats("G1", "ACME").unwrap().attempts, 2);
}

#[tokio::test]
async fn test_invalidate_during_flight() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G1", "ACME", [payload("[]")]);
    let gate = fetcher.close_gate();

    let lookup = tokio::spawn({
        let manager = manager.clone();
        async move { manager.lookup("G1", "ACME").await }
    });
    fetcher.wait_for_calls(1).await;

    manager.invalidate_all();
    assert_eq!(manager.status().in_flight, 1);

    gate.add_permits(1);
    lookup.await.unwrap().unwrap();

    // the pending request still stores its record, but its stats were cleared
    assert!(manager.has_data("G1", "ACME"));
    assert!(manager.request_stats("G1", "ACME").is_none());
    assert_eq!(manager.status().in_flight, 0);
}

#[tokio::test]
async fn test_invalidate_keeps_pending_request() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G1", "ACME", [payload("[]")]);
    let gate = fetcher.close_gate();

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.lookup("G1", "ACME").await }
    });
    fetcher.wait_for_calls(1).await;

    manager.invalidate("G1", "ACME");
    assert_eq!(manager.status().in_flight, 1);

    let second = tokio::spawn({
        let manager = manager.clone();
        async move { manager.lookup("G1", "ACME").await }
    });
    while manager.request_stats("G1", "ACME").unwrap().attempts < 2 {
        tokio::task::yield_now().await;
    }

    // the second lookup joined the request started before the invalidation
    assert_eq!(manager.status().in_flight, 1);
    assert_eq!(fetcher.calls(), 1);

    gate.add_permits(1);
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    assert!(manager.has_data("G1", "ACME"));
    assert_eq!(manager.status().in_flight, 0);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_invalidate_all() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G1", "ACME", [payload("[]")]);

    manager.lookup("G1", "ACME").await.unwrap();
    manager.lookup("G2", "ACME").await.unwrap_err();

    manager.invalidate_all();

    let status = manager.status();
    assert_eq!(status.cache_size, 0);
    assert!(status.cached_keys.is_empty());
    assert!(status.request_stats.is_empty());

    manager.lookup("G1", "ACME").await.unwrap();
    assert_eq!(fetcher.calls(), 3);
    assert_eq!(manager.request_stats("G1", "ACME").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_force_refresh_waits_for_pending_request() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G1", "ACME", [payload(r#"["old"]"#), payload(r#"["new"]"#)]);
    let gate = fetcher.close_gate();

    let lookup = tokio::spawn({
        let manager = manager.clone();
        async move { manager.lookup("G1", "ACME").await }
    });
    fetcher.wait_for_calls(1).await;

    let refresh = tokio::spawn({
        let manager = manager.clone();
        async move { manager.force_refresh("G1", "ACME").await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!refresh.is_finished());
    assert_eq!(fetcher.calls(), 1);

    gate.add_permits(2);

    let old = lookup.await.unwrap().unwrap();
    let new = refresh.await.unwrap().unwrap();

    assert_eq!(fetcher.calls(), 2);
    assert_eq!(old.size_info, Some(json!(["old"])));
    assert_eq!(new.size_info, Some(json!(["new"])));

    let cached = manager.lookup("G1", "ACME").await.unwrap();
    assert!(Arc::ptr_eq(&new, &cached));
}

#[tokio::test]
async fn test_force_refresh_ignores_pending_failure() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script(
        "G1",
        "ACME",
        [Err(FetchError::Network("connection reset".into())), payload("[]")],
    );
    let gate = fetcher.close_gate();

    let lookup = tokio::spawn({
        let manager = manager.clone();
        async move { manager.lookup("G1", "ACME").await }
    });
    fetcher.wait_for_calls(1).await;

    let refresh = tokio::spawn({
        let manager = manager.clone();
        async move { manager.force_refresh("G1", "ACME").await }
    });
    gate.add_permits(2);

    assert_eq!(
        lookup.await.unwrap(),
        Err(FetchError::Network("connection reset".into()))
    );
    refresh.await.unwrap().unwrap();
    assert_eq!(fetcher.calls(), 2);
    assert!(manager.has_data("G1", "ACME"));
}

#[tokio::test]
async fn test_force_refresh_replaces_entry() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G1", "ACME", [payload(r#"["old"]"#), payload(r#"["new"]"#)]);

    let old = manager.lookup("G1", "ACME").await.unwrap();
    let new = manager.force_refresh("G1", "ACME").await.unwrap();

    assert_eq!(fetcher.calls(), 2);
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(new.size_info, Some(json!(["new"])));
}

#[tokio::test]
async fn test_preload() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G1", "ACME", [payload("[]")]);

    let records = manager.preload([("G1", "ACME"), ("G2", "ACME")]).await;

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].as_ref().unwrap().garment_id, "G1");
    assert!(records[1].is_none());
    assert_eq!(fetcher.calls(), 2);
    assert!(manager.has_data("G1", "ACME"));
}

#[tokio::test]
async fn test_success_rate() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script(
        "G1",
        "ACME",
        [payload("[]"), payload("[]"), Err(FetchError::Status(503))],
    );

    manager.lookup("G1", "ACME").await.unwrap();
    manager.invalidate("G1", "ACME");
    manager.lookup("G1", "ACME").await.unwrap();
    manager.invalidate("G1", "ACME");
    manager.lookup("G1", "ACME").await.unwrap_err();

    let status = manager.status();
    assert_eq!(
        status.request_stats["ACME_G1"],
        StatsSummary {
            attempts: 3,
            successes: 2,
            failures: 1,
            success_rate: "66.67%".into(),
        }
    );

    let stats = manager.request_stats("G1", "ACME").unwrap();
    assert!(stats.last_failure >= stats.last_success);
    assert!(stats.last_attempt.is_some());
}

#[tokio::test]
async fn test_status() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G1", "ACME", [payload("[]")]);
    fetcher.script("G2", "ACME", [payload("[]")]);

    manager.lookup("G1", "ACME").await.unwrap();

    let gate = fetcher.close_gate();
    let lookup = tokio::spawn({
        let manager = manager.clone();
        async move { manager.lookup("G2", "ACME").await }
    });
    fetcher.wait_for_calls(2).await;

    insta::assert_json_snapshot!(manager.status(), @r#"
    {
      "cache_size": 1,
      "in_flight": 1,
      "cached_keys": [
        "ACME_G1"
      ],
      "in_flight_keys": [
        "ACME_G2"
      ],
      "request_stats": {
        "ACME_G1": {
          "attempts": 1,
          "successes": 1,
          "failures": 0,
          "success_rate": "100.00%"
        },
        "ACME_G2": {
          "attempts": 1,
          "successes": 0,
          "failures": 0,
          "success_rate": "0.00%"
        }
      }
    }
    "#);

    gate.add_permits(1);
    lookup.await.unwrap().unwrap();

    let status = manager.status();
    assert_eq!(status.cached_keys, ["ACME_G1", "ACME_G2"]);
    assert!(status.in_flight_keys.is_empty());
}

#[test]
fn test_lookup_outside_runtime() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G1", "ACME", [payload("[]")]);

    let result = futures::executor::block_on(manager.lookup("G1", "ACME"));
    assert_eq!(result.unwrap_err(), FetchError::Internal);

    // the state is still usable
    let status = manager.status();
    assert_eq!(status.in_flight, 0);
    assert_eq!(status.cache_size, 0);
    assert_eq!(fetcher.calls(), 0);

    let stats = manager.request_stats("G1", "ACME").unwrap();
    assert_eq!(stats.attempts, 1);
    assert_eq!(stats.failures, 1);

    let result = futures::executor::block_on(manager.lookup("G1", "ACME"));
    assert_eq!(result.unwrap_err(), FetchError::Internal);
}

#[tokio::test]
async fn test_panicking_fetcher() {
    sizeinfo_test::setup();

    let manager = SizeInfoManager::new(PanickingFetcher);

    let result = manager.lookup("G1", "ACME").await;
    assert_eq!(result, Err(FetchError::Internal));

    // the key is deregistered and the failure recorded
    assert_eq!(manager.status().in_flight, 0);
    let stats = manager.request_stats("G1", "ACME").unwrap();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.recent_errors[0].message, "internal error");
}

#[tokio::test]
async fn test_lookup_example() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G123", "ACME", [payload(r#"[{"尺寸":"S"}]"#)]);

    let record = manager.lookup("G123", "ACME").await.unwrap();

    assert_eq!(record.size_info, Some(json!([{"尺寸": "S"}])));
    assert_eq!(record.unit, "cm");
    assert!(!record.has_attributes);
    assert_eq!(record.gender_garment_id, "M&G123&U");
}

#[tokio::test]
async fn test_malformed_embedded_document() {
    sizeinfo_test::setup();

    let (manager, fetcher) = manager();
    fetcher.script("G1", "ACME", [payload("[{")]);

    let result = manager.lookup("G1", "ACME").await;

    assert!(matches!(result, Err(FetchError::Parse(_))));
    assert!(!manager.has_data("G1", "ACME"));
    assert_eq!(manager.request_stats("G1", "ACME").unwrap().failures, 1);
}

#[tokio::test]
async fn test_http_lookups_coalesce() {
    sizeinfo_test::setup();

    let server = SizeInfoServer::new();
    server.respond(
        "G123",
        "ACME",
        MockResponse::Json(json!({
            "SizeInfo": "[{\"尺寸\":\"S\",\"着丈\":\"60\"}]",
            "ChartInfo": {"type": "top"},
        })),
    );

    let config = Config {
        endpoint: server.endpoint(),
        ..Default::default()
    };
    let manager = SizeInfoManager::from_config(&config).unwrap();

    let results = future::join_all((0..8).map(|_| manager.lookup("G123", "ACME"))).await;
    for result in &results {
        let record = result.as_ref().unwrap();
        assert!(record.has_chart);
        assert_eq!(record.size_rows().unwrap()[0]["着丈"], "60");
    }
    assert_eq!(server.accesses(), 1);

    manager.lookup("G123", "ACME").await.unwrap();
    assert_eq!(server.accesses(), 0);

    let missing = manager.lookup("G404", "ACME").await;
    assert_eq!(missing, Err(FetchError::Status(404)));
    assert_eq!(server.accesses(), 1);
}
