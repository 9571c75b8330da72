mod support;

use std::collections::HashSet;
use std::sync::OnceLock;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use postcache::cache::{CacheConfig, CacheKey, FetchError};
use postcache::domain::entities::FetchedBatch;
use postcache::infra::telemetry;
use serial_test::serial;

use support::{FakeRemote, T0, harness, post};

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        telemetry::describe_metrics();
        snapshotter
    })
}

/// `name{label=value}` for every recorded series.
fn series() -> HashSet<String> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| {
            let key = composite_key.key();
            let labels: Vec<String> = key
                .labels()
                .map(|label| format!("{}={}", label.key(), label.value()))
                .collect();
            format!("{}{{{}}}", key.name(), labels.join(","))
        })
        .collect()
}

fn counter_value(name: &str) -> u64 {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(composite_key, _, _, _)| composite_key.key().name() == name)
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(value) => value,
            _ => 0,
        })
        .sum()
}

#[tokio::test]
#[serial]
async fn reads_and_refreshes_emit_labelled_metrics() {
    let _ = snapshotter();
    let h = harness(FakeRemote::new(), CacheConfig::default());
    h.remote.respond(
        CacheKey::AllPosts,
        Ok(FetchedBatch::posts(vec![post(1, 1, None, T0)])),
    );
    h.remote
        .respond(CacheKey::Categories, Err(FetchError::Timeout));

    h.manager
        .get_or_refresh(&CacheKey::AllPosts)
        .await
        .expect("missing read");
    h.manager
        .get_or_refresh(&CacheKey::AllPosts)
        .await
        .expect("fresh read");
    h.manager
        .get_or_refresh(&CacheKey::Categories)
        .await
        .expect_err("refresh fails with nothing cached");

    let names = series();
    for expected in [
        "postcache_read_total{freshness=missing}",
        "postcache_read_total{freshness=fresh}",
        "postcache_refresh_total{result=ok}",
        "postcache_refresh_total{result=error}",
        "postcache_refresh_ms{class=posts}",
        "postcache_refresh_ms{class=categories}",
    ] {
        assert!(names.contains(expected), "missing series: {expected}");
    }
}

#[tokio::test]
#[serial]
async fn joined_refreshes_and_evictions_are_counted() {
    let _ = snapshotter();
    let joined_before = counter_value("postcache_refresh_joined_total");

    let h = harness(FakeRemote::gated(), CacheConfig::default());
    let first = tokio::spawn({
        let manager = h.manager.clone();
        async move { manager.refresh(&CacheKey::AllPosts).await }
    });
    h.remote.wait_for_calls(1).await;
    let second = tokio::spawn({
        let manager = h.manager.clone();
        async move { manager.refresh(&CacheKey::AllPosts).await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    h.remote.release(1);
    first.await.expect("task").expect("refresh");
    second.await.expect("task").expect("joined refresh");

    assert_eq!(
        counter_value("postcache_refresh_joined_total") - joined_before,
        1
    );

    h.manager.clear_all_cache().await.expect("clear");
    assert!(series().contains("postcache_evicted_rows_total{table=metadata}"));
}
