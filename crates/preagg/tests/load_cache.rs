mod common;

use common::*;
use preagg::{LoaderOptions, OrchestratorOptions, SqlQuery};
use serde_json::json;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_concurrent_listings_share_one_driver_call() {
    let h = Harness::new();
    h.source.add_table(SCHEMA, &raw_build("a", "b", 1));
    h.source.set_list_delay(Duration::from_secs(1));
    let cache = h.orchestrator.load_cache();
    let descriptor = orders_rollup();

    let (first, second) = tokio::join!(
        cache.table_listing(&descriptor, false),
        cache.table_listing(&descriptor, false)
    );

    assert_eq!(first.unwrap(), vec![raw_build("a", "b", 1)]);
    assert_eq!(second.unwrap(), vec![raw_build("a", "b", 1)]);
    assert_eq!(h.source.calls_starting_with("list_tables").len(), 1);
}

#[tokio::test]
async fn test_listing_is_shared_across_batches_until_renewed() {
    let h = Harness::new();
    let descriptor = orders_rollup();

    assert!(h.orchestrator.load_cache().table_listing(&descriptor, false).await.unwrap().is_empty());
    h.source.add_table(SCHEMA, &raw_build("a", "b", 1));
    assert!(h.orchestrator.load_cache().table_listing(&descriptor, false).await.unwrap().is_empty());
    assert_eq!(h.source.calls_starting_with("list_tables").len(), 1);

    let renewed = h.orchestrator.load_cache().table_listing(&descriptor, true).await.unwrap();
    assert_eq!(renewed, vec![raw_build("a", "b", 1)]);
    assert_eq!(h.source.calls_starting_with("list_tables").len(), 2);

    let cached = h.orchestrator.load_cache().table_listing(&descriptor, false).await.unwrap();
    assert_eq!(cached, renewed);
}

#[tokio::test]
async fn test_local_and_external_listings_are_separate() {
    let h = Harness::new();
    h.source.add_table(SCHEMA, &raw_build("local", "v", 1));
    h.external.add_table(SCHEMA, &raw_build("ext", "v", 2));
    let cache = h.orchestrator.load_cache();

    let local = cache.version_entries(&orders_rollup()).await.unwrap();
    let external = cache.version_entries(&orders_rollup().external()).await.unwrap();

    assert_eq!(local.len(), 1);
    assert_eq!(local[0].content_version, "local");
    assert_eq!(external.len(), 1);
    assert_eq!(external[0].content_version, "ext");
}

#[tokio::test]
async fn test_version_entries_skip_foreign_tables() {
    let h = Harness::new();
    h.source.add_table(SCHEMA, "scratch");
    h.source.add_table(SCHEMA, &raw_build("old", "v", 1_000));
    h.source.add_table(SCHEMA, &raw_build("new", "v", 2_000));

    let entries = h.orchestrator.load_cache().version_entries(&orders_rollup()).await.unwrap();

    let contents: Vec<&str> = entries.iter().map(|e| e.content_version.as_str()).collect();
    assert_eq!(contents, vec!["new", "old"]);
    assert!(entries.iter().all(|e| e.table_name == TABLE));
}

#[tokio::test]
async fn test_reset_reloads_memoized_entries() {
    let h = Harness::new();
    let cache = h.orchestrator.load_cache();
    let descriptor = orders_rollup();

    assert!(cache.version_entries(&descriptor).await.unwrap().is_empty());
    h.source.add_table(SCHEMA, &raw_build("a", "b", 1));
    assert!(cache.version_entries(&descriptor).await.unwrap().is_empty());

    cache.reset(&descriptor).await.unwrap();
    assert_eq!(cache.version_entries(&descriptor).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_key_queries_run_once_per_batch() {
    let h = Harness::new();
    h.query_cache.set_value(KEY_SQL, json!([{"max": 7}]));
    let cache = h.orchestrator.load_cache();
    let key_query = SqlQuery::new(KEY_SQL);

    assert!(!cache.has_key_query_result(&key_query).await);
    let first = cache.key_query_result(&key_query, false, 10, None).await.unwrap();
    let second = cache.key_query_result(&key_query, true, 0, Some(5)).await.unwrap();

    assert_eq!(first, json!([{"max": 7}]));
    assert_eq!(first, second);
    assert!(cache.has_key_query_result(&key_query).await);

    let calls = h.query_cache.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.renewal_threshold, 120);
    assert_eq!(calls[0].1.priority, 10);
    assert!(!calls[0].1.wait_for_renew);
    assert_eq!(calls[0].1.renewal_key, json!([KEY_SQL, []]));
}

#[tokio::test]
async fn test_renewal_thresholds_follow_precedence() {
    let h = Harness::new();
    let mut descriptor = orders_rollup().with_key_query(SqlQuery::new("SELECT max(updated_at) FROM orders"));
    descriptor.refresh_key_renewal_thresholds = vec![Some(30), None];

    let loader = h.orchestrator.loader(
        descriptor.clone(),
        h.orchestrator.load_cache(),
        Vec::new(),
        LoaderOptions {
            wait_for_renew: true,
            request_id: "thresholds".to_string(),
        },
    );
    _ = loader.load().await.unwrap();

    let thresholds: Vec<(String, u64)> = h
        .query_cache
        .calls()
        .into_iter()
        .map(|(sql, options)| (sql, options.renewal_threshold))
        .collect();
    assert!(thresholds.contains(&(KEY_SQL.to_string(), 30)));
    assert!(thresholds.contains(&("SELECT max(updated_at) FROM orders".to_string(), 120)));

    let options = OrchestratorOptions {
        refresh_key_renewal_threshold: Some(5),
        ..OrchestratorOptions::default()
    };
    let h = Harness::with(MockDriver::writable(), MockDriver::writable(), options);
    let cache = h.orchestrator.load_cache();
    _ = cache.key_query_result(&SqlQuery::new(KEY_SQL), false, 10, Some(30)).await.unwrap();
    assert_eq!(h.query_cache.calls()[0].1.renewal_threshold, 5);
}
