use metrics_exporter_prometheus::PrometheusBuilder;

#[test]
fn store_calls_record_latency() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    metrics::with_local_recorder(&recorder, || {
        rt.block_on(async {
            let tmp = tempfile::NamedTempFile::new().unwrap();
            let store = common::store::KvStore::open(tmp.path().to_str().unwrap(), 1)
                .await
                .unwrap();

            let meta = common::types::SyncMeta {
                points_synced: 3,
                last_sync_ms: Some(1),
            };
            store.persist_sync_meta(&meta, 1).await.unwrap();
            assert_eq!(store.load_sync_meta().await.unwrap(), meta);
        });
    });

    let rendered = handle.render();
    assert!(
        rendered.contains("tracker_store_latency_ms"),
        "expected tracker_store_latency_ms in rendered metrics, got:\n{rendered}"
    );
    assert!(
        rendered.contains("store.put"),
        "expected the store.put op label, got:\n{rendered}"
    );
}
