mod common;

use common::{PendingClient, ScriptedClient, TextItem, channel_config, eventually, transmission};
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry_channel::channel::MIN_FLUSH_INTERVAL;
use telemetry_channel::reliability::TransmissionStorage;
use telemetry_channel::sender::HttpResponse;
use telemetry_channel::{ChannelError, Diagnostics, TelemetryChannel};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn test_capacity_three_batch_is_sent_as_one_payload() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::always(200);
    let mut config = channel_config(dir.path());
    config.buffer_capacity = 3;
    let channel = TelemetryChannel::with_client(config, client.clone())
        .await
        .unwrap();
    let mut events = channel.subscribe();

    channel.send(TextItem::new("A"));
    channel.send(TextItem::new("B"));
    channel.send(TextItem::new("C"));

    let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event.status(), Some(200));

    let posted = client.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].text(), "A\nB\nC\n");
    assert_eq!(posted[0].item_count, 3);
    assert!(channel.storage().is_empty());
    assert_eq!(channel.buffered_len(), 0);

    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_items_under_capacity_arrive_in_order_on_flush() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::always(200);
    let mut config = channel_config(dir.path());
    config.buffer_capacity = 100;
    let channel = TelemetryChannel::with_client(config, client.clone())
        .await
        .unwrap();

    let expected: Vec<String> = (0..10).map(|i| format!("{{\"seq\":{i}}}")).collect();
    for line in &expected {
        channel.send(TextItem(line.clone()));
    }
    assert_eq!(channel.buffered_len(), 10);

    channel.flush().await.unwrap();
    let posted = client.wait_for_posts(1, WAIT).await;

    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].lines(), expected);
    channel.shutdown().await.unwrap();
    assert_eq!(client.post_count(), 1);
}

#[tokio::test]
async fn test_reaching_capacity_flushes_before_send_returns() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::always(200);
    let mut config = channel_config(dir.path());
    config.buffer_capacity = 5;
    let channel = TelemetryChannel::with_client(config, client.clone())
        .await
        .unwrap();

    for i in 0..6 {
        channel.send(TextItem(format!("item-{i}")));
    }

    assert_eq!(channel.diagnostics().snapshot().flushes, 1);
    assert_eq!(channel.buffered_len(), 1);

    let posted = client.wait_for_posts(1, WAIT).await;
    assert_eq!(posted[0].item_count, 5);
    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_flush_and_shutdown_on_empty_buffer_make_no_calls() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::always(200);
    let mut config = channel_config(dir.path());
    config.shutdown_timeout = Duration::from_millis(500);
    let channel = TelemetryChannel::with_client(config, client.clone())
        .await
        .unwrap();

    let started = Instant::now();
    channel.flush().await.unwrap();
    channel.shutdown().await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(client.post_count(), 0);
}

#[tokio::test]
async fn test_shutdown_sends_buffered_items_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::always(200);
    let channel = TelemetryChannel::with_client(channel_config(dir.path()), client.clone())
        .await
        .unwrap();

    channel.send(TextItem::new("last words"));
    channel.shutdown().await.unwrap();

    assert_eq!(client.post_count(), 1);
    assert!(channel.is_closed());
    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_send_after_shutdown_is_dropped_and_counted() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::always(200);
    let channel = TelemetryChannel::with_client(channel_config(dir.path()), client.clone())
        .await
        .unwrap();
    channel.shutdown().await.unwrap();

    channel.send(TextItem::new("too late"));

    assert_eq!(channel.buffered_len(), 0);
    let snapshot = channel.diagnostics().snapshot();
    assert_eq!(snapshot.items_dropped, 1);
    assert_eq!(snapshot.items_received, 0);
    assert!(matches!(channel.flush().await, Err(ChannelError::Closed)));
    assert_eq!(client.post_count(), 0);
}

#[tokio::test]
async fn test_developer_mode_sends_each_item_alone() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::always(200);
    let mut config = channel_config(dir.path());
    config.developer_mode = true;
    let channel = TelemetryChannel::with_client(config, client.clone())
        .await
        .unwrap();

    for name in ["one", "two", "three"] {
        channel.send(TextItem::new(name));
    }

    let posted = client.wait_for_posts(3, WAIT).await;
    assert_eq!(posted.len(), 3);
    assert!(posted.iter().all(|p| p.item_count == 1));
    assert_eq!(channel.buffered_len(), 0);
    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_enabling_developer_mode_flushes_buffer() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::always(200);
    let channel = TelemetryChannel::with_client(channel_config(dir.path()), client.clone())
        .await
        .unwrap();

    channel.send(TextItem::new("buffered"));
    channel.set_developer_mode(true);

    let posted = client.wait_for_posts(1, WAIT).await;
    assert_eq!(posted.len(), 1);
    assert!(channel.developer_mode());
    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_busy_sender_falls_back_to_storage() {
    let dir = TempDir::new().unwrap();
    let client = PendingClient::new();
    let mut config = channel_config(dir.path());
    config.sender.capacity = 1;
    config.sender.request_timeout = Duration::from_secs(60);
    config.shutdown_timeout = Duration::from_millis(200);
    let channel = TelemetryChannel::with_client(config, client.clone())
        .await
        .unwrap();

    channel.send(TextItem::new("first"));
    channel.flush().await.unwrap();
    channel.send(TextItem::new("second"));
    channel.flush().await.unwrap();

    assert!(eventually(WAIT, || client.calls() == 1).await);
    assert_eq!(channel.storage().len(), 1);
    let stored = channel.storage().dequeue().await.unwrap();
    assert_eq!(stored.payload().as_ref(), b"second\n");

    // The first send never completes.
    assert!(matches!(
        channel.shutdown().await,
        Err(ChannelError::ShutdownTimeout(_))
    ));
}

#[tokio::test]
async fn test_transient_failure_is_stored_and_retried_by_peeker() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::with_script(vec![HttpResponse::new(503)], 200);
    let mut config = channel_config(dir.path());
    config.peek_interval = Duration::from_millis(50);
    config.backoff.base_delay = Duration::from_millis(50);
    let channel = TelemetryChannel::with_client(config, client.clone())
        .await
        .unwrap();

    channel.send(TextItem::new("retry me"));
    channel.flush().await.unwrap();

    let posted = client.wait_for_posts(2, WAIT).await;
    assert_eq!(posted.len(), 2);
    assert_eq!(posted[0].id, posted[1].id);
    assert_eq!(posted[1].text(), "retry me\n");
    assert!(eventually(WAIT, || channel.storage().is_empty()).await);

    channel.shutdown().await.unwrap();
    let snapshot = channel.diagnostics().snapshot();
    assert_eq!(snapshot.transmissions_transient, 1);
    assert_eq!(snapshot.transmissions_succeeded, 1);
}

#[tokio::test]
async fn test_peeker_drains_storage_left_by_previous_run() {
    let dir = TempDir::new().unwrap();
    let leftover = transmission("from last run\n", 1);
    {
        let storage = TransmissionStorage::new(
            common::storage_config(dir.path(), 1024 * 1024),
            Arc::new(Diagnostics::new()),
        )
        .await
        .unwrap();
        assert!(storage.store(leftover.clone()).await);
    }

    let client = ScriptedClient::always(200);
    let mut config = channel_config(dir.path());
    config.peek_interval = Duration::from_millis(50);
    let channel = TelemetryChannel::with_client(config, client.clone())
        .await
        .unwrap();

    let posted = client.wait_for_posts(1, WAIT).await;
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].id, leftover.id());
    assert!(eventually(WAIT, || channel.storage().is_empty()).await);
    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_flush_timer_follows_interval_changes() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::always(200);
    let channel = TelemetryChannel::with_client(channel_config(dir.path()), client.clone())
        .await
        .unwrap();

    channel.send(TextItem::new("tick"));
    channel.set_flush_interval(Duration::from_millis(50));
    assert_eq!(channel.flush_interval(), Duration::from_millis(50));

    let posted = client.wait_for_posts(1, WAIT).await;
    assert_eq!(posted.len(), 1);
    channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_compressed_payload_round_trips() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::always(200);
    let mut config = channel_config(dir.path());
    config.compression = true;
    let channel = TelemetryChannel::with_client(config, client.clone())
        .await
        .unwrap();

    channel.send(TextItem::new("{\"x\":1}"));
    channel.send(TextItem::new("{\"x\":2}"));
    channel.shutdown().await.unwrap();

    let posted = client.posted();
    assert_eq!(posted.len(), 1);
    assert!(posted[0].compressed);
    assert_eq!(posted[0].lines(), vec!["{\"x\":1}", "{\"x\":2}"]);
}

#[tokio::test]
async fn test_runtime_properties_are_adjustable() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::always(200);
    let channel = TelemetryChannel::with_client(channel_config(dir.path()), client.clone())
        .await
        .unwrap();

    channel.set_buffer_capacity(2);
    channel.set_sender_capacity(4);
    channel.set_storage_capacity_bytes(4096);
    let endpoint = url::Url::parse("http://collector.internal/v2/track").unwrap();
    channel.set_endpoint_address(endpoint.clone());

    assert_eq!(channel.buffer_capacity(), 2);
    assert_eq!(channel.sender_capacity(), 4);
    assert_eq!(channel.storage_capacity_bytes(), 4096);
    assert_eq!(channel.endpoint_address(), endpoint);

    channel.send(TextItem::new("a"));
    channel.send(TextItem::new("b"));
    let posted = client.wait_for_posts(1, WAIT).await;
    assert_eq!(posted[0].item_count, 2);
    channel.shutdown().await.unwrap();
}

#[cfg(feature = "metrics")]
#[tokio::test]
async fn test_prometheus_text_reflects_deliveries_and_drops() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::always(200);
    let channel = TelemetryChannel::with_client(channel_config(dir.path()), client.clone())
        .await
        .unwrap();

    channel.send(TextItem::new("counted"));
    channel.shutdown().await.unwrap();
    channel.send(TextItem::new("after close"));

    let text = channel.diagnostics().gather_text();
    assert!(text.contains("telemetry_items_received_total 1"), "{text}");
    assert!(
        text.contains("telemetry_transmissions_total{outcome=\"success\"} 1"),
        "{text}"
    );
    assert!(
        text.contains("telemetry_items_dropped_total{reason=\"closed\"} 1"),
        "{text}"
    );
    assert!(channel.diagnostics().metrics().is_some());
}

#[tokio::test]
async fn test_zero_flush_interval_is_raised_to_the_minimum() {
    let dir = TempDir::new().unwrap();
    let client = ScriptedClient::always(200);
    let mut config = channel_config(dir.path());
    config.flush_interval = Duration::ZERO;
    let channel = TelemetryChannel::with_client(config, client.clone())
        .await
        .unwrap();
    assert_eq!(channel.flush_interval(), MIN_FLUSH_INTERVAL);

    channel.set_flush_interval(Duration::from_secs(3600));
    channel.set_flush_interval(Duration::ZERO);
    assert_eq!(channel.flush_interval(), MIN_FLUSH_INTERVAL);

    channel.send(TextItem::new("soon"));
    let posted = client.wait_for_posts(1, WAIT).await;
    assert_eq!(posted.len(), 1);
    channel.shutdown().await.unwrap();
}
