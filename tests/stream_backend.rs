//! Интеграционные тесты бэкенда Redis Streams
//!
//! Запускаются только при заданной переменной `ZUMIC_CHANNELS_REDIS_URL`
//! (например `redis://127.0.0.1:6379`). Каждый тест использует свой префикс
//! ключей и очищает его за собой.

use std::time::Duration;

use bytes::Bytes;
use serial_test::serial;
use tokio::time::timeout;
use zumic_channels::{
    Backend, ChannelName, Hub, HubConfig, HubError, MessageId, StreamBackend, StreamConfig,
    TryRecvError,
};

fn redis_url() -> Option<String> {
    std::env::var("ZUMIC_CHANNELS_REDIS_URL").ok()
}

fn stream_config(
    url: String,
    test: &str,
) -> StreamConfig {
    StreamConfig::new(url)
        .key_prefix(format!("ZUMIC_CHANNELS_TEST_{test}"))
}

async fn hub(
    test: &str,
    tune: impl FnOnce(zumic_channels::HubConfigBuilder) -> zumic_channels::HubConfigBuilder,
) -> Option<Hub> {
    let url = redis_url()?;
    let builder = HubConfig::builder().stream(stream_config(url, test));
    let hub = Hub::new(tune(builder).build()).await.unwrap();
    hub.flush_all().await.unwrap();
    Some(hub)
}

/// Тест проверяет публикацию и доставку через цикл чтения потоков.
#[tokio::test]
#[serial]
async fn test_stream_publish_and_receive() {
    let Some(hub) = hub("publish", |b| b).await else {
        return;
    };
    let sub = hub.subscribe(["news"], false).await.unwrap();

    let mut published = Vec::new();
    for i in 0..5u8 {
        published.push(hub.publish("news", vec![i]).await.unwrap());
    }

    for expected in &published {
        let got = timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("message must arrive")
            .unwrap();
        assert_eq!(got.id, expected.id);
        assert_eq!(got.payload, expected.payload);
    }

    hub.flush_all().await.unwrap();
    hub.shutdown().await;
}

/// Тест проверяет сценарий `max_backlog=1`: поздний подписчик получает
/// только последнее сообщение.
#[tokio::test]
#[serial]
async fn test_stream_replay_with_backlog_of_one() {
    let Some(hub) = hub("replay", |b| b.max_backlog(1)).await else {
        return;
    };
    hub.publish("x", r#"{"a"}"#).await.unwrap();
    hub.publish("x", r#"{"b"}"#).await.unwrap();

    let sub = hub.subscribe(["x"], true).await.unwrap();
    assert_eq!(sub.try_recv().unwrap().payload, Bytes::from_static(br#"{"b"}"#));
    assert_eq!(sub.try_recv(), Err(TryRecvError::Empty));

    hub.flush_all().await.unwrap();
    hub.shutdown().await;
}

/// Тест проверяет, что живые сообщения после воспроизведения не
/// дублируют историю.
#[tokio::test]
#[serial]
async fn test_stream_replay_then_live() {
    let Some(hub) = hub("replay_live", |b| b).await else {
        return;
    };
    let old = hub.publish("x", "old").await.unwrap();
    let sub = hub.subscribe(["x"], true).await.unwrap();
    let new = hub.publish("x", "new").await.unwrap();

    let first = timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
    assert_eq!(first.id, old.id);
    assert_eq!(second.id, new.id);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sub.try_recv(), Err(TryRecvError::Empty));

    hub.flush_all().await.unwrap();
    hub.shutdown().await;
}

/// Тест проверяет, что после обрыва всех соединений хаба (`CLIENT KILL`)
/// цикл чтения переподключается и доставка продолжается с прежнего места.
#[tokio::test]
#[serial]
async fn test_stream_delivery_resumes_after_connection_kill() {
    let Some(hub) = hub("reconnect", |b| {
        b.publish_retries(10)
            .retry_backoff(Duration::from_millis(50), Duration::from_millis(500))
    })
    .await
    else {
        return;
    };
    let sub = hub.subscribe(["x"], false).await.unwrap();

    let before = hub.publish("x", "before").await.unwrap();
    let got = timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
    assert_eq!(got.id, before.id);

    // SKIPME по умолчанию yes: соединение теста переживает команду
    let admin = redis::Client::open(redis_url().unwrap()).unwrap();
    let mut conn = admin.get_multiplexed_async_connection().await.unwrap();
    let killed: usize = redis::cmd("CLIENT")
        .arg("KILL")
        .arg("TYPE")
        .arg("normal")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(killed >= 1);

    let after = hub.publish("x", "after").await.unwrap();
    let got = timeout(Duration::from_secs(15), sub.recv())
        .await
        .expect("delivery must resume after reconnect")
        .unwrap();
    assert_eq!(got.id, after.id);
    assert_eq!(got.payload, Bytes::from_static(b"after"));
    assert!(sub.is_active());

    hub.flush_all().await.unwrap();
    hub.shutdown().await;
}

/// Тест проверяет сценарий истечения: `max_backlog=3`, `idle_ttl=2s`,
/// `sweep_interval=1s`; через 4 секунды история канала пуста.
#[tokio::test]
#[serial]
async fn test_stream_idle_channel_expires() {
    let Some(hub) = hub("expiry", |b| {
        b.max_backlog(3)
            .idle_ttl(Duration::from_secs(2))
            .sweep_interval(Duration::from_secs(1))
    })
    .await
    else {
        return;
    };

    hub.publish("y", "once").await.unwrap();
    assert_eq!(hub.history("y", 10).await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(hub.history("y", 10).await.unwrap().is_empty());

    hub.shutdown().await;
}

/// Тест проверяет проход сборщика напрямую через бэкенд: удаляются только
/// простаивающие каналы своего префикса.
#[tokio::test]
#[serial]
async fn test_stream_sweep_keeps_fresh_channels() {
    let Some(url) = redis_url() else {
        return;
    };
    let backend = StreamBackend::connect(
        stream_config(url, "sweep"),
        10,
        Duration::from_secs(60),
    )
    .await
    .unwrap();
    backend.flush_all().await.unwrap();

    let ch = ChannelName::new("fresh");
    backend.publish(&ch, Bytes::from_static(b"1")).await.unwrap();

    let report = backend.sweep().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.removed, 0);
    assert!(backend.latest_id(&ch).await.unwrap() > MessageId::ZERO);

    assert_eq!(backend.flush_all().await.unwrap(), 1);
    backend.shutdown().await;
}

/// Тест проверяет, что после остановки бэкенд отклоняет операции.
#[tokio::test]
#[serial]
async fn test_stream_backend_closed_after_shutdown() {
    let Some(url) = redis_url() else {
        return;
    };
    let backend = StreamBackend::connect(
        stream_config(url, "closed"),
        10,
        Duration::from_secs(60),
    )
    .await
    .unwrap();
    backend.shutdown().await;

    let err = backend
        .publish(&ChannelName::new("x"), Bytes::from_static(b"1"))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Closed));
}

/// Тест проверяет, что недоступный Redis даёт `BackendUnavailable` при
/// создании хаба.
#[tokio::test]
#[serial]
async fn test_unreachable_redis_fails_fast() {
    let config = HubConfig::builder()
        .stream(StreamConfig::new("redis://127.0.0.1:1"))
        .build();
    let result = timeout(Duration::from_secs(10), Hub::new(config)).await;
    if let Ok(result) = result {
        assert!(matches!(result, Err(HubError::BackendUnavailable { .. })));
    }
}
