use std::{
    collections::{HashMap, HashSet},
    mem,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

use super::{
    backend::{build_backend, Backend, SweepReport},
    backoff::ExponentialBackoff,
    fanout::spawn_fanout_task,
    inbox::{Inbox, Push, SubscriptionId},
    registry::{Attach, Registry},
    stats::{HubStats, HubStatsSnapshot},
    subscription::{Replay, SubscribeOptions, Subscription},
    sweeper::spawn_sweeper_task,
    ChannelName, Message, MessageId,
};
use crate::{HubConfig, HubError};

/// Хаб каналов: реестр подписок, публикация и фоновые задачи.
///
/// Клонирование дешёвое, все клоны работают с одним хабом.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: HubConfig,
    backend: Arc<dyn Backend>,
    registry: Arc<Registry>,
    stats: Arc<HubStats>,
    next_id: AtomicU64,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    publisher: Mutex<Option<PublishWorker>>,
}

/// Фоновая очередь публикаций для `broadcast`.
struct PublishWorker {
    tx: mpsc::UnboundedSender<Broadcast>,
    handle: JoinHandle<()>,
}

struct Broadcast {
    channels: Vec<ChannelName>,
    payload: Bytes,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Hub {
    /// Создаёт хаб с бэкендом из конфигурации.
    ///
    /// Некорректная конфигурация возвращает `Configuration`, недоступный
    /// Redis даёт `BackendUnavailable`.
    pub async fn new(config: HubConfig) -> Result<Self, HubError> {
        config.validate()?;
        let backend = build_backend(&config).await?;
        Self::with_backend(config, backend)
    }

    /// Создаёт хаб с готовым бэкендом. Требует контекста Tokio.
    pub fn with_backend(
        config: HubConfig,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, HubError> {
        config.validate()?;

        let stats = Arc::new(HubStats::default());
        let registry = Arc::new(Registry::new(stats.clone()));
        let (shutdown, _) = watch::channel(false);

        let stream = backend.subscribe_stream(registry.interest(), registry.clone());
        let tasks = vec![
            spawn_fanout_task(stream, registry.clone(), stats.clone(), shutdown.subscribe()),
            spawn_sweeper_task(
                backend.clone(),
                stats.clone(),
                config.sweep_interval,
                shutdown.subscribe(),
            ),
        ];

        info!(
            backend = backend.name(),
            max_backlog = config.max_backlog,
            idle_ttl_ms = config.idle_ttl.as_millis() as u64,
            sweep_interval_ms = config.sweep_interval.as_millis() as u64,
            queue_capacity = config.queue_capacity,
            overflow = %config.overflow,
            "Channels hub started"
        );

        let inner = Arc::new_cyclic(|weak: &Weak<HubInner>| {
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = spawn_publish_worker(weak.clone(), rx);
            HubInner {
                config,
                backend,
                registry,
                stats,
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                shutdown,
                tasks: Mutex::new(tasks),
                publisher: Mutex::new(Some(PublishWorker { tx, handle })),
            }
        });

        Ok(Self { inner })
    }

    /// Подписка на каналы; `replay` запрашивает всю хранимую историю.
    pub async fn subscribe<I, C>(
        &self,
        channels: I,
        replay: bool,
    ) -> Result<Subscription, HubError>
    where
        I: IntoIterator<Item = C>,
        C: Into<ChannelName>,
    {
        let replay = if replay { Replay::All } else { Replay::None };
        self.subscribe_with(channels, SubscribeOptions::replay(replay))
            .await
    }

    /// Подписка с параметрами.
    ///
    /// При воспроизведении история каждого канала ставится в очередь раньше
    /// любого живого сообщения, а живые повторы истории отбрасываются.
    pub async fn subscribe_with<I, C>(
        &self,
        channels: I,
        options: SubscribeOptions,
    ) -> Result<Subscription, HubError>
    where
        I: IntoIterator<Item = C>,
        C: Into<ChannelName>,
    {
        let inner = &self.inner;
        inner.ensure_open()?;

        let mut seen = HashSet::new();
        let channels: Vec<ChannelName> = channels
            .into_iter()
            .map(Into::<ChannelName>::into)
            .filter(|c| seen.insert(c.clone()))
            .collect();

        let replay_limit = match options.replay {
            Replay::None => None,
            Replay::Last(n) => Some(n.min(inner.config.max_backlog)),
            Replay::All => Some(inner.config.max_backlog),
        };

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let inbox = Arc::new(Inbox::new(
            id,
            inner.config.queue_capacity,
            inner.config.overflow,
            replay_limit.is_some(),
        ));

        // Курсор берётся для каждого канала, даже если у него сейчас есть
        // подписчики: к моменту регистрации канал может опустеть, и бэкенд с
        // циклом чтения начнёт его заново с этого курсора, а не с начала.
        let mut cursors = inner.start_cursors(&channels).await?;
        while let Err(missing) = inner.registry.register(inbox.clone(), &channels, &cursors) {
            cursors.extend(inner.start_cursors(&missing).await?);
        }

        // Handle создаётся сразу: при отмене или ошибке ниже его Drop
        // снимет регистрацию.
        let subscription = Subscription::new(inbox.clone(), Arc::downgrade(&inner.registry));

        if inner.closed.load(Ordering::Acquire) {
            return Err(HubError::Closed);
        }

        if let Some(limit) = replay_limit {
            let mut history = Vec::new();
            for channel in &channels {
                history.extend(inner.backend.history(channel, limit).await?);
            }
            let replayed = history.len();
            if inbox.finish_replay(history) == Push::Overflow {
                inner.registry.disconnect_slow(&inbox);
            }
            debug!(subscription = id, replayed, "Replayed channel history");

            // Живые сообщения, пришедшие во время воспроизведения, переполнили
            // очередь при политике disconnect.
            if inbox.is_slow_consumer() {
                return Err(HubError::SlowConsumer {
                    subscription: id,
                    capacity: inbox.capacity(),
                });
            }
        }

        Ok(subscription)
    }

    /// Добавляет каналы к живой подписке; приходят только новые сообщения.
    ///
    /// Каналы, на которые подписка уже подписана, пропускаются. Возвращает
    /// действительно добавленные каналы. Снятая подписка даёт `Closed`.
    pub async fn subscribe_more<I, C>(
        &self,
        subscription: &Subscription,
        channels: I,
    ) -> Result<Vec<ChannelName>, HubError>
    where
        I: IntoIterator<Item = C>,
        C: Into<ChannelName>,
    {
        let inner = &self.inner;
        inner.ensure_open()?;
        let mut seen = HashSet::new();
        let channels: Vec<ChannelName> = channels
            .into_iter()
            .map(Into::<ChannelName>::into)
            .filter(|c| seen.insert(c.clone()))
            .collect();

        let mut cursors = inner.start_cursors(&channels).await?;
        let attached = loop {
            match inner.registry.attach(subscription.id(), &channels, &cursors) {
                Ok(attached) => break attached,
                Err(missing) => cursors.extend(inner.start_cursors(&missing).await?),
            }
        };

        match attached {
            Attach::Attached(added) => Ok(added),
            Attach::Gone => Err(HubError::Closed),
        }
    }

    /// Снимает подписку. Повторный вызов ничего не делает.
    pub fn unsubscribe(
        &self,
        subscription: &Subscription,
    ) {
        self.inner.registry.unregister(subscription.id());
    }

    /// Отписывает подписку от части каналов, не закрывая её.
    ///
    /// Возвращает каналы, от которых подписка действительно отписана. Для
    /// снятой подписки ничего не делает.
    pub fn unsubscribe_channels<I, C>(
        &self,
        subscription: &Subscription,
        channels: I,
    ) -> Vec<ChannelName>
    where
        I: IntoIterator<Item = C>,
        C: Into<ChannelName>,
    {
        let channels: Vec<ChannelName> = channels.into_iter().map(Into::into).collect();
        self.inner
            .registry
            .detach(subscription.id(), &channels)
            .unwrap_or_default()
    }

    /// Публикует сообщение и возвращает его с назначенным id.
    ///
    /// Транзиентные ошибки бэкенда повторяются с экспоненциальной задержкой;
    /// `BackendUnavailable` возвращается после исчерпания попыток.
    pub async fn publish(
        &self,
        channel: impl Into<ChannelName>,
        payload: impl Into<Bytes>,
    ) -> Result<Message, HubError> {
        self.inner.ensure_open()?;
        self.inner
            .publish_with_retry(&channel.into(), payload.into())
            .await
    }

    /// Публикует сообщение в несколько каналов в фоне, не дожидаясь
    /// бэкенда. Остановка хаба дожидается отправки очереди.
    pub fn broadcast<I, C>(
        &self,
        channels: I,
        payload: impl Into<Bytes>,
    ) -> Result<(), HubError>
    where
        I: IntoIterator<Item = C>,
        C: Into<ChannelName>,
    {
        self.inner.ensure_open()?;
        let job = Broadcast {
            channels: channels.into_iter().map(Into::<ChannelName>::into).collect(),
            payload: payload.into(),
        };

        let publisher = self.inner.publisher.lock();
        match publisher.as_ref() {
            Some(worker) => worker.tx.send(job).map_err(|_| HubError::Closed),
            None => Err(HubError::Closed),
        }
    }

    /// До `limit` последних сообщений канала, от старых к новым.
    pub async fn history(
        &self,
        channel: impl Into<ChannelName>,
        limit: usize,
    ) -> Result<Vec<Message>, HubError> {
        self.inner.ensure_open()?;
        self.inner.backend.history(&channel.into(), limit).await
    }

    pub fn subscriber_count(
        &self,
        channel: &str,
    ) -> usize {
        self.inner.registry.subscriber_count(channel)
    }

    /// Каналы, на которые есть подписчики.
    pub fn channels(&self) -> Vec<ChannelName> {
        self.inner.registry.channels()
    }

    /// Каналы подписки; `None`, если она снята.
    pub fn subscriptions_of(
        &self,
        id: SubscriptionId,
    ) -> Option<Vec<ChannelName>> {
        self.inner.registry.subscriptions_of(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.subscription_count()
    }

    /// Удаляет все каналы бэкенда. Подписки остаются активными.
    pub async fn flush_all(&self) -> Result<usize, HubError> {
        self.inner.ensure_open()?;
        let removed = self.inner.backend.flush_all().await?;
        info!(removed, "Flushed all channels");
        Ok(removed)
    }

    /// Внеплановый проход сборки мусора.
    pub async fn sweep_now(&self) -> Result<SweepReport, HubError> {
        self.inner.ensure_open()?;
        let report = self.inner.backend.sweep().await?;
        self.inner.stats.record_swept(report.removed);
        Ok(report)
    }

    pub fn stats(&self) -> HubStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Останавливает хаб.
    ///
    /// Порядок: новые операции отклоняются, очередь `broadcast`
    /// дописывается, фоновые задачи останавливаются, подписки закрываются,
    /// бэкенд освобождает соединения. Повторный вызов ничего не делает.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down channels hub");

        let worker = inner.publisher.lock().take();
        if let Some(PublishWorker { tx, handle }) = worker {
            drop(tx);
            if let Err(e) = handle.await {
                error!(error = %e, "Publish worker panicked");
            }
        }

        inner.shutdown.send_replace(true);
        let tasks = mem::take(&mut *inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task panicked");
            }
        }

        let closed = inner.registry.close_all();
        inner.backend.shutdown().await;

        info!(subscriptions = closed, "Channels hub stopped");
    }
}

impl HubInner {
    fn ensure_open(&self) -> Result<(), HubError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubError::Closed);
        }
        Ok(())
    }

    /// Id последней записи каждого канала: с него бэкенд начнёт читать
    /// канал, если тот станет новым для хаба.
    async fn start_cursors(
        &self,
        channels: &[ChannelName],
    ) -> Result<HashMap<ChannelName, MessageId>, HubError> {
        let mut cursors = HashMap::with_capacity(channels.len());
        for channel in channels {
            let latest = self.backend.latest_id(channel).await?;
            cursors.insert(channel.clone(), latest);
        }
        Ok(cursors)
    }

    async fn publish_with_retry(
        &self,
        channel: &ChannelName,
        payload: Bytes,
    ) -> Result<Message, HubError> {
        let mut backoff = ExponentialBackoff::new(self.config.retry_initial, self.config.retry_max);

        loop {
            match self.backend.publish(channel, payload.clone()).await {
                Ok(message) => {
                    self.stats.record_published();
                    trace!(channel = %channel, id = %message.id, "Message published");
                    return Ok(message);
                }
                Err(err) => {
                    self.stats.record_backend_error();
                    if !err.is_retryable() || backoff.attempt() >= self.config.publish_retries {
                        warn!(channel = %channel, error = %err, "Publish failed");
                        return Err(err);
                    }

                    let delay = backoff.next_delay();
                    debug!(
                        channel = %channel,
                        error = %err,
                        attempt = backoff.attempt(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Retrying publish"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn spawn_publish_worker(
    hub: Weak<HubInner>,
    mut rx: mpsc::UnboundedReceiver<Broadcast>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Broadcast { channels, payload }) = rx.recv().await {
            let Some(inner) = hub.upgrade() else {
                break;
            };
            for channel in channels {
                if let Err(err) = inner.publish_with_retry(&channel, payload.clone()).await {
                    warn!(channel = %channel, error = %err, "Broadcast publish dropped");
                }
            }
        }
    })
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Drop for HubInner {
    fn drop(&mut self) {
        // Хаб сброшен без shutdown: фоновые задачи останавливаются сами
        self.shutdown.send_replace(true);
        self.registry.close_all();
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("backend", &self.backend_name())
            .field("subscriptions", &self.subscription_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
