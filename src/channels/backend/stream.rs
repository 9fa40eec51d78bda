use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use redis::{
    aio::{ConnectionManager, MultiplexedConnection},
    streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply},
    AsyncCommands, Client,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{keys, scripts, Backend, Delivery, Interest, MessageStream, SweepReport};
use crate::{
    channels::{backoff::ExponentialBackoff, ChannelName, Message, MessageId},
    HubError, StreamConfig,
};

/// Запас сверх `read_block`, после которого блокирующее чтение считается
/// зависшим.
const READ_GRACE: Duration = Duration::from_secs(2);
/// Подсказка `COUNT` для `SCAN` при сборке мусора.
const SCAN_BATCH: usize = 100;

/// Бэкенд на Redis Streams.
///
/// Каждый канал хранится в отдельном потоке `<prefix>:channel:<name>`.
/// Команды публикации, истории и сборки мусора идут через
/// `ConnectionManager`; блокирующий `XREAD` цикла чтения работает на
/// отдельном соединении, чтобы не задерживать остальные команды.
pub struct StreamBackend {
    client: Client,
    manager: ConnectionManager,
    config: StreamConfig,
    max_backlog: usize,
    idle_ttl: Duration,
    closed: Arc<AtomicBool>,
}

/// Состояние цикла блокирующего чтения.
struct ReadLoop {
    client: Client,
    conn: Option<MultiplexedConnection>,
    prefix: String,
    read_block: Duration,
    read_count: usize,
    interest: watch::Receiver<Interest>,
    cursors: ReadCursors,
    ready: VecDeque<Result<Message, HubError>>,
    backoff: ExponentialBackoff,
    retry_delay: Option<Duration>,
    closed: Arc<AtomicBool>,
}

/// Позиции цикла чтения: последний прочитанный id по каждому каналу
/// интереса.
#[derive(Debug, Default)]
struct ReadCursors {
    positions: HashMap<ChannelName, MessageId>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StreamBackend {
    /// Подключается к Redis. Ошибка подключения возвращается как
    /// `BackendUnavailable`.
    pub async fn connect(
        config: StreamConfig,
        max_backlog: usize,
        idle_ttl: Duration,
    ) -> Result<Self, HubError> {
        let client = Client::open(config.url.as_str())?;
        let manager = ConnectionManager::new(client.clone()).await?;

        info!(
            key_prefix = %config.key_prefix,
            max_backlog,
            idle_ttl_ms = idle_ttl.as_millis() as u64,
            approximate = config.cap_approximate,
            "Connected stream backend"
        );

        Ok(Self {
            client,
            manager,
            config,
            max_backlog: max_backlog.max(1),
            idle_ttl,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn key(
        &self,
        channel: &ChannelName,
    ) -> String {
        keys::stream_key(&self.config.key_prefix, channel)
    }

    fn ensure_open(&self) -> Result<(), HubError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubError::Closed);
        }
        Ok(())
    }

    fn ttl_ms(&self) -> u64 {
        (self.idle_ttl.as_millis() as u64).max(1)
    }

    /// Минимальный id, который ещё считается «свежим», по часам сервера.
    async fn watermark(
        &self,
        conn: &mut ConnectionManager,
    ) -> Result<MessageId, HubError> {
        let (secs, micros): (u64, u64) = redis::cmd("TIME").query_async(conn).await?;
        let now_ms = secs * 1000 + micros / 1000;
        Ok(MessageId::new(now_ms.saturating_sub(self.ttl_ms()), 0))
    }

    /// Одна страница `SCAN` по ключам каналов этого префикса.
    ///
    /// Возвращает следующий курсор (0, если обход завершён) и пачку ключей.
    async fn scan_page(
        &self,
        conn: &mut ConnectionManager,
        cursor: u64,
    ) -> Result<(u64, Vec<String>), HubError> {
        let page = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(keys::sweep_pattern(&self.config.key_prefix))
            .arg("COUNT")
            .arg(SCAN_BATCH)
            .query_async(conn)
            .await?;
        Ok(page)
    }
}

impl ReadCursors {
    /// Приводит набор курсоров к текущему интересу хаба.
    ///
    /// Курсор канала никогда не отступает назад: если канал заново получил
    /// подписчиков, чтение продолжается с большего из двух id.
    fn sync(
        &mut self,
        interest: &Interest,
    ) {
        self.positions
            .retain(|channel, _| interest.contains_key(channel));
        for (channel, start) in interest {
            let cursor = self.positions.entry(channel.clone()).or_insert(*start);
            if *start > *cursor {
                *cursor = *start;
            }
        }
    }

    /// Сдвигает курсор канала на прочитанную запись. Каналы вне интереса и
    /// записи старше курсора не меняют состояние.
    fn advance(
        &mut self,
        channel: &ChannelName,
        id: MessageId,
    ) {
        if let Some(cursor) = self.positions.get_mut(channel) {
            if id > *cursor {
                *cursor = id;
            }
        }
    }

    #[cfg(test)]
    fn get(
        &self,
        channel: &str,
    ) -> Option<MessageId> {
        self.positions.get(channel).copied()
    }

    fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Ключи потоков и id для `XREAD ... STREAMS`.
    fn read_args(
        &self,
        prefix: &str,
    ) -> (Vec<String>, Vec<String>) {
        self.positions
            .iter()
            .map(|(channel, id)| (keys::stream_key(prefix, channel), id.to_string()))
            .unzip()
    }
}

impl ReadLoop {
    fn new(
        client: Client,
        config: &StreamConfig,
        interest: watch::Receiver<Interest>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            client,
            conn: None,
            prefix: config.key_prefix.clone(),
            read_block: config.read_block,
            read_count: config.read_count,
            interest,
            cursors: ReadCursors::default(),
            ready: VecDeque::new(),
            backoff: ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10)),
            retry_delay: None,
            closed,
        }
    }

    async fn next(&mut self) -> Option<Result<Message, HubError>> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(delay) = self.retry_delay.take() {
                tokio::time::sleep(delay).await;
            }

            self.sync_interest();
            if self.cursors.is_empty() {
                // Подписчиков нет: ждём, пока хаб не заинтересуется каналом
                if self.interest.changed().await.is_err() {
                    return None;
                }
                continue;
            }

            if let Err(err) = self.read_batch().await {
                self.conn = None;
                let delay = self.backoff.next_delay();
                warn!(
                    error = %err,
                    attempt = self.backoff.attempt(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Stream read failed, reconnecting"
                );
                self.retry_delay = Some(delay);
                return Some(Err(err));
            }
        }
    }

    fn sync_interest(&mut self) {
        let interest = self.interest.borrow_and_update();
        self.cursors.sync(&interest);
    }

    async fn read_batch(&mut self) -> Result<(), HubError> {
        let (stream_keys, ids) = self.cursors.read_args(&self.prefix);

        if self.conn.is_none() {
            let conn = self.client.get_multiplexed_async_connection().await?;
            debug!(channels = stream_keys.len(), "Stream reader connected");
            self.conn = Some(conn);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };

        let options = StreamReadOptions::default()
            .block(self.read_block.as_millis() as usize)
            .count(self.read_count);
        let read = conn.xread_options::<_, _, Option<StreamReadReply>>(
            stream_keys.as_slice(),
            ids.as_slice(),
            &options,
        );
        let reply = tokio::time::timeout(self.read_block + READ_GRACE, read)
            .await
            .map_err(|_| HubError::BackendUnavailable {
                backend: "stream",
                reason: "blocking read timed out".to_string(),
            })??;

        self.backoff.reset();
        let Some(reply) = reply else {
            return Ok(());
        };

        for stream in reply.keys {
            let Some(channel) = keys::channel_from_key(&self.prefix, &stream.key) else {
                continue;
            };
            for entry in &stream.ids {
                let id = match parse_id(&stream.key, &entry.id) {
                    Ok(id) => id,
                    Err(err) => {
                        self.ready.push_back(Err(err));
                        continue;
                    }
                };
                self.cursors.advance(&channel, id);
                self.ready
                    .push_back(entry_to_message(&stream.key, channel.clone(), id, entry));
            }
        }
        Ok(())
    }
}

fn parse_id(
    key: &str,
    raw: &str,
) -> Result<MessageId, HubError> {
    raw.parse().map_err(|_| HubError::MalformedEntry {
        key: key.to_string(),
        id: raw.to_string(),
        reason: "invalid stream id".to_string(),
    })
}

fn entry_to_message(
    key: &str,
    channel: ChannelName,
    id: MessageId,
    entry: &StreamId,
) -> Result<Message, HubError> {
    let Some(data) = entry.get::<Vec<u8>>("data") else {
        return Err(HubError::MalformedEntry {
            key: key.to_string(),
            id: entry.id.clone(),
            reason: "missing 'data' field".to_string(),
        });
    };
    Ok(Message::new(channel, data, id))
}

////////////////////////////////////////////////////////////////////////////////
// Реализация Backend
////////////////////////////////////////////////////////////////////////////////

#[async_trait]
impl Backend for StreamBackend {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn publish(
        &self,
        channel: &ChannelName,
        payload: Bytes,
    ) -> Result<Message, HubError> {
        self.ensure_open()?;

        let key = self.key(channel);
        let trim = if self.config.cap_approximate { "~" } else { "=" };
        let mut conn = self.manager.clone();

        let raw: String = scripts::PUBLISH
            .key(&key)
            .arg(trim)
            .arg(self.max_backlog)
            .arg(channel.as_str())
            .arg(payload.as_ref())
            .arg(self.ttl_ms())
            .invoke_async(&mut conn)
            .await?;

        let id = parse_id(&key, &raw)?;
        Ok(Message::new(channel.clone(), payload, id))
    }

    async fn history(
        &self,
        channel: &ChannelName,
        limit: usize,
    ) -> Result<Vec<Message>, HubError> {
        self.ensure_open()?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let key = self.key(channel);
        let mut conn = self.manager.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(&key, "+", "-", limit).await?;

        let mut messages = Vec::with_capacity(reply.ids.len());
        for entry in reply.ids.iter().rev() {
            let parsed = parse_id(&key, &entry.id)
                .and_then(|id| entry_to_message(&key, channel.clone(), id, entry));
            match parsed {
                Ok(message) => messages.push(message),
                Err(err) => warn!(error = %err, "Skipping malformed history entry"),
            }
        }
        Ok(messages)
    }

    async fn latest_id(
        &self,
        channel: &ChannelName,
    ) -> Result<MessageId, HubError> {
        self.ensure_open()?;

        let key = self.key(channel);
        let mut conn = self.manager.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(&key, "+", "-", 1).await?;
        match reply.ids.first() {
            Some(entry) => parse_id(&key, &entry.id),
            None => Ok(MessageId::ZERO),
        }
    }

    fn subscribe_stream(
        &self,
        interest: watch::Receiver<Interest>,
        _delivery: Arc<dyn Delivery>,
    ) -> MessageStream {
        let state = ReadLoop::new(
            self.client.clone(),
            &self.config,
            interest,
            self.closed.clone(),
        );

        stream::unfold(state, |mut state| async move {
            let item = state.next().await?;
            Some((item, state))
        })
        .boxed()
    }

    async fn sweep(&self) -> Result<SweepReport, HubError> {
        self.ensure_open()?;

        let mut conn = self.manager.clone();
        let watermark = self.watermark(&mut conn).await?.to_string();
        let mut report = SweepReport::default();
        let mut cursor = 0;

        loop {
            let (next, batch) = self.scan_page(&mut conn, cursor).await?;
            if !batch.is_empty() {
                report.scanned += batch.len();
                let mut invocation = scripts::SWEEP.prepare_invoke();
                for key in &batch {
                    invocation.key(key);
                }
                let removed: usize = invocation.arg(&watermark).invoke_async(&mut conn).await?;
                report.removed += removed;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(
            scanned = report.scanned,
            removed = report.removed,
            "Stream sweep finished"
        );
        Ok(report)
    }

    async fn flush_all(&self) -> Result<usize, HubError> {
        self.ensure_open()?;

        let mut conn = self.manager.clone();
        let mut removed = 0usize;
        let mut cursor = 0;

        loop {
            let (next, batch) = self.scan_page(&mut conn, cursor).await?;
            if !batch.is_empty() {
                let count: usize = conn.del(&batch).await?;
                removed += count;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        info!(removed, "Flushed stream backend channels");
        Ok(removed)
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
