use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::{sync::watch, time::Instant};
use tracing::debug;

use super::{Backend, Delivery, Interest, MessageStream, SweepReport};
use crate::{
    channels::{ChannelName, Message, MessageId},
    HubError,
};

/// Бэкенд в памяти процесса.
///
/// Для каждого канала хранится кольцевой буфер последних `max_backlog`
/// сообщений. Раздача подписчикам происходит прямо в `publish`, под
/// блокировкой канала, поэтому порядок доставки совпадает с порядком id.
pub struct MemoryBackend {
    channels: DashMap<ChannelName, Arc<Mutex<Ring>>>,
    max_backlog: usize,
    idle_ttl: Duration,
    delivery: RwLock<Option<Arc<dyn Delivery>>>,
    /// Наибольший id удалённых буферов. Новый буфер начинает выше него,
    /// чтобы id канала не повторялись после сборки мусора.
    floor: Mutex<MessageId>,
}

struct Ring {
    entries: VecDeque<Message>,
    last_id: MessageId,
    last_publish: Instant,
    /// Буфер удалён из карты сборщиком; писать в него нельзя.
    retired: bool,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl MemoryBackend {
    pub fn new(
        max_backlog: usize,
        idle_ttl: Duration,
    ) -> Self {
        Self {
            channels: DashMap::new(),
            max_backlog: max_backlog.max(1),
            idle_ttl,
            delivery: RwLock::new(None),
            floor: Mutex::new(MessageId::ZERO),
        }
    }

    /// Число каналов с буфером.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn ring(
        &self,
        channel: &ChannelName,
    ) -> Option<Arc<Mutex<Ring>>> {
        self.channels.get(channel).map(|r| r.value().clone())
    }

    fn retire(
        &self,
        ring: &mut Ring,
    ) {
        ring.retired = true;
        let mut floor = self.floor.lock();
        *floor = (*floor).max(ring.last_id);
    }
}

impl Ring {
    fn new(floor: MessageId) -> Self {
        Self {
            entries: VecDeque::new(),
            last_id: floor,
            last_publish: Instant::now(),
            retired: false,
        }
    }

    fn is_idle(
        &self,
        ttl: Duration,
    ) -> bool {
        self.last_publish.elapsed() > ttl
    }
}

fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

////////////////////////////////////////////////////////////////////////////////
// Реализация Backend
////////////////////////////////////////////////////////////////////////////////

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(
        &self,
        channel: &ChannelName,
        payload: Bytes,
    ) -> Result<Message, HubError> {
        let delivery = self.delivery.read().clone();

        loop {
            let ring = self
                .channels
                .entry(channel.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Ring::new(*self.floor.lock()))))
                .value()
                .clone();

            let mut ring = ring.lock();
            if ring.retired {
                // сборщик удалил буфер между поиском и блокировкой
                continue;
            }

            let id = ring.last_id.next_after(now_ms());
            let message = Message::new(channel.clone(), payload, id);

            if ring.entries.len() >= self.max_backlog {
                ring.entries.pop_front();
            }
            ring.entries.push_back(message.clone());
            ring.last_id = id;
            ring.last_publish = Instant::now();

            if let Some(delivery) = &delivery {
                delivery.deliver(message.clone());
            }
            return Ok(message);
        }
    }

    async fn history(
        &self,
        channel: &ChannelName,
        limit: usize,
    ) -> Result<Vec<Message>, HubError> {
        let Some(ring) = self.ring(channel) else {
            return Ok(Vec::new());
        };
        let ring = ring.lock();
        let skip = ring.entries.len().saturating_sub(limit);
        Ok(ring.entries.iter().skip(skip).cloned().collect())
    }

    async fn latest_id(
        &self,
        channel: &ChannelName,
    ) -> Result<MessageId, HubError> {
        Ok(self
            .ring(channel)
            .map(|ring| ring.lock().last_id)
            .unwrap_or(MessageId::ZERO))
    }

    fn subscribe_stream(
        &self,
        _interest: watch::Receiver<Interest>,
        delivery: Arc<dyn Delivery>,
    ) -> MessageStream {
        *self.delivery.write() = Some(delivery);
        stream::pending().boxed()
    }

    async fn sweep(&self) -> Result<SweepReport, HubError> {
        let scanned = self.channels.len();
        let idle: Vec<ChannelName> = self
            .channels
            .iter()
            .filter(|entry| entry.value().lock().is_idle(self.idle_ttl))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for name in idle {
            let gone = self.channels.remove_if(&name, |_, ring| {
                let mut ring = ring.lock();
                // канал мог получить публикацию после первой проверки
                if ring.is_idle(self.idle_ttl) {
                    self.retire(&mut ring);
                    true
                } else {
                    false
                }
            });
            if gone.is_some() {
                debug!(channel = %name, "Removed idle memory channel");
                removed += 1;
            }
        }

        Ok(SweepReport { scanned, removed })
    }

    async fn flush_all(&self) -> Result<usize, HubError> {
        let names: Vec<ChannelName> = self.channels.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;
        for name in names {
            if let Some((_, ring)) = self.channels.remove(&name) {
                self.retire(&mut ring.lock());
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn shutdown(&self) {
        self.delivery.write().take();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
