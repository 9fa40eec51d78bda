use std::{
    fmt,
    sync::{Arc, Weak},
};

use futures_util::{stream, Stream};
use serde::Serialize;

use super::{
    inbox::{Inbox, SubscriptionId},
    registry::Registry,
    ChannelName, Message,
};
use crate::{RecvError, TryRecvError};

/// Состояние подписки. `Closed` окончательно.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Active,
    Closed,
}

/// Какую часть истории канала получить при подписке.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Replay {
    /// Только новые сообщения.
    #[default]
    None,
    /// Не больше `n` последних сообщений каждого канала.
    Last(usize),
    /// Вся хранимая история (до `max_backlog`).
    All,
}

/// Параметры подписки.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub replay: Replay,
}

/// Handle подписки на стороне потребителя.
///
/// Сама очередь принадлежит хабу; handle только читает из неё. Набор
/// каналов меняется через `Hub::subscribe_more` и
/// `Hub::unsubscribe_channels`. Сброс handle снимает подписку (как и явный
/// `close`/`Hub::unsubscribe`).
pub struct Subscription {
    inbox: Arc<Inbox>,
    registry: Weak<Registry>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl SubscribeOptions {
    pub fn replay(replay: Replay) -> Self {
        Self { replay }
    }
}

impl Subscription {
    pub(crate) fn new(
        inbox: Arc<Inbox>,
        registry: Weak<Registry>,
    ) -> Self {
        Self { inbox, registry }
    }

    pub fn id(&self) -> SubscriptionId {
        self.inbox.id()
    }

    /// Текущие каналы подписки в порядке добавления. Пусто после закрытия.
    pub fn channels(&self) -> Vec<ChannelName> {
        self.registry
            .upgrade()
            .and_then(|registry| registry.subscriptions_of(self.id()))
            .unwrap_or_default()
    }

    pub fn state(&self) -> SubscriptionState {
        if self.inbox.is_closed() {
            SubscriptionState::Closed
        } else {
            SubscriptionState::Active
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    /// Число сообщений, ожидающих чтения.
    pub fn len(&self) -> usize {
        self.inbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inbox.capacity()
    }

    /// Сколько сообщений вытеснено из очереди этой подписки.
    pub fn dropped(&self) -> u64 {
        self.inbox.evicted()
    }

    /// Ждёт следующее сообщение.
    ///
    /// После закрытия возвращает `Closed`. Отключение за переполнение
    /// сообщается один раз как `SlowConsumer`.
    pub async fn recv(&self) -> Result<Message, RecvError> {
        self.inbox.recv().await
    }

    pub fn try_recv(&self) -> Result<Message, TryRecvError> {
        self.inbox.try_recv()
    }

    /// Снимает подписку. Идемпотентно, не ждёт разбора очереди.
    pub fn close(&self) {
        match self.registry.upgrade() {
            Some(registry) => {
                registry.unregister(self.id());
            }
            None => {
                self.inbox.close();
            }
        }
    }

    /// Ленивый поток сообщений; завершается при закрытии подписки.
    ///
    /// `SlowConsumer` выдаётся последним элементом потока.
    pub fn into_stream(self) -> impl Stream<Item = Result<Message, RecvError>> + Send + 'static {
        stream::unfold(self, |sub| async move {
            let next = sub.recv().await;
            match next {
                Ok(message) => Some((Ok(message), sub)),
                Err(RecvError::Closed) => None,
                Err(err) => Some((Err(err), sub)),
            }
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("channels", &self.channels())
            .field("state", &self.state())
            .field("queued", &self.len())
            .finish()
    }
}
