use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{ChannelName, Message, MessageId};
use crate::{OverflowPolicy, RecvError, TryRecvError};

/// Идентификатор подписки, уникальный в пределах хаба.
pub type SubscriptionId = u64;

/// Ограниченная очередь доставки одной подписки.
///
/// Принадлежит хабу; потребитель видит её только через `Subscription`.
/// Запись (`push`) никогда не ждёт потребителя: при переполнении
/// срабатывает политика, а не рост очереди.
pub(crate) struct Inbox {
    id: SubscriptionId,
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<InboxState>,
    notify: Notify,
}

/// Результат попытки поставить сообщение в очередь.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Push {
    /// Сообщение принято.
    Queued,
    /// Сообщение принято ценой вытеснения самого старого.
    Evicted,
    /// Сообщение уже было доставлено (id не больше водяного знака канала).
    Duplicate,
    /// Очередь переполнена при политике `disconnect`; подписка закрыта.
    Overflow,
    /// Подписка уже закрыта.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Unsubscribed,
    SlowConsumer { reported: bool },
}

struct InboxState {
    queue: VecDeque<Message>,
    /// Живые сообщения, пришедшие во время воспроизведения истории.
    pending: Option<VecDeque<Message>>,
    /// Последний поставленный в очередь id по каждому каналу.
    watermarks: HashMap<ChannelName, MessageId>,
    closed: Option<CloseReason>,
    evicted: u64,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Inbox {
    pub(crate) fn new(
        id: SubscriptionId,
        capacity: usize,
        policy: OverflowPolicy,
        replaying: bool,
    ) -> Self {
        Self {
            id,
            capacity,
            policy,
            state: Mutex::new(InboxState {
                queue: VecDeque::with_capacity(capacity.min(64)),
                pending: replaying.then(VecDeque::new),
                watermarks: HashMap::new(),
                closed: None,
                evicted: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Живая доставка из fan-out.
    pub(crate) fn push(
        &self,
        message: Message,
    ) -> Push {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return Push::Closed;
        }

        let state = &mut *state;
        if let Some(pending) = state.pending.as_mut() {
            if pending.len() < self.capacity {
                pending.push_back(message);
                return Push::Queued;
            }
            match self.policy {
                OverflowPolicy::DropOldest => {
                    pending.pop_front();
                    pending.push_back(message);
                    state.evicted += 1;
                    return Push::Evicted;
                }
                OverflowPolicy::Disconnect => {
                    state.pending = None;
                    state.queue.clear();
                    state.closed = Some(CloseReason::SlowConsumer { reported: false });
                    self.wake_all();
                    return Push::Overflow;
                }
            }
        }

        let outcome = self.enqueue(state, message, self.policy);
        self.wake(outcome);
        outcome
    }

    /// Завершает воспроизведение истории.
    ///
    /// История ставится в очередь строго раньше живых сообщений, а живые
    /// сообщения с id не больше последнего воспроизведённого отбрасываются.
    /// Сама история никогда не отключает подписку: при нехватке места
    /// вытесняются старые записи.
    pub(crate) fn finish_replay(
        &self,
        history: Vec<Message>,
    ) -> Push {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return Push::Closed;
        }

        for message in history {
            self.enqueue(&mut state, message, OverflowPolicy::DropOldest);
        }

        let pending = state.pending.take().unwrap_or_default();
        let mut outcome = Push::Queued;
        for message in pending {
            match self.enqueue(&mut state, message, self.policy) {
                Push::Overflow => {
                    outcome = Push::Overflow;
                    break;
                }
                Push::Evicted => outcome = Push::Evicted,
                _ => {}
            }
        }
        drop(state);
        self.wake(outcome);
        outcome
    }

    fn enqueue(
        &self,
        state: &mut InboxState,
        message: Message,
        policy: OverflowPolicy,
    ) -> Push {
        if let Some(last) = state.watermarks.get(&message.channel) {
            if message.id <= *last {
                return Push::Duplicate;
            }
        }

        let mut outcome = Push::Queued;
        if state.queue.len() >= self.capacity {
            match policy {
                OverflowPolicy::DropOldest => {
                    state.queue.pop_front();
                    state.evicted += 1;
                    outcome = Push::Evicted;
                }
                OverflowPolicy::Disconnect => {
                    state.queue.clear();
                    state.closed = Some(CloseReason::SlowConsumer { reported: false });
                    return Push::Overflow;
                }
            }
        }

        state
            .watermarks
            .insert(message.channel.clone(), message.id);
        state.queue.push_back(message);
        outcome
    }

    fn wake(
        &self,
        outcome: Push,
    ) {
        match outcome {
            Push::Queued | Push::Evicted => self.notify.notify_one(),
            Push::Overflow => self.wake_all(),
            Push::Duplicate | Push::Closed => {}
        }
    }

    fn wake_all(&self) {
        self.notify.notify_waiters();
        // разрешение на случай, если потребитель ещё не успел встать в ожидание
        self.notify.notify_one();
    }

    /// Закрывает очередь и освобождает буфер. Идемпотентно.
    ///
    /// Возвращает `true`, если именно этот вызов закрыл подписку.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return false;
        }
        state.closed = Some(CloseReason::Unsubscribed);
        state.queue = VecDeque::new();
        state.pending = None;
        state.watermarks.clear();
        drop(state);
        self.wake_all();
        true
    }

    pub(crate) fn try_recv(&self) -> Result<Message, TryRecvError> {
        let mut state = self.state.lock();
        if let Some(message) = state.queue.pop_front() {
            return Ok(message);
        }
        match Self::closed_error(&mut state, self.capacity) {
            Some(err) => Err(err.into()),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Ждёт сообщение или закрытие подписки.
    pub(crate) async fn recv(&self) -> Result<Message, RecvError> {
        loop {
            // Notified создаётся до проверки состояния, чтобы не потерять
            // пробуждение между проверкой и ожиданием.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(message) = state.queue.pop_front() {
                    return Ok(message);
                }
                if let Some(err) = Self::closed_error(&mut state, self.capacity) {
                    return Err(err);
                }
            }
            notified.await;
        }
    }

    fn closed_error(
        state: &mut InboxState,
        capacity: usize,
    ) -> Option<RecvError> {
        match state.closed {
            None => None,
            Some(CloseReason::SlowConsumer { reported: false }) => {
                state.closed = Some(CloseReason::SlowConsumer { reported: true });
                Some(RecvError::SlowConsumer { capacity })
            }
            Some(_) => Some(RecvError::Closed),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    /// Закрыта ли подписка за переполнение очереди.
    pub(crate) fn is_slow_consumer(&self) -> bool {
        matches!(
            self.state.lock().closed,
            Some(CloseReason::SlowConsumer { .. })
        )
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub(crate) fn evicted(&self) -> u64 {
        self.state.lock().evicted
    }

    #[cfg(test)]
    fn is_replaying(&self) -> bool {
        self.state.lock().pending.is_some()
    }
}

impl std::fmt::Debug for Inbox {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use bytes::Bytes;
    use tokio::time::timeout;

    use super::*;

    fn msg(
        channel: &str,
        ms: u64,
        payload: &'static [u8],
    ) -> Message {
        Message::new(
            ChannelName::new(channel),
            Bytes::from_static(payload),
            MessageId::new(ms, 0),
        )
    }

    /// Тест проверяет FIFO-порядок и пустую очередь.
    #[test]
    fn test_fifo_order() {
        let inbox = Inbox::new(1, 4, OverflowPolicy::DropOldest, false);
        assert_eq!(inbox.push(msg("a", 1, b"1")), Push::Queued);
        assert_eq!(inbox.push(msg("a", 2, b"2")), Push::Queued);

        assert_eq!(inbox.try_recv().unwrap().payload, Bytes::from_static(b"1"));
        assert_eq!(inbox.try_recv().unwrap().payload, Bytes::from_static(b"2"));
        assert_eq!(inbox.try_recv(), Err(TryRecvError::Empty));
    }

    /// Тест проверяет политику drop-oldest: очередь не растёт выше ёмкости.
    #[test]
    fn test_drop_oldest() {
        let inbox = Inbox::new(1, 2, OverflowPolicy::DropOldest, false);
        inbox.push(msg("a", 1, b"1"));
        inbox.push(msg("a", 2, b"2"));
        assert_eq!(inbox.push(msg("a", 3, b"3")), Push::Evicted);

        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.evicted(), 1);
        assert_eq!(inbox.try_recv().unwrap().id, MessageId::new(2, 0));
        assert_eq!(inbox.try_recv().unwrap().id, MessageId::new(3, 0));
    }

    /// Тест проверяет политику disconnect: SlowConsumer сообщается один раз.
    #[test]
    fn test_disconnect_reports_once() {
        let inbox = Inbox::new(9, 1, OverflowPolicy::Disconnect, false);
        inbox.push(msg("a", 1, b"1"));
        assert_eq!(inbox.push(msg("a", 2, b"2")), Push::Overflow);
        assert!(inbox.is_closed());
        assert_eq!(inbox.len(), 0);

        assert_eq!(
            inbox.try_recv(),
            Err(TryRecvError::SlowConsumer { capacity: 1 })
        );
        assert_eq!(inbox.try_recv(), Err(TryRecvError::Closed));
        assert_eq!(inbox.push(msg("a", 3, b"3")), Push::Closed);
    }

    /// Тест проверяет отбрасывание дубликатов и сообщений вне порядка.
    #[test]
    fn test_duplicates_are_dropped() {
        let inbox = Inbox::new(1, 8, OverflowPolicy::DropOldest, false);
        inbox.push(msg("a", 5, b"5"));
        assert_eq!(inbox.push(msg("a", 5, b"5")), Push::Duplicate);
        assert_eq!(inbox.push(msg("a", 4, b"4")), Push::Duplicate);
        // другой канал имеет свой водяной знак
        assert_eq!(inbox.push(msg("b", 1, b"1")), Push::Queued);
        assert_eq!(inbox.len(), 2);
    }

    /// Тест проверяет, что история идёт раньше живых сообщений, а живые
    /// дубликаты истории отбрасываются.
    #[test]
    fn test_replay_before_live() {
        let inbox = Inbox::new(1, 8, OverflowPolicy::DropOldest, true);
        assert!(inbox.is_replaying());

        // живые сообщения приходят раньше, чем завершилось чтение истории
        inbox.push(msg("a", 2, b"2"));
        inbox.push(msg("a", 3, b"3"));
        assert_eq!(inbox.len(), 0);

        inbox.finish_replay(vec![msg("a", 1, b"1"), msg("a", 2, b"2")]);
        assert!(!inbox.is_replaying());

        let ids: Vec<u64> = std::iter::from_fn(|| inbox.try_recv().ok())
            .map(|m| m.id.ms)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    /// Тест проверяет, что большая история не отключает подписку даже при
    /// политике disconnect.
    #[test]
    fn test_replay_never_disconnects() {
        let inbox = Inbox::new(1, 2, OverflowPolicy::Disconnect, true);
        let history = (1..=5).map(|i| msg("a", i, b"x")).collect();
        assert_eq!(inbox.finish_replay(history), Push::Queued);
        assert!(!inbox.is_closed());
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.try_recv().unwrap().id.ms, 4);
    }

    /// Тест проверяет, что живые сообщения во время воспроизведения
    /// подчиняются политике очереди.
    #[test]
    fn test_pending_follows_policy() {
        let drop_oldest = Inbox::new(1, 2, OverflowPolicy::DropOldest, true);
        for i in 1..=3 {
            drop_oldest.push(msg("a", i, b"x"));
        }
        assert_eq!(drop_oldest.evicted(), 1);
        drop_oldest.finish_replay(Vec::new());
        assert_eq!(drop_oldest.try_recv().unwrap().id.ms, 2);

        let disconnect = Inbox::new(2, 2, OverflowPolicy::Disconnect, true);
        assert_eq!(disconnect.push(msg("a", 1, b"x")), Push::Queued);
        assert_eq!(disconnect.push(msg("a", 2, b"x")), Push::Queued);
        assert_eq!(disconnect.push(msg("a", 3, b"x")), Push::Overflow);
        assert!(disconnect.is_slow_consumer());
        assert_eq!(disconnect.finish_replay(vec![msg("a", 0, b"h")]), Push::Closed);
        assert_eq!(
            disconnect.try_recv(),
            Err(TryRecvError::SlowConsumer { capacity: 2 })
        );
    }

    /// Тест проверяет, что `close` будит ожидающего потребителя.
    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let inbox = Arc::new(Inbox::new(1, 4, OverflowPolicy::DropOldest, false));
        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(inbox.close());
        assert!(!inbox.close(), "повторное закрытие ничего не делает");

        let res = timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter must wake up")
            .unwrap();
        assert_eq!(res, Err(RecvError::Closed));
    }

    /// Тест проверяет, что `recv` получает сообщение, поставленное позже.
    #[tokio::test]
    async fn test_recv_waits_for_push() {
        let inbox = Arc::new(Inbox::new(1, 4, OverflowPolicy::DropOldest, false));
        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        inbox.push(msg("a", 1, b"late"));

        let res = timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter must wake up")
            .unwrap()
            .unwrap();
        assert_eq!(res.payload, Bytes::from_static(b"late"));
    }
}
