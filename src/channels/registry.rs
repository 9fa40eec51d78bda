use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{
    backend::{Delivery, Interest},
    inbox::{Inbox, Push, SubscriptionId},
    stats::HubStats,
    ChannelName, Message, MessageId,
};

/// Реестр подписок хаба.
///
/// Все изменения (регистрация и снятие подписки сразу по всем её каналам)
/// выполняются под одной блокировкой записи, а раздача читает реестр под
/// блокировкой чтения. Поэтому fan-out всегда видит согласованный снимок.
pub(crate) struct Registry {
    state: RwLock<RegistryState>,
    /// Каналы с подписчиками и курсоры для бэкендов с циклом чтения.
    /// Обновляется под той же блокировкой, что и `state`.
    interest: watch::Sender<Interest>,
    stats: Arc<HubStats>,
}

#[derive(Default)]
struct RegistryState {
    channels: HashMap<ChannelName, BTreeMap<SubscriptionId, Arc<Inbox>>>,
    subscriptions: HashMap<SubscriptionId, Registration>,
}

struct Registration {
    inbox: Arc<Inbox>,
    channels: Vec<ChannelName>,
}

/// Результат добавления каналов к подписке.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Attach {
    /// Каналы, действительно добавленные к подписке.
    Attached(Vec<ChannelName>),
    /// Подписка уже снята.
    Gone,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Registry {
    pub(crate) fn new(stats: Arc<HubStats>) -> Self {
        let (interest, _) = watch::channel(Interest::new());
        Self {
            state: RwLock::new(RegistryState::default()),
            interest,
            stats,
        }
    }

    pub(crate) fn interest(&self) -> watch::Receiver<Interest> {
        self.interest.subscribe()
    }

    /// Регистрирует подписку на все `channels` атомарно.
    ///
    /// Каналу, у которого ещё нет подписчиков, нужен стартовый курсор из
    /// `cursors`. Если курсора нет, ничего не меняется, а в ошибке
    /// возвращаются такие каналы: вызывающий получает для них курсоры и
    /// повторяет регистрацию.
    pub(crate) fn register(
        &self,
        inbox: Arc<Inbox>,
        channels: &[ChannelName],
        cursors: &HashMap<ChannelName, MessageId>,
    ) -> Result<(), Vec<ChannelName>> {
        let id = inbox.id();
        let mut state = self.state.write();
        let missing = state.missing_cursors(channels, cursors);
        if !missing.is_empty() {
            return Err(missing);
        }

        state.subscriptions.insert(
            id,
            Registration {
                inbox,
                channels: Vec::new(),
            },
        );
        self.attach_locked(&mut state, id, channels, cursors);

        debug!(subscription = id, channels = channels.len(), "Subscription registered");
        Ok(())
    }

    /// Добавляет каналы к существующей подписке атомарно.
    ///
    /// Каналы, на которые подписка уже подписана, пропускаются. Курсоры
    /// работают так же, как в [`Registry::register`].
    pub(crate) fn attach(
        &self,
        id: SubscriptionId,
        channels: &[ChannelName],
        cursors: &HashMap<ChannelName, MessageId>,
    ) -> Result<Attach, Vec<ChannelName>> {
        let mut state = self.state.write();
        let Some(registration) = state.subscriptions.get(&id) else {
            return Ok(Attach::Gone);
        };
        let fresh: Vec<ChannelName> = channels
            .iter()
            .filter(|c| !registration.channels.contains(c))
            .cloned()
            .collect();

        let missing = state.missing_cursors(&fresh, cursors);
        if !missing.is_empty() {
            return Err(missing);
        }

        self.attach_locked(&mut state, id, &fresh, cursors);
        debug!(subscription = id, added = fresh.len(), "Channels attached");
        Ok(Attach::Attached(fresh))
    }

    fn attach_locked(
        &self,
        state: &mut RegistryState,
        id: SubscriptionId,
        channels: &[ChannelName],
        cursors: &HashMap<ChannelName, MessageId>,
    ) {
        let Some(registration) = state.subscriptions.get_mut(&id) else {
            return;
        };
        let inbox = registration.inbox.clone();
        registration.channels.extend(channels.iter().cloned());

        let mut added = Vec::new();
        for channel in channels {
            let subscribers = state.channels.entry(channel.clone()).or_insert_with(|| {
                added.push(channel.clone());
                BTreeMap::new()
            });
            subscribers.insert(id, inbox.clone());
        }

        if !added.is_empty() {
            self.interest.send_modify(|interest| {
                for channel in added {
                    // курсор проверен в missing_cursors
                    if let Some(start) = cursors.get(&channel) {
                        interest.insert(channel, *start);
                    }
                }
            });
        }
    }

    /// Отписывает подписку от части каналов. Подписка остаётся активной,
    /// даже если каналов не осталось.
    ///
    /// Возвращает каналы, от которых она действительно отписана, или
    /// `None`, если подписка уже снята.
    pub(crate) fn detach(
        &self,
        id: SubscriptionId,
        channels: &[ChannelName],
    ) -> Option<Vec<ChannelName>> {
        let mut state = self.state.write();
        let registration = state.subscriptions.get_mut(&id)?;
        let mut removed = Vec::new();
        registration.channels.retain(|c| {
            let drop_it = channels.contains(c);
            if drop_it {
                removed.push(c.clone());
            }
            !drop_it
        });

        let emptied = state.remove_from_channels(id, &removed);
        self.forget(emptied);

        debug!(subscription = id, removed = removed.len(), "Channels detached");
        Some(removed)
    }

    /// Снимает подписку и закрывает её очередь. Повторный вызов ничего не
    /// делает и возвращает `false`.
    pub(crate) fn unregister(
        &self,
        id: SubscriptionId,
    ) -> bool {
        let mut state = self.state.write();
        let Some(registration) = state.subscriptions.remove(&id) else {
            return false;
        };

        let emptied = state.remove_from_channels(id, &registration.channels);
        self.forget(emptied);
        drop(state);

        registration.inbox.close();
        debug!(subscription = id, "Subscription removed");
        true
    }

    /// Убирает из интереса каналы, у которых не осталось подписчиков.
    /// Вызывается под блокировкой записи.
    fn forget(
        &self,
        emptied: Vec<ChannelName>,
    ) {
        if emptied.is_empty() {
            return;
        }
        self.interest.send_modify(|interest| {
            for channel in &emptied {
                interest.remove(channel);
            }
        });
    }

    /// Снимает подписку, закрытую за переполнение очереди.
    pub(crate) fn disconnect_slow(
        &self,
        inbox: &Inbox,
    ) {
        warn!(
            subscription = inbox.id(),
            capacity = inbox.capacity(),
            "Slow consumer disconnected"
        );
        self.stats.record_slow_consumer();
        self.unregister(inbox.id());
    }

    /// Закрывает все подписки. Возвращает их число.
    pub(crate) fn close_all(&self) -> usize {
        let registrations: Vec<Registration> = {
            let mut state = self.state.write();
            state.channels.clear();
            self.interest.send_replace(Interest::new());
            state.subscriptions.drain().map(|(_, r)| r).collect()
        };

        for registration in &registrations {
            registration.inbox.close();
        }
        registrations.len()
    }

    pub(crate) fn subscriber_count(
        &self,
        channel: &str,
    ) -> usize {
        self.state
            .read()
            .channels
            .get(channel)
            .map_or(0, BTreeMap::len)
    }

    /// Каналы с хотя бы одним подписчиком, по алфавиту.
    pub(crate) fn channels(&self) -> Vec<ChannelName> {
        let mut channels: Vec<ChannelName> = self.state.read().channels.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub(crate) fn subscriptions_of(
        &self,
        id: SubscriptionId,
    ) -> Option<Vec<ChannelName>> {
        self.state
            .read()
            .subscriptions
            .get(&id)
            .map(|r| r.channels.clone())
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.state.read().subscriptions.len()
    }

    pub(crate) fn record_push(
        &self,
        outcome: Push,
    ) {
        match outcome {
            Push::Queued => self.stats.record_delivered(),
            Push::Evicted => {
                self.stats.record_delivered();
                self.stats.record_evicted();
            }
            Push::Duplicate => self.stats.record_duplicate(),
            Push::Overflow | Push::Closed => {}
        }
    }
}

impl RegistryState {
    /// Каналы без подписчиков, для которых не передан стартовый курсор.
    fn missing_cursors(
        &self,
        channels: &[ChannelName],
        cursors: &HashMap<ChannelName, MessageId>,
    ) -> Vec<ChannelName> {
        channels
            .iter()
            .filter(|c| !self.channels.contains_key(*c) && !cursors.contains_key(*c))
            .cloned()
            .collect()
    }

    /// Убирает подписку из списков каналов. Возвращает опустевшие каналы.
    fn remove_from_channels(
        &mut self,
        id: SubscriptionId,
        channels: &[ChannelName],
    ) -> Vec<ChannelName> {
        let mut emptied = Vec::new();
        for channel in channels {
            let now_empty = match self.channels.get_mut(channel) {
                Some(subscribers) => {
                    subscribers.remove(&id);
                    subscribers.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.channels.remove(channel);
                emptied.push(channel.clone());
            }
        }
        emptied
    }
}

////////////////////////////////////////////////////////////////////////////////
// Реализация Delivery
////////////////////////////////////////////////////////////////////////////////

impl Delivery for Registry {
    /// Раздаёт сообщение всем подписчикам его канала.
    ///
    /// Никогда не ждёт потребителей: переполненные подписки вытесняют старое
    /// или отключаются по политике.
    fn deliver(
        &self,
        message: Message,
    ) {
        let mut overflowed = Vec::new();
        {
            let state = self.state.read();
            let Some(subscribers) = state.channels.get(&message.channel) else {
                return;
            };
            for inbox in subscribers.values() {
                let outcome = inbox.push(message.clone());
                if outcome == Push::Overflow {
                    overflowed.push(inbox.clone());
                }
                self.record_push(outcome);
            }
        }

        for inbox in overflowed {
            self.disconnect_slow(&inbox);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{OverflowPolicy, TryRecvError};

    fn registry() -> Registry {
        Registry::new(Arc::new(HubStats::default()))
    }

    fn inbox(
        id: SubscriptionId,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Arc<Inbox> {
        Arc::new(Inbox::new(id, capacity, policy, false))
    }

    fn msg(
        channel: &str,
        ms: u64,
    ) -> Message {
        Message::new(
            ChannelName::new(channel),
            Bytes::from_static(b"x"),
            MessageId::new(ms, 0),
        )
    }

    fn names(list: &[&str]) -> Vec<ChannelName> {
        list.iter().map(|s| ChannelName::new(s)).collect()
    }

    /// Регистрация с нулевыми курсорами для всех каналов.
    fn register(
        registry: &Registry,
        inbox: Arc<Inbox>,
        channels: &[&str],
    ) {
        let channels = names(channels);
        let cursors = channels
            .iter()
            .map(|c| (c.clone(), MessageId::ZERO))
            .collect();
        registry.register(inbox, &channels, &cursors).unwrap();
    }

    /// Тест проверяет, что сообщение получают только подписчики его канала.
    #[test]
    fn test_deliver_routes_by_channel() {
        let registry = registry();
        let a = inbox(1, 8, OverflowPolicy::DropOldest);
        let b = inbox(2, 8, OverflowPolicy::DropOldest);
        register(&registry, a.clone(), &["news"]);
        register(&registry, b.clone(), &["sport"]);

        registry.deliver(msg("news", 1));

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 0);
        assert_eq!(registry.stats.snapshot().delivered, 1);
    }

    /// Тест проверяет учёт интереса: канал появляется с курсором при первой
    /// подписке и исчезает после последней отписки.
    #[test]
    fn test_interest_tracks_channels() {
        let registry = registry();
        let interest = registry.interest();

        let cursors = HashMap::from([
            (ChannelName::new("x"), MessageId::new(10, 2)),
            (ChannelName::new("y"), MessageId::new(11, 0)),
        ]);
        registry
            .register(inbox(1, 8, OverflowPolicy::DropOldest), &names(&["x"]), &cursors)
            .unwrap();
        registry
            .register(inbox(2, 8, OverflowPolicy::DropOldest), &names(&["x", "y"]), &cursors)
            .unwrap();

        {
            let current = interest.borrow();
            assert_eq!(current.get("x"), Some(&MessageId::new(10, 2)));
            assert_eq!(current.get("y"), Some(&MessageId::new(11, 0)));
        }

        assert!(registry.unregister(1));
        assert!(interest.borrow().contains_key("x"), "у x остался подписчик 2");

        assert!(registry.unregister(2));
        assert!(interest.borrow().is_empty());
        assert!(registry.channels().is_empty());
    }

    /// Тест проверяет, что канал без подписчиков не попадает в интерес без
    /// стартового курсора: регистрация отклоняется целиком.
    #[test]
    fn test_register_requires_cursor_for_new_channels() {
        let registry = registry();
        let interest = registry.interest();
        let a = inbox(1, 8, OverflowPolicy::DropOldest);
        register(&registry, a, &["x"]);

        // у x есть подписчик, курсор нужен только для y
        let b = inbox(2, 8, OverflowPolicy::DropOldest);
        assert_eq!(
            registry.register(b.clone(), &names(&["x", "y"]), &HashMap::new()),
            Err(names(&["y"]))
        );
        assert_eq!(registry.subscriptions_of(2), None);
        assert!(!interest.borrow().contains_key("y"));

        // x опустел между проверкой и регистрацией: курсор нужен и для него
        assert!(registry.unregister(1));
        let only_y = HashMap::from([(ChannelName::new("y"), MessageId::new(5, 0))]);
        assert_eq!(
            registry.register(b.clone(), &names(&["x", "y"]), &only_y),
            Err(names(&["x"]))
        );

        let both = HashMap::from([
            (ChannelName::new("x"), MessageId::new(9, 4)),
            (ChannelName::new("y"), MessageId::new(5, 0)),
        ]);
        registry.register(b, &names(&["x", "y"]), &both).unwrap();
        assert_eq!(interest.borrow().get("x"), Some(&MessageId::new(9, 4)));
    }

    /// Тест проверяет добавление и снятие части каналов у живой подписки.
    #[test]
    fn test_attach_and_detach_channels() {
        let registry = registry();
        let interest = registry.interest();
        let a = inbox(1, 8, OverflowPolicy::DropOldest);
        register(&registry, a.clone(), &["x"]);

        let cursors = HashMap::from([(ChannelName::new("y"), MessageId::new(3, 0))]);
        assert_eq!(
            registry.attach(1, &names(&["x", "y"]), &cursors),
            Ok(Attach::Attached(names(&["y"])))
        );
        assert_eq!(registry.subscriptions_of(1), Some(names(&["x", "y"])));
        assert_eq!(interest.borrow().get("y"), Some(&MessageId::new(3, 0)));

        registry.deliver(msg("y", 4));
        assert_eq!(a.len(), 1);

        assert_eq!(registry.detach(1, &names(&["x", "z"])), Some(names(&["x"])));
        assert_eq!(registry.subscriptions_of(1), Some(names(&["y"])));
        assert_eq!(registry.subscriber_count("x"), 0);
        assert!(!interest.borrow().contains_key("x"));
        assert!(!a.is_closed());

        assert_eq!(registry.detach(1, &names(&["y"])), Some(names(&["y"])));
        assert_eq!(registry.subscriptions_of(1), Some(Vec::new()));
        assert!(interest.borrow().is_empty());

        assert!(registry.unregister(1));
        assert_eq!(registry.detach(1, &names(&["y"])), None);
        assert_eq!(registry.attach(1, &names(&["y"]), &cursors), Ok(Attach::Gone));
    }

    /// Тест проверяет идемпотентность отписки и закрытие очереди.
    #[test]
    fn test_unregister_is_idempotent() {
        let registry = registry();
        let a = inbox(1, 8, OverflowPolicy::DropOldest);
        register(&registry, a.clone(), &["x"]);
        registry.deliver(msg("x", 1));

        assert!(registry.unregister(1));
        assert!(!registry.unregister(1));
        assert!(a.is_closed());
        assert_eq!(a.len(), 0, "очередь освобождается при отписке");
        assert_eq!(registry.subscriber_count("x"), 0);
    }

    /// Тест проверяет, что переполнение при disconnect снимает подписку, не
    /// затрагивая соседей.
    #[test]
    fn test_overflow_disconnects_only_slow_consumer() {
        let registry = registry();
        let slow = inbox(1, 1, OverflowPolicy::Disconnect);
        let fast = inbox(2, 8, OverflowPolicy::Disconnect);
        register(&registry, slow.clone(), &["x"]);
        register(&registry, fast.clone(), &["x"]);

        registry.deliver(msg("x", 1));
        registry.deliver(msg("x", 2));

        assert_eq!(registry.subscriber_count("x"), 1);
        assert_eq!(
            slow.try_recv(),
            Err(TryRecvError::SlowConsumer { capacity: 1 })
        );
        assert_eq!(fast.len(), 2);
        assert_eq!(registry.stats.snapshot().slow_consumers, 1);
    }

    #[test]
    fn test_close_all() {
        let registry = registry();
        let a = inbox(1, 8, OverflowPolicy::DropOldest);
        let b = inbox(2, 8, OverflowPolicy::DropOldest);
        register(&registry, a.clone(), &["x"]);
        register(&registry, b.clone(), &["y"]);

        assert_eq!(registry.close_all(), 2);
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(registry.subscription_count(), 0);
        assert!(registry.interest().borrow().is_empty());
    }

    #[test]
    fn test_subscriptions_of() {
        let registry = registry();
        register(&registry, inbox(7, 8, OverflowPolicy::DropOldest), &["b", "a"]);
        assert_eq!(registry.subscriptions_of(7), Some(names(&["b", "a"])));
        assert_eq!(registry.subscriptions_of(8), None);
        assert_eq!(registry.channels(), names(&["a", "b"]));
    }
}
