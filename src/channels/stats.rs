use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Счётчики хаба. Обновляются без блокировок.
#[derive(Debug, Default)]
pub struct HubStats {
    published: AtomicU64,
    delivered: AtomicU64,
    evicted: AtomicU64,
    duplicates: AtomicU64,
    slow_consumers: AtomicU64,
    backend_errors: AtomicU64,
    swept_channels: AtomicU64,
}

/// Снимок счётчиков хаба.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStatsSnapshot {
    /// Успешных публикаций.
    pub published: u64,
    /// Сообщений, поставленных в очереди подписок.
    pub delivered: u64,
    /// Сообщений, вытесненных из очередей политикой drop-oldest.
    pub evicted: u64,
    /// Отброшенных повторов (пересечение истории и живого потока).
    pub duplicates: u64,
    /// Подписок, отключённых за переполнение.
    pub slow_consumers: u64,
    /// Ошибок бэкенда в фоновых задачах и при публикации.
    pub backend_errors: u64,
    /// Каналов, удалённых сборщиком мусора.
    pub swept_channels: u64,
}

impl HubStats {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_slow_consumer(&self) {
        self.slow_consumers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_swept(
        &self,
        count: usize,
    ) {
        self.swept_channels
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HubStatsSnapshot {
        HubStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            slow_consumers: self.slow_consumers.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            swept_channels: self.swept_channels.load(Ordering::Relaxed),
        }
    }
}
