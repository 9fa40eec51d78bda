/// Хаб каналов: подписки, публикация, бэкенды, сборка мусора.
pub mod channels;
/// Конфигурация хаба и загрузка настроек приложения.
pub mod config;
/// Гибкое логирование (форматы, фильтры, файловые приёмники).
pub mod logging;

// -----------------------------------------------------------------------------
//  Часто используемые публичные типы
// -----------------------------------------------------------------------------

/// Хаб и типы подписок.
pub use channels::{
    Backend, ChannelName, Hub, HubStatsSnapshot, MemoryBackend, Message, MessageId, Replay,
    StreamBackend, SubscribeOptions, Subscription, SubscriptionId, SubscriptionState, SweepReport,
};
/// Конфигурация.
pub use config::{
    BackendConfig, BackendKind, HubConfig, HubConfigBuilder, HubSettings, OverflowPolicy,
    Settings, StreamConfig,
};
/// Логирование.
pub use logging::{init_logging, LoggingConfig, LoggingHandle};
/// Ошибки и коды статусов.
pub use zumic_channels_error::{
    ChannelsResult, ErrorExt, HubError, RecvError, StatusCode, TryRecvError,
};
