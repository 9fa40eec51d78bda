//! Бэкенды хранения и доставки сообщений каналов.

pub mod keys;
pub mod memory;
mod scripts;
pub mod stream;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::Serialize;
use tokio::sync::watch;

pub use memory::MemoryBackend;
pub use stream::StreamBackend;

use super::{ChannelName, Message, MessageId};
use crate::{BackendConfig, HubConfig, HubError};

/// Текущий интерес хаба: каналы с локальными подписчиками и курсор, с
/// которого нужно читать новые записи канала.
pub type Interest = HashMap<ChannelName, MessageId>;

/// Поток сообщений, из которого читает fan-out хаба.
pub type MessageStream = BoxStream<'static, Result<Message, HubError>>;

/// Приёмник сообщений для бэкендов, которые раздают сообщения сами, в
/// момент публикации (без отдельного цикла чтения).
pub trait Delivery: Send + Sync + 'static {
    fn deliver(
        &self,
        message: Message,
    );
}

/// Итог одного прохода сборки мусора.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Сколько каналов проверено.
    pub scanned: usize,
    /// Сколько каналов удалено.
    pub removed: usize,
}

/// Хранилище и транспорт потоков сообщений по каналам.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Короткое имя для логов и ошибок.
    fn name(&self) -> &'static str;

    /// Добавляет сообщение в журнал канала с учётом ограничения `max_backlog`.
    async fn publish(
        &self,
        channel: &ChannelName,
        payload: Bytes,
    ) -> Result<Message, HubError>;

    /// До `limit` последних сообщений канала, от старых к новым.
    /// Неизвестный или истёкший канал даёт пустой список.
    async fn history(
        &self,
        channel: &ChannelName,
        limit: usize,
    ) -> Result<Vec<Message>, HubError>;

    /// Id самой новой записи канала или [`MessageId::ZERO`].
    async fn latest_id(
        &self,
        channel: &ChannelName,
    ) -> Result<MessageId, HubError>;

    /// Долгоживущий источник сообщений для fan-out.
    ///
    /// Набор каналов берётся из `interest` и может меняться на ходу. Бэкенды,
    /// раздающие сообщения при публикации, вместо потока используют
    /// `delivery`. Отмена происходит сбросом возвращённого потока.
    fn subscribe_stream(
        &self,
        interest: watch::Receiver<Interest>,
        delivery: Arc<dyn Delivery>,
    ) -> MessageStream;

    /// Один проход сборки мусора по простаивающим каналам.
    async fn sweep(&self) -> Result<SweepReport, HubError>;

    /// Удаляет все каналы бэкенда. Возвращает число удалённых.
    async fn flush_all(&self) -> Result<usize, HubError>;

    /// Освобождает ресурсы бэкенда.
    async fn shutdown(&self);
}

/// Создаёт бэкенд по конфигурации хаба.
pub async fn build_backend(config: &HubConfig) -> Result<Arc<dyn Backend>, HubError> {
    match &config.backend {
        BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new(
            config.max_backlog,
            config.idle_ttl,
        ))),
        BackendConfig::Stream(stream) => {
            let backend = StreamBackend::connect(
                stream.clone(),
                config.max_backlog,
                config.idle_ttl,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}
