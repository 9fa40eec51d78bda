use std::sync::Arc;

use futures_util::StreamExt;
use tokio::{select, sync::watch, task::JoinHandle};
use tracing::{debug, info};

use super::{backend::MessageStream, log_backend_error, registry::Registry, stats::HubStats};
use crate::channels::backend::Delivery;

////////////////////////////////////////////////////////////////////////////////
// Внешние функции
////////////////////////////////////////////////////////////////////////////////

/// Запускает фоновую задачу раздачи сообщений из потока бэкенда.
///
/// Ошибки потока (обрыв соединения, битые записи) логируются и не
/// останавливают раздачу: повторное подключение выполняет сам поток.
/// Задача завершается по сигналу `shutdown` или когда поток иссякает.
pub(crate) fn spawn_fanout_task(
    mut stream: MessageStream,
    registry: Arc<Registry>,
    stats: Arc<HubStats>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    debug!("Fan-out task received shutdown signal");
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(message)) => registry.deliver(message),
                    Some(Err(err)) => {
                        stats.record_backend_error();
                        log_backend_error("fan-out", &err);
                    }
                    None => {
                        info!("Backend stream ended, fan-out task stopped");
                        break;
                    }
                },
            }
        }
    })
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
