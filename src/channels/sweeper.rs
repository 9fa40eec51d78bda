use std::{sync::Arc, time::Duration};

use tokio::{
    select,
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::debug;

use super::{backend::Backend, log_backend_error, stats::HubStats};

////////////////////////////////////////////////////////////////////////////////
// Внешние функции
////////////////////////////////////////////////////////////////////////////////

/// Запускает фоновую задачу периодической сборки мусора бэкенда.
///
/// Интервал не зависит от трафика публикаций. Ошибка прохода логируется,
/// следующий проход выполняется по расписанию.
pub(crate) fn spawn_sweeper_task(
    backend: Arc<dyn Backend>,
    stats: Arc<HubStats>,
    sweep_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Первый тик срабатывает сразу; сборщику нечего делать на старте
        ticker.tick().await;

        loop {
            select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    debug!("Sweeper task received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    match backend.sweep().await {
                        Ok(report) => {
                            stats.record_swept(report.removed);
                            if report.removed > 0 {
                                debug!(
                                    backend = backend.name(),
                                    scanned = report.scanned,
                                    removed = report.removed,
                                    "Swept idle channels"
                                );
                            }
                        }
                        Err(err) => {
                            stats.record_backend_error();
                            log_backend_error("sweeper", &err);
                        }
                    }
                }
            }
        }
    })
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
