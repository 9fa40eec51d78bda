pub mod backend;
pub mod backoff;
mod fanout;
mod hub;
mod inbox;
mod message;
mod registry;
mod stats;
mod subscription;
mod sweeper;

pub use backend::{Backend, Delivery, Interest, MemoryBackend, MessageStream, StreamBackend, SweepReport};
pub use hub::Hub;
pub use inbox::SubscriptionId;
pub use message::{ChannelName, Message, MessageId, ParseMessageIdError};
pub use stats::{HubStats, HubStatsSnapshot};
pub use subscription::{Replay, SubscribeOptions, Subscription, SubscriptionState};
use zumic_channels_error::{ErrorExt, HubError, LogLevel};

/// Логирует ошибку фоновой задачи с уровнем, заданным её статус-кодом.
pub(crate) fn log_backend_error(
    task: &'static str,
    err: &HubError,
) {
    let code = err.status_code();
    match code.log_level() {
        LogLevel::Trace => tracing::trace!(task, code = %code, error = %err, "Background task error"),
        LogLevel::Debug => tracing::debug!(task, code = %code, error = %err, "Background task error"),
        LogLevel::Info => tracing::info!(task, code = %code, error = %err, "Background task error"),
        LogLevel::Warn => tracing::warn!(task, code = %code, error = %err, "Background task error"),
        LogLevel::Error => tracing::error!(task, code = %code, error = %err, "Background task error"),
    }
}
