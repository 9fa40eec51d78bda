//! Именование ключей Redis для каналов.
//!
//! Ключ канала: `<prefix>:channel:<name>`. Имя канала не преобразуется,
//! поэтому отображение канал → ключ взаимно однозначно при фиксированном
//! префиксе.

use crate::channels::ChannelName;

const CHANNEL_SEGMENT: &str = ":channel:";

/// Ключ потока для канала.
pub fn stream_key(
    prefix: &str,
    channel: &ChannelName,
) -> String {
    let mut key = String::with_capacity(prefix.len() + CHANNEL_SEGMENT.len() + channel.as_str().len());
    key.push_str(prefix);
    key.push_str(CHANNEL_SEGMENT);
    key.push_str(channel.as_str());
    key
}

/// Обратное преобразование; `None` для чужих ключей.
pub fn channel_from_key(
    prefix: &str,
    key: &str,
) -> Option<ChannelName> {
    key.strip_prefix(prefix)?
        .strip_prefix(CHANNEL_SEGMENT)
        .map(ChannelName::new)
}

/// Шаблон `SCAN MATCH`, покрывающий ровно ключи каналов с этим префиксом.
///
/// Спецсимволы glob в префиксе экранируются, иначе префикс `a*` захватил
/// бы ключи чужого приложения.
pub fn sweep_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + CHANNEL_SEGMENT.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str(CHANNEL_SEGMENT);
    pattern.push('*');
    pattern
}
