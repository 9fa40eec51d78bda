//! Lua-скрипты бэкенда Redis Streams.

use once_cell::sync::Lazy;
use redis::Script;

/// Добавляет запись с ограничением длины и обновляет TTL ключа одной
/// атомарной операцией.
///
/// KEYS[1]: ключ потока; ARGV: `~`|`=`, max_backlog, имя канала, данные,
/// TTL в миллисекундах. Возвращает id записи.
pub static PUBLISH: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local id = redis.call('XADD', KEYS[1], 'MAXLEN', ARGV[1], ARGV[2], '*', 'channel', ARGV[3], 'data', ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return id
",
    )
});

/// Удаляет потоки без записей новее водяного знака.
///
/// KEYS: пачка ключей из `SCAN`; ARGV[1]: минимальный id. Возвращает
/// число удалённых ключей.
pub static SWEEP: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local removed = 0
for _, key in ipairs(KEYS) do
    if #redis.call('XRANGE', key, ARGV[1], '+', 'COUNT', 1) == 0 then
        removed = removed + redis.call('DEL', key)
    end
end
return removed
",
    )
});
