//! Lua scripts backing every state transition of the Redis broker.
//!
//! Each task lives in a hash `{prefix}:{queue}:t:{id}` with fields `msg`
//! (JSON) and `state`. Its ID additionally sits in exactly one of the
//! per-queue structures: the `pending` list, or the `lease`, `scheduled`,
//! `retry` and `dead` sorted sets (scored in epoch milliseconds).

use redis::Script;

/// KEYS: task, target (pending list or scheduled zset), queues set, [unique]
/// ARGV: msg, id, state, process_at_ms, unique_ttl_secs, queue
///
/// Returns 1 on success, 0 if the ID exists, -1 if the unique key is held.
const ENQUEUE: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return 0
end
if KEYS[4] then
    if not redis.call("SET", KEYS[4], ARGV[2], "NX", "EX", ARGV[5]) then
        return -1
    end
end
redis.call("HSET", KEYS[1], "msg", ARGV[1], "state", ARGV[3])
if ARGV[3] == "pending" then
    redis.call("LPUSH", KEYS[2], ARGV[2])
else
    redis.call("ZADD", KEYS[2], ARGV[4], ARGV[2])
end
redis.call("SADD", KEYS[3], ARGV[6])
return 1
"#;

/// KEYS: pending, lease
/// ARGV: task key prefix, now_ms, lease_grace_ms
///
/// Returns the leased message, or nil when the queue is empty.
const DEQUEUE: &str = r#"
while true do
    local id = redis.call("RPOP", KEYS[1])
    if not id then
        return false
    end
    local key = ARGV[1] .. id
    local msg = redis.call("HGET", key, "msg")
    if msg then
        local timeout = tonumber(cjson.decode(msg)["timeout_secs"]) or 0
        local deadline = tonumber(ARGV[2]) + timeout * 1000 + tonumber(ARGV[3])
        redis.call("HSET", key, "state", "active")
        redis.call("ZADD", KEYS[2], deadline, id)
        return msg
    end
end
"#;

/// KEYS: lease, task, processed counter, [unique]
/// ARGV: id
const DONE: &str = r#"
if redis.call("ZREM", KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call("DEL", KEYS[2])
redis.call("INCR", KEYS[3])
if KEYS[4] and redis.call("GET", KEYS[4]) == ARGV[1] then
    redis.call("DEL", KEYS[4])
end
return 1
"#;

/// KEYS: lease, task, destination zset (retry or dead), failed counter
/// ARGV: id, msg, score_ms, state
const FAIL: &str = r#"
if redis.call("ZREM", KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call("HSET", KEYS[2], "msg", ARGV[2], "state", ARGV[4])
redis.call("ZADD", KEYS[3], ARGV[3], ARGV[1])
redis.call("INCR", KEYS[4])
return 1
"#;

/// KEYS: lease, task, pending
/// ARGV: id
const REQUEUE: &str = r#"
if redis.call("ZREM", KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call("HSET", KEYS[2], "state", "pending")
redis.call("RPUSH", KEYS[3], ARGV[1])
return 1
"#;

/// KEYS: source zset (scheduled, retry or lease), pending
/// ARGV: task key prefix, now_ms, batch size
///
/// Returns the number of tasks moved.
const MOVE_DUE: &str = r#"
local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[2], "LIMIT", 0, tonumber(ARGV[3]))
for _, id in ipairs(ids) do
    redis.call("ZREM", KEYS[1], id)
    redis.call("HSET", ARGV[1] .. id, "state", "pending")
    redis.call("LPUSH", KEYS[2], id)
end
return #ids
"#;

/// KEYS: task, pending, scheduled, retry, dead
/// ARGV: id, unique key prefix
///
/// Returns 1 on success, 0 if missing, -1 if the task is active.
const DELETE: &str = r#"
local state = redis.call("HGET", KEYS[1], "state")
if not state then
    return 0
end
if state == "active" then
    return -1
elseif state == "pending" then
    redis.call("LREM", KEYS[2], 0, ARGV[1])
elseif state == "scheduled" then
    redis.call("ZREM", KEYS[3], ARGV[1])
elseif state == "retry" then
    redis.call("ZREM", KEYS[4], ARGV[1])
elseif state == "dead" then
    redis.call("ZREM", KEYS[5], ARGV[1])
end
local msg = cjson.decode(redis.call("HGET", KEYS[1], "msg"))
local unique = msg["unique_key"]
if type(unique) == "string" then
    local ukey = ARGV[2] .. unique
    if redis.call("GET", ukey) == ARGV[1] then
        redis.call("DEL", ukey)
    end
end
redis.call("DEL", KEYS[1])
return 1
"#;

/// KEYS: task, source zset, pending
/// ARGV: id, expected state, msg
///
/// Returns 1 on success, 0 if missing, -1 if the state changed.
const RUN: &str = r#"
local state = redis.call("HGET", KEYS[1], "state")
if not state then
    return 0
end
if state ~= ARGV[2] or redis.call("ZREM", KEYS[2], ARGV[1]) == 0 then
    return -1
end
redis.call("HSET", KEYS[1], "msg", ARGV[3], "state", "pending")
redis.call("LPUSH", KEYS[3], ARGV[1])
return 1
"#;

/// Compiled scripts; hashes are computed once per broker.
pub(super) struct Scripts {
    pub enqueue: Script,
    pub dequeue: Script,
    pub done: Script,
    pub fail: Script,
    pub requeue: Script,
    pub move_due: Script,
    pub delete: Script,
    pub run: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            dequeue: Script::new(DEQUEUE),
            done: Script::new(DONE),
            fail: Script::new(FAIL),
            requeue: Script::new(REQUEUE),
            move_due: Script::new(MOVE_DUE),
            delete: Script::new(DELETE),
            run: Script::new(RUN),
        }
    }
}
