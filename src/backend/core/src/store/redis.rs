//! Redis-backed store.
//!
//! Redis has no per-key revisions, so the store keeps its own:
//!
//! ```text
//! {prefix}rev        STRING  global revision counter (INCR)
//! {prefix}idx        ZSET    every live key, score 0, for lexicographic scans
//! {prefix}kv:{key}   HASH    v = value, c = create rev, m = mod rev, n = version
//! ```
//!
//! Each [`KvStore`] call is a single Lua script, so it runs atomically on the
//! primary. Scripts address their keys through `ARGV` (the key set of a
//! transaction is data-dependent), which ties the store to a single Redis
//! instance; cluster mode is not supported.

use async_trait::async_trait;
use metrics::histogram;
use std::time::Instant;

use super::{Compare, KeyValue, KvStore, RangeEnd, RangeRequest, Revision, SortOrder, Txn, TxnOp, TxnResponse};
use crate::error::{ErrorCode, KvqError, Result};

const PRELUDE: &str = r#"
local prefix = ARGV[1]
local idx = prefix .. 'idx'
local function kv(key) return prefix .. 'kv:' .. key end
local function mod_revision(key)
  local m = redis.call('HGET', kv(key), 'm')
  if m then return tonumber(m) end
  return 0
end
local function put(key, value, rev)
  local h = kv(key)
  if redis.call('EXISTS', h) == 1 then
    redis.call('HSET', h, 'v', value, 'm', rev)
    redis.call('HINCRBY', h, 'n', 1)
  else
    redis.call('HSET', h, 'v', value, 'c', rev, 'm', rev, 'n', 1)
    redis.call('ZADD', idx, 0, key)
  end
end
local function del(key)
  local removed = redis.call('DEL', kv(key))
  if removed > 0 then redis.call('ZREM', idx, key) end
  return removed
end
local function current_revision()
  return tonumber(redis.call('GET', prefix .. 'rev') or '0')
end
"#;

const GET_SCRIPT: &str = r#"
local key = ARGV[2]
local f = redis.call('HMGET', kv(key), 'v', 'c', 'm', 'n')
if not f[1] then return {} end
return {key, f[1], f[2], f[3], f[4]}
"#;

const RANGE_SCRIPT: &str = r#"
local min, max, limit, order = ARGV[2], ARGV[3], tonumber(ARGV[4]), ARGV[5]
local keys
if order == 'desc' then
  if limit > 0 then
    keys = redis.call('ZREVRANGEBYLEX', idx, max, min, 'LIMIT', 0, limit)
  else
    keys = redis.call('ZREVRANGEBYLEX', idx, max, min)
  end
else
  if limit > 0 then
    keys = redis.call('ZRANGEBYLEX', idx, min, max, 'LIMIT', 0, limit)
  else
    keys = redis.call('ZRANGEBYLEX', idx, min, max)
  end
end
local out = {}
for _, key in ipairs(keys) do
  local f = redis.call('HMGET', kv(key), 'v', 'c', 'm', 'n')
  if f[1] then
    table.insert(out, key)
    table.insert(out, f[1])
    table.insert(out, f[2])
    table.insert(out, f[3])
    table.insert(out, f[4])
  end
end
return out
"#;

const PUT_SCRIPT: &str = r#"
local rev = redis.call('INCR', prefix .. 'rev')
put(ARGV[2], ARGV[3], rev)
return rev
"#;

const DELETE_SCRIPT: &str = r#"
local removed = del(ARGV[2])
if removed > 0 then redis.call('INCR', prefix .. 'rev') end
return removed
"#;

const DELETE_RANGE_SCRIPT: &str = r#"
local keys = redis.call('ZRANGEBYLEX', idx, ARGV[2], ARGV[3])
local removed = 0
for _, key in ipairs(keys) do
  removed = removed + del(key)
end
if removed > 0 then redis.call('INCR', prefix .. 'rev') end
return removed
"#;

const TXN_SCRIPT: &str = r#"
local ncompare = tonumber(ARGV[2])
local i = 3
local holds = true
for _ = 1, ncompare do
  if mod_revision(ARGV[i]) ~= tonumber(ARGV[i + 1]) then holds = false end
  i = i + 2
end
if not holds then return {0, current_revision()} end
if i > #ARGV then return {1, current_revision()} end
local rev = redis.call('INCR', prefix .. 'rev')
while i <= #ARGV do
  if ARGV[i] == 'put' then
    put(ARGV[i + 1], ARGV[i + 2], rev)
  else
    del(ARGV[i + 1])
  end
  i = i + 3
end
return {1, rev}
"#;

fn script(body: &str) -> ::redis::Script {
    ::redis::Script::new(&format!("{}{}", PRELUDE, body))
}

/// Lower bound (inclusive) for `ZRANGEBYLEX`.
fn lex_min(start: &str) -> Vec<u8> {
    let mut bound = Vec::with_capacity(start.len() + 1);
    bound.push(b'[');
    bound.extend_from_slice(start.as_bytes());
    bound
}

/// Upper bound (exclusive) for `ZRANGEBYLEX`. UTF-8 never contains `0xff`, so
/// `prefix + 0xff` sorts after every key sharing the prefix.
fn lex_max(request: &RangeRequest) -> Vec<u8> {
    let mut bound = vec![b'('];
    match &request.end {
        RangeEnd::Prefix => {
            bound.extend_from_slice(request.start.as_bytes());
            bound.push(0xff);
        }
        RangeEnd::Key(end) => bound.extend_from_slice(end.as_bytes()),
    }
    bound
}

fn parse_revision(raw: &[u8], key: &str) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            KvqError::with_internal(
                ErrorCode::StoreError,
                "Redis store metadata is corrupt",
                format!("non-numeric revision field for key {}", key),
            )
        })
}

/// Decode the flat `[key, v, c, m, n, key, v, ...]` script reply.
fn decode_entries(flat: Vec<Vec<u8>>) -> Result<Vec<KeyValue>> {
    if flat.len() % 5 != 0 {
        return Err(KvqError::with_internal(
            ErrorCode::StoreError,
            "Unexpected reply from Redis store",
            format!("expected groups of 5 fields, got {}", flat.len()),
        ));
    }
    let mut out = Vec::with_capacity(flat.len() / 5);
    let mut fields = flat.into_iter();
    while let (Some(key), Some(value), Some(c), Some(m), Some(n)) = (
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
    ) {
        let key = String::from_utf8(key).map_err(|e| {
            KvqError::with_internal(ErrorCode::StoreError, "Redis store key is not UTF-8", e.to_string())
        })?;
        out.push(KeyValue {
            create_revision: parse_revision(&c, &key)?,
            mod_revision: parse_revision(&m, &key)?,
            version: parse_revision(&n, &key)?,
            value,
            key,
        });
    }
    Ok(out)
}

/// Key-value store on a single Redis primary.
pub struct RedisStore {
    conn: ::redis::aio::ConnectionManager,
    key_prefix: String,
    get_script: ::redis::Script,
    range_script: ::redis::Script,
    put_script: ::redis::Script,
    delete_script: ::redis::Script,
    delete_range_script: ::redis::Script,
    txn_script: ::redis::Script,
}

impl RedisStore {
    /// Open a reconnecting connection and verify it with `PING`.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = ::redis::Client::open(url).map_err(|e| {
            KvqError::with_internal(ErrorCode::InvalidConfiguration, "Invalid Redis URL", e.to_string())
        })?;
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(|e| KvqError::store_unavailable("redis", e.to_string()))?;

        ::redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| KvqError::store_unavailable("redis", e.to_string()))?;

        Ok(Self::with_connection(conn, key_prefix))
    }

    /// Wrap an existing connection.
    pub fn with_connection(conn: ::redis::aio::ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            get_script: script(GET_SCRIPT),
            range_script: script(RANGE_SCRIPT),
            put_script: script(PUT_SCRIPT),
            delete_script: script(DELETE_SCRIPT),
            delete_range_script: script(DELETE_RANGE_SCRIPT),
            txn_script: script(TXN_SCRIPT),
        }
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    async fn run<T: ::redis::FromRedisValue>(
        &self,
        operation: &'static str,
        invocation: ::redis::ScriptInvocation<'_>,
    ) -> Result<T> {
        let start = Instant::now();
        let mut conn = self.conn.clone();
        let result = invocation.invoke_async::<_, T>(&mut conn).await;
        histogram!("kvq_store_op_duration_seconds", "backend" => "redis", "op" => operation)
            .record(start.elapsed().as_secs_f64());
        result.map_err(|e| {
            tracing::debug!(operation, error = %e, "Redis store operation failed");
            KvqError::from(e)
        })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut invocation = self.get_script.prepare_invoke();
        invocation.arg(&self.key_prefix).arg(key);
        let flat: Vec<Vec<u8>> = self.run("get", invocation).await?;
        Ok(decode_entries(flat)?.into_iter().next())
    }

    async fn range(&self, request: RangeRequest) -> Result<Vec<KeyValue>> {
        let order = match request.order {
            SortOrder::Ascend => "asc",
            SortOrder::Descend => "desc",
        };
        let mut invocation = self.range_script.prepare_invoke();
        invocation
            .arg(&self.key_prefix)
            .arg(lex_min(&request.start))
            .arg(lex_max(&request))
            .arg(request.limit.unwrap_or(0))
            .arg(order);
        let flat: Vec<Vec<u8>> = self.run("range", invocation).await?;
        decode_entries(flat)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<Revision> {
        let mut invocation = self.put_script.prepare_invoke();
        invocation.arg(&self.key_prefix).arg(key).arg(value);
        self.run("put", invocation).await
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut invocation = self.delete_script.prepare_invoke();
        invocation.arg(&self.key_prefix).arg(key);
        self.run("delete", invocation).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let request = RangeRequest::prefix(prefix);
        let mut invocation = self.delete_range_script.prepare_invoke();
        invocation
            .arg(&self.key_prefix)
            .arg(lex_min(prefix))
            .arg(lex_max(&request));
        self.run("delete_prefix", invocation).await
    }

    async fn count_prefix(&self, prefix: &str) -> Result<u64> {
        let request = RangeRequest::prefix(prefix);
        let mut conn = self.conn.clone();
        let count: u64 = ::redis::cmd("ZLEXCOUNT")
            .arg(format!("{}idx", self.key_prefix))
            .arg(lex_min(prefix))
            .arg(lex_max(&request))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn transact(&self, txn: Txn) -> Result<TxnResponse> {
        let mut invocation = self.txn_script.prepare_invoke();
        invocation.arg(&self.key_prefix).arg(txn.compare.len());
        for compare in &txn.compare {
            match compare {
                Compare::ModRevision { key, expected } => {
                    invocation.arg(key).arg(*expected);
                }
            }
        }
        for op in &txn.success {
            match op {
                TxnOp::Put { key, value } => {
                    invocation.arg("put").arg(key).arg(value.as_slice());
                }
                TxnOp::Delete { key } => {
                    invocation.arg("del").arg(key).arg("");
                }
            }
        }

        let reply: Vec<i64> = self.run("transact", invocation).await?;
        match reply.as_slice() {
            [succeeded, revision] => Ok(TxnResponse {
                succeeded: *succeeded == 1,
                revision: *revision,
            }),
            other => Err(KvqError::with_internal(
                ErrorCode::StoreError,
                "Unexpected reply from Redis store",
                format!("transaction returned {} fields", other.len()),
            )),
        }
    }
}
