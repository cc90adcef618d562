// src/store/redis_store.rs
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use serde::de::DeserializeOwned;

use super::{BookingStore, ClaimOutcome, DriverStore, EarningStore, SpatialIndex};
use crate::errors::{AppError, AppResult};
use crate::models::{Booking, BookingFilter, BookingStatus, Driver, DriverEarning, GeoPoint};

// Cache key generators for the stored documents
pub struct CacheKeys;

impl CacheKeys {
    pub fn booking_by_id(booking_id: &str) -> String {
        format!("booking:id:{}", booking_id)
    }

    pub fn all_bookings() -> String {
        "bookings:all".to_string()
    }

    pub fn bookings_by_user(user_id: &str) -> String {
        format!("bookings:user:{}", user_id)
    }

    pub fn bookings_by_driver(driver_id: &str) -> String {
        format!("bookings:driver:{}", driver_id)
    }

    pub const DRIVER_ACTIVE_PREFIX: &'static str = "driver:active:";

    /// Derived pointer from a driver to the booking they currently hold.
    pub fn driver_active_booking(driver_id: &str) -> String {
        format!("{}{}", Self::DRIVER_ACTIVE_PREFIX, driver_id)
    }

    pub fn driver_by_id(driver_id: &str) -> String {
        format!("driver:id:{}", driver_id)
    }

    pub fn driver_stats(driver_id: &str) -> String {
        format!("driver:stats:{}", driver_id)
    }

    pub fn all_drivers() -> String {
        "drivers:all".to_string()
    }

    pub fn earnings_by_driver(driver_id: &str) -> String {
        format!("earnings:driver:{}", driver_id)
    }

    pub fn earnings_by_booking(booking_id: &str) -> String {
        format!("earnings:booking:{}", booking_id)
    }

    pub fn earning_marker(booking_id: &str, kind: &str) -> String {
        format!("earning:once:{}:{}", booking_id, kind)
    }

    pub fn driver_locations() -> String {
        "drivers:locations".to_string()
    }
}

// KEYS[1] booking, ARGV[1] expected status, ARGV[2] new document,
// ARGV[3] driver-active key prefix, ARGV[4] expected revision.
// Releases the previous driver's active pointer when the new document no
// longer holds that driver in an active status.
const REPLACE_IF_STATUS: &str = r#"
local cur = redis.call('GET', KEYS[1])
if not cur then return -1 end
local doc = cjson.decode(cur)
if doc['status'] ~= ARGV[1] then return 0 end
if (tonumber(doc['revision']) or 0) ~= tonumber(ARGV[4]) then return 0 end
redis.call('SET', KEYS[1], ARGV[2])
local driver = doc['driver_id']
if driver and driver ~= cjson.null then
  local new = cjson.decode(ARGV[2])
  local active = { accepted = true, confirmed = true, started = true, in_progress = true }
  if not active[new['status']] or new['driver_id'] ~= driver then
    local key = ARGV[3] .. driver
    if redis.call('GET', key) == doc['id'] then redis.call('DEL', key) end
  end
end
return 1
"#;

// KEYS[1] booking, KEYS[2] driver-active pointer, KEYS[3] driver index,
// ARGV[1] new document, ARGV[2] booking id, ARGV[3] booking key prefix,
// ARGV[4] expected revision.
// Returns 1 claimed, -1 missing, -2 driver busy, -3 stale, or the current
// status.
const CLAIM_PENDING: &str = r#"
local cur = redis.call('GET', KEYS[1])
if not cur then return -1 end
local doc = cjson.decode(cur)
local status = doc['status']
if status ~= 'pending' then return status end
if (tonumber(doc['revision']) or 0) ~= tonumber(ARGV[4]) then return -3 end
local holder = redis.call('GET', KEYS[2])
if holder and holder ~= ARGV[2] then
  local held = redis.call('GET', ARGV[3] .. holder)
  if held then
    local held_status = cjson.decode(held)['status']
    local active = { accepted = true, confirmed = true, started = true, in_progress = true }
    if active[held_status] then return -2 end
  end
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[2])
return 1
"#;

// KEYS[1] booking, KEYS[2] all-bookings index, KEYS[3] user index,
// ARGV[1] expected status, ARGV[2] booking id.
const DELETE_IF_STATUS: &str = r#"
local cur = redis.call('GET', KEYS[1])
if not cur then return 0 end
if cjson.decode(cur)['status'] ~= ARGV[1] then return 0 end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[2])
redis.call('SREM', KEYS[3], ARGV[2])
return 1
"#;

// KEYS[1] once-per-booking marker (or empty), KEYS[2] driver ledger,
// KEYS[3] booking ledger, ARGV[1] entry, ARGV[2] enforce marker flag.
const APPEND_EARNING: &str = r#"
if ARGV[2] == '1' then
  if redis.call('SETNX', KEYS[1], '1') == 0 then return 0 end
end
redis.call('RPUSH', KEYS[2], ARGV[1])
redis.call('RPUSH', KEYS[3], ARGV[1])
return 1
"#;

/// Redis-backed document store. Documents are JSON strings; driver
/// counters live in a separate hash so increments stay atomic.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> AppResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        tracing::info!("Connected to Redis document store");
        Ok(Self { conn })
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn mget_json<T: DeserializeOwned>(&self, keys: Vec<String>) -> AppResult<Vec<T>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let docs: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        docs.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(AppError::from))
            .collect()
    }

    async fn smembers(&self, key: &str) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn lrange_json<T: DeserializeOwned>(&self, key: &str) -> AppResult<Vec<T>> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = redis::cmd("LRANGE").arg(key).arg(0).arg(-1).query_async(&mut conn).await?;
        entries
            .iter()
            .map(|json| serde_json::from_str(json).map_err(AppError::from))
            .collect()
    }

    async fn with_stats(&self, mut driver: Driver) -> AppResult<Driver> {
        let mut conn = self.conn.clone();
        let (earnings, trips): (Option<i64>, Option<u32>) = redis::cmd("HMGET")
            .arg(CacheKeys::driver_stats(&driver.id))
            .arg("total_earnings")
            .arg("total_trips")
            .query_async(&mut conn)
            .await?;
        driver.total_earnings = earnings.unwrap_or(0);
        driver.total_trips = trips.unwrap_or(0);
        Ok(driver)
    }
}

#[async_trait]
impl BookingStore for RedisStore {
    async fn insert_booking(&self, booking: &Booking) -> AppResult<()> {
        let json = serde_json::to_string(booking)?;
        let mut conn = self.conn.clone();

        let created: bool = redis::cmd("SET")
            .arg(CacheKeys::booking_by_id(&booking.id))
            .arg(json)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        if !created {
            return Err(AppError::Conflict(format!("Booking {} already exists", booking.id)));
        }

        redis::pipe()
            .cmd("SADD").arg(CacheKeys::all_bookings()).arg(&booking.id).ignore()
            .cmd("SADD").arg(CacheKeys::bookings_by_user(&booking.user_id)).arg(&booking.id).ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_booking(&self, booking_id: &str) -> AppResult<Option<Booking>> {
        self.get_json(&CacheKeys::booking_by_id(booking_id)).await
    }

    async fn list_bookings(&self, filter: &BookingFilter) -> AppResult<Vec<Booking>> {
        let index = match (&filter.driver_id, &filter.user_id) {
            (Some(driver_id), _) => CacheKeys::bookings_by_driver(driver_id),
            (None, Some(user_id)) => CacheKeys::bookings_by_user(user_id),
            (None, None) => CacheKeys::all_bookings(),
        };
        let keys = self
            .smembers(&index)
            .await?
            .iter()
            .map(|id| CacheKeys::booking_by_id(id))
            .collect();

        // Index sets may hold stale ids; the filter is the source of truth
        let mut bookings: Vec<Booking> = self.mget_json(keys).await?;
        bookings.retain(|b| filter.matches(b));
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(bookings)
    }

    async fn replace_booking_if(
        &self,
        booking: &Booking,
        expected: BookingStatus,
        expected_revision: u64,
    ) -> AppResult<bool> {
        let json = serde_json::to_string(booking)?;
        let mut conn = self.conn.clone();
        let result: i64 = Script::new(REPLACE_IF_STATUS)
            .key(CacheKeys::booking_by_id(&booking.id))
            .arg(expected.as_str())
            .arg(json)
            .arg(CacheKeys::DRIVER_ACTIVE_PREFIX)
            .arg(expected_revision)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn claim_booking(&self, booking: &Booking, expected_revision: u64) -> AppResult<ClaimOutcome> {
        let Some(driver_id) = booking.driver_id.as_deref() else {
            return Err(AppError::internal_error("claim_booking called without a driver"));
        };
        let json = serde_json::to_string(booking)?;
        let mut conn = self.conn.clone();

        let result: redis::Value = Script::new(CLAIM_PENDING)
            .key(CacheKeys::booking_by_id(&booking.id))
            .key(CacheKeys::driver_active_booking(driver_id))
            .key(CacheKeys::bookings_by_driver(driver_id))
            .arg(json)
            .arg(&booking.id)
            .arg(CacheKeys::booking_by_id(""))
            .arg(expected_revision)
            .invoke_async(&mut conn)
            .await?;

        match result {
            redis::Value::Int(1) => Ok(ClaimOutcome::Claimed),
            redis::Value::Int(-1) => Ok(ClaimOutcome::Missing),
            redis::Value::Int(-2) => Ok(ClaimOutcome::DriverBusy),
            redis::Value::Int(-3) => Ok(ClaimOutcome::Stale),
            redis::Value::Data(bytes) => {
                let status: BookingStatus = serde_json::from_value(serde_json::Value::String(
                    String::from_utf8_lossy(&bytes).into_owned(),
                ))?;
                Ok(ClaimOutcome::StatusChanged(status))
            }
            other => Err(AppError::internal_error(format!("Unexpected claim reply: {:?}", other))),
        }
    }

    async fn delete_booking_if(&self, booking_id: &str, expected: BookingStatus) -> AppResult<bool> {
        let Some(booking) = self.get_booking(booking_id).await? else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let result: i64 = Script::new(DELETE_IF_STATUS)
            .key(CacheKeys::booking_by_id(booking_id))
            .key(CacheKeys::all_bookings())
            .key(CacheKeys::bookings_by_user(&booking.user_id))
            .arg(expected.as_str())
            .arg(booking_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn active_booking_for_driver(&self, driver_id: &str) -> AppResult<Option<Booking>> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = redis::cmd("GET")
            .arg(CacheKeys::driver_active_booking(driver_id))
            .query_async(&mut conn)
            .await?;
        let Some(booking_id) = holder else {
            return Ok(None);
        };
        let booking = self.get_booking(&booking_id).await?;
        Ok(booking.filter(|b| b.is_held_by(driver_id)))
    }
}

#[async_trait]
impl DriverStore for RedisStore {
    async fn insert_driver(&self, driver: &Driver) -> AppResult<()> {
        let json = serde_json::to_string(driver)?;
        let mut conn = self.conn.clone();
        let created: bool = redis::cmd("SET")
            .arg(CacheKeys::driver_by_id(&driver.id))
            .arg(json)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        if !created {
            return Err(AppError::Conflict(format!("Driver {} already exists", driver.id)));
        }
        redis::pipe()
            .cmd("SADD").arg(CacheKeys::all_drivers()).arg(&driver.id).ignore()
            .cmd("HSET").arg(CacheKeys::driver_stats(&driver.id))
                .arg("total_earnings").arg(driver.total_earnings)
                .arg("total_trips").arg(driver.total_trips).ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_driver(&self, driver_id: &str) -> AppResult<Option<Driver>> {
        match self.get_json::<Driver>(&CacheKeys::driver_by_id(driver_id)).await? {
            Some(driver) => Ok(Some(self.with_stats(driver).await?)),
            None => Ok(None),
        }
    }

    async fn list_drivers(&self) -> AppResult<Vec<Driver>> {
        let keys = self
            .smembers(&CacheKeys::all_drivers())
            .await?
            .iter()
            .map(|id| CacheKeys::driver_by_id(id))
            .collect();
        let drivers: Vec<Driver> = self.mget_json(keys).await?;

        let mut with_stats = Vec::with_capacity(drivers.len());
        for driver in drivers {
            with_stats.push(self.with_stats(driver).await?);
        }
        Ok(with_stats)
    }

    async fn update_driver(&self, driver: &Driver) -> AppResult<()> {
        let json = serde_json::to_string(driver)?;
        let mut conn = self.conn.clone();
        let updated: bool = redis::cmd("SET")
            .arg(CacheKeys::driver_by_id(&driver.id))
            .arg(json)
            .arg("XX")
            .query_async(&mut conn)
            .await?;
        if !updated {
            return Err(AppError::driver_not_found(&driver.id));
        }
        Ok(())
    }

    async fn credit_driver(&self, driver_id: &str, amount: i64, trips: u32) -> AppResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("HINCRBY").arg(CacheKeys::driver_stats(driver_id)).arg("total_earnings").arg(amount).ignore()
            .cmd("HINCRBY").arg(CacheKeys::driver_stats(driver_id)).arg("total_trips").arg(trips).ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_driver_totals(&self, driver_id: &str, total_earnings: i64, total_trips: u32) -> AppResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(CacheKeys::driver_stats(driver_id))
            .arg("total_earnings")
            .arg(total_earnings)
            .arg("total_trips")
            .arg(total_trips)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EarningStore for RedisStore {
    async fn append_earning(&self, earning: &DriverEarning) -> AppResult<()> {
        let json = serde_json::to_string(earning)?;
        let once = earning.kind.is_once_per_booking();
        let mut conn = self.conn.clone();

        let appended: i64 = Script::new(APPEND_EARNING)
            .key(CacheKeys::earning_marker(&earning.booking_id, earning.kind.as_str()))
            .key(CacheKeys::earnings_by_driver(&earning.driver_id))
            .key(CacheKeys::earnings_by_booking(&earning.booking_id))
            .arg(json)
            .arg(if once { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        if appended == 0 {
            return Err(AppError::Conflict(format!(
                "{} already recorded for booking {}",
                earning.kind, earning.booking_id
            )));
        }
        Ok(())
    }

    async fn list_earnings(&self, driver_id: &str) -> AppResult<Vec<DriverEarning>> {
        self.lrange_json(&CacheKeys::earnings_by_driver(driver_id)).await
    }

    async fn list_booking_earnings(&self, booking_id: &str) -> AppResult<Vec<DriverEarning>> {
        self.lrange_json(&CacheKeys::earnings_by_booking(booking_id)).await
    }
}

/// Driver positions in a Redis geo set.
#[derive(Clone)]
pub struct RedisGeoIndex {
    conn: MultiplexedConnection,
}

impl RedisGeoIndex {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SpatialIndex for RedisGeoIndex {
    async fn update_location(&self, driver_id: &str, point: GeoPoint) -> AppResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("GEOADD")
            .arg(CacheKeys::driver_locations())
            .arg(point.lng)
            .arg(point.lat)
            .arg(driver_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, driver_id: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREM")
            .arg(CacheKeys::driver_locations())
            .arg(driver_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn nearby(&self, center: GeoPoint, radius_m: f64, limit: usize) -> AppResult<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        let hits: Vec<(String, f64)> = redis::cmd("GEORADIUS")
            .arg(CacheKeys::driver_locations())
            .arg(center.lng)
            .arg(center.lat)
            .arg(radius_m)
            .arg("m")
            .arg("WITHDIST")
            .arg("ASC")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(hits)
    }
}
