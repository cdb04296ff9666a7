use log::warn;
use thiserror::Error;

use crate::schedule::{ReportConfig, Schedule};
use crate::types::Sample;

pub const NS_CONFIG: &str = "cfg";
pub const NS_DATA: &str = "data";

const KEY_ORDERS: &str = "orders";
const KEY_SEND_DELAY: &str = "send_delay_us";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
}

/// Durable short-key storage. A `put`, `delete` or `clear` is committed by the
/// time the call returns; there are no transactions spanning keys or
/// namespaces, so callers must order writes for crash consistency.
pub trait KvStore {
    fn get(&mut self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StoreError>;
    fn keys(&mut self, namespace: &str) -> Result<Vec<String>, StoreError>;
    fn clear(&mut self, namespace: &str) -> Result<(), StoreError>;
}

// The two namespaces carry different 8-byte records. Each has its own codec;
// which one applies is decided by the namespace, never by bit layout.

pub fn encode_schedule(schedule: Schedule) -> [u8; 8] {
    let mut raw = [0_u8; 8];
    raw[0..4].copy_from_slice(&schedule.anchor_epoch.to_le_bytes());
    raw[4..6].copy_from_slice(&schedule.interval_seconds.to_le_bytes());
    raw[6..8].copy_from_slice(&schedule.sample_count.to_le_bytes());
    raw
}

pub fn decode_schedule(raw: &[u8]) -> Option<Schedule> {
    if raw.len() != 8 {
        return None;
    }
    Some(Schedule::new(
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
        u16::from_le_bytes([raw[4], raw[5]]),
        u16::from_le_bytes([raw[6], raw[7]]),
    ))
}

pub fn encode_sample(sample: Sample) -> [u8; 8] {
    let mut raw = [0_u8; 8];
    raw[0..4].copy_from_slice(&sample.epoch.to_le_bytes());
    raw[4..6].copy_from_slice(&sample.temperature_raw.to_le_bytes());
    raw[6..8].copy_from_slice(&sample.humidity_raw.to_le_bytes());
    raw
}

pub fn decode_sample(raw: &[u8]) -> Option<Sample> {
    if raw.len() != 8 {
        return None;
    }
    Some(Sample {
        epoch: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
        temperature_raw: u16::from_le_bytes([raw[4], raw[5]]),
        humidity_raw: u16::from_le_bytes([raw[6], raw[7]]),
    })
}

/// Persistence model for the standing order, the report config and the queue
/// of unsent samples. Owns all store access so write ordering stays in one
/// place.
pub struct ScheduleStore<S> {
    store: S,
}

impl<S: KvStore> ScheduleStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Read the standing order and report config, defaulting anything missing
    /// or unreadable. Bounds are clamped on read, so a corrupted or downgraded
    /// record cannot demand an overlong cadence.
    pub fn load(&mut self) -> (Schedule, ReportConfig) {
        let schedule = match self.store.get(NS_CONFIG, KEY_ORDERS) {
            Ok(Some(raw)) => decode_schedule(&raw).unwrap_or_else(|| {
                warn!("discarding malformed order record");
                Schedule::default()
            }),
            Ok(None) => Schedule::default(),
            Err(err) => {
                warn!("order read failed: {err}");
                Schedule::default()
            }
        };

        let config = match self.store.get(NS_CONFIG, KEY_SEND_DELAY) {
            Ok(Some(raw)) if raw.len() == 4 => ReportConfig {
                send_delay_us: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            },
            Ok(Some(_)) => {
                warn!("discarding malformed send-delay record");
                ReportConfig::default()
            }
            Ok(None) => ReportConfig::default(),
            Err(err) => {
                warn!("send-delay read failed: {err}");
                ReportConfig::default()
            }
        };

        (schedule, config)
    }

    pub fn save_schedule(&mut self, schedule: Schedule) -> Result<(), StoreError> {
        self.store.put(NS_CONFIG, KEY_ORDERS, &encode_schedule(schedule))
    }

    pub fn save_send_delay(&mut self, send_delay_us: u32) -> Result<(), StoreError> {
        self.store.put(NS_CONFIG, KEY_SEND_DELAY, &send_delay_us.to_le_bytes())
    }

    /// Queue one sample, keyed by its epoch: re-running the same boot's write
    /// after a power loss lands on the same key.
    pub fn enqueue(&mut self, sample: Sample) -> Result<(), StoreError> {
        self.store.put(NS_DATA, &sample.key(), &encode_sample(sample))
    }

    /// Every queued sample, ordered by epoch. Read-only: entries are deleted
    /// only once the report that carried them is acknowledged.
    pub fn queued(&mut self) -> Result<Vec<Sample>, StoreError> {
        let mut samples = Vec::new();
        for key in self.store.keys(NS_DATA)? {
            if let Some(raw) = self.store.get(NS_DATA, &key)? {
                match decode_sample(&raw) {
                    Some(sample) => samples.push(sample),
                    None => warn!("discarding malformed queue entry {key}"),
                }
            }
        }
        samples.sort_by_key(|sample| sample.epoch);
        Ok(samples)
    }

    /// Remove and return everything in the queue.
    pub fn drain(&mut self) -> Result<Vec<Sample>, StoreError> {
        let samples = self.queued()?;
        self.store.clear(NS_DATA)?;
        Ok(samples)
    }

    pub fn clear_queue(&mut self) -> Result<(), StoreError> {
        self.store.clear(NS_DATA)
    }

    /// Drop the standing order and the whole queue. Called whenever persisted
    /// state cannot be trusted: an unset clock, or an unconfirmed image whose
    /// queue encoding may differ. The queue goes first so a crash between the
    /// two writes can only leave a stale order, never orphaned samples.
    pub fn invalidate(&mut self) -> Result<(), StoreError> {
        self.store.clear(NS_DATA)?;
        self.store.delete(NS_CONFIG, KEY_ORDERS)
    }
}
