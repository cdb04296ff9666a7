//! Shared fakes for the colocated unit tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use crate::boot::{HardwareFault, Sensor};
use crate::link::{LinkError, NetLink};
use crate::ota::{FirmwareDigest, OtaBackend, OtaError, OtaSession};
use crate::platform::{Clock, Indicator, Timing};
use crate::report::Report;
use crate::store::{KvStore, StoreError};
use crate::types::{ApBandwidth, ApInfo, Measurement, SensorSerial, WakeReason};
use crate::uplink::{ExchangeError, Transport};

#[derive(Default)]
pub(crate) struct MemStore {
    spaces: HashMap<String, BTreeMap<String, Vec<u8>>>,
}

impl KvStore for MemStore {
    fn get(&mut self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .spaces
            .get(namespace)
            .and_then(|space| space.get(key))
            .cloned())
    }

    fn put(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.spaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StoreError> {
        if let Some(space) = self.spaces.get_mut(namespace) {
            space.remove(key);
        }
        Ok(())
    }

    fn keys(&mut self, namespace: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .spaces
            .get(namespace)
            .map(|space| space.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn clear(&mut self, namespace: &str) -> Result<(), StoreError> {
        self.spaces.remove(namespace);
        Ok(())
    }
}

pub(crate) struct FakeClock(pub u32);

impl Clock for FakeClock {
    fn now_epoch(&self) -> u32 {
        self.0
    }
}

#[derive(Default)]
pub(crate) struct FakeTiming {
    pub delays_ms: Vec<u64>,
    pub waits_us: Vec<u64>,
    pub next_random: u32,
}

impl Timing for FakeTiming {
    fn delay_ms(&mut self, ms: u64) {
        self.delays_ms.push(ms);
    }

    fn low_power_wait_us(&mut self, us: u64) {
        self.waits_us.push(us);
    }

    fn random(&mut self) -> u32 {
        self.next_random
    }
}

#[derive(Default)]
pub(crate) struct FakeLed {
    pub flashes: Vec<(u32, u64)>,
}

impl Indicator for FakeLed {
    fn flash(&mut self, count: u32, period_ms: u64) {
        self.flashes.push((count, period_ms));
    }
}

pub(crate) struct FakeLink {
    pub fail_connects: u32,
    pub connects: u32,
    pub synced: bool,
    pub synced_after_polls: u32,
    pub polls: u32,
    pub sync_started: bool,
    pub shutdowns: u32,
    pub ap: ApInfo,
}

impl Default for FakeLink {
    fn default() -> Self {
        Self {
            fail_connects: 0,
            connects: 0,
            synced: true,
            synced_after_polls: 0,
            polls: 0,
            sync_started: false,
            shutdowns: 0,
            ap: ApInfo {
                ssid: "attic".to_string(),
                rssi: -61,
                channel: 6,
                bandwidth: ApBandwidth::Single,
            },
        }
    }
}

impl NetLink for FakeLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        if self.connects < self.fail_connects {
            self.connects = self.connects.saturating_add(1);
            return Err(LinkError::Connect);
        }
        self.connects = self.connects.saturating_add(1);
        Ok(())
    }

    fn access_point(&mut self) -> ApInfo {
        self.ap.clone()
    }

    fn start_clock_sync(&mut self) {
        self.sync_started = true;
    }

    fn clock_synced(&mut self) -> bool {
        if self.synced_after_polls > 0 {
            self.polls += 1;
            return self.polls > self.synced_after_polls;
        }
        self.synced
    }

    fn shutdown(&mut self) {
        self.shutdowns += 1;
    }
}

pub(crate) struct FakeTransport {
    script: VecDeque<Result<String, ExchangeError>>,
    repeat: Option<ExchangeError>,
    pub bodies: Vec<String>,
}

impl FakeTransport {
    pub fn scripted(script: Vec<Result<String, ExchangeError>>) -> Self {
        Self {
            script: script.into(),
            repeat: None,
            bodies: Vec::new(),
        }
    }

    pub fn always(err: ExchangeError) -> Self {
        Self {
            script: VecDeque::new(),
            repeat: Some(err),
            bodies: Vec::new(),
        }
    }
}

impl Transport for FakeTransport {
    fn post(&mut self, _url: &str, body: &str) -> Result<String, ExchangeError> {
        self.bodies.push(body.to_string());
        if let Some(err) = &self.repeat {
            return Err(err.clone());
        }
        self.script
            .pop_front()
            .unwrap_or(Err(ExchangeError::Open))
    }
}

#[derive(Debug, Default)]
pub(crate) struct OtaLog {
    pub begun: u32,
    pub installed: u32,
    pub aborted: u32,
    pub marked_valid: bool,
}

pub(crate) struct FakeOta {
    pub running: FirmwareDigest,
    pub offered: Result<FirmwareDigest, OtaError>,
    pub install_result: Result<(), OtaError>,
    pub pending: bool,
    pub log: Rc<RefCell<OtaLog>>,
    pub urls: Rc<RefCell<Vec<String>>>,
}

impl FakeOta {
    pub fn new(running: FirmwareDigest, offered: Result<FirmwareDigest, OtaError>) -> Self {
        Self {
            running,
            offered,
            install_result: Ok(()),
            pending: false,
            log: Rc::new(RefCell::new(OtaLog::default())),
            urls: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

pub(crate) struct FakeSession {
    offered: Result<FirmwareDigest, OtaError>,
    install_result: Result<(), OtaError>,
    log: Rc<RefCell<OtaLog>>,
}

impl OtaSession for FakeSession {
    fn image_digest(&mut self) -> Result<FirmwareDigest, OtaError> {
        self.offered.clone()
    }

    fn install(self) -> Result<(), OtaError> {
        self.install_result.clone()?;
        self.log.borrow_mut().installed += 1;
        Ok(())
    }

    fn abort(self) {
        self.log.borrow_mut().aborted += 1;
    }
}

impl OtaBackend for FakeOta {
    type Session = FakeSession;

    fn begin(&mut self, url: &str) -> Result<FakeSession, OtaError> {
        self.log.borrow_mut().begun += 1;
        self.urls.borrow_mut().push(url.to_string());
        Ok(FakeSession {
            offered: self.offered.clone(),
            install_result: self.install_result.clone(),
            log: Rc::clone(&self.log),
        })
    }

    fn running_digest(&self) -> FirmwareDigest {
        self.running
    }

    fn pending_verify(&mut self) -> bool {
        self.pending
    }

    fn mark_valid(&mut self) {
        self.pending = false;
        self.log.borrow_mut().marked_valid = true;
    }
}

pub(crate) struct FakeSensor {
    pub serial: SensorSerial,
    pub reading: Measurement,
    pub fail: bool,
}

impl Default for FakeSensor {
    fn default() -> Self {
        Self {
            serial: SensorSerial([0x0001, 0xbeef, 0x00aa]),
            reading: Measurement {
                temperature_raw: 0x6100,
                humidity_raw: 0x9a00,
            },
            fail: false,
        }
    }
}

impl Sensor for FakeSensor {
    fn identity(&mut self) -> Result<SensorSerial, HardwareFault> {
        if self.fail {
            return Err(HardwareFault("no ack on identity read".to_string()));
        }
        Ok(self.serial)
    }

    fn read(&mut self) -> Result<Measurement, HardwareFault> {
        if self.fail {
            return Err(HardwareFault("no ack on measurement read".to_string()));
        }
        Ok(self.reading)
    }
}

pub(crate) fn digest(seed: u8) -> FirmwareDigest {
    FirmwareDigest([seed; 32])
}

pub(crate) fn report_fixture() -> Report {
    Report {
        fw_sha: "0101010101010101".to_string(),
        serial: "0001beef00aa".to_string(),
        ap_rssi: -61,
        ap_channel: 6,
        ap_ssid: "attic".to_string(),
        ap_bw: ApBandwidth::Single,
        wake_reason: WakeReason::DeepSleep,
        send_delay_us: 0,
        wifi_retries: 0,
        retries: None,
        data: Vec::new(),
    }
}
