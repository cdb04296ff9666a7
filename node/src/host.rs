use std::{
    collections::BTreeMap,
    fs,
    io::Read as _,
    path::PathBuf,
    thread,
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use airnode_common::{
    boot::{run_cycle, Board, BootInfo, BootOutcome, Sensor},
    link::{LinkError, NetLink},
    ota::{FirmwareDigest, OtaBackend, OtaError, OtaSession},
    platform::{Clock, Indicator, Timing},
    store::{KvStore, StoreError},
    types::{ApBandwidth, ApInfo, Measurement, SensorSerial, WakeReason},
    uplink::{ExchangeError, Transport, RESPONSE_LIMIT},
    HardwareFault, NodeConfig, ScheduleStore,
};

const PENDING_VERIFY_MARKER: &str = "pending_verify";
const UPDATE_SLOT_FILE: &str = "update.bin";

/// File-per-namespace store. Every mutation rewrites the namespace file
/// through a temp file and rename; the rename is the commit point.
struct FsStore {
    root: PathBuf,
}

impl FsStore {
    fn new(root: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("creating state dir {}", root.display()))?;
        Ok(Self { root })
    }

    fn space_path(&self, namespace: &str) -> PathBuf {
        self.root.join(format!("{namespace}.json"))
    }

    fn read_space(&self, namespace: &str) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        let path = self.space_path(namespace);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read(&path).map_err(|err| StoreError::Backend(err.to_string()))?;
        serde_json::from_slice(&raw).map_err(|err| StoreError::Backend(err.to_string()))
    }

    fn write_space(
        &self,
        namespace: &str,
        space: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), StoreError> {
        let path = self.space_path(namespace);
        let tmp = path.with_extension("tmp");
        let raw =
            serde_json::to_vec(space).map_err(|err| StoreError::Backend(err.to_string()))?;
        fs::write(&tmp, raw).map_err(|err| StoreError::Backend(err.to_string()))?;
        fs::rename(&tmp, &path).map_err(|err| StoreError::Backend(err.to_string()))
    }
}

impl KvStore for FsStore {
    fn get(&mut self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read_space(namespace)?.get(key).cloned())
    }

    fn put(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut space = self.read_space(namespace)?;
        space.insert(key.to_string(), value.to_vec());
        self.write_space(namespace, &space)
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut space = self.read_space(namespace)?;
        if space.remove(key).is_some() {
            self.write_space(namespace, &space)?;
        }
        Ok(())
    }

    fn keys(&mut self, namespace: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.read_space(namespace)?.keys().cloned().collect())
    }

    fn clear(&mut self, namespace: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.space_path(namespace)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }
}

/// Stand-in for the transducer: plausible raw codes that wander a little from
/// boot to boot. Swap in the real I2C driver on the device build.
struct SimSensor {
    serial: SensorSerial,
    boots: u32,
}

impl Sensor for SimSensor {
    fn identity(&mut self) -> Result<SensorSerial, HardwareFault> {
        Ok(self.serial)
    }

    fn read(&mut self) -> Result<Measurement, HardwareFault> {
        Ok(Measurement {
            temperature_raw: 0x6000 + (self.boots % 8) as u16 * 0x40,
            humidity_raw: 0x9800 + (self.boots % 6) as u16 * 0x20,
        })
    }
}

struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> u32 {
        u32::try_from(Utc::now().timestamp()).unwrap_or(0)
    }
}

/// The host has no radio: "association" always succeeds and the OS clock
/// counts as synchronized.
#[derive(Default)]
struct HostLink;

impl NetLink for HostLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    fn access_point(&mut self) -> ApInfo {
        ApInfo {
            ssid: "hostnet".to_string(),
            rssi: -55,
            channel: 1,
            bandwidth: ApBandwidth::Single,
        }
    }

    fn start_clock_sync(&mut self) {}

    fn clock_synced(&mut self) -> bool {
        true
    }

    fn shutdown(&mut self) {
        info!("link down");
    }
}

struct HostTransport {
    client: reqwest::blocking::Client,
}

impl Transport for HostTransport {
    fn post(&mut self, url: &str, body: &str) -> Result<String, ExchangeError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .map_err(|err| {
                if err.is_connect() {
                    ExchangeError::Open
                } else {
                    ExchangeError::Write
                }
            })?;

        let declared = match response.content_length() {
            Some(len) if len > 0 && len <= RESPONSE_LIMIT as u64 => len as usize,
            Some(len) => return Err(ExchangeError::Length(len as i64)),
            None => return Err(ExchangeError::Length(-1)),
        };

        let mut raw = Vec::with_capacity(declared);
        let got = response
            .take(RESPONSE_LIMIT as u64 + 1)
            .read_to_end(&mut raw)
            .map_err(|_| ExchangeError::Read)?;
        if got != declared {
            return Err(ExchangeError::LengthMismatch { declared, got });
        }

        String::from_utf8(raw).map_err(|_| ExchangeError::Parse)
    }
}

/// Simulated update slots: the "running image" is this executable, installs
/// land in the state directory, and a marker file stands in for the loader's
/// pending-verify flag across simulated reboots.
struct HostOta {
    client: reqwest::blocking::Client,
    running: FirmwareDigest,
    root: PathBuf,
}

impl HostOta {
    fn new(client: reqwest::blocking::Client, root: PathBuf) -> anyhow::Result<Self> {
        let exe = std::env::current_exe().context("locating running image")?;
        let raw = fs::read(&exe).context("hashing running image")?;
        let mut running = [0_u8; 32];
        running.copy_from_slice(&Sha256::digest(&raw));
        Ok(Self {
            client,
            running: FirmwareDigest(running),
            root,
        })
    }

    fn marker_path(&self) -> PathBuf {
        self.root.join(PENDING_VERIFY_MARKER)
    }
}

struct HostOtaSession {
    image: Vec<u8>,
    slot: PathBuf,
    marker: PathBuf,
}

impl OtaSession for HostOtaSession {
    fn image_digest(&mut self) -> Result<FirmwareDigest, OtaError> {
        if self.image.is_empty() {
            return Err(OtaError::Descriptor);
        }
        let mut digest = [0_u8; 32];
        digest.copy_from_slice(&Sha256::digest(&self.image));
        Ok(FirmwareDigest(digest))
    }

    fn install(self) -> Result<(), OtaError> {
        let tmp = self.slot.with_extension("tmp");
        fs::write(&tmp, &self.image).map_err(|_| OtaError::Download)?;
        fs::rename(&tmp, &self.slot).map_err(|_| OtaError::Finalize)?;
        fs::write(&self.marker, b"1").map_err(|_| OtaError::Finalize)?;
        Ok(())
    }

    fn abort(self) {}
}

impl OtaBackend for HostOta {
    type Session = HostOtaSession;

    fn begin(&mut self, url: &str) -> Result<HostOtaSession, OtaError> {
        let response = self.client.get(url).send().map_err(|_| OtaError::Begin)?;
        if !response.status().is_success() {
            return Err(OtaError::Begin);
        }
        let image = response.bytes().map_err(|_| OtaError::Download)?.to_vec();
        Ok(HostOtaSession {
            image,
            slot: self.root.join(UPDATE_SLOT_FILE),
            marker: self.marker_path(),
        })
    }

    fn running_digest(&self) -> FirmwareDigest {
        self.running
    }

    fn pending_verify(&mut self) -> bool {
        self.marker_path().exists()
    }

    fn mark_valid(&mut self) {
        if let Err(err) = fs::remove_file(self.marker_path()) {
            warn!("could not clear pending-verify marker: {err}");
        }
    }
}

struct HostTiming;

impl Timing for HostTiming {
    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn low_power_wait_us(&mut self, us: u64) {
        thread::sleep(Duration::from_micros(us));
    }

    fn random(&mut self) -> u32 {
        rand::random()
    }
}

struct LedLog;

impl Indicator for LedLog {
    fn flash(&mut self, count: u32, period_ms: u64) {
        info!("status led: {count} blinks of {period_ms}ms");
    }
}

fn env_or(name: &str, fallback: String) -> String {
    std::env::var(name).unwrap_or(fallback)
}

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let defaults = NodeConfig::default();
    let config = NodeConfig {
        collector_host: env_or("COLLECTOR_HOST", defaults.collector_host),
        ntp_server: env_or("NTP_SERVER", defaults.ntp_server),
    };
    let state_dir = PathBuf::from(env_or("AIRNODE_STATE_DIR", "./airnode-state".to_string()));
    let time_scale: u32 = std::env::var("AIRNODE_TIME_SCALE")
        .ok()
        .and_then(|value| value.parse().ok())
        .filter(|value| *value > 0)
        .unwrap_or(1);

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("building http client")?;

    info!(
        "simulated node starting (collector {}, state in {})",
        config.collector_host,
        state_dir.display()
    );

    let mut wake_reason = WakeReason::Initial;
    let mut boots = 0_u32;

    loop {
        boots = boots.saturating_add(1);

        // Everything volatile dies with the simulated power cycle; only the
        // state directory carries over, exactly like the device's store.
        let mut board = Board {
            sensor: SimSensor {
                serial: SensorSerial([0x5150, 0xc0de, 0x0001]),
                boots,
            },
            store: ScheduleStore::new(FsStore::new(state_dir.clone())?),
            clock: SystemClock,
            link: HostLink,
            transport: HostTransport {
                client: client.clone(),
            },
            ota: HostOta::new(client.clone(), state_dir.clone())?,
            timing: HostTiming,
            led: LedLog,
        };
        let boot = BootInfo {
            wake_reason,
            config: config.clone(),
        };

        match run_cycle(&mut board, &boot) {
            Ok(BootOutcome::Sleep(duration)) => {
                info!("deep sleep for {}s", duration.as_secs());
                thread::sleep(duration / time_scale);
                wake_reason = WakeReason::DeepSleep;
            }
            Ok(BootOutcome::Restart) => {
                info!("restarting into new image");
                wake_reason = WakeReason::Reset;
            }
            Err(fault) => {
                return Err(anyhow::Error::new(fault).context("hardware fault at boot"));
            }
        }
    }
}
