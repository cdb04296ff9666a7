use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use embedded_svc::http::{Headers, Method};
use embedded_svc::io::{Read, Write};
use esp_idf_hal::delay::{FreeRtos, BLOCK};
use esp_idf_hal::gpio::{
    AnyIOPin, AnyOutputPin, IOPin, InputOutput, Output, OutputPin, PinDriver,
};
use esp_idf_hal::i2c::{I2cConfig, I2cDriver};
use esp_idf_hal::units::FromValueType;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::prelude::Peripherals;
use esp_idf_svc::http::client::{Configuration as HttpConfiguration, EspHttpConnection};
use esp_idf_svc::log::EspLogger;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};
use esp_idf_svc::ota::EspOta;
use esp_idf_svc::sntp::{EspSntp, OperatingMode, SntpConf, SyncMode, SyncStatus};
use esp_idf_svc::sys;
use esp_idf_svc::wifi::{BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use log::{error, info, warn};

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

const HDC1080_ADDR: u8 = 0x40;
const REG_TEMPERATURE: u8 = 0x00;
const REG_HUMIDITY: u8 = 0x01;
const REG_CONFIG: u8 = 0x02;
const REG_SERIAL_FIRST: u8 = 0xFB;
const REG_SERIAL_MID: u8 = 0xFC;
const REG_SERIAL_LAST: u8 = 0xFD;

const CFG_BATTERY_LOW: u16 = 1 << 11;
const CFG_MODE_SEQ: u16 = 1 << 12;
const CFG_HEATER_ON: u16 = 1 << 13;
const CFG_HUMIDITY_RES: u16 = 3 << 8;
const CFG_TEMPERATURE_RES: u16 = 1 << 10;

// Conversion time at full resolution, per datasheet.
const MEASUREMENT_DELAY_MS: u32 = 20;

const OTA_CHUNK_SIZE: usize = 4096;
// esp_image_header_t + one segment header precede esp_app_desc_t; the ELF
// SHA-256 sits 144 bytes into the descriptor.
const IMAGE_SHA_OFFSET: usize = 24 + 8 + 144;

struct Hdc1080<'d> {
    i2c: I2cDriver<'d>,
    serial: SensorSerial,
}

impl<'d> Hdc1080<'d> {
    fn new(mut i2c: I2cDriver<'d>) -> anyhow::Result<Self> {
        // The bus pulls are unpowered across deep sleep, so the first
        // transaction may fail; issue a throwaway read.
        let mut scratch = [0_u8; 2];
        let _ = i2c.write_read(HDC1080_ADDR, &[REG_SERIAL_FIRST], &mut scratch, BLOCK);

        let serial = SensorSerial([
            Self::read_register(&mut i2c, REG_SERIAL_FIRST)?,
            Self::read_register(&mut i2c, REG_SERIAL_MID)?,
            Self::read_register(&mut i2c, REG_SERIAL_LAST)?,
        ]);

        let config = Self::read_register(&mut i2c, REG_CONFIG)?;
        if config & CFG_BATTERY_LOW != 0 {
            error!("sensor reports supply voltage at or below 2.8V");
        }

        let config =
            config & !(CFG_MODE_SEQ | CFG_HEATER_ON | CFG_HUMIDITY_RES | CFG_TEMPERATURE_RES);
        i2c.write(
            HDC1080_ADDR,
            &[REG_CONFIG, (config >> 8) as u8, (config & 0xff) as u8],
            BLOCK,
        )
        .context("writing sensor config")?;

        Ok(Self { i2c, serial })
    }

    fn read_register(i2c: &mut I2cDriver<'_>, register: u8) -> anyhow::Result<u16> {
        let mut raw = [0_u8; 2];
        i2c.write_read(HDC1080_ADDR, &[register], &mut raw, BLOCK)
            .with_context(|| format!("reading sensor register {register:#04x}"))?;
        Ok(u16::from_be_bytes(raw))
    }

    fn read_measurement(&mut self, register: u8) -> Result<u16, HardwareFault> {
        // Measurement registers need a pointer write, a conversion wait, then
        // a bare read.
        self.i2c
            .write(HDC1080_ADDR, &[register], BLOCK)
            .map_err(|err| HardwareFault(format!("measurement trigger: {err}")))?;
        FreeRtos::delay_ms(MEASUREMENT_DELAY_MS);

        let mut raw = [0_u8; 2];
        self.i2c
            .read(HDC1080_ADDR, &mut raw, BLOCK)
            .map_err(|err| HardwareFault(format!("measurement read: {err}")))?;
        Ok(u16::from_be_bytes(raw))
    }
}

impl Sensor for Hdc1080<'_> {
    fn identity(&mut self) -> Result<SensorSerial, HardwareFault> {
        Ok(self.serial)
    }

    fn read(&mut self) -> Result<Measurement, HardwareFault> {
        let temperature_raw = self.read_measurement(REG_TEMPERATURE)?;
        let humidity_raw = self.read_measurement(REG_HUMIDITY)?;
        info!("raw codes: temp={temperature_raw:#06x} humi={humidity_raw:#06x}");
        Ok(Measurement {
            temperature_raw,
            humidity_raw,
        })
    }
}

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn open(&self, namespace: &str) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, StoreError> {
        EspNvs::new(self.partition.clone(), namespace, true)
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

impl KvStore for NvsStore {
    fn get(&mut self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let nvs = self.open(namespace)?;
        let mut raw = [0_u8; 64];
        let value = nvs
            .get_raw(key, &mut raw)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(value.map(<[u8]>::to_vec))
    }

    fn put(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut nvs = self.open(namespace)?;
        nvs.set_raw(key, value)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(())
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut nvs = self.open(namespace)?;
        nvs.remove(key)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(())
    }

    fn keys(&mut self, namespace: &str) -> Result<Vec<String>, StoreError> {
        // The safe wrapper has no iterator; walk the entries the C way.
        let namespace_c = std::ffi::CString::new(namespace)
            .map_err(|_| StoreError::Backend("bad namespace".to_string()))?;
        let mut keys = Vec::new();

        unsafe {
            let mut it: sys::nvs_iterator_t = core::ptr::null_mut();
            let mut ret = sys::nvs_entry_find(
                b"nvs\0".as_ptr().cast(),
                namespace_c.as_ptr(),
                sys::nvs_type_t_NVS_TYPE_BLOB,
                &mut it,
            );
            while ret == sys::ESP_OK {
                let mut entry = sys::nvs_entry_info_t::default();
                sys::nvs_entry_info(it, &mut entry);
                let key = core::ffi::CStr::from_ptr(entry.key.as_ptr())
                    .to_string_lossy()
                    .into_owned();
                keys.push(key);
                ret = sys::nvs_entry_next(&mut it);
            }
            sys::nvs_release_iterator(it);
        }

        Ok(keys)
    }

    fn clear(&mut self, namespace: &str) -> Result<(), StoreError> {
        let namespace_c = std::ffi::CString::new(namespace)
            .map_err(|_| StoreError::Backend("bad namespace".to_string()))?;

        unsafe {
            let mut handle: sys::nvs_handle_t = 0;
            let ret = sys::nvs_open(
                namespace_c.as_ptr(),
                sys::nvs_open_mode_t_NVS_READWRITE,
                &mut handle,
            );
            if ret != sys::ESP_OK {
                return Err(StoreError::Backend(format!("nvs_open: {ret}")));
            }
            sys::nvs_erase_all(handle);
            sys::nvs_commit(handle);
            sys::nvs_close(handle);
        }

        Ok(())
    }
}

struct EspClock;

impl Clock for EspClock {
    fn now_epoch(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }
}

struct EspLink {
    wifi: BlockingWifi<EspWifi<'static>>,
    power: PinDriver<'static, AnyOutputPin, Output>,
    sntp: Option<EspSntp<'static>>,
    ntp_server: &'static str,
    started: bool,
}

impl NetLink for EspLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        if !self.started {
            // Switched rail feeding the radio domain; give it a moment to
            // stabilize before the stack comes up.
            self.power.set_high().map_err(|_| LinkError::Connect)?;
            FreeRtos::delay_ms(1);
            self.wifi.start().map_err(|err| {
                warn!("wifi start failed: {err}");
                LinkError::Connect
            })?;
            self.started = true;
        }

        match self.wifi.connect().and_then(|()| self.wifi.wait_netif_up()) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("wifi connect failed: {err}");
                let _ = self.wifi.disconnect();
                Err(LinkError::Connect)
            }
        }
    }

    fn access_point(&mut self) -> ApInfo {
        let mut record = sys::wifi_ap_record_t::default();
        let ret = unsafe { sys::esp_wifi_sta_get_ap_info(&mut record) };
        if ret != sys::ESP_OK {
            warn!("no ap info: {ret}");
            return ApInfo {
                ssid: String::new(),
                rssi: 0,
                channel: 0,
                bandwidth: ApBandwidth::Single,
            };
        }

        let ssid_len = record
            .ssid
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(record.ssid.len());
        ApInfo {
            ssid: String::from_utf8_lossy(&record.ssid[..ssid_len]).into_owned(),
            rssi: i32::from(record.rssi),
            channel: record.primary,
            bandwidth: match record.second {
                sys::wifi_second_chan_t_WIFI_SECOND_CHAN_ABOVE => ApBandwidth::Above,
                sys::wifi_second_chan_t_WIFI_SECOND_CHAN_BELOW => ApBandwidth::Below,
                _ => ApBandwidth::Single,
            },
        }
    }

    fn start_clock_sync(&mut self) {
        if self.sntp.is_some() {
            return;
        }
        let conf = SntpConf {
            servers: [self.ntp_server],
            operating_mode: OperatingMode::Poll,
            sync_mode: SyncMode::Immediate,
        };
        match EspSntp::new(&conf) {
            Ok(sntp) => self.sntp = Some(sntp),
            Err(err) => warn!("sntp start failed: {err}"),
        }
    }

    fn clock_synced(&mut self) -> bool {
        self.sntp
            .as_ref()
            .map(|sntp| sntp.get_sync_status() == SyncStatus::Completed)
            .unwrap_or(false)
    }

    fn shutdown(&mut self) {
        self.sntp = None;
        if self.started {
            let _ = self.wifi.disconnect();
            let _ = self.wifi.stop();
            self.started = false;
        }
        if self.power.set_low().is_err() {
            warn!("radio rail not released");
        }
    }
}

struct EspTransport;

impl Transport for EspTransport {
    fn post(&mut self, url: &str, body: &str) -> Result<String, ExchangeError> {
        let mut connection = EspHttpConnection::new(&HttpConfiguration {
            crt_bundle_attach: Some(sys::esp_crt_bundle_attach),
            ..Default::default()
        })
        .map_err(|_| ExchangeError::Open)?;

        let content_length = body.len().to_string();
        let headers = [
            ("Content-Type", "application/json"),
            ("Content-Length", content_length.as_str()),
        ];
        connection
            .initiate_request(Method::Post, url, &headers)
            .map_err(|_| ExchangeError::Open)?;
        connection
            .write_all(body.as_bytes())
            .map_err(|_| ExchangeError::Write)?;
        connection
            .initiate_response()
            .map_err(|_| ExchangeError::Write)?;

        let declared = match connection
            .header("Content-Length")
            .and_then(|value| value.parse::<i64>().ok())
        {
            Some(len) if len > 0 && len <= RESPONSE_LIMIT as i64 => len as usize,
            Some(len) => return Err(ExchangeError::Length(len)),
            None => return Err(ExchangeError::Length(-1)),
        };

        let mut raw = [0_u8; RESPONSE_LIMIT];
        let mut got = 0;
        while got < declared {
            let count = connection
                .read(&mut raw[got..declared])
                .map_err(|_| ExchangeError::Read)?;
            if count == 0 {
                break;
            }
            got += count;
        }
        if got != declared {
            return Err(ExchangeError::LengthMismatch { declared, got });
        }

        core::str::from_utf8(&raw[..declared])
            .map(str::to_string)
            .map_err(|_| ExchangeError::Parse)
    }
}

struct EspOtaBackend {
    running: FirmwareDigest,
}

struct EspOtaSession {
    connection: EspHttpConnection,
    head: Vec<u8>,
    declared: Option<usize>,
}

impl OtaSession for EspOtaSession {
    fn image_digest(&mut self) -> Result<FirmwareDigest, OtaError> {
        // Pull stream data until the app descriptor's digest is in hand.
        let mut chunk = [0_u8; OTA_CHUNK_SIZE];
        while self.head.len() < IMAGE_SHA_OFFSET + 32 {
            let count = self
                .connection
                .read(&mut chunk)
                .map_err(|_| OtaError::Descriptor)?;
            if count == 0 {
                return Err(OtaError::Descriptor);
            }
            self.head.extend_from_slice(&chunk[..count]);
        }

        let mut digest = [0_u8; 32];
        digest.copy_from_slice(&self.head[IMAGE_SHA_OFFSET..IMAGE_SHA_OFFSET + 32]);
        Ok(FirmwareDigest(digest))
    }

    fn install(mut self) -> Result<(), OtaError> {
        let mut ota = EspOta::new().map_err(|_| OtaError::Begin)?;
        let mut update = ota.initiate_update().map_err(|_| OtaError::Begin)?;

        if update.write_all(&self.head).is_err() {
            let _ = update.abort();
            return Err(OtaError::Download);
        }
        let mut written = self.head.len();

        let mut chunk = [0_u8; OTA_CHUNK_SIZE];
        loop {
            let count = match self.connection.read(&mut chunk) {
                Ok(0) => break,
                Ok(count) => count,
                Err(_) => {
                    let _ = update.abort();
                    return Err(OtaError::Download);
                }
            };
            if update.write_all(&chunk[..count]).is_err() {
                let _ = update.abort();
                return Err(OtaError::Download);
            }
            written += count;
        }

        if let Some(declared) = self.declared {
            if written != declared {
                error!("image truncated: {written} of {declared} bytes");
                let _ = update.abort();
                return Err(OtaError::Incomplete);
            }
        }

        update.complete().map_err(|_| OtaError::Finalize)?;
        Ok(())
    }

    fn abort(self) {}
}

impl OtaBackend for EspOtaBackend {
    type Session = EspOtaSession;

    fn begin(&mut self, url: &str) -> Result<EspOtaSession, OtaError> {
        let mut connection = EspHttpConnection::new(&HttpConfiguration {
            crt_bundle_attach: Some(sys::esp_crt_bundle_attach),
            ..Default::default()
        })
        .map_err(|_| OtaError::Begin)?;

        connection
            .initiate_request(Method::Get, url, &[])
            .map_err(|_| OtaError::Begin)?;
        connection
            .initiate_response()
            .map_err(|_| OtaError::Begin)?;

        let declared = connection
            .header("Content-Length")
            .and_then(|value| value.parse::<usize>().ok());

        Ok(EspOtaSession {
            connection,
            head: Vec::new(),
            declared,
        })
    }

    fn running_digest(&self) -> FirmwareDigest {
        self.running
    }

    fn pending_verify(&mut self) -> bool {
        let mut state: sys::esp_ota_img_states_t = 0;
        let ret = unsafe {
            sys::esp_ota_get_state_partition(sys::esp_ota_get_running_partition(), &mut state)
        };
        ret == sys::ESP_OK && state == sys::esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY
    }

    fn mark_valid(&mut self) {
        let ret = unsafe { sys::esp_ota_mark_app_valid_cancel_rollback() };
        if ret != sys::ESP_OK {
            warn!("could not cancel rollback: {ret}");
        }
    }
}

fn read_running_digest() -> FirmwareDigest {
    let desc = unsafe { *sys::esp_app_get_description() };
    FirmwareDigest(desc.app_elf_sha256)
}

struct EspTiming;

impl Timing for EspTiming {
    fn delay_ms(&mut self, ms: u64) {
        FreeRtos::delay_ms(u32::try_from(ms).unwrap_or(u32::MAX));
    }

    fn low_power_wait_us(&mut self, us: u64) {
        unsafe {
            sys::esp_sleep_enable_timer_wakeup(us);
            if sys::esp_light_sleep_start() != sys::ESP_OK {
                warn!("light sleep unavailable, busy delaying");
                FreeRtos::delay_ms(u32::try_from(us / 1_000).unwrap_or(u32::MAX));
            }
        }
    }

    fn random(&mut self) -> u32 {
        unsafe { sys::esp_random() }
    }
}

struct Led {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
}

impl Indicator for Led {
    // Open-drain, active low.
    fn flash(&mut self, count: u32, period_ms: u64) {
        let period_ms = u32::try_from(period_ms).unwrap_or(u32::MAX);
        for _ in 0..count {
            let _ = self.pin.set_low();
            FreeRtos::delay_ms(period_ms);
            let _ = self.pin.set_high();
            FreeRtos::delay_ms(period_ms * 2);
        }
    }
}

fn wake_reason() -> WakeReason {
    match unsafe { sys::esp_reset_reason() } {
        sys::esp_reset_reason_t_ESP_RST_POWERON => WakeReason::Initial,
        sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => WakeReason::DeepSleep,
        sys::esp_reset_reason_t_ESP_RST_BROWNOUT => WakeReason::Brownout,
        sys::esp_reset_reason_t_ESP_RST_PANIC => WakeReason::Panic,
        sys::esp_reset_reason_t_ESP_RST_SW => WakeReason::Reset,
        sys::esp_reset_reason_t_ESP_RST_INT_WDT
        | sys::esp_reset_reason_t_ESP_RST_TASK_WDT
        | sys::esp_reset_reason_t_ESP_RST_WDT => WakeReason::Watchdog,
        sys::esp_reset_reason_t_ESP_RST_SDIO => WakeReason::Sdio,
        _ => WakeReason::Unknown,
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    // Radio rail off, LED off (open-drain, high = off) until needed.
    let mut power = PinDriver::output(peripherals.pins.gpio19.downgrade_output())?;
    power.set_low()?;
    let mut led_pin = PinDriver::input_output_od(peripherals.pins.gpio18.downgrade())?;
    led_pin.set_high()?;

    // Sensor first: the measurement must happen before anything warms the
    // board.
    let i2c = I2cDriver::new(
        peripherals.i2c0,
        peripherals.pins.gpio3,
        peripherals.pins.gpio10,
        &I2cConfig::new().baudrate(400.kHz().into()),
    )?;
    let sensor = Hdc1080::new(i2c).context("sensor bring-up failed")?;

    let config = NodeConfig {
        collector_host: option_env!("COLLECTOR_HOST")
            .unwrap_or("collector.example.net")
            .to_string(),
        ntp_server: option_env!("NTP_SERVER").unwrap_or("pool.ntp.org").to_string(),
    };
    let ntp_server: &'static str = Box::leak(config.ntp_server.clone().into_boxed_str());

    let wifi = EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs_partition.clone()))?;
    let mut wifi = BlockingWifi::wrap(wifi, sys_loop)?;
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: option_env!("WIFI_SSID")
            .unwrap_or("CHANGE_ME")
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: option_env!("WIFI_PSK")
            .unwrap_or("CHANGE_ME")
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        ..Default::default()
    }))?;

    let mut board = Board {
        sensor,
        store: ScheduleStore::new(NvsStore {
            partition: nvs_partition,
        }),
        clock: EspClock,
        link: EspLink {
            wifi,
            power,
            sntp: None,
            ntp_server,
            started: false,
        },
        transport: EspTransport,
        ota: EspOtaBackend {
            running: read_running_digest(),
        },
        timing: EspTiming,
        led: Led { pin: led_pin },
    };
    let boot = BootInfo {
        wake_reason: wake_reason(),
        config,
    };

    let outcome = run_cycle(&mut board, &boot).map_err(|fault| anyhow!("{fault}"))?;

    // Rail and LED off whichever path got us here.
    board.link.shutdown();
    let _ = board.led.pin.set_high();

    match outcome {
        BootOutcome::Restart => {
            info!("restarting into freshly installed image");
            unsafe { sys::esp_restart() };
        }
        BootOutcome::Sleep(duration) => {
            info!("entering deep sleep for {}s", duration.as_secs());
            unsafe {
                sys::esp_sleep_enable_timer_wakeup(duration.as_micros() as u64);
                sys::esp_deep_sleep_start()
            };
        }
    }
}
