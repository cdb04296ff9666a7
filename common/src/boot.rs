use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

use crate::config::NodeConfig;
use crate::link::{self, NetLink};
use crate::ota::OtaBackend;
use crate::platform::{self, clock_plausible, Clock, Indicator, Timing};
use crate::report::Report;
use crate::schedule::Schedule;
use crate::store::{KvStore, ScheduleStore};
use crate::types::{Measurement, Sample, SensorSerial, WakeReason};
use crate::uplink::{self, ExchangeOutcome, Transport};

/// Sleep used when nothing dictates a duration: first boots, link failures,
/// failed exchanges, directives without a wake time.
pub const FALLBACK_SLEEP: Duration = Duration::from_secs(60);

/// Sensor trouble at boot. There is no retry: the node will fail the same way
/// every wake until physically serviced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sensor hardware fault: {0}")]
pub struct HardwareFault(pub String);

/// The transducer: identity registers and one raw reading.
pub trait Sensor {
    fn identity(&mut self) -> Result<SensorSerial, HardwareFault>;
    fn read(&mut self) -> Result<Measurement, HardwareFault>;
}

/// Shell-provided facts that exist before the sensor is touched.
#[derive(Debug, Clone)]
pub struct BootInfo {
    pub wake_reason: WakeReason,
    pub config: NodeConfig,
}

/// Everything one boot knows about itself, fixed at flow start and passed
/// explicitly. Never serialized: only the store survives the sleep transition.
#[derive(Debug, Clone)]
pub struct BootContext {
    pub wake_reason: WakeReason,
    pub serial: String,
    pub fw_sha: String,
    pub config: NodeConfig,
}

impl BootContext {
    pub fn report_url(&self) -> String {
        format!("https://{}/data/{}", self.config.collector_host, self.serial)
    }
}

/// How a boot ends. `Sleep` is the normal exit; `Restart` happens only after a
/// firmware install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    Sleep(Duration),
    Restart,
}

/// The collaborators one cycle runs against, owned for its duration.
pub struct Board<N, S, C, L, T, O, M, I> {
    pub sensor: N,
    pub store: ScheduleStore<S>,
    pub clock: C,
    pub link: L,
    pub transport: T,
    pub ota: O,
    pub timing: M,
    pub led: I,
}

/// One full duty cycle: sample, evaluate the standing order, then either queue
/// and sleep or flush everything to the collector. Exactly one linear flow per
/// power-up; a power loss between any two store writes leaves a valid (if
/// stale) state for the next boot to re-evaluate.
pub fn run_cycle<N, S, C, L, T, O, M, I>(
    board: &mut Board<N, S, C, L, T, O, M, I>,
    boot: &BootInfo,
) -> Result<BootOutcome, HardwareFault>
where
    N: Sensor,
    S: KvStore,
    C: Clock,
    L: NetLink,
    T: Transport,
    O: OtaBackend,
    M: Timing,
    I: Indicator,
{
    // Measure before anything else warms the board, radio included.
    let serial = board.sensor.identity()?;
    let reading = board.sensor.read()?;
    let now = board.clock.now_epoch();
    let live = Sample {
        epoch: now,
        temperature_raw: reading.temperature_raw,
        humidity_raw: reading.humidity_raw,
    };

    let ctx = BootContext {
        wake_reason: boot.wake_reason,
        serial: serial.hex(),
        fw_sha: board.ota.running_digest().short_hex(),
        config: boot.config.clone(),
    };
    info!(
        "awake: serial={} fw={} reason={}",
        ctx.serial,
        ctx.fw_sha,
        ctx.wake_reason.as_str()
    );

    let (mut schedule, report_config) = board.store.load();

    // An unset clock or an unproven image means nothing persisted can be
    // trusted. Drop it all and force this boot onto the report path, so a
    // freshly flashed or clock-less node contacts the collector immediately
    // instead of queuing blind for up to a full horizon.
    let clock_valid = clock_plausible(now);
    if !clock_valid || board.ota.pending_verify() {
        info!("invalidating persisted state (clock_valid={clock_valid})");
        if let Err(err) = board.store.invalidate() {
            warn!("invalidation incomplete: {err}");
        }
        schedule = Schedule::default();
    }

    if !schedule.is_exhausted(now) {
        if let Err(err) = board.store.enqueue(live) {
            warn!("sample not queued: {err}");
        }
        let seconds = match schedule.next_aligned_wake(now) {
            Some(next) => {
                // Re-read the clock: the queue write took time that must not
                // be slept twice.
                let now = board.clock.now_epoch();
                platform::bounded_sleep_seconds(i64::from(next) - i64::from(now))
            }
            None => FALLBACK_SLEEP.as_secs(),
        };
        return Ok(BootOutcome::Sleep(Duration::from_secs(seconds)));
    }

    // Flush path. Everything still queued rides along behind the live reading,
    // whether or not the order that produced it survives.
    let queued = board.store.queued().unwrap_or_else(|err| {
        warn!("queue enumeration failed: {err}");
        Vec::new()
    });

    if report_config.send_delay_us > 0 {
        info!("pausing {}us before transmit", report_config.send_delay_us);
        platform::bounded_wait_us(&mut board.timing, u64::from(report_config.send_delay_us));
    }

    let wifi_retries = match link::bring_up(&mut board.link, &mut board.timing) {
        Ok(failures) => failures,
        Err(_) => {
            board.led.flash(10, 50);
            board.link.shutdown();
            return Ok(BootOutcome::Sleep(FALLBACK_SLEEP));
        }
    };
    link::sync_clock(&mut board.link, &mut board.timing, clock_valid);

    let ap = board.link.access_point();
    let mut report = Report {
        fw_sha: ctx.fw_sha.clone(),
        serial: ctx.serial.clone(),
        ap_rssi: ap.rssi,
        ap_channel: ap.channel,
        ap_ssid: ap.ssid,
        ap_bw: ap.bandwidth,
        wake_reason: ctx.wake_reason,
        send_delay_us: report_config.send_delay_us,
        wifi_retries,
        retries: None,
        data: Report::data_series(live, &queued),
    };

    let url = ctx.report_url();
    let exchange = uplink::exchange(
        &mut board.store,
        &mut board.transport,
        &mut board.ota,
        &mut board.link,
        &mut board.timing,
        &mut board.led,
        &mut report,
        &url,
    );
    board.link.shutdown();

    match exchange {
        Ok(ExchangeOutcome::Installed) => Ok(BootOutcome::Restart),
        Ok(ExchangeOutcome::Applied { wake_epoch }) => {
            // Only now is the backlog known to be on the server.
            if !queued.is_empty() {
                if let Err(err) = board.store.clear_queue() {
                    warn!("queue not cleared after send: {err}");
                }
            }
            let seconds = match wake_epoch {
                Some(epoch) => {
                    let now = board.clock.now_epoch();
                    platform::bounded_sleep_seconds(i64::from(epoch) - i64::from(now))
                }
                None => FALLBACK_SLEEP.as_secs(),
            };
            Ok(BootOutcome::Sleep(Duration::from_secs(seconds)))
        }
        Err(err) => {
            warn!("report not delivered: {err}");
            Ok(BootOutcome::Sleep(FALLBACK_SLEEP))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::platform::EPOCH_PLAUSIBLE_FLOOR;
    use crate::testutil::{
        digest, FakeClock, FakeLed, FakeLink, FakeOta, FakeSensor, FakeTiming, FakeTransport,
        MemStore,
    };
    use crate::uplink::ExchangeError;

    type TestBoard = Board<
        FakeSensor,
        MemStore,
        FakeClock,
        FakeLink,
        FakeTransport,
        FakeOta,
        FakeTiming,
        FakeLed,
    >;

    // Epochs in tests sit on top of the plausibility floor so the clock passes
    // validation unless a test says otherwise.
    const T0: u32 = EPOCH_PLAUSIBLE_FLOOR;

    fn board(now: u32, responses: Vec<Result<String, ExchangeError>>) -> TestBoard {
        Board {
            sensor: FakeSensor::default(),
            store: ScheduleStore::new(MemStore::default()),
            clock: FakeClock(now),
            link: FakeLink::default(),
            transport: FakeTransport::scripted(responses),
            ota: FakeOta::new(digest(1), Ok(digest(2))),
            timing: FakeTiming::default(),
            led: FakeLed::default(),
        }
    }

    fn info() -> BootInfo {
        BootInfo {
            wake_reason: WakeReason::DeepSleep,
            config: NodeConfig::default(),
        }
    }

    #[test]
    fn standing_order_queues_and_sleeps_aligned() {
        let mut board = board(T0, vec![]);
        board
            .store
            .save_schedule(Schedule::new(T0, 60, 3))
            .unwrap();

        let outcome = run_cycle(&mut board, &info()).unwrap();

        assert_eq!(outcome, BootOutcome::Sleep(Duration::from_secs(60)));
        let queued = board.store.queued().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].epoch, T0);
        // No radio activity on the queue path.
        assert_eq!(board.link.connects, 0);
        assert!(board.transport.bodies.is_empty());
    }

    #[test]
    fn exhausted_order_flushes_backlog_live_first() {
        let mut board = board(T0 + 185, vec![Ok("{}".to_string())]);
        board
            .store
            .save_schedule(Schedule::new(T0, 60, 3))
            .unwrap();
        for epoch in [T0, T0 + 60, T0 + 120] {
            board
                .store
                .enqueue(Sample {
                    epoch,
                    temperature_raw: 7,
                    humidity_raw: 8,
                })
                .unwrap();
        }

        let outcome = run_cycle(&mut board, &info()).unwrap();

        assert_eq!(outcome, BootOutcome::Sleep(FALLBACK_SLEEP));
        let body: serde_json::Value = serde_json::from_str(&board.transport.bodies[0]).unwrap();
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 4);
        assert_eq!(data[0]["epoch"], T0 + 185);
        // Acknowledged backlog is gone.
        assert!(board.store.queued().unwrap().is_empty());
    }

    #[test]
    fn implausible_clock_forces_report_despite_orders() {
        let mut board = board(1_000, vec![Ok("{}".to_string())]);
        board
            .store
            .save_schedule(Schedule::new(900, 60, 30))
            .unwrap();
        board
            .store
            .enqueue(Sample {
                epoch: 900,
                temperature_raw: 1,
                humidity_raw: 2,
            })
            .unwrap();

        let outcome = run_cycle(&mut board, &info()).unwrap();

        // Not the queue path: the order was invalidated and the node reported.
        assert_eq!(outcome, BootOutcome::Sleep(FALLBACK_SLEEP));
        assert_eq!(board.transport.bodies.len(), 1);
        let (schedule, _) = board.store.load();
        assert_eq!(schedule, Schedule::default());
        assert!(board.store.queued().unwrap().is_empty());

        // The stale backlog was dropped, not transmitted.
        let body: serde_json::Value = serde_json::from_str(&board.transport.bodies[0]).unwrap();
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn pending_image_forces_report_and_gets_confirmed() {
        let mut board = board(T0, vec![Ok("{}".to_string())]);
        board.ota.pending = true;
        board
            .store
            .save_schedule(Schedule::new(T0, 60, 30))
            .unwrap();

        let outcome = run_cycle(&mut board, &info()).unwrap();

        assert_eq!(outcome, BootOutcome::Sleep(FALLBACK_SLEEP));
        assert!(board.ota.log.borrow().marked_valid);
        let (schedule, _) = board.store.load();
        assert_eq!(schedule, Schedule::default());
    }

    #[test]
    fn directive_wake_epoch_sets_clamped_sleep() {
        let mut board = board(
            T0,
            vec![Ok(format!("{{\"next_epoch\": {}}}", T0 + 90))],
        );

        let outcome = run_cycle(&mut board, &info()).unwrap();
        assert_eq!(outcome, BootOutcome::Sleep(Duration::from_secs(90)));
    }

    #[test]
    fn distant_wake_epoch_is_truncated_to_ceiling() {
        let mut board = board(
            T0,
            vec![Ok(format!("{{\"next_epoch\": {}}}", T0 + 100_000))],
        );

        let outcome = run_cycle(&mut board, &info()).unwrap();
        assert_eq!(outcome, BootOutcome::Sleep(Duration::from_secs(300)));
    }

    #[test]
    fn past_wake_epoch_floors_at_zero() {
        let mut board = board(T0, vec![Ok(format!("{{\"next_epoch\": {}}}", T0 - 50))]);

        let outcome = run_cycle(&mut board, &info()).unwrap();
        assert_eq!(outcome, BootOutcome::Sleep(Duration::ZERO));
    }

    #[test]
    fn link_failure_keeps_queue_and_resleeps() {
        let mut board = board(T0 + 185, vec![]);
        board.link.fail_connects = u32::MAX;
        board
            .store
            .save_schedule(Schedule::new(T0, 60, 3))
            .unwrap();
        board
            .store
            .enqueue(Sample {
                epoch: T0,
                temperature_raw: 1,
                humidity_raw: 2,
            })
            .unwrap();

        let outcome = run_cycle(&mut board, &info()).unwrap();

        assert_eq!(outcome, BootOutcome::Sleep(FALLBACK_SLEEP));
        assert_eq!(board.led.flashes, vec![(10, 50)]);
        assert_eq!(board.link.shutdowns, 1);
        assert_eq!(board.store.queued().unwrap().len(), 1);
    }

    #[test]
    fn failed_exchange_keeps_queue_for_next_cycle() {
        let mut board = board(T0 + 185, vec![]);
        board.transport = FakeTransport::always(ExchangeError::Open);
        board
            .store
            .save_schedule(Schedule::new(T0, 60, 3))
            .unwrap();
        board
            .store
            .enqueue(Sample {
                epoch: T0,
                temperature_raw: 1,
                humidity_raw: 2,
            })
            .unwrap();

        let outcome = run_cycle(&mut board, &info()).unwrap();

        assert_eq!(outcome, BootOutcome::Sleep(FALLBACK_SLEEP));
        assert_eq!(board.store.queued().unwrap().len(), 1);
        assert_eq!(board.link.shutdowns, 1);
    }

    #[test]
    fn queue_clears_once_even_when_only_the_fifth_attempt_lands() {
        let mut board = board(
            T0 + 185,
            vec![
                Err(ExchangeError::Open),
                Err(ExchangeError::Write),
                Err(ExchangeError::Read),
                Err(ExchangeError::Parse),
                Ok("{}".to_string()),
            ],
        );
        board
            .store
            .save_schedule(Schedule::new(T0, 60, 3))
            .unwrap();
        board
            .store
            .enqueue(Sample {
                epoch: T0,
                temperature_raw: 1,
                humidity_raw: 2,
            })
            .unwrap();

        let outcome = run_cycle(&mut board, &info()).unwrap();

        assert_eq!(outcome, BootOutcome::Sleep(FALLBACK_SLEEP));
        assert_eq!(board.transport.bodies.len(), 5);
        assert!(board.store.queued().unwrap().is_empty());

        let last: serde_json::Value = serde_json::from_str(&board.transport.bodies[4]).unwrap();
        assert_eq!(last["retries"], 4);
    }

    #[test]
    fn send_delay_pauses_before_transmit() {
        let mut board = board(T0, vec![Ok("{}".to_string())]);
        board.store.save_send_delay(250_000).unwrap();

        run_cycle(&mut board, &info()).unwrap();
        assert_eq!(board.timing.waits_us, vec![250_000]);
    }

    #[test]
    fn install_directive_ends_in_restart() {
        let mut board = board(
            T0,
            vec![Ok(r#"{"new_fw": "https://coll/fw/abc"}"#.to_string())],
        );
        board
            .store
            .enqueue(Sample {
                epoch: T0 - 60,
                temperature_raw: 1,
                humidity_raw: 2,
            })
            .unwrap();

        let outcome = run_cycle(&mut board, &info()).unwrap();

        assert_eq!(outcome, BootOutcome::Restart);
        assert_eq!(board.ota.log.borrow().installed, 1);
        assert!(board.store.queued().unwrap().is_empty());
    }

    #[test]
    fn report_url_derives_from_serial() {
        let ctx = BootContext {
            wake_reason: WakeReason::Initial,
            serial: "0001beef00aa".to_string(),
            fw_sha: "0000000000000000".to_string(),
            config: NodeConfig {
                collector_host: "coll.example".to_string(),
                ntp_server: "ntp.example".to_string(),
            },
        };
        assert_eq!(ctx.report_url(), "https://coll.example/data/0001beef00aa");
    }

    #[test]
    fn sensor_fault_is_fatal() {
        let mut board = board(T0, vec![]);
        board.sensor.fail = true;

        assert!(run_cycle(&mut board, &info()).is_err());
    }
}
