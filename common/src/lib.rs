pub mod boot;
pub mod config;
pub mod link;
pub mod ota;
pub mod platform;
pub mod report;
pub mod schedule;
pub mod store;
pub mod types;
pub mod uplink;

#[cfg(test)]
pub(crate) mod testutil;

pub use boot::{run_cycle, Board, BootContext, BootInfo, BootOutcome, HardwareFault, Sensor};
pub use config::NodeConfig;
pub use link::{LinkError, NetLink};
pub use ota::{FirmwareDigest, OtaBackend, OtaError, OtaSession};
pub use platform::{Clock, Indicator, Timing};
pub use report::{DataPoint, Report, ServerDirective};
pub use schedule::{ReportConfig, Schedule};
pub use store::{KvStore, ScheduleStore, StoreError};
pub use types::{ApBandwidth, ApInfo, Measurement, Sample, SensorSerial, WakeReason};
pub use uplink::{ExchangeError, ExchangeOutcome, Transport};
