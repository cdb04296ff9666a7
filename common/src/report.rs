use serde::{Deserialize, Serialize};

use crate::schedule::Schedule;
use crate::types::{ApBandwidth, Sample, WakeReason};

/// One point in the report's `data` array. The collector treats the array as
/// an unordered set; every point carries its own epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPoint {
    pub epoch: u32,
    pub temperature: u16,
    pub humidity: u16,
}

impl From<Sample> for DataPoint {
    fn from(sample: Sample) -> Self {
        Self {
            epoch: sample.epoch,
            temperature: sample.temperature_raw,
            humidity: sample.humidity_raw,
        }
    }
}

/// The outbound body, rebuilt from scratch every boot and never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub fw_sha: String,
    pub serial: String,
    pub ap_rssi: i32,
    pub ap_channel: u8,
    pub ap_ssid: String,
    pub ap_bw: ApBandwidth,
    pub wake_reason: WakeReason,
    pub send_delay_us: u32,
    pub wifi_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    pub data: Vec<DataPoint>,
}

impl Report {
    /// Live reading first, then the queued backlog.
    pub fn data_series(live: Sample, queued: &[Sample]) -> Vec<DataPoint> {
        let mut data = Vec::with_capacity(1 + queued.len());
        data.push(live.into());
        data.extend(queued.iter().copied().map(DataPoint::from));
        data
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Instructions parsed out of the collector's response. Every field is
/// independently optional; absence means no change. Unrecognized fields are
/// ignored so old firmware survives newer servers.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerDirective {
    pub new_fw: Option<String>,
    pub next_epoch: Option<u32>,
    pub queue_interval: Option<u32>,
    pub queue_count: Option<u32>,
    pub next_send_delay_us: Option<u32>,
    pub wait_for_ntp_sync: Option<bool>,
}

impl ServerDirective {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// A new standing order needs all three fields; partial sets are ignored.
    pub fn schedule(&self) -> Option<Schedule> {
        let anchor = self.next_epoch?;
        let interval = self.queue_interval?;
        let count = self.queue_count?;
        Some(Schedule::new(
            anchor,
            u16::try_from(interval).unwrap_or(u16::MAX),
            u16::try_from(count).unwrap_or(u16::MAX),
        ))
    }
}
