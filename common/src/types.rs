use core::fmt;

use serde::Serialize;

/// One measurement, immutable once taken. Queued copies are keyed by `epoch`,
/// so replaying the same boot's write after a power loss overwrites instead of
/// duplicating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub epoch: u32,
    pub temperature_raw: u16,
    pub humidity_raw: u16,
}

impl Sample {
    pub fn key(&self) -> String {
        self.epoch.to_string()
    }
}

/// Raw transducer codes, straight off the measurement registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub temperature_raw: u16,
    pub humidity_raw: u16,
}

/// Serial read out of the transducer's three 16-bit ID registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSerial(pub [u16; 3]);

impl SensorSerial {
    pub fn hex(&self) -> String {
        format!("{:04x}{:04x}{:04x}", self.0[0], self.0[1], self.0[2])
    }
}

impl fmt::Display for SensorSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}{:04x}{:04x}", self.0[0], self.0[1], self.0[2])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeReason {
    Initial,
    DeepSleep,
    Brownout,
    Panic,
    Reset,
    Watchdog,
    Sdio,
    Unknown,
}

impl WakeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::DeepSleep => "deepsleep",
            Self::Brownout => "brownout",
            Self::Panic => "panic",
            Self::Reset => "reset",
            Self::Watchdog => "watchdog",
            Self::Sdio => "sdio",
            Self::Unknown => "unknown",
        }
    }
}

/// Secondary-channel layout of the access point, as the collector expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApBandwidth {
    #[serde(rename = "40+")]
    Above,
    #[serde(rename = "40-")]
    Below,
    #[serde(rename = "20")]
    Single,
}

impl ApBandwidth {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Above => "40+",
            Self::Below => "40-",
            Self::Single => "20",
        }
    }
}

/// Link-quality metadata captured from the association, echoed in each report.
#[derive(Debug, Clone, PartialEq)]
pub struct ApInfo {
    pub ssid: String,
    pub rssi: i32,
    pub channel: u8,
    pub bandwidth: ApBandwidth,
}
