use log::{info, warn};
use thiserror::Error;

use crate::platform::Timing;
use crate::types::ApInfo;

pub const CONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("association failed")]
    Connect,
    #[error("link budget exhausted after {0} attempts")]
    Exhausted(u32),
}

/// The radio collaborator. `connect` performs one attempt and blocks until the
/// underlying stack reports up or failed; the retry policy lives in `bring_up`,
/// not in implementations.
pub trait NetLink {
    fn connect(&mut self) -> Result<(), LinkError>;
    fn access_point(&mut self) -> ApInfo;
    fn start_clock_sync(&mut self);
    fn clock_synced(&mut self) -> bool;
    fn shutdown(&mut self);
}

/// Bring the link up within a bounded attempt budget. Attempts are separated
/// by a randomized 1-2 s pause so nodes sharing an outage do not hammer the
/// access point in lockstep. Returns the number of failed attempts that
/// preceded success.
pub fn bring_up(link: &mut impl NetLink, timing: &mut impl Timing) -> Result<u32, LinkError> {
    let mut failures = 0_u32;
    loop {
        if link.connect().is_ok() {
            return Ok(failures);
        }

        let jitter = timing.random() % 1_000;
        timing.delay_ms(1_000 + u64::from(jitter));

        failures += 1;
        if failures >= CONNECT_ATTEMPTS {
            warn!("link not up after {CONNECT_ATTEMPTS} attempts");
            return Err(LinkError::Exhausted(failures));
        }
    }
}

/// Kick clock synchronization after association. A boot whose clock was
/// invalid must not report with a bogus epoch, so the sync is awaited. The
/// wait is uncapped: a dead time server keeps the node awake until the
/// hardware watchdog fires.
pub fn sync_clock(link: &mut impl NetLink, timing: &mut impl Timing, clock_was_valid: bool) {
    link.start_clock_sync();
    if clock_was_valid {
        return;
    }

    info!("waiting for clock synchronization");
    while !link.clock_synced() {
        timing.delay_ms(10);
    }
}
