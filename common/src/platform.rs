use log::error;

/// Wall-clock epochs below this cannot be real: the constant predates every
/// deployed unit, so a smaller reading means the RTC has not been set since
/// power was applied.
pub const EPOCH_PLAUSIBLE_FLOOR: u32 = 1_670_653_382;

/// Hard ceiling on any single blocking pause or sleep, bounding worst-case
/// unresponsiveness to the collector.
pub const MAX_WAIT_SECONDS: u64 = 300;

pub trait Clock {
    fn now_epoch(&self) -> u32;
}

pub fn clock_plausible(epoch: u32) -> bool {
    epoch >= EPOCH_PLAUSIBLE_FLOOR
}

/// Blocking waits and the jitter source. `low_power_wait_us` may drop the core
/// into a light sleep; `delay_ms` must stay scheduler-friendly.
pub trait Timing {
    fn delay_ms(&mut self, ms: u64);
    fn low_power_wait_us(&mut self, us: u64);
    fn random(&mut self) -> u32;
}

/// An overlong pause request is a policy violation: truncated and logged,
/// never honored verbatim.
pub fn bounded_delay_ms(timing: &mut impl Timing, ms: u64) {
    let max = MAX_WAIT_SECONDS * 1_000;
    let ms = if ms > max {
        error!("refusing to block for {ms}ms, truncating to {max}ms");
        max
    } else {
        ms
    };
    if ms > 0 {
        timing.delay_ms(ms);
    }
}

pub fn bounded_wait_us(timing: &mut impl Timing, us: u64) {
    let max = MAX_WAIT_SECONDS * 1_000_000;
    let us = if us > max {
        error!("refusing to wait for {us}us, truncating to {max}us");
        max
    } else {
        us
    };
    if us > 0 {
        timing.low_power_wait_us(us);
    }
}

/// Deep-sleep durations obey the same ceiling, and are floored at zero.
pub fn bounded_sleep_seconds(requested: i64) -> u64 {
    if requested > MAX_WAIT_SECONDS as i64 {
        error!("refusing to sleep for {requested}s, truncating to {MAX_WAIT_SECONDS}s");
        return MAX_WAIT_SECONDS;
    }
    requested.max(0) as u64
}

/// The only user-visible failure channel once deployed: a blink count on the
/// status LED.
pub trait Indicator {
    fn flash(&mut self, count: u32, period_ms: u64);
}
