use log::{info, warn};
use thiserror::Error;

use crate::link::NetLink;
use crate::ota::{self, OtaBackend, OtaError};
use crate::platform::{Indicator, Timing};
use crate::report::{Report, ServerDirective};
use crate::store::{KvStore, ScheduleStore};

pub const POST_ATTEMPTS: u32 = 5;

/// Largest response body the node accepts. Directives are tiny; anything
/// bigger is treated as a transport fault, not truncated.
pub const RESPONSE_LIMIT: usize = 256;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    #[error("report serialization failed: {0}")]
    Encode(String),
    #[error("connection open failed")]
    Open,
    #[error("request write failed")]
    Write,
    #[error("unacceptable content length {0}")]
    Length(i64),
    #[error("response read failed")]
    Read,
    #[error("read {got} of {declared} declared bytes")]
    LengthMismatch { declared: usize, got: usize },
    #[error("response is not a JSON object")]
    Parse,
    #[error("firmware update failed: {0}")]
    Ota(#[from] OtaError),
}

/// One HTTPS POST against the collector. Implementations deliver the body only
/// when it arrived with an honest Content-Length of at most RESPONSE_LIMIT
/// bytes and exactly that many bytes were read back; every earlier failure
/// maps to its stage's ExchangeError.
pub trait Transport {
    fn post(&mut self, url: &str, body: &str) -> Result<String, ExchangeError>;
}

/// What a successful exchange decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// Directive applied; sleep until `wake_epoch` if the server set one.
    Applied { wake_epoch: Option<u32> },
    /// New firmware installed; the caller must restart instead of sleeping.
    Installed,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("no valid exchange after {attempts} attempts: {last}")]
pub struct ExchangeFailed {
    pub attempts: u32,
    pub last: ExchangeError,
}

// Blink codes per failure stage, the only diagnostics a deployed node has.
fn failure_blink(err: &ExchangeError) -> Option<(u32, u64)> {
    match err {
        ExchangeError::Encode(_) => None,
        ExchangeError::Open => Some((1, 150)),
        ExchangeError::Write => Some((2, 150)),
        ExchangeError::Length(_) => Some((3, 150)),
        ExchangeError::Read => Some((4, 150)),
        ExchangeError::LengthMismatch { .. } => Some((5, 150)),
        ExchangeError::Parse => Some((2, 300)),
        ExchangeError::Ota(_) => Some((3, 300)),
    }
}

/// Run the report exchange with a bounded retry budget. Resend attempts carry
/// a running retry counter in the body for server-side observability. Failure
/// after the whole budget is non-fatal: the caller keeps the queue and tries
/// again next duty-cycle boot.
#[allow(clippy::too_many_arguments)]
pub fn exchange<S, T, O, L, M, I>(
    store: &mut ScheduleStore<S>,
    transport: &mut T,
    ota: &mut O,
    link: &mut L,
    timing: &mut M,
    led: &mut I,
    report: &mut Report,
    url: &str,
) -> Result<ExchangeOutcome, ExchangeFailed>
where
    S: KvStore,
    T: Transport,
    O: OtaBackend,
    L: NetLink,
    M: Timing,
    I: Indicator,
{
    let mut last = ExchangeError::Open;
    for attempt in 1..=POST_ATTEMPTS {
        if attempt > 1 {
            report.retries = Some(attempt - 1);
            let backoff = timing.random() % 100;
            timing.delay_ms(u64::from(backoff));
        }

        let err = match attempt_exchange(store, transport, ota, link, timing, report, url) {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };

        if let Some((count, period_ms)) = failure_blink(&err) {
            led.flash(count, period_ms);
        }
        warn!("exchange attempt {attempt}/{POST_ATTEMPTS} failed: {err}");
        last = err;
    }

    Err(ExchangeFailed {
        attempts: POST_ATTEMPTS,
        last,
    })
}

fn attempt_exchange<S, T, O, L, M>(
    store: &mut ScheduleStore<S>,
    transport: &mut T,
    ota: &mut O,
    link: &mut L,
    timing: &mut M,
    report: &Report,
    url: &str,
) -> Result<ExchangeOutcome, ExchangeError>
where
    S: KvStore,
    T: Transport,
    O: OtaBackend,
    L: NetLink,
    M: Timing,
{
    let body = report
        .to_json()
        .map_err(|err| ExchangeError::Encode(err.to_string()))?;
    info!("POSTing {} bytes to {url}", body.len());

    let response = transport.post(url, &body)?;
    info!("server responds: {response}");

    let directive = ServerDirective::parse(&response).ok_or(ExchangeError::Parse)?;

    if let Some(image_url) = directive.new_fw.as_deref() {
        // New firmware preempts the rest of the response; scheduling fields
        // riding along are dropped.
        info!("server directs new firmware from {image_url}");
        ota::try_install(ota, store, image_url)?;
        return Ok(ExchangeOutcome::Installed);
    }

    if let Some(schedule) = directive.schedule() {
        if let Err(err) = store.save_schedule(schedule) {
            warn!("could not persist new orders: {err}");
        }
    }

    if let Some(send_delay_us) = directive.next_send_delay_us {
        if let Err(err) = store.save_send_delay(send_delay_us) {
            warn!("could not persist send delay: {err}");
        }
    }

    ota::confirm_running(ota);

    if directive.wait_for_ntp_sync == Some(true) {
        // Uncapped on purpose, same hazard as the boot-time sync wait.
        info!("waiting for clock sync as commanded");
        while !link.clock_synced() {
            timing.delay_ms(10);
        }
    }

    Ok(ExchangeOutcome::Applied {
        wake_epoch: directive.next_epoch,
    })
}
