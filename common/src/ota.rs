use core::fmt::Write as _;

use log::{error, info};
use thiserror::Error;

use crate::store::{KvStore, ScheduleStore};

/// SHA-256 of the application image: reported in short form, compared in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareDigest(pub [u8; 32]);

impl FirmwareDigest {
    /// Truncated hex form carried in report bodies.
    pub fn short_hex(&self) -> String {
        let mut out = String::with_capacity(16);
        for byte in &self.0[..8] {
            let _ = write!(&mut out, "{byte:02x}");
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("update session could not be opened")]
    Begin,
    #[error("new image descriptor unreadable")]
    Descriptor,
    #[error("image is identical to the running firmware")]
    SameImage,
    #[error("image download failed")]
    Download,
    #[error("image arrived incomplete")]
    Incomplete,
    #[error("update slot could not be finalized")]
    Finalize,
}

/// One in-flight firmware replacement.
pub trait OtaSession {
    /// Digest of the offered image, reading only as far into the stream as the
    /// descriptor requires.
    fn image_digest(&mut self) -> Result<FirmwareDigest, OtaError>;
    /// Stream the remainder into the inactive slot, verify it arrived whole,
    /// and activate the slot for the next boot.
    fn install(self) -> Result<(), OtaError>;
    fn abort(self);
}

pub trait OtaBackend {
    type Session: OtaSession;

    fn begin(&mut self, url: &str) -> Result<Self::Session, OtaError>;
    fn running_digest(&self) -> FirmwareDigest;
    /// True while the running image has booted but not yet proven itself; the
    /// loader rolls back unless `mark_valid` is called first.
    fn pending_verify(&mut self) -> bool;
    fn mark_valid(&mut self);
}

/// Replace the firmware, guarded against the one self-inflicted loop a remote
/// directive can cause: reinstalling the image that is already running. On
/// success the sample queue is purged (its encoding is not promised across
/// versions) and the caller must restart instead of sleeping.
pub fn try_install<B, S>(
    backend: &mut B,
    store: &mut ScheduleStore<S>,
    url: &str,
) -> Result<(), OtaError>
where
    B: OtaBackend,
    S: KvStore,
{
    let mut session = backend.begin(url)?;

    let offered = match session.image_digest() {
        Ok(digest) => digest,
        Err(err) => {
            session.abort();
            return Err(err);
        }
    };

    if offered == backend.running_digest() {
        error!("refusing to reinstall identical firmware");
        session.abort();
        return Err(OtaError::SameImage);
    }

    info!("downloading replacement firmware");
    session.install()?;

    if let Err(err) = store.clear_queue() {
        error!("could not clear sample queue before restart: {err}");
    }

    info!("firmware installed, restart required");
    Ok(())
}

/// Called after a fully successful exchange: the first such round-trip on an
/// unconfirmed image is the proof it works, and cancels the pending rollback.
pub fn confirm_running<B: OtaBackend>(backend: &mut B) {
    if backend.pending_verify() {
        info!("first exchange on new image succeeded, canceling rollback");
        backend.mark_valid();
    }
}
