//! Soft-failure reporting.
//!
//! Every failure in this layer is handled locally: the single operation is
//! aborted, a diagnostic is emitted through the `log` facade, and state is
//! left unchanged. Nothing here propagates as a hard fault. The higher-level
//! compositor decides whether e.g. a `None` from `start_painting` warrants
//! falling back to another backend.

use thiserror::Error;

/// The ways an operation in this layer can softly fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Diag {
    #[error("render context doesn't exist")]
    ContextGone,

    #[error("paint device doesn't exist")]
    PaintDeviceGone,

    #[error("framebuffer object doesn't exist, reallocate_buffer was not called?")]
    FramebufferMissing,

    #[error("could not make render context current")]
    MakeCurrentFailed,

    #[error("invalid or inactive painter passed")]
    InactivePainter,

    #[error("framebuffer not valid or was not bound")]
    NotBound,

    #[error("destination framebuffer object is not valid")]
    DestinationInvalid,

    #[error("invalid buffer passed")]
    InvalidBatchBuffer,

    #[error("framebuffer readback failed")]
    ReadbackFailed,
}

/// Emits a diagnostic tagged with the failing call site. Advisory only.
pub(crate) fn report(site: &str, diag: &Diag) {
    log::warn!(target: "plotbuf", "{site}: {diag}");
}

/// Reports a soft failure and converts the result into an `Option`.
pub(crate) fn soft<T>(site: &str, result: Result<T, Diag>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(diag) => {
            report(site, &diag);
            None
        }
    }
}
