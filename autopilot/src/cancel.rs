//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is threaded through every LLM call and tool
//! execution. Cancellation surfaces as the typed [`Cancelled`] error so the
//! loops can tell it apart from an ordinary tool or planning failure.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Fail with [`Cancelled`] if `cancel` has fired.
pub fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Cancelled.into());
    }
    Ok(())
}

/// True when `err` (or anything in its context chain) is a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<Cancelled>().is_some())
}
