//! C3: the backend-neutral interface contract and delivery state machine
//! described in spec §4.3. Every engine (`morp-postgres`, `morp-dropfile`,
//! `morp-sqs`) implements `Interface`.

use crate::error::InterfaceError;
use crate::value::Fields;
use async_trait::async_trait;
use std::time::Duration;

/// `send`/`recv`/`release`/`count`/`unsafe_clear`/`unsafe_delete`, plus
/// connection lifecycle. Mirrors `Interface` in `morp/interface/base.py`,
/// minus the Python-specific context-manager plumbing (REDESIGN FLAGS:
/// "Context-manager recv").
#[async_trait]
pub trait Interface: Send + Sync {
    /// Establish the backend connection/pool. Connecting twice is a no-op.
    async fn connect(&self) -> Result<(), InterfaceError>;

    /// Idempotent: closing an already-closed interface is a no-op.
    async fn close(&self) -> Result<(), InterfaceError>;

    /// Enqueue a new message, transitioning it to READY (optionally after
    /// `delay_seconds`). Returns the fields populated with `_id` and any
    /// backend-private handle.
    async fn send(
        &self,
        name: &str,
        fields: Fields,
        delay_seconds: u64,
    ) -> Result<Fields, InterfaceError>;

    /// Atomically claim one READY message and transition it to INFLIGHT,
    /// long-polling up to `timeout` if none is immediately available.
    /// `_count` is incremented on the returned fields. Returns `None` on
    /// timeout expiry.
    async fn recv(&self, name: &str, timeout: Duration) -> Result<Option<Fields>, InterfaceError>;

    /// INFLIGHT -> CONSUMED (removed).
    async fn ack(&self, name: &str, fields: &Fields) -> Result<(), InterfaceError>;

    /// INFLIGHT -> READY, after `delay_seconds` (or a computed backoff
    /// delay when `delay_seconds` is `None`, per spec §4.3/§8 invariant 5).
    async fn release(
        &self,
        name: &str,
        fields: &Fields,
        delay_seconds: Option<u64>,
    ) -> Result<(), InterfaceError>;

    /// Approximate count of messages in the queue, any state.
    async fn count(&self, name: &str) -> Result<u64, InterfaceError>;

    /// Remove all messages from the queue. Idempotent if the queue does
    /// not exist.
    async fn unsafe_clear(&self, name: &str) -> Result<(), InterfaceError>;

    /// Remove all messages and drop the queue entirely. Idempotent if the
    /// queue does not exist.
    async fn unsafe_delete(&self, name: &str) -> Result<(), InterfaceError>;
}

/// `min(max_timeout, count * multiplier * amplifier)`, amplifier
/// defaulting to `count` — spec §4.3/§8 invariant 5. Shared by every
/// engine's `release` so the formula lives in exactly one place (in the
/// Python source each engine re-derives it inline in `base.py::release`).
///
/// Adopted as-written per spec §9: this is quadratic in `count` when
/// `amplifier` is left at its default, not exponential. That drift from
/// "exponential backoff" in the original's naming is intentional per the
/// spec's Open Questions, not corrected here.
pub fn compute_release_delay(
    count: i64,
    max_timeout: u64,
    multiplier: u64,
    amplifier: Option<u64>,
) -> u64 {
    if count <= 0 {
        return 0;
    }

    let count = count as u64;
    let amplifier = amplifier.unwrap_or(count);
    let delay = count.saturating_mul(multiplier).saturating_mul(amplifier);
    delay.min(max_timeout)
}
