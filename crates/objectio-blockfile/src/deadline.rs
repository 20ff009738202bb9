//! Cancellation / deadline token. Every public operation takes
//! one; it is checked at each backing-store suspension point.
//!
//! Built in the idiom `objectio_storage::metadata::store::MetadataStore`
//! already uses for its own background-thread coordination: plain
//! `Instant`/`Duration` bookkeeping, no async cancellation crate, since the
//! engine here is blocking rather than async. The background flusher thread
//! in `store.rs` has its own separate `Arc<AtomicBool>` shutdown flag plus
//! `thread::sleep` loop rather than a `Deadline` — it doesn't call into any
//! per-operation suspension point this type guards, just `flush_cache()`
//! on a timer.

use std::time::{Duration, Instant};

use crate::error::{BlockFileError, Result};

#[derive(Debug, Clone)]
pub struct Deadline {
    inner: Inner,
}

#[derive(Debug, Clone)]
enum Inner {
    Never,
    At(Instant),
}

impl Deadline {
    pub fn never() -> Self {
        Self { inner: Inner::Never }
    }

    pub fn after(d: Duration) -> Self {
        Self {
            inner: Inner::At(Instant::now() + d),
        }
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            inner: Inner::At(instant),
        }
    }

    pub fn is_expired(&self) -> bool {
        match &self.inner {
            Inner::Never => false,
            Inner::At(t) => Instant::now() >= *t,
        }
    }

    /// Call at every suspension point before crossing into the backing
    /// store.
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(BlockFileError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_never_expires() {
        assert!(Deadline::never().check().is_ok());
    }

    #[test]
    fn past_deadline_is_expired() {
        let d = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(d.check().is_err());
    }

    #[test]
    fn future_deadline_not_yet_expired() {
        let d = Deadline::after(Duration::from_secs(60));
        assert!(d.check().is_ok());
    }
}
