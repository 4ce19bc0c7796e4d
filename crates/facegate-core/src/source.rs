//! Frame acquisition seam and cooperative cancellation.

use crate::types::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Fatal frame acquisition failure. Transient hiccups are reported as
/// `Ok(None)` by [`FrameSource::next_frame`] instead.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Anything that can hand out frames one at a time, such as a camera or a
/// scripted test sequence.
pub trait FrameSource {
    /// `Ok(None)` means "nothing usable this time, try again".
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for &mut S {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).next_frame()
    }
}

/// Cloneable stop flag checked once per frame by the capture sessions.
#[derive(Clone, Default, Debug)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous stop request so the signal can guard the next session.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Discard `count` frames while the camera's exposure settles.
///
/// Hiccups are ignored; a fatal capture error ends the warm-up. Returns
/// `false` if the stop signal fired.
pub(crate) fn discard_warmup<S: FrameSource>(
    source: &mut S,
    count: usize,
    delay: Duration,
    stop: &StopSignal,
) -> Result<bool, CaptureError> {
    if count > 0 {
        tracing::debug!(count, "discarding warmup frames");
    }
    for _ in 0..count {
        if stop.is_stopped() {
            return Ok(false);
        }
        let _ = source.next_frame()?;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
    Ok(!stop.is_stopped())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_signal_shared_between_clones() {
        let a = StopSignal::new();
        let b = a.clone();
        assert!(!b.is_stopped());
        a.stop();
        assert!(b.is_stopped());
        b.reset();
        assert!(!a.is_stopped());
    }
}
