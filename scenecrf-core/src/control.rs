use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use tracing::info;

const PAUSE_POLL: Duration = Duration::from_millis(500);

/// Shared pause/cancel token, checked by every search before each probe.
///
/// Pausing can also be requested from outside the process by creating the
/// pause file, removing it resumes.
#[derive(Debug, Clone, Default)]
pub struct SearchControl {
    cancelled:  Arc<AtomicBool>,
    paused:     Arc<AtomicBool>,
    pause_file: Option<PathBuf>,
}

/// Returned by [`SearchControl::checkpoint`] once cancellation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl SearchControl {
    #[inline]
    pub fn new(pause_file: Option<PathBuf>) -> Self {
        Self {
            pause_file,
            ..Self::default()
        }
    }

    #[inline]
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst) || self.pause_file.as_ref().is_some_and(|f| f.exists())
    }

    /// Blocks while paused. Fails once cancellation is requested, even while
    /// paused.
    #[inline]
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        let mut announced = false;
        while self.is_paused() {
            if self.is_cancelled() {
                return Err(Cancelled);
            }
            if !announced {
                info!("paused, waiting to resume");
                announced = true;
            }
            thread::sleep(PAUSE_POLL);
        }

        if self.is_cancelled() {
            return Err(Cancelled);
        }
        Ok(())
    }
}
