//! Virtual Display Layer
//!
//! Owns the lifecycle of off-screen X display servers (Xvfb) used for
//! headless screenshot capture. Displays are managed as a bounded pool of
//! slots with reference-counted leases: concurrent requests share a running
//! display to amortize server startup, and the last release of a slot
//! terminates its process.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DisplayConfig;
use crate::error::PipelineError;

/// How long to wait for the X socket after spawning the display server
const SOCKET_WAIT: Duration = Duration::from_secs(5);
/// Poll interval while waiting for the X socket
const SOCKET_POLL: Duration = Duration::from_millis(50);

/// State of one display slot in the pool
struct SlotState {
    /// X display number for this slot
    display: u32,
    /// Running display server process, if any
    process: Option<Child>,
    /// Active leases on this slot
    leases: u32,
    /// Whether the display server has finished starting up
    ready: bool,
    /// Serializes screenshot captures against this display
    capture_lock: Arc<tokio::sync::Mutex<()>>,
}

struct PoolInner {
    config: DisplayConfig,
    slots: Mutex<Vec<SlotState>>,
    /// Signalled whenever a lease is returned or a slot becomes ready
    freed: Notify,
}

/// Bounded pool of virtual display slots
#[derive(Clone)]
pub struct DisplayPool {
    inner: Arc<PoolInner>,
}

/// A lease on one virtual display slot.
///
/// Must be returned via [`DisplayPool::release`]; dropping an unreleased
/// handle still returns the lease and best-effort kills an orphaned server.
pub struct DisplayHandle {
    display: u32,
    slot_index: usize,
    capture_lock: Arc<tokio::sync::Mutex<()>>,
    pool: Arc<PoolInner>,
    released: AtomicBool,
}

impl DisplayPool {
    pub fn new(config: DisplayConfig) -> Self {
        let slots = (0..config.slots)
            .map(|i| SlotState {
                display: config.base_display + i,
                process: None,
                leases: 0,
                ready: false,
                capture_lock: Arc::new(tokio::sync::Mutex::new(())),
            })
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                config,
                slots: Mutex::new(slots),
                freed: Notify::new(),
            }),
        }
    }

    /// Lease a display slot, starting a display server if no running slot has
    /// lease capacity. Waits up to the configured acquire timeout for a slot
    /// to free up before failing with `DisplayUnavailable`.
    pub async fn acquire(&self) -> Result<DisplayHandle, PipelineError> {
        let deadline = Instant::now() + Duration::from_millis(self.inner.config.acquire_timeout_ms);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.try_lease() {
                Lease::Ready(handle) => return Ok(handle),
                Lease::NeedsStart(handle) => {
                    return self.start_slot(handle).await;
                }
                Lease::Exhausted => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(PipelineError::DisplayUnavailable { attempts });
                    }
                    // Wake on release/ready, or re-check at the deadline
                    let _ = tokio::time::timeout(remaining, self.inner.freed.notified()).await;
                }
            }
        }
    }

    /// Return a lease. The slot's display server is terminated when the last
    /// lease is returned. Idempotent per handle.
    pub async fn release(&self, handle: DisplayHandle) {
        if let Some(mut child) = handle.release_lease() {
            debug!(display = handle.display, "terminating display server");
            if let Err(e) = child.kill().await {
                warn!(display = handle.display, "failed to kill display server: {}", e);
            }
            let _ = child.wait().await;
        }
        self.inner.freed.notify_waiters();
    }

    /// Number of display server processes currently running
    pub fn active_displays(&self) -> usize {
        self.inner.slots.lock().iter().filter(|s| s.process.is_some()).count()
    }

    /// Total active leases across all slots
    pub fn active_leases(&self) -> u32 {
        self.inner.slots.lock().iter().map(|s| s.leases).sum()
    }

    fn try_lease(&self) -> Lease {
        let mut slots = self.inner.slots.lock();
        let max_shared = self.inner.config.max_leases_per_slot.max(1);

        // Prefer sharing an already-running display
        if let Some((idx, slot)) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.ready && s.leases > 0 && s.leases < max_shared)
        {
            slot.leases += 1;
            return Lease::Ready(self.handle_for(idx, slot));
        }

        // Otherwise claim a free slot; caller spawns the server outside the lock
        if let Some((idx, slot)) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.leases == 0 && s.process.is_none())
        {
            slot.leases = 1;
            slot.ready = false;
            return Lease::NeedsStart(self.handle_for(idx, slot));
        }

        Lease::Exhausted
    }

    fn handle_for(&self, slot_index: usize, slot: &SlotState) -> DisplayHandle {
        DisplayHandle {
            display: slot.display,
            slot_index,
            capture_lock: Arc::clone(&slot.capture_lock),
            pool: Arc::clone(&self.inner),
            released: AtomicBool::new(false),
        }
    }

    /// Spawn the display server for a freshly claimed slot and wait for it to
    /// come up. On failure the claim is rolled back so the slot is reusable.
    async fn start_slot(&self, handle: DisplayHandle) -> Result<DisplayHandle, PipelineError> {
        let config = &self.inner.config;
        let display_arg = format!(":{}", handle.display);

        info!(display = handle.display, command = %config.server_command, "starting display server");

        let spawn = Command::new(&config.server_command)
            .arg(&display_arg)
            .args(["-screen", "0", &config.screen])
            .arg("-nolisten")
            .arg("tcp")
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawn {
            Ok(child) => child,
            Err(e) => {
                warn!(display = handle.display, "failed to spawn display server: {}", e);
                handle.release_lease();
                self.inner.freed.notify_waiters();
                return Err(PipelineError::DisplayUnavailable { attempts: 1 });
            }
        };

        if self.inner.config.wait_for_socket {
            if let Err(e) = wait_for_socket(&mut child, handle.display).await {
                let _ = child.kill().await;
                handle.release_lease();
                self.inner.freed.notify_waiters();
                return Err(e);
            }
        }

        {
            let mut slots = self.inner.slots.lock();
            let slot = &mut slots[handle.slot_index];
            slot.process = Some(child);
            slot.ready = true;
        }
        self.inner.freed.notify_waiters();

        debug!(display = handle.display, "display server ready");
        Ok(handle)
    }
}

enum Lease {
    /// Slot is running; lease granted
    Ready(DisplayHandle),
    /// Slot claimed but its server must be started first
    NeedsStart(DisplayHandle),
    /// Every slot is at capacity
    Exhausted,
}

/// Poll for the X socket, bailing out early if the server process exits.
/// The display number parameter deliberately avoids the name `display`,
/// which tracing macros resolve to `tracing::field::display`.
async fn wait_for_socket(child: &mut Child, display_num: u32) -> Result<(), PipelineError> {
    let socket = format!("/tmp/.X11-unix/X{}", display_num);
    let deadline = Instant::now() + SOCKET_WAIT;

    loop {
        if Path::new(&socket).exists() {
            return Ok(());
        }
        if let Ok(Some(status)) = child.try_wait() {
            warn!(display = display_num, %status, "display server exited during startup");
            return Err(PipelineError::DisplayUnavailable { attempts: 1 });
        }
        if Instant::now() >= deadline {
            warn!(display = display_num, "timed out waiting for X socket {}", socket);
            return Err(PipelineError::DisplayUnavailable { attempts: 1 });
        }
        tokio::time::sleep(SOCKET_POLL).await;
    }
}

impl DisplayHandle {
    /// X display number of this lease
    pub fn display(&self) -> u32 {
        self.display
    }

    /// Value for the `DISPLAY` environment variable
    pub fn display_env(&self) -> String {
        format!(":{}", self.display)
    }

    /// Serialize screenshot captures against this display. Held for the
    /// duration of one capture attempt sequence.
    pub async fn capture_permit(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.capture_lock.lock().await
    }

    /// Decrement the slot's lease count; returns the display server process
    /// if this was the last lease. Idempotent.
    fn release_lease(&self) -> Option<Child> {
        if self.released.swap(true, Ordering::SeqCst) {
            return None;
        }

        let mut slots = self.pool.slots.lock();
        let slot = &mut slots[self.slot_index];
        slot.leases = slot.leases.saturating_sub(1);
        if slot.leases == 0 {
            slot.ready = false;
            return slot.process.take();
        }
        None
    }
}

impl std::fmt::Debug for DisplayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayHandle")
            .field("display", &self.display)
            .field("slot_index", &self.slot_index)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for DisplayHandle {
    fn drop(&mut self) {
        // Normal path releases through the pool; this only catches leaks.
        if let Some(mut child) = self.release_lease() {
            warn!(display = self.display, "display handle dropped without release");
            let _ = child.start_kill();
            self.pool.freed.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pool configured with a dummy command in place of Xvfb; socket waiting
    /// is off, so slot bookkeeping is exercised without a real X server.
    fn test_config(slots: u32, max_shared: u32) -> DisplayConfig {
        DisplayConfig {
            server_command: "sleep".to_string(),
            base_display: 900,
            slots,
            max_leases_per_slot: max_shared,
            screen: "60".to_string(),
            acquire_timeout_ms: 500,
            wait_for_socket: false,
        }
    }

    #[tokio::test]
    async fn test_acquire_starts_one_process() {
        let pool = DisplayPool::new(test_config(2, 4));
        assert_eq!(pool.active_displays(), 0);

        let handle = pool.acquire().await.unwrap();
        assert_eq!(pool.active_displays(), 1);
        assert_eq!(handle.display(), 900);
        assert_eq!(handle.display_env(), ":900");
        assert!(format!("{:?}", handle).contains("display: 900"));

        pool.release(handle).await;
        assert_eq!(pool.active_displays(), 0);
        assert_eq!(pool.active_leases(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_leases_share_one_display() {
        let pool = DisplayPool::new(test_config(4, 4));

        let h1 = pool.acquire().await.unwrap();
        let h2 = pool.acquire().await.unwrap();
        let h3 = pool.acquire().await.unwrap();

        // All three leases share the first slot's single process
        assert_eq!(pool.active_displays(), 1);
        assert_eq!(pool.active_leases(), 3);
        assert_eq!(h1.display(), h2.display());
        assert_eq!(h2.display(), h3.display());

        pool.release(h1).await;
        pool.release(h2).await;
        assert_eq!(pool.active_displays(), 1, "process survives until last release");

        pool.release(h3).await;
        assert_eq!(pool.active_displays(), 0, "last release terminates the process");
    }

    #[tokio::test]
    async fn test_lease_cap_spills_to_next_slot() {
        let pool = DisplayPool::new(test_config(2, 2));

        let h1 = pool.acquire().await.unwrap();
        let h2 = pool.acquire().await.unwrap();
        let h3 = pool.acquire().await.unwrap();

        assert_eq!(pool.active_displays(), 2);
        assert_ne!(h1.display(), h3.display());

        pool.release(h1).await;
        pool.release(h2).await;
        pool.release(h3).await;
        assert_eq!(pool.active_displays(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let pool = DisplayPool::new(test_config(1, 1));

        let h1 = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PipelineError::DisplayUnavailable { .. }));

        pool.release(h1).await;
    }

    #[tokio::test]
    async fn test_waiter_gets_slot_on_release() {
        let pool = DisplayPool::new(test_config(1, 1));

        let h1 = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(h1).await;

        let h2 = waiter.await.unwrap().unwrap();
        assert_eq!(pool.active_leases(), 1);
        pool.release(h2).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_rolls_back_claim() {
        let mut config = test_config(1, 1);
        config.server_command = "/nonexistent/display-server".to_string();
        let pool = DisplayPool::new(config);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PipelineError::DisplayUnavailable { .. }));
        // The claim was rolled back, not leaked
        assert_eq!(pool.active_leases(), 0);
        assert_eq!(pool.active_displays(), 0);
    }

    #[tokio::test]
    async fn test_socket_wait_fails_when_server_exits() {
        // `true` exits immediately without ever creating an X socket
        let mut config = test_config(1, 1);
        config.server_command = "true".to_string();
        config.wait_for_socket = true;
        let pool = DisplayPool::new(config);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PipelineError::DisplayUnavailable { .. }));
        assert_eq!(pool.active_leases(), 0);
        assert_eq!(pool.active_displays(), 0);
    }

    #[tokio::test]
    async fn test_dropped_handle_returns_lease() {
        let pool = DisplayPool::new(test_config(1, 1));

        {
            let _handle = pool.acquire().await.unwrap();
            assert_eq!(pool.active_leases(), 1);
        }

        assert_eq!(pool.active_leases(), 0);
        // Slot is usable again after the leak path
        let handle = pool.acquire().await.unwrap();
        pool.release(handle).await;
    }
}
