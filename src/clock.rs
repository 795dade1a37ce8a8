//! Conversion of kernel boot-time timestamps to wall-clock time

use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait BootClock: Send + Sync {
    /// Converts nanoseconds since boot (`CLOCK_BOOTTIME`) to wall-clock time
    fn wall_clock(&self, boot_ns: u64) -> SystemTime;
}

/// Host clock. The boot offset is measured once per process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBootClock;

static BOOT_TIME: OnceLock<SystemTime> = OnceLock::new();

impl SystemBootClock {
    /// Wall-clock time at which the host booted
    pub fn boot_time() -> SystemTime {
        *BOOT_TIME.get_or_init(measure_boot_time)
    }
}

impl BootClock for SystemBootClock {
    fn wall_clock(&self, boot_ns: u64) -> SystemTime {
        Self::boot_time() + Duration::from_nanos(boot_ns)
    }
}

#[cfg(target_os = "linux")]
fn measure_boot_time() -> SystemTime {
    fn now(clock: libc::clockid_t) -> Option<Duration> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid, writable timespec
        let ret = unsafe { libc::clock_gettime(clock, &mut ts) };
        if ret != 0 {
            return None;
        }
        Some(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
    }

    match (now(libc::CLOCK_REALTIME), now(libc::CLOCK_BOOTTIME)) {
        (Some(real), Some(boot)) => UNIX_EPOCH + real.saturating_sub(boot),
        _ => {
            tracing::warn!("Failed to read host clocks, timestamps are relative to the epoch");
            UNIX_EPOCH
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn measure_boot_time() -> SystemTime {
    UNIX_EPOCH
}

/// Clock anchored at a known boot time, for replaying captured records
#[derive(Debug, Clone, Copy)]
pub struct FixedBootClock {
    boot_time: SystemTime,
}

impl FixedBootClock {
    pub fn new(boot_time: SystemTime) -> Self {
        Self { boot_time }
    }
}

impl Default for FixedBootClock {
    fn default() -> Self {
        Self::new(UNIX_EPOCH)
    }
}

impl BootClock for FixedBootClock {
    fn wall_clock(&self, boot_ns: u64) -> SystemTime {
        self.boot_time + Duration::from_nanos(boot_ns)
    }
}
