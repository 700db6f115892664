//! Thread priority and CPU affinity helpers for dispatch threads.
use crate::priority::PriorityLevel;

/// Attempt to raise the current thread's scheduling priority on supported platforms.
///
/// Used by dedicated worker threads when `elevate_dedicated_threads` is set.
///
/// # Platform-Specific Behavior
///
/// ## Linux
/// Uses `pthread_setschedparam`:
/// - `High`: `SCHED_RR` with priority 30
/// - `Medium`: `SCHED_RR` with priority 10
/// - `Low`: `SCHED_OTHER` (unchanged default)
///
/// ## macOS
/// Uses Quality of Service (QoS) classes:
/// - `High`: `QOS_CLASS_USER_INITIATED`
/// - `Medium`: `QOS_CLASS_UTILITY`
/// - `Low`: `QOS_CLASS_BACKGROUND`
///
/// ## Other Platforms
/// No-op.
///
/// # Note
/// Real-time policies need appropriate capabilities on Linux. Returns `false` when the request
/// was refused or is unsupported, so the caller can log it.
pub fn set_thread_priority(level: PriorityLevel) -> bool {
    #[cfg(target_os = "linux")]
    {
        use libc::{pthread_self, pthread_setschedparam, sched_param, SCHED_OTHER, SCHED_RR};
        use std::mem;

        let (policy, sched_priority) = match level {
            PriorityLevel::High => (SCHED_RR, 30),
            PriorityLevel::Medium => (SCHED_RR, 10),
            PriorityLevel::Low => (SCHED_OTHER, 0),
        };

        // SAFETY: `param` is fully initialised and `pthread_self` is always a valid handle.
        unsafe {
            let mut param: sched_param = mem::zeroed();
            param.sched_priority = sched_priority;
            pthread_setschedparam(pthread_self(), policy, &param) == 0
        }
    }
    #[cfg(target_os = "macos")]
    {
        const QOS_CLASS_USER_INITIATED: u32 = 0x19;
        const QOS_CLASS_UTILITY: u32 = 0x15;
        const QOS_CLASS_BACKGROUND: u32 = 0x09;

        let qos_class = match level {
            PriorityLevel::High => QOS_CLASS_USER_INITIATED,
            PriorityLevel::Medium => QOS_CLASS_UTILITY,
            PriorityLevel::Low => QOS_CLASS_BACKGROUND,
        };

        extern "C" {
            fn pthread_set_qos_class_self_np(qos_class: u32, relative_priority: i32) -> i32;
        }

        // SAFETY: plain FFI call on the current thread with constant arguments.
        unsafe { pthread_set_qos_class_self_np(qos_class, 0) == 0 }
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = level;
        false
    }
}

/// Attempt to pin the current thread to a specific core when supported.
///
/// # Platform Support
/// - **Linux**: Uses `pthread_setaffinity_np` to pin the thread to `core_id`
/// - **Other platforms**: No-op, returns `false`
pub fn set_thread_core(core_id: usize) -> bool {
    #[cfg(target_os = "linux")]
    {
        use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_SETSIZE, CPU_ZERO};

        if core_id >= CPU_SETSIZE as usize {
            return false;
        }
        // SAFETY: the set is zeroed before use and `core_id` is bounded by CPU_SETSIZE.
        unsafe {
            let mut set: cpu_set_t = std::mem::zeroed();
            CPU_ZERO(&mut set);
            CPU_SET(core_id, &mut set);
            pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set) == 0
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = core_id;
        false
    }
}
