use std::env;

/// Environment switch for cross-process shared blaming, parsed as an
/// integer boolean (`0` off, anything else on).
pub const ENV_SHARED_BLAMING: &str = "GPU_BLAME_SHARED_BLAMING";

/// Environment override for the number of inner frames to skip when
/// sampling the call path at a kernel launch site.
pub const ENV_LAUNCH_SKIP_INNER: &str = "GPU_BLAME_LAUNCH_SKIP_INNER";

/// Environment override for the device ordinal used in trace records and
/// the shared-memory object name.
pub const ENV_DEVICE: &str = "GPU_BLAME_DEVICE";

/// Runtime options of the blame-shift core.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Opts {
    /// Coordinate GPU-idle attribution with other processes through a
    /// per-device shared-memory counter.
    ///
    /// When enabled, a sample is not credited as GPU-idle while any
    /// process on the machine has unretired work on this device. When the
    /// shared-memory object cannot be opened the core silently falls back
    /// to per-process blaming.
    pub shared_blaming: bool,

    /// Inner frames to skip when unwinding at a kernel launch site, so the
    /// launcher is attributed to user code rather than runtime wrappers.
    pub launch_skip_inner: u32,

    /// Device ordinal. All reasoning is per single device.
    pub device: u32,
}

impl Opts {
    /// Builds options from the environment, with [`Default`] values for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        Self {
            shared_blaming: env_int(ENV_SHARED_BLAMING).map(|v| v != 0).unwrap_or(false),
            launch_skip_inner: env_int(ENV_LAUNCH_SKIP_INNER).unwrap_or(0) as u32,
            device: env_int(ENV_DEVICE).unwrap_or(0) as u32,
        }
    }
}

fn env_int(key: &str) -> Option<i64> {
    env::var(key).ok()?.trim().parse().ok()
}
