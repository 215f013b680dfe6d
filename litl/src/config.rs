//! Recorder configuration.
//!
//! Everything defaults to on and can be disabled through the environment
//! before the trace is initialized, or toggled later through the `Trace`
//! methods. Only the exact value `off` disables a switch; any other value,
//! including an unset variable, leaves it enabled.

use std::env;

/// Disables overflow flushing when set to `off`: a full buffer then latches
/// the trace into drop mode instead of spilling to disk.
pub const ENV_BUFFER_FLUSH: &str = "LITL_BUFFER_FLUSH";

/// Disables flush serialization when set to `off`. Only safe for
/// single-threaded recorders.
pub const ENV_THREAD_SAFETY: &str = "LITL_THREAD_SAFETY";

/// Initial switch positions for a trace, read once at init.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub buffer_flush: bool,
    pub thread_safety: bool,
    pub record_tid: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_flush: true,
            thread_safety: true,
            record_tid: true,
        }
    }
}

impl Config {
    /// Seed the configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            buffer_flush: env_enabled(ENV_BUFFER_FLUSH),
            thread_safety: env_enabled(ENV_THREAD_SAFETY),
            record_tid: true,
        }
    }
}

fn env_enabled(name: &str) -> bool {
    !matches!(env::var(name), Ok(v) if v == "off")
}

#[cfg(test)]
mod tests {
    use super::*;

    // one test so the env mutations cannot interleave with each other
    #[test]
    fn env_switches() {
        env::remove_var(ENV_BUFFER_FLUSH);
        env::remove_var(ENV_THREAD_SAFETY);
        let cfg = Config::from_env();
        assert!(cfg.buffer_flush);
        assert!(cfg.thread_safety);
        assert!(cfg.record_tid);

        env::set_var(ENV_BUFFER_FLUSH, "off");
        assert!(!Config::from_env().buffer_flush);

        // only the exact string disables
        env::set_var(ENV_BUFFER_FLUSH, "OFF");
        assert!(Config::from_env().buffer_flush);
        env::set_var(ENV_BUFFER_FLUSH, "0");
        assert!(Config::from_env().buffer_flush);

        env::set_var(ENV_THREAD_SAFETY, "off");
        assert!(!Config::from_env().thread_safety);

        env::remove_var(ENV_BUFFER_FLUSH);
        env::remove_var(ENV_THREAD_SAFETY);
    }
}
