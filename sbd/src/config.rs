//! Session timing configuration.

use bon::Builder;
use std::time::Duration;

/// Time to wait before the second power-up attempt. The modem needs a while to
/// charge its supercapacitor when fed from a low power supply.
pub const DEFAULT_POWER_UP_RETRY_WAIT: Duration = Duration::from_secs(30);
/// Overall deadline for a mailbox check, across all of its cycles.
pub const DEFAULT_TRANSMISSION_TIMEOUT: Duration = Duration::from_secs(300);
/// Overall deadline for waiting on network service.
pub const DEFAULT_NETWORK_CHECK_TIMEOUT: Duration = Duration::from_secs(120);

/// Timing knobs of a [`Session`](crate::Session).
///
/// Every operation reads these when it starts, so changing them through the
/// session setters affects the next operation, never a running one.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct Config {
    #[builder(default = DEFAULT_POWER_UP_RETRY_WAIT)]
    pub power_up_retry_wait: Duration,
    #[builder(default = DEFAULT_TRANSMISSION_TIMEOUT)]
    pub transmission_timeout: Duration,
    #[builder(default = DEFAULT_NETWORK_CHECK_TIMEOUT)]
    pub network_check_timeout: Duration,
    /// Mirror the modem exchange onto the console transport.
    #[builder(default)]
    pub console_print: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_modem_recommendations() {
        let cfg = Config::default();
        assert_eq!(cfg.power_up_retry_wait, Duration::from_secs(30));
        assert_eq!(cfg.transmission_timeout, Duration::from_secs(300));
        assert_eq!(cfg.network_check_timeout, Duration::from_secs(120));
        assert!(!cfg.console_print);
    }

    #[test]
    fn builder_overrides_single_field() {
        let cfg = Config::builder()
            .transmission_timeout(Duration::from_secs(60))
            .build();
        assert_eq!(cfg.transmission_timeout, Duration::from_secs(60));
        assert_eq!(cfg.network_check_timeout, DEFAULT_NETWORK_CHECK_TIMEOUT);
    }
}
