//! Configuration of the client subsystem.

use core::cmp;
use core::time::Duration;

//------------ DefMinMax -----------------------------------------------------

/// The default, minimum, and maximum values for a config setting.
#[derive(Clone, Copy)]
pub(crate) struct DefMinMax<T> {
    /// The default value.
    def: T,

    /// The minimum value.
    min: T,

    /// The maximum value.
    max: T,
}

impl<T> DefMinMax<T> {
    /// Creates a new value.
    pub(crate) const fn new(def: T, min: T, max: T) -> Self {
        Self { def, min, max }
    }

    /// Returns the default value.
    pub(crate) fn default(self) -> T {
        self.def
    }

    /// Trims the given value to fit into the minimum/maximum range.
    pub(crate) fn limit(self, value: T) -> T
    where
        T: Ord,
    {
        cmp::max(self.min, cmp::min(self.max, value))
    }
}

//------------ Constants -----------------------------------------------------

/// Limit on the time to wait for a response send to complete.
///
/// The value has to be between 1 millisecond and 60 seconds. The default of
/// 5 seconds is a guess at something reasonable: long enough for a stalled
/// peer to recover, short enough not to pin a send buffer forever.
const SEND_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(5),
    Duration::from_millis(1),
    Duration::from_secs(60),
);

//------------ Config --------------------------------------------------------

/// Configuration for a [`ClientManager`] and the clients it creates.
///
/// A manager stores its config behind an [`arc_swap::ArcSwap`] so that
/// [`reconfigure`] takes effect without restarting clients; each client
/// reads the current values at the point of use.
///
/// [`ClientManager`]: crate::manager::ClientManager
/// [`reconfigure`]: crate::manager::ClientManager::reconfigure
#[derive(Clone, Debug)]
pub struct Config {
    /// Limit on the time to wait for a response send to complete.
    send_timeout: Duration,

    /// Whether created clients advertise recursion.
    recursion_available: bool,
}

impl Config {
    /// Creates a new, default config.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the limit on the time to wait for a response send to complete.
    ///
    /// The value has to be between 1 millisecond and 60 seconds; anything
    /// outside that range is clamped. The default is 5 seconds.
    ///
    /// # Reconfigure
    ///
    /// Changing this setting affects sends scheduled after the change;
    /// in-flight sends keep the timeout they started with.
    pub fn set_send_timeout(&mut self, value: Duration) {
        self.send_timeout = SEND_TIMEOUT.limit(value);
    }

    /// Returns the limit on the time to wait for a send to complete.
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Sets whether created clients get the RECURSION_AVAILABLE attribute.
    ///
    /// # Reconfigure
    ///
    /// Only clients created after the change are affected; the attribute
    /// set of an existing client is immutable.
    pub fn set_recursion_available(&mut self, value: bool) {
        self.recursion_available = value;
    }

    /// Returns whether created clients advertise recursion.
    #[must_use]
    pub fn recursion_available(&self) -> bool {
        self.recursion_available
    }
}

//--- Default

impl Default for Config {
    fn default() -> Self {
        Self {
            send_timeout: SEND_TIMEOUT.default(),
            recursion_available: false,
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_timeout_is_clamped() {
        let mut config = Config::new();
        config.set_send_timeout(Duration::ZERO);
        assert_eq!(config.send_timeout(), Duration::from_millis(1));
        config.set_send_timeout(Duration::from_secs(3600));
        assert_eq!(config.send_timeout(), Duration::from_secs(60));
        config.set_send_timeout(Duration::from_secs(2));
        assert_eq!(config.send_timeout(), Duration::from_secs(2));
    }
}
