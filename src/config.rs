//! Open-time configuration.
//!
//! An [`OpenConfiguration`] is a small typed option map merged onto defaults
//! when a device is opened; it is never mutated after that point. Option
//! values are validated at open time, so a bad configuration surfaces as
//! [`DeviceError::InvalidOption`] from `open` (and as a quiet `None` from
//! `try_open`).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};

/// Recognized open options.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenOption {
    /// Request sole access to the device, enforced across processes.
    /// Default: `false`.
    Exclusive,
    /// Allow a contending exclusive open in another process to interrupt
    /// this stream's blocking reads. Default: `true`.
    Interruptible,
    /// Upper bound on exclusive-lock acquisition, in milliseconds.
    /// Default: 3000.
    LockTimeout,
}

/// A value assigned to an [`OpenOption`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum OptionValue {
    Bool(bool),
    Millis(u64),
}

/// Options controlling how a device is opened.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OpenConfiguration {
    options: HashMap<OpenOption, OptionValue>,
}

impl OpenConfiguration {
    pub fn new() -> OpenConfiguration {
        OpenConfiguration::default()
    }

    /// Sets an option, replacing any previous value.
    pub fn set(&mut self, option: OpenOption, value: OptionValue) -> &mut Self {
        self.options.insert(option, value);
        self
    }

    /// The explicitly configured value for `option`, if any.
    pub fn get(&self, option: OpenOption) -> Option<OptionValue> {
        self.options.get(&option).copied()
    }

    /// Builder form of `set(OpenOption::Exclusive, ..)`.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.set(OpenOption::Exclusive, OptionValue::Bool(exclusive));
        self
    }

    /// Builder form of `set(OpenOption::Interruptible, ..)`.
    pub fn interruptible(mut self, interruptible: bool) -> Self {
        self.set(OpenOption::Interruptible, OptionValue::Bool(interruptible));
        self
    }

    /// Builder form of `set(OpenOption::LockTimeout, ..)`.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.set(
            OpenOption::LockTimeout,
            OptionValue::Millis(timeout.as_millis() as u64),
        );
        self
    }

    /// Merges this configuration onto the defaults, validating every value.
    pub(crate) fn resolve(&self) -> Result<ResolvedOptions> {
        let mut resolved = ResolvedOptions::default();
        for (&option, &value) in &self.options {
            match (option, value) {
                (OpenOption::Exclusive, OptionValue::Bool(v)) => resolved.exclusive = v,
                (OpenOption::Interruptible, OptionValue::Bool(v)) => resolved.interruptible = v,
                (OpenOption::LockTimeout, OptionValue::Millis(ms)) => {
                    resolved.lock_timeout = Duration::from_millis(ms);
                }
                (option, value) => {
                    return Err(DeviceError::InvalidOption(format!(
                        "{option:?} does not accept {value:?}"
                    )));
                }
            }
        }
        Ok(resolved)
    }
}

/// Effective options after merging onto defaults.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ResolvedOptions {
    pub exclusive: bool,
    pub interruptible: bool,
    pub lock_timeout: Duration,
}

impl Default for ResolvedOptions {
    fn default() -> Self {
        ResolvedOptions {
            exclusive: false,
            interruptible: true,
            lock_timeout: Duration::from_millis(3000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let resolved = OpenConfiguration::new().resolve().expect("valid");
        assert!(!resolved.exclusive);
        assert!(resolved.interruptible);
        assert_eq!(resolved.lock_timeout, Duration::from_millis(3000));
    }

    #[test]
    fn explicit_options_override_defaults() {
        let resolved = OpenConfiguration::new()
            .exclusive(true)
            .interruptible(false)
            .lock_timeout(Duration::from_millis(250))
            .resolve()
            .expect("valid");
        assert!(resolved.exclusive);
        assert!(!resolved.interruptible);
        assert_eq!(resolved.lock_timeout, Duration::from_millis(250));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut config = OpenConfiguration::new();
        config.set(OpenOption::Exclusive, OptionValue::Millis(1));
        let err = config.resolve().unwrap_err();
        assert!(matches!(err, DeviceError::InvalidOption(_)));

        let mut config = OpenConfiguration::new();
        config.set(OpenOption::LockTimeout, OptionValue::Bool(true));
        assert!(config.resolve().is_err());
    }
}
