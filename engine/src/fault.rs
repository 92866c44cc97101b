//! Simulated I/O errors.
//!
//! Volumes and target images consult a shared [`FaultRegistry`] before every
//! read or write. Rules are keyed by device name (a volume id or a target
//! name) and may fire a limited number of times.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::IoFault;
use crate::model::{Extent, IoOperation};

/// errno used when a rule does not name one (EIO).
pub const EIO: i32 = 5;

/// errno reported for accesses outside a device.
pub const EINVAL: i32 = 22;

fn default_errno() -> i32 {
    EIO
}

/// One injected failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRule {
    pub operation: IoOperation,

    /// Byte range the rule applies to; `None` matches every access.
    #[serde(default)]
    pub range: Option<Extent>,

    #[serde(default = "default_errno")]
    pub errno: i32,

    /// How many more times the rule fires; `None` fires forever.
    #[serde(default)]
    pub remaining: Option<u32>,
}

impl FaultRule {
    /// A rule that fails the first access of `operation` touching `range`.
    pub fn once(operation: IoOperation, range: Extent) -> Self {
        FaultRule {
            operation,
            range: Some(range),
            errno: EIO,
            remaining: Some(1),
        }
    }

    /// A rule that fails every access of `operation`.
    pub fn always(operation: IoOperation) -> Self {
        FaultRule {
            operation,
            range: None,
            errno: EIO,
            remaining: None,
        }
    }

    fn matches(&self, operation: IoOperation, access: Extent) -> bool {
        if self.operation != operation || self.remaining == Some(0) {
            return false;
        }
        match self.range {
            None => true,
            Some(range) => access.offset < range.end() && range.offset < access.end(),
        }
    }
}

/// Device-keyed set of fault rules.
#[derive(Debug, Default)]
pub struct FaultRegistry {
    rules: Mutex<HashMap<String, Vec<FaultRule>>>,
}

impl FaultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, device: &str, rule: FaultRule) {
        debug!(device, ?rule, "fault rule injected");
        self.rules
            .lock()
            .entry(device.to_string())
            .or_default()
            .push(rule);
    }

    /// Drop every rule registered for `device`.
    pub fn clear(&self, device: &str) {
        self.rules.lock().remove(device);
    }

    /// Fail the access if a rule matches, consuming one firing of that rule.
    pub fn check(&self, device: &str, operation: IoOperation, access: Extent) -> Result<(), IoFault> {
        let mut rules = self.rules.lock();
        let Some(list) = rules.get_mut(device) else {
            return Ok(());
        };
        let Some(rule) = list.iter_mut().find(|r| r.matches(operation, access)) else {
            return Ok(());
        };

        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        let errno = rule.errno;
        list.retain(|r| r.remaining != Some(0));

        debug!(device, %operation, offset = access.offset, len = access.len, errno, "injected fault fired");
        Err(IoFault::new(errno, operation, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_once_rule_fires_once() {
        let registry = FaultRegistry::new();
        registry.inject("drive0", FaultRule::once(IoOperation::Read, Extent::new(4096, 512)));

        let hit = Extent::new(0, 65536);
        let err = registry.check("drive0", IoOperation::Read, hit).unwrap_err();
        assert_eq!(err.errno, EIO);
        assert_eq!(err.operation, IoOperation::Read);
        assert_eq!(err.device, "drive0");

        assert!(registry.check("drive0", IoOperation::Read, hit).is_ok());
    }

    #[test]
    fn test_rule_ignores_other_ranges_and_ops() {
        let registry = FaultRegistry::new();
        registry.inject("drive0", FaultRule::once(IoOperation::Read, Extent::new(65536, 512)));

        assert!(registry.check("drive0", IoOperation::Read, Extent::new(0, 65536)).is_ok());
        assert!(registry.check("drive0", IoOperation::Write, Extent::new(65536, 512)).is_ok());
        assert!(registry.check("drive1", IoOperation::Read, Extent::new(65536, 512)).is_ok());
        assert!(registry.check("drive0", IoOperation::Read, Extent::new(65536, 512)).is_err());
    }

    #[test]
    fn test_always_rule_and_clear() {
        let registry = FaultRegistry::new();
        registry.inject("target0", FaultRule::always(IoOperation::Write));

        for _ in 0..3 {
            assert!(registry.check("target0", IoOperation::Write, Extent::new(0, 1)).is_err());
        }
        registry.clear("target0");
        assert!(registry.check("target0", IoOperation::Write, Extent::new(0, 1)).is_ok());
    }

    #[test]
    fn test_rule_at_end_of_address_space() {
        let registry = FaultRegistry::new();
        registry.inject("drive0", FaultRule::once(IoOperation::Read, Extent::new(u64::MAX - 1, 10)));

        assert!(registry.check("drive0", IoOperation::Read, Extent::new(0, 65536)).is_ok());
        assert!(registry.check("drive0", IoOperation::Read, Extent::new(u64::MAX - 1, 1)).is_err());
    }
}
