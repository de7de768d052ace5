#![forbid(unsafe_code)]

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion(pub u32);

/// Wall-clock milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    /// Milliseconds elapsed from `earlier` to `self`, clamped at zero when the
    /// clock went backwards.
    pub fn saturating_elapsed_since(self, earlier: UnixTimeMs) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn saturating_add_ms(self, ms: u64) -> UnixTimeMs {
        UnixTimeMs(self.0.saturating_add(ms))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContractViolation {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("{field} out of range {min}..={max} (got {got})")]
    InvalidRange {
        field: &'static str,
        min: f64,
        max: f64,
        got: f64,
    },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}
