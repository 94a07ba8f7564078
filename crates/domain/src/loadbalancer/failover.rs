use serde::{Deserialize, Serialize};

use super::error::LbError;

/// Rotating identity label for the kernel objects currently installed for
/// an upstream group.
///
/// Every recomputation installs fresh chain/set objects under the next
/// mode's name and retires the previous mode's objects, so the rule graph
/// is never momentarily empty. `Active1` and `Active2` alternate to
/// guarantee the incoming name always differs from the outgoing one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverMode {
    Unknown,
    #[default]
    Inactive,
    Active1,
    Active2,
    Down,
}

impl FailoverMode {
    /// Stable single-digit identifier used in kernel object names.
    pub fn id(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Inactive => 1,
            Self::Active1 => 2,
            Self::Active2 => 3,
            Self::Down => 4,
        }
    }

    /// Index into mode-sized bookkeeping tables.
    pub fn index(self) -> usize {
        usize::from(self.id())
    }

    /// The mode a partially-available group rotates to.
    pub fn next(self) -> Result<Self, LbError> {
        match self {
            Self::Inactive | Self::Down | Self::Active2 => Ok(Self::Active1),
            Self::Active1 => Ok(Self::Active2),
            Self::Unknown => Err(LbError::FailoverTransition(self.as_str())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Inactive => "inactive",
            Self::Active1 => "active1",
            Self::Active2 => "active2",
            Self::Down => "down",
        }
    }
}

impl std::fmt::Display for FailoverMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
