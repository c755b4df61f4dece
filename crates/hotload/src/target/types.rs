//! Events describing reload activity.

#[cfg(feature = "watch")]
use std::path::PathBuf;
use std::time::Instant;

/// What caused a reload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReloadTrigger {
    /// The periodic timer ticked.
    Tick,

    /// The target's [`Signal`](crate::Signal) was notified.
    Signal,

    /// A watched path was created or modified.
    #[cfg(feature = "watch")]
    PathChanged(PathBuf),

    /// A watched path was deleted or renamed and has reappeared.
    #[cfg(feature = "watch")]
    PathReplaced(PathBuf),

    /// Reload requested through [`Target::request_reload`](crate::Target::request_reload).
    Manual,
}

impl ReloadTrigger {
    /// Returns the path if this trigger is file-related.
    #[cfg(feature = "watch")]
    #[must_use]
    pub const fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::PathChanged(p) | Self::PathReplaced(p) => Some(p),

            _ => None,
        }
    }
}

impl std::fmt::Display for ReloadTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tick => write!(f, "periodic tick"),

            Self::Signal => write!(f, "signal"),

            #[cfg(feature = "watch")]
            Self::PathChanged(p) => write!(f, "path changed: {}", p.display()),

            #[cfg(feature = "watch")]
            Self::PathReplaced(p) => write!(f, "path replaced: {}", p.display()),

            Self::Manual => write!(f, "manual reload"),
        }
    }
}

/// A successful reload.
///
/// Passed to the `on_reload` callback registered on
/// [`TargetBuilder`](crate::TargetBuilder).
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    /// Signature of the resource that was replaced.
    pub old_signature: u64,

    /// Signature of the newly published resource.
    pub new_signature: u64,

    /// Swap buffer epoch after the publish.
    pub epoch: u64,

    /// What triggered the reload.
    pub trigger: ReloadTrigger,

    /// When the new resource was published.
    pub timestamp: Instant,
}

impl ReloadEvent {
    pub(crate) fn new(old_signature: u64, new_signature: u64, epoch: u64, trigger: ReloadTrigger) -> Self {
        Self {
            old_signature,
            new_signature,
            epoch,
            trigger,
            timestamp: Instant::now(),
        }
    }
}
