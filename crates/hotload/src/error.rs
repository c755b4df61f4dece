//! Error types for swapping and reloading resources.
//!
//! # Error Variants
//!
//! | Variant | When It Occurs |
//! |---------|----------------|
//! | [`Error::Init`] | A freshly built resource failed `init` |
//! | [`Error::SlotBusy`] | Publish hit a slot whose previous handle is still borrowed |
//! | [`Error::NoChange`] | Reload skipped: sentinel or unchanged signature |
//! | [`Error::AlreadyLoaded`] | `load` called twice on the same target |
//! | [`Error::NotLoaded`] | Operation requires a loaded target |
//! | [`Error::Stopped`] | The trigger loop is no longer running |
//! | [`Error::Watch`] | A watched path could not be armed (with `watch` feature) |
//! | [`Error::Spawn`] | A background thread could not be started |
//!
//! Only [`Error::Init`] returned from [`Target::load`](crate::Target::load) is
//! fatal. Every error produced by a reload leaves the previously published
//! resource serving.

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
#[cfg(feature = "watch")]
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Errors produced by the swap buffer and the reload target.
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    /// A resource failed to initialize.
    ///
    /// At load time the target stays unusable. During a reload the previous
    /// resource keeps serving.
    #[error("resource initialization failed: {message}")]
    #[diagnostic(
        code(hotload::init_failed),
        help("Fix the resource input and trigger another reload. A loaded target keeps serving the previous resource.")
    )]
    Init {
        /// Human-readable error message.
        message: String,
        /// The error returned by the resource.
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The slot a publish would write to still has active borrowers.
    #[error("slot {slot} is still draining ({borrowers} active borrower(s))")]
    #[diagnostic(
        code(hotload::slot_busy),
        help("Readers are still holding the retired resource. Retry the publish later.")
    )]
    SlotBusy {
        /// Index of the busy slot.
        slot: usize,
        /// Borrowers observed on the slot.
        borrowers: usize,
    },

    /// The reload was skipped on purpose.
    #[error("reload skipped: {reason}")]
    #[diagnostic(code(hotload::no_change), severity(Advice))]
    NoChange {
        /// Why nothing was published.
        reason: NoChangeReason,
    },

    /// `load` was called on a target that is already loaded.
    #[error("target is already loaded")]
    #[diagnostic(code(hotload::already_loaded))]
    AlreadyLoaded,

    /// The target has not been loaded yet.
    #[error("target has not been loaded")]
    #[diagnostic(
        code(hotload::not_loaded),
        help("Call `Target::load` before using the target")
    )]
    NotLoaded,

    /// The trigger loop has been stopped.
    #[error("trigger loop has been stopped")]
    #[diagnostic(
        code(hotload::stopped),
        help("The target still serves its last resource but no longer reloads")
    )]
    Stopped,

    /// A watched path could not be armed.
    #[cfg(feature = "watch")]
    #[error("failed to watch path '{path}': {message}")]
    #[diagnostic(
        code(hotload::watch_failed),
        help("Ensure the path or its parent directory exists and is readable")
    )]
    Watch {
        /// The path that could not be watched.
        path: PathBuf,
        /// Human-readable error message.
        message: String,
        /// The underlying notify error, if available.
        #[source]
        source: Option<notify::Error>,
    },

    /// A background thread could not be spawned.
    #[error("failed to spawn {name} thread")]
    #[diagnostic(code(hotload::spawn_failed))]
    Spawn {
        /// Name of the thread.
        name: String,
        /// The OS error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a new `Init` error from the resource's own error.
    pub fn init(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Init {
            message: source.to_string(),
            source: Box::new(source),
        }
    }

    /// Create a new `SlotBusy` error.
    #[must_use]
    pub const fn slot_busy(slot: usize, borrowers: usize) -> Self {
        Self::SlotBusy { slot, borrowers }
    }

    /// Create a new `NoChange` error.
    #[must_use]
    pub const fn no_change(reason: NoChangeReason) -> Self {
        Self::NoChange { reason }
    }

    /// Create a new `Watch` error.
    #[cfg(feature = "watch")]
    pub fn watch(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: Option<notify::Error>,
    ) -> Self {
        Self::Watch {
            path: path.into(),
            message: message.into(),
            source,
        }
    }

    /// Create a new `Spawn` error.
    pub fn spawn(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            name: name.into(),
            source,
        }
    }

    /// Returns `true` if this is an intentional skip rather than a failure.
    #[must_use]
    pub const fn is_no_change(&self) -> bool {
        matches!(self, Self::NoChange { .. })
    }

    /// Returns `true` if a publish was refused because a slot is draining.
    #[must_use]
    pub const fn is_slot_busy(&self) -> bool {
        matches!(self, Self::SlotBusy { .. })
    }
}

/// Why a reload did not publish anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoChangeReason {
    /// The fresh resource reported signature `0`, which opts out of reloads.
    Sentinel,

    /// The fresh resource has the same signature as the active one.
    Unchanged(u64),
}

impl Display for NoChangeReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sentinel => write!(f, "signature 0 marks the resource as never reloading"),

            Self::Unchanged(signature) => write!(f, "no data changed (signature {signature:#x})"),
        }
    }
}

/// Error returned by [`Target::process`](crate::Target::process).
///
/// Once a target is loaded, only the resource's own errors come through.
#[derive(Debug, Error)]
pub enum ProcessError<E> {
    /// The target has no published resource yet.
    #[error("target has not been loaded")]
    NotLoaded,

    /// The resource failed to process the input.
    #[error(transparent)]
    Resource(E),
}

impl<E> ProcessError<E> {
    /// Returns the resource error, if this is one.
    pub fn into_resource(self) -> Option<E> {
        match self {
            Self::Resource(e) => Some(e),

            Self::NotLoaded => None,
        }
    }
}
