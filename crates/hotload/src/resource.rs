//! The capability set a hot-swappable resource implements.
//!
//! A [`Resource`] is an opaque unit of work: a parsed config, a compiled
//! rule set, a loaded model. A [`Target`](crate::Target) builds one through a
//! factory, initializes it, publishes it, and builds fresh ones whenever its
//! [`ReloadSpec`] fires.
//!
//! # The zero signature
//!
//! [`Resource::signature`] returning `0` means **never reload**. A fresh
//! resource with signature `0` is discarded without being initialized. This
//! is easy to hit by accident with an unset fingerprint field, so compute
//! signatures from the actual content and map a zero hash to some other
//! value if the resource is meant to reload.

use std::fmt;
#[cfg(feature = "watch")]
use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// A resource managed by a [`Target`](crate::Target).
///
/// # Example
///
/// ```ignore
/// struct Rules {
///     path: PathBuf,
///     source: String,
///     compiled: Vec<Rule>,
/// }
///
/// impl Resource for Rules {
///     type Config = RuleOptions;
///     type Input = Request;
///     type Output = Verdict;
///     type Error = RuleError;
///
///     fn init(&mut self, options: &RuleOptions) -> Result<(), RuleError> {
///         self.compiled = compile(&self.source, options)?;
///         Ok(())
///     }
///
///     fn process(&self, request: Request) -> Result<Verdict, RuleError> {
///         evaluate(&self.compiled, &request)
///     }
///
///     fn signature(&self) -> u64 {
///         fingerprint(&self.source)
///     }
///
///     fn reload_spec(&self) -> ReloadSpec {
///         ReloadSpec::Watched(vec![self.path.clone()])
///     }
/// }
/// ```
pub trait Resource: Send + Sync + 'static {
    /// Construction-time configuration handed to every `init`.
    type Config: Send + Sync + 'static;

    /// Input accepted by [`process`](Resource::process).
    type Input;

    /// Output produced by [`process`](Resource::process).
    type Output;

    /// Error produced by `init` and `process`.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Prepare a freshly constructed resource for serving.
    ///
    /// # Errors
    ///
    /// An error at load time leaves the target unusable. An error during a
    /// reload discards the fresh resource and keeps the current one.
    fn init(&mut self, config: &Self::Config) -> Result<(), Self::Error>;

    /// Handle one unit of work against this version of the resource.
    ///
    /// # Errors
    ///
    /// Whatever the resource reports; passed through to the caller.
    fn process(&self, input: Self::Input) -> Result<Self::Output, Self::Error>;

    /// Content fingerprint, read on fresh instances before `init`.
    ///
    /// `0` opts the resource out of reloading entirely: a fresh resource
    /// reporting `0` is dropped, and an active resource reporting `0` is
    /// never replaced.
    fn signature(&self) -> u64;

    /// How reloads are triggered. Read once, on the resource built by
    /// [`Target::load`](crate::Target::load).
    fn reload_spec(&self) -> ReloadSpec;
}

/// The trigger strategy a resource declares.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ReloadSpec {
    /// Reload on every tick of a fixed interval.
    Periodic(Duration),

    /// Reload when the signal is notified.
    Signaled(Signal),

    /// Reload when any of the paths changes.
    #[cfg(feature = "watch")]
    Watched(Vec<PathBuf>),
}

impl ReloadSpec {
    /// Short name of the strategy, used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Periodic(_) => "periodic",

            Self::Signaled(_) => "signaled",

            #[cfg(feature = "watch")]
            Self::Watched(_) => "watched",
        }
    }
}

/// External reload trigger for [`ReloadSpec::Signaled`] targets.
///
/// Notifications are not queued: while one is pending, further calls to
/// [`notify`](Signal::notify) are absorbed into it. Every notification is
/// followed by at least one reload attempt, but not necessarily one attempt
/// per notification.
///
/// Clones share the same channel, so a resource can hand out the same
/// signal from every instance the factory builds.
#[derive(Clone)]
pub struct Signal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Signal {
    /// Create a new signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Request a reload.
    ///
    /// Returns `false` if a notification was already pending.
    pub fn notify(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,

            Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => false,
        }
    }

    /// Returns `true` if a notification is waiting to be consumed.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.rx.is_empty()
    }

    pub(crate) fn receiver(&self) -> Receiver<()> {
        self.rx.clone()
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("pending", &self.is_pending())
            .finish()
    }
}
