//! Reload target: a resource slot that refreshes itself.
//!
//! A [`Target`] owns a resource factory, a [`SwapBuffer`] and one trigger
//! loop. [`Target::load`] builds, initializes and publishes the first
//! resource, then starts the loop matching the resource's [`ReloadSpec`].
//! Every trigger builds a fresh resource and publishes it only if its
//! signature is non-zero and differs from the active one. An active resource
//! with signature `0` is never replaced.
//!
//! # Failure Handling
//!
//! A reload that fails (the fresh resource fails `init`, or the previous
//! version is still draining) leaves the active resource serving. The error
//! is logged and passed to the `on_error` callback if one is registered.
//!
//! ```ignore
//! let target = Target::builder(Rules::unloaded, RuleOptions::default())
//!     .on_error(|err| eprintln!("rules reload failed: {err}"))
//!     .build();
//!
//! target.load()?;
//! let verdict = target.process(request)?;
//! ```
//!
//! # Change Detection
//!
//! The publish epoch allows cheap change detection without callbacks:
//!
//! ```ignore
//! let epoch = target.epoch();
//! // ...
//! if target.has_changed_since(epoch) {
//!     rebuild_caches(&target);
//! }
//! ```

mod builder;
mod trigger;
mod types;

pub use builder::{ErrorCallback, ReloadCallback, TargetBuilder};
pub use types::{ReloadEvent, ReloadTrigger};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffer::{Lease, SwapBuffer};
use crate::error::{NoChangeReason, ProcessError};
use crate::{Error, ReloadSpec, Resource, Settings, Signal};
use builder::Factory;
use trigger::{TriggerLoop, TriggerSource};

/// State shared between a target and its trigger thread.
struct Shared<R: Resource> {
    factory: Factory<R>,
    config: R::Config,
    buffer: SwapBuffer<R>,
    /// Signature of the last accepted resource.
    signature: AtomicU64,
    /// Keeps reloads strictly one at a time.
    reload_lock: Mutex<()>,
    on_reload: Option<ReloadCallback>,
    on_error: Option<ErrorCallback>,
}

impl<R: Resource> Shared<R> {
    /// Build a fresh resource and publish it if its signature changed.
    fn reload(&self, trigger: ReloadTrigger) -> Result<ReloadEvent, Error> {
        let _reload = self.reload_lock.lock();

        let mut fresh = (self.factory)();
        let signature = fresh.signature();
        if signature == 0 {
            return Err(Error::no_change(NoChangeReason::Sentinel));
        }

        let current = self
            .buffer
            .borrow()
            .map_or_else(|| self.signature.load(Ordering::Acquire), |lease| lease.signature());
        // An active resource with signature 0 has opted out for good
        if current == 0 {
            return Err(Error::no_change(NoChangeReason::Sentinel));
        }
        if signature == current {
            return Err(Error::no_change(NoChangeReason::Unchanged(signature)));
        }

        fresh.init(&self.config).map_err(Error::init)?;
        let epoch = self.buffer.publish(fresh)?;
        self.signature.store(signature, Ordering::Release);

        Ok(ReloadEvent::new(current, signature, epoch, trigger))
    }

    /// Entry point of the trigger loop. Reload errors stop here.
    fn on_trigger(&self, trigger: ReloadTrigger) {
        debug!(%trigger, "reload triggered");
        match self.reload(trigger) {
            Ok(event) => {
                info!(
                    old_signature = event.old_signature,
                    new_signature = event.new_signature,
                    epoch = event.epoch,
                    trigger = %event.trigger,
                    "resource reloaded"
                );
                if let Some(callback) = &self.on_reload {
                    callback(event);
                }
            }
            Err(e) if e.is_no_change() => debug!(reason = %e, "reload skipped"),
            Err(e) => {
                warn!(error = %e, "reload failed, keeping current resource");
                if let Some(callback) = &self.on_error {
                    callback(e);
                }
            }
        }
    }
}

/// A hot-reloadable resource slot.
///
/// Readers call [`process`](Target::process) or [`borrow`](Target::borrow)
/// from any number of threads; each call borrows the active version for its
/// own duration and never waits on a reload.
///
/// Dropping the target stops its trigger loop and waits for it to exit.
pub struct Target<R: Resource> {
    shared: Arc<Shared<R>>,
    settings: Settings,
    spec: OnceLock<ReloadSpec>,
    trigger: Mutex<Option<TriggerLoop>>,
}

impl<R: Resource> Target<R> {
    /// Create a target with default settings.
    ///
    /// `factory` is called once by [`load`](Target::load) and once per
    /// reload attempt. `config` is passed to every `init`.
    pub fn new<F>(factory: F, config: R::Config) -> Self
    where
        F: Fn() -> R + Send + Sync + 'static,
    {
        TargetBuilder::new(factory, config).build()
    }

    /// Start configuring a target.
    pub fn builder<F>(factory: F, config: R::Config) -> TargetBuilder<R>
    where
        F: Fn() -> R + Send + Sync + 'static,
    {
        TargetBuilder::new(factory, config)
    }

    pub(crate) fn from_parts(
        factory: Factory<R>,
        config: R::Config,
        settings: Settings,
        on_reload: Option<ReloadCallback>,
        on_error: Option<ErrorCallback>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                config,
                buffer: SwapBuffer::with_retire_interval(settings.retire_interval),
                signature: AtomicU64::new(0),
                reload_lock: Mutex::new(()),
                on_reload,
                on_error,
            }),
            settings,
            spec: OnceLock::new(),
            trigger: Mutex::new(None),
        }
    }

    /// Build, initialize and publish the first resource, then start the
    /// trigger loop.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyLoaded`] on a second call
    /// - [`Error::Init`] if the resource fails to initialize; the target
    ///   stays unusable
    /// - [`Error::Watch`] if a watched path cannot be armed; nothing is
    ///   published
    /// - [`Error::Spawn`] if the trigger thread cannot start; the resource
    ///   is published but never reloads
    pub fn load(&self) -> Result<(), Error> {
        let mut trigger = self.trigger.lock();
        if self.spec.get().is_some() {
            return Err(Error::AlreadyLoaded);
        }

        let mut resource = (self.shared.factory)();
        resource.init(&self.shared.config).map_err(Error::init)?;

        let spec = resource.reload_spec();
        let signature = resource.signature();
        let source = TriggerSource::prepare(&spec, &self.settings)?;

        let epoch = self.shared.buffer.publish(resource)?;
        self.shared.signature.store(signature, Ordering::Release);
        info!(signature, epoch, strategy = spec.kind(), "resource loaded");
        // Only `load` sets the spec, and it holds the trigger lock
        if self.spec.set(spec).is_err() {
            return Err(Error::AlreadyLoaded);
        }

        let shared = Arc::clone(&self.shared);
        *trigger = Some(TriggerLoop::spawn(source, &self.settings, move |t| {
            shared.on_trigger(t);
        })?);

        Ok(())
    }

    /// Run the active resource's `process` on `input`.
    ///
    /// The active version is borrowed for the duration of the call and
    /// released on every path, including errors.
    ///
    /// # Errors
    ///
    /// [`ProcessError::NotLoaded`] before [`load`](Target::load) succeeded,
    /// otherwise only the resource's own errors.
    pub fn process(&self, input: R::Input) -> Result<R::Output, ProcessError<R::Error>> {
        let lease = self.shared.buffer.borrow().ok_or(ProcessError::NotLoaded)?;
        lease.process(input).map_err(ProcessError::Resource)
    }

    /// Signature of the active resource, or `None` before loading.
    #[must_use]
    pub fn signature(&self) -> Option<u64> {
        self.shared.buffer.borrow().map(|lease| lease.signature())
    }

    /// Borrow the active resource directly.
    ///
    /// Hold the lease only as long as needed: while it is alive, the next
    /// reload after this version is retired cannot reuse its slot.
    #[must_use]
    pub fn borrow(&self) -> Option<Lease<R>> {
        self.shared.buffer.borrow()
    }

    /// Ask the trigger loop to reload now.
    ///
    /// # Errors
    ///
    /// [`Error::NotLoaded`] before loading, [`Error::Stopped`] after
    /// [`stop`](Target::stop).
    pub fn request_reload(&self) -> Result<(), Error> {
        match self.trigger.lock().as_ref() {
            Some(trigger) => trigger.request_reload(),

            None => Err(Error::NotLoaded),
        }
    }

    /// Stop the trigger loop. The last resource keeps serving.
    pub fn stop(&self) {
        if let Some(trigger) = self.trigger.lock().as_ref() {
            trigger.stop();
        }
    }

    /// Returns `true` while the trigger loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.trigger
            .lock()
            .as_ref()
            .is_some_and(TriggerLoop::is_running)
    }

    /// Returns `true` once [`load`](Target::load) has published a resource.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.spec.get().is_some()
    }

    /// Reload strategy declared by the loaded resource.
    #[must_use]
    pub fn reload_spec(&self) -> Option<&ReloadSpec> {
        self.spec.get()
    }

    /// The signal driving a [`ReloadSpec::Signaled`] target.
    #[must_use]
    pub fn signal(&self) -> Option<Signal> {
        match self.spec.get() {
            Some(ReloadSpec::Signaled(signal)) => Some(signal.clone()),

            _ => None,
        }
    }

    /// Number of resources published so far.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.shared.buffer.epoch()
    }

    /// Check if a resource was published after `epoch`.
    #[must_use]
    pub fn has_changed_since(&self, epoch: u64) -> bool {
        self.epoch() != epoch
    }

    /// The underlying swap buffer.
    #[must_use]
    pub fn buffer(&self) -> &SwapBuffer<R> {
        &self.shared.buffer
    }

    #[cfg(test)]
    fn reload(&self, trigger: ReloadTrigger) -> Result<ReloadEvent, Error> {
        self.shared.reload(trigger)
    }
}

// Manual Debug impl to avoid requiring R: Debug
impl<R: Resource> fmt::Debug for Target<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("loaded", &self.is_loaded())
            .field("running", &self.is_running())
            .field("signature", &self.signature())
            .field("epoch", &self.epoch())
            .finish_non_exhaustive()
    }
}
