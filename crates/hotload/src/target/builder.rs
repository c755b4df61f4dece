//! Builder for configuring a [`Target`].

use std::time::Duration;

use super::Target;
use super::types::ReloadEvent;
use crate::{Error, Resource, Settings};

/// Callback type for successful reloads.
pub type ReloadCallback = Box<dyn Fn(ReloadEvent) + Send + Sync + 'static>;

/// Callback type for failed reloads.
pub type ErrorCallback = Box<dyn Fn(Error) + Send + Sync + 'static>;

/// Resource factory stored by a target.
pub(crate) type Factory<R> = Box<dyn Fn() -> R + Send + Sync + 'static>;

/// Builder for a [`Target`].
///
/// # Example
///
/// ```ignore
/// let target = Target::builder(Rules::unloaded, RuleOptions::default())
///     .debounce(Duration::from_millis(200))
///     .on_reload(|event| println!("rules reloaded: {}", event.trigger))
///     .on_error(|err| eprintln!("rules reload failed: {err}"))
///     .build();
///
/// target.load()?;
/// ```
pub struct TargetBuilder<R: Resource> {
    factory: Factory<R>,
    config: R::Config,
    settings: Settings,
    on_reload: Option<ReloadCallback>,
    on_error: Option<ErrorCallback>,
}

impl<R: Resource> TargetBuilder<R> {
    /// Create a builder from a factory and the configuration passed to
    /// every `init`.
    pub fn new<F>(factory: F, config: R::Config) -> Self
    where
        F: Fn() -> R + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            config,
            settings: Settings::default(),
            on_reload: None,
            on_error: None,
        }
    }

    /// Replace all tunables at once.
    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Interval at which retired resources are polled for zero borrowers
    /// (default: 50ms).
    #[must_use]
    pub const fn retire_interval(mut self, interval: Duration) -> Self {
        self.settings.retire_interval = interval;
        self
    }

    /// Delay before re-probing a deleted or renamed watched path
    /// (default: 50ms).
    #[must_use]
    pub const fn probe_delay(mut self, delay: Duration) -> Self {
        self.settings.probe_delay = delay;
        self
    }

    /// Quiet period after file events before reloading (default: none).
    ///
    /// Editors often emit several events for one save. Signatures already
    /// filter out no-op reloads, but a debounce avoids rebuilding the
    /// resource for each of them.
    #[must_use]
    pub const fn debounce(mut self, duration: Duration) -> Self {
        self.settings.debounce = duration;
        self
    }

    /// Name of the trigger loop thread (default: `hotload-trigger`).
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.settings.thread_name = name.into();
        self
    }

    /// Register a callback for successful reloads.
    ///
    /// Runs on the trigger thread; keep it short.
    #[must_use]
    pub fn on_reload<F>(mut self, callback: F) -> Self
    where
        F: Fn(ReloadEvent) + Send + Sync + 'static,
    {
        self.on_reload = Some(Box::new(callback));
        self
    }

    /// Register a callback for failed reloads.
    ///
    /// Skipped reloads (unchanged or zero signature) are not failures and
    /// are not reported here.
    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Build the target. Nothing is constructed until [`Target::load`].
    #[must_use]
    pub fn build(self) -> Target<R> {
        Target::from_parts(
            self.factory,
            self.config,
            self.settings,
            self.on_reload,
            self.on_error,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReloadSpec;

    struct Static;

    impl Resource for Static {
        type Config = ();
        type Input = ();
        type Output = ();
        type Error = std::io::Error;

        fn init(&mut self, _: &()) -> Result<(), std::io::Error> {
            Ok(())
        }

        fn process(&self, _: ()) -> Result<(), std::io::Error> {
            Ok(())
        }

        fn signature(&self) -> u64 {
            0
        }

        fn reload_spec(&self) -> ReloadSpec {
            ReloadSpec::Periodic(Duration::from_secs(3600))
        }
    }

    #[test]
    fn test_builder_defaults() {
        let builder = TargetBuilder::new(|| Static, ());
        assert_eq!(builder.settings, Settings::default());
        assert!(builder.on_reload.is_none());
        assert!(builder.on_error.is_none());
    }

    #[test]
    fn test_builder_fluent_api() {
        let builder = TargetBuilder::new(|| Static, ())
            .retire_interval(Duration::from_millis(10))
            .probe_delay(Duration::from_millis(20))
            .debounce(Duration::from_millis(200))
            .thread_name("static-trigger")
            .on_reload(|_| {})
            .on_error(|_| {});

        assert_eq!(builder.settings.retire_interval, Duration::from_millis(10));
        assert_eq!(builder.settings.probe_delay, Duration::from_millis(20));
        assert_eq!(builder.settings.debounce, Duration::from_millis(200));
        assert_eq!(builder.settings.thread_name, "static-trigger");
        assert!(builder.on_reload.is_some());
        assert!(builder.on_error.is_some());
    }

    #[test]
    fn test_build_does_not_load() {
        let target = TargetBuilder::new(|| Static, ()).build();
        assert!(!target.is_loaded());
        assert!(target.signature().is_none());
    }
}
