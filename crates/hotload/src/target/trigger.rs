//! Background trigger loop.
//!
//! Exactly one loop runs per loaded [`Target`](crate::Target). It waits on
//! the source selected by the resource's [`ReloadSpec`] and on a command
//! channel, and calls the reload routine on each fire. Because the loop is a
//! single thread, reloads it starts never overlap.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
#[cfg(feature = "watch")]
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvError, Sender, TrySendError, bounded, never, select, tick};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::types::ReloadTrigger;
use crate::{Error, ReloadSpec, Settings, Signal};

#[cfg(feature = "watch")]
pub(crate) use watched::PathWatcher;

/// How often a debounce-free watch loop re-checks its running flag.
#[cfg(feature = "watch")]
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Commands sent to the trigger thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TriggerCommand {
    /// Run a reload now.
    Reload,
    /// Exit the loop.
    Stop,
}

/// Where reload triggers come from.
pub(crate) enum TriggerSource {
    Periodic(Duration),
    Signaled(Signal),
    #[cfg(feature = "watch")]
    Watched(PathWatcher),
}

impl TriggerSource {
    /// Arm the source described by `spec`.
    ///
    /// Watched paths are registered here, so a path that cannot be watched
    /// fails before anything is published.
    #[cfg_attr(not(feature = "watch"), allow(unused_variables))]
    pub fn prepare(spec: &ReloadSpec, settings: &Settings) -> Result<Self, Error> {
        match spec {
            ReloadSpec::Periodic(interval) => Ok(Self::Periodic(*interval)),

            ReloadSpec::Signaled(signal) => Ok(Self::Signaled(signal.clone())),

            #[cfg(feature = "watch")]
            ReloadSpec::Watched(paths) => {
                PathWatcher::new(paths, settings.probe_delay).map(Self::Watched)
            }
        }
    }
}

/// Handle to a running trigger thread.
pub(crate) struct TriggerLoop {
    command_tx: Mutex<Option<Sender<TriggerCommand>>>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TriggerLoop {
    /// Spawn the loop. `fire` runs on the trigger thread for every trigger.
    pub fn spawn<F>(source: TriggerSource, settings: &Settings, fire: F) -> Result<Self, Error>
    where
        F: Fn(ReloadTrigger) + Send + 'static,
    {
        let (command_tx, command_rx) = bounded::<TriggerCommand>(16);
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = running.clone();
        #[cfg(feature = "watch")]
        let debounce = settings.debounce;

        let thread = thread::Builder::new()
            .name(settings.thread_name.clone())
            .spawn(move || {
                match source {
                    TriggerSource::Periodic(interval) => {
                        run_periodic(&thread_running, &command_rx, interval, &fire);
                    }
                    TriggerSource::Signaled(signal) => {
                        run_signaled(&thread_running, &command_rx, &signal, &fire);
                    }
                    #[cfg(feature = "watch")]
                    TriggerSource::Watched(watcher) => {
                        run_watched(&thread_running, &command_rx, watcher, debounce, &fire);
                    }
                }
                thread_running.store(false, Ordering::Release);
                debug!("trigger loop exited");
            })
            .map_err(|e| Error::spawn(settings.thread_name.clone(), e))?;

        Ok(Self {
            command_tx: Mutex::new(Some(command_tx)),
            running,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Ask the loop to reload as soon as it is idle.
    ///
    /// Requests made while the command queue is full are folded into the
    /// queued ones.
    pub fn request_reload(&self) -> Result<(), Error> {
        if !self.is_running() {
            return Err(Error::Stopped);
        }
        let guard = self.command_tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(Error::Stopped);
        };
        match tx.try_send(TriggerCommand::Reload) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),

            Err(TrySendError::Disconnected(_)) => Err(Error::Stopped),
        }
    }

    /// Stop the loop without waiting for it to exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        // Dropping the only sender disconnects the loop even if the queue is full
        if let Some(tx) = self.command_tx.lock().take() {
            let _ = tx.try_send(TriggerCommand::Stop);
        }
    }

    /// Returns `true` until the loop has been stopped or has exited.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the loop and wait for the thread to exit.
    pub fn join(&self) {
        self.stop();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for TriggerLoop {
    fn drop(&mut self) {
        self.join();
    }
}

/// Apply a command. Returns `false` when the loop should exit.
fn on_command<F: Fn(ReloadTrigger)>(command: Result<TriggerCommand, RecvError>, fire: &F) -> bool {
    match command {
        Ok(TriggerCommand::Reload) => {
            fire(ReloadTrigger::Manual);
            true
        }
        Ok(TriggerCommand::Stop) | Err(_) => false,
    }
}

fn run_periodic<F: Fn(ReloadTrigger)>(
    running: &AtomicBool,
    command_rx: &Receiver<TriggerCommand>,
    interval: Duration,
    fire: &F,
) {
    let ticks = if interval.is_zero() {
        warn!("periodic reload interval is zero, timer disabled");
        never()
    } else {
        tick(interval)
    };

    while running.load(Ordering::Acquire) {
        select! {
            recv(command_rx) -> command => {
                if !on_command(command, fire) {
                    break;
                }
            }
            recv(ticks) -> _ => fire(ReloadTrigger::Tick),
        }
    }
}

fn run_signaled<F: Fn(ReloadTrigger)>(
    running: &AtomicBool,
    command_rx: &Receiver<TriggerCommand>,
    signal: &Signal,
    fire: &F,
) {
    // The loop keeps `signal` alive, so the receiver never disconnects
    let notifications = signal.receiver();

    while running.load(Ordering::Acquire) {
        select! {
            recv(command_rx) -> command => {
                if !on_command(command, fire) {
                    break;
                }
            }
            recv(notifications) -> _ => fire(ReloadTrigger::Signal),
        }
    }
}

#[cfg(feature = "watch")]
fn run_watched<F: Fn(ReloadTrigger)>(
    running: &AtomicBool,
    command_rx: &Receiver<TriggerCommand>,
    mut watcher: PathWatcher,
    debounce: Duration,
    fire: &F,
) {
    let events = watcher.events();
    let idle = if debounce.is_zero() { IDLE_POLL } else { debounce };
    let mut debouncer = Debouncer::new(debounce);

    while running.load(Ordering::Acquire) {
        select! {
            recv(command_rx) -> command => {
                if !on_command(command, fire) {
                    break;
                }
            }

            recv(events) -> event => {
                match event {
                    Ok(Ok(event)) => {
                        if let Some(trigger) = watcher
                            .classify(&event)
                            .and_then(|t| debouncer.push(t, Instant::now()))
                        {
                            fire(trigger);
                        }
                    }
                    Ok(Err(e)) => warn!(error = %e, "file watcher reported an error"),
                    Err(_) => break,
                }
            }

            default(idle) => {
                if let Some(trigger) = debouncer.poll(Instant::now()) {
                    fire(trigger);
                }
            }
        }
    }
}

/// Folds bursts of file events into one reload.
///
/// A pending trigger fires after `window` of quiet, or at the latest
/// `window` after the first event of the burst.
#[cfg(feature = "watch")]
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    pending: Option<ReloadTrigger>,
    first_event: Instant,
    last_event: Instant,
}

#[cfg(feature = "watch")]
impl Debouncer {
    fn new(window: Duration) -> Self {
        let now = Instant::now();
        Self {
            window,
            pending: None,
            first_event: now,
            last_event: now,
        }
    }

    /// Record an event. Returns the trigger to fire now, if any.
    fn push(&mut self, trigger: ReloadTrigger, now: Instant) -> Option<ReloadTrigger> {
        if self.window.is_zero() {
            return Some(trigger);
        }
        if self.pending.is_none() {
            self.first_event = now;
        }
        self.pending = Some(trigger);
        self.last_event = now;

        if now.saturating_duration_since(self.first_event) >= self.window {
            return self.pending.take();
        }
        None
    }

    /// Fire the pending trigger once the burst has gone quiet.
    fn poll(&mut self, now: Instant) -> Option<ReloadTrigger> {
        if now.saturating_duration_since(self.last_event) >= self.window {
            return self.pending.take();
        }
        None
    }
}

#[cfg(feature = "watch")]
mod watched {
    use std::path::{Path, PathBuf};
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel::{Receiver, bounded};
    use notify::event::ModifyKind;
    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use tracing::{debug, info, warn};

    use super::ReloadTrigger;
    use crate::Error;

    /// A path being watched, with its canonical form for event matching.
    #[derive(Debug)]
    struct WatchedPath {
        path: PathBuf,
        canonical: Option<PathBuf>,
        /// What notify is actually watching: the path or its parent.
        armed: PathBuf,
    }

    impl WatchedPath {
        fn new(path: &Path, armed: PathBuf) -> Self {
            Self {
                path: path.to_path_buf(),
                canonical: canonical_of(path),
                armed,
            }
        }

        fn matches(&self, candidate: &Path) -> bool {
            candidate == self.path
                || self.canonical.as_deref() == Some(candidate)
                || candidate
                    .canonicalize()
                    .is_ok_and(|c| c == self.path || self.canonical.as_deref() == Some(&c))
        }
    }

    /// Canonical form of `path`, falling back to the canonical parent for
    /// paths that do not exist yet.
    fn canonical_of(path: &Path) -> Option<PathBuf> {
        path.canonicalize().ok().or_else(|| {
            let parent = path.parent()?.canonicalize().ok()?;
            Some(parent.join(path.file_name()?))
        })
    }

    /// notify-backed watcher over a fixed set of paths.
    pub(crate) struct PathWatcher {
        watcher: RecommendedWatcher,
        events: Receiver<notify::Result<Event>>,
        paths: Vec<WatchedPath>,
        probe_delay: Duration,
    }

    impl PathWatcher {
        pub fn new(paths: &[PathBuf], probe_delay: Duration) -> Result<Self, Error> {
            if paths.is_empty() {
                return Err(Error::watch(PathBuf::new(), "no paths specified to watch", None));
            }

            let (tx, events) = bounded::<notify::Result<Event>>(100);
            // A full queue already holds a pending reload, so extra events can go
            let mut watcher = notify::recommended_watcher(move |res| {
                let _ = tx.try_send(res);
            })
            .map_err(|e| {
                Error::watch(PathBuf::new(), format!("failed to create file watcher: {e}"), Some(e))
            })?;

            let mut watched = Vec::with_capacity(paths.len());
            for path in paths {
                let armed = watch_path(&mut watcher, path)?;
                watched.push(WatchedPath::new(path, armed));
            }

            Ok(Self {
                watcher,
                events,
                paths: watched,
                probe_delay,
            })
        }

        pub fn events(&self) -> Receiver<notify::Result<Event>> {
            self.events.clone()
        }

        /// Paths still being watched.
        #[cfg(test)]
        pub fn paths(&self) -> Vec<PathBuf> {
            self.paths.iter().map(|p| p.path.clone()).collect()
        }

        /// Turn a notify event into a reload trigger, if it concerns us.
        ///
        /// Deletes and renames drop the watch and re-probe the path after
        /// the probe delay.
        pub fn classify(&mut self, event: &Event) -> Option<ReloadTrigger> {
            for candidate in &event.paths {
                let Some(idx) = self.paths.iter().position(|p| p.matches(candidate)) else {
                    continue;
                };

                return match event.kind {
                    EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                        self.rearm(idx)
                    }
                    EventKind::Create(_) | EventKind::Modify(_) => {
                        Some(ReloadTrigger::PathChanged(self.paths[idx].path.clone()))
                    }
                    _ => None,
                };
            }
            None
        }

        /// What each remaining path is armed on.
        #[cfg(test)]
        pub fn armed(&self) -> Vec<PathBuf> {
            self.paths.iter().map(|p| p.armed.clone()).collect()
        }

        fn rearm(&mut self, idx: usize) -> Option<ReloadTrigger> {
            let path = self.paths[idx].path.clone();
            self.release(idx);
            thread::sleep(self.probe_delay);

            if !path.exists() {
                warn!(path = %path.display(), "watched path disappeared, no longer watching it");
                self.paths.remove(idx);
                if self.paths.is_empty() {
                    info!("no watched paths left, only manual reloads remain");
                }
                return None;
            }

            match watch_path(&mut self.watcher, &path) {
                Ok(armed) => self.paths[idx].armed = armed,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to re-arm watch"),
            }
            self.paths[idx].canonical = canonical_of(&path);
            debug!(path = %path.display(), "watch re-armed");
            Some(ReloadTrigger::PathReplaced(path))
        }

        /// Drop the watch backing `paths[idx]` unless another path shares it.
        fn release(&mut self, idx: usize) {
            let armed = &self.paths[idx].armed;
            let shared = self
                .paths
                .iter()
                .enumerate()
                .any(|(i, p)| i != idx && p.armed == *armed);
            if !shared {
                // Already gone when the kernel dropped it with the file
                let _ = self.watcher.unwatch(armed);
            }
        }
    }

    /// Watch a path, or its parent directory if the path does not exist yet.
    ///
    /// Returns what was actually armed.
    fn watch_path(watcher: &mut RecommendedWatcher, path: &Path) -> Result<PathBuf, Error> {
        let watch_target = if path.exists() {
            path.to_path_buf()
        } else if let Some(parent) = path.parent().filter(|p| p.exists()) {
            parent.to_path_buf()
        } else {
            return Err(Error::watch(path, "neither path nor parent directory exists", None));
        };

        watcher
            .watch(&watch_target, RecursiveMode::NonRecursive)
            .map_err(|e| Error::watch(path, format!("failed to watch: {e}"), Some(e)))?;
        Ok(watch_target)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::fs;
        use tempfile::tempdir;

        #[test]
        fn test_no_paths_fails() {
            let err = PathWatcher::new(&[], Duration::from_millis(10)).err().unwrap();
            assert!(err.to_string().contains("no paths specified"));
        }

        #[test]
        fn test_missing_parent_fails() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("missing").join("rules.conf");
            let err = PathWatcher::new(&[path], Duration::from_millis(10)).err().unwrap();
            assert!(matches!(err, Error::Watch { .. }));
        }

        #[test]
        fn test_missing_file_watched_through_parent() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("later.conf");
            let watcher = PathWatcher::new(&[path.clone()], Duration::from_millis(10)).unwrap();
            assert_eq!(watcher.paths(), vec![path]);
        }

        #[test]
        fn test_watched_path_matching() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("rules.conf");
            fs::write(&path, "allow all").unwrap();

            let watched = WatchedPath::new(&path, path.clone());
            assert!(watched.matches(&path));
            assert!(watched.matches(&path.canonicalize().unwrap()));
            assert!(!watched.matches(&dir.path().join("other.conf")));
        }

        #[test]
        fn test_classify_ignores_unrelated_paths() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("rules.conf");
            fs::write(&path, "allow all").unwrap();
            let mut watcher = PathWatcher::new(&[path.clone()], Duration::from_millis(10)).unwrap();

            let event = Event::new(EventKind::Modify(ModifyKind::Any))
                .add_path(dir.path().join("other.conf"));
            assert!(watcher.classify(&event).is_none());

            let event = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(path.clone());
            assert_eq!(watcher.classify(&event), Some(ReloadTrigger::PathChanged(path)));
        }

        #[test]
        fn test_classify_removed_path_stops_watching() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("rules.conf");
            fs::write(&path, "allow all").unwrap();
            let mut watcher = PathWatcher::new(&[path.clone()], Duration::from_millis(10)).unwrap();

            fs::remove_file(&path).unwrap();
            let event = Event::new(EventKind::Remove(notify::event::RemoveKind::File))
                .add_path(path.clone());
            assert!(watcher.classify(&event).is_none());
            assert!(watcher.paths().is_empty());
        }

        #[test]
        fn test_parent_watch_released_when_path_gone() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("later.conf");
            let mut watcher = PathWatcher::new(&[path.clone()], Duration::from_millis(10)).unwrap();
            assert_eq!(watcher.armed(), vec![dir.path().to_path_buf()]);

            fs::write(&path, "allow all").unwrap();
            fs::remove_file(&path).unwrap();
            let event = Event::new(EventKind::Remove(notify::event::RemoveKind::File))
                .add_path(path.clone());
            assert!(watcher.classify(&event).is_none());
            assert!(watcher.paths().is_empty());

            // Nothing left to unwatch
            assert!(watcher.watcher.unwatch(dir.path()).is_err());
        }

        #[test]
        fn test_shared_parent_watch_kept() {
            let dir = tempdir().unwrap();
            let first = dir.path().join("first.conf");
            let second = dir.path().join("second.conf");
            let mut watcher =
                PathWatcher::new(&[first.clone(), second.clone()], Duration::from_millis(10))
                    .unwrap();

            fs::write(&first, "allow all").unwrap();
            fs::remove_file(&first).unwrap();
            let event = Event::new(EventKind::Remove(notify::event::RemoveKind::File))
                .add_path(first.clone());
            assert!(watcher.classify(&event).is_none());

            assert_eq!(watcher.paths(), vec![second]);
            assert_eq!(watcher.armed(), vec![dir.path().to_path_buf()]);
            assert!(watcher.watcher.unwatch(dir.path()).is_ok());
        }

        #[test]
        fn test_classify_replaced_path_rearms() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("rules.conf");
            fs::write(&path, "allow all").unwrap();
            let mut watcher = PathWatcher::new(&[path.clone()], Duration::from_millis(10)).unwrap();

            // Removed, then recreated before the probe
            let event = Event::new(EventKind::Remove(notify::event::RemoveKind::File))
                .add_path(path.clone());
            assert_eq!(
                watcher.classify(&event),
                Some(ReloadTrigger::PathReplaced(path.clone()))
            );
            assert_eq!(watcher.paths(), vec![path]);
        }
    }
}
