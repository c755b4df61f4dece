//! # hotload
//!
//! Double-buffered hot swapping of immutable resources.
//!
//! `hotload` keeps a long-lived, read-mostly resource (a rule set, a routing
//! table, a compiled template bundle) up to date while it is being used. A
//! replacement is built off to the side, initialized, and published with a
//! single index flip. Readers never block on a reload and never observe a
//! half-built value.
//!
//! ## Features
//!
//! - **Double buffering** - Two slots; the active one serves, the other receives the next version
//! - **Borrow counting** - A retired version is freed only once its last reader is done
//! - **Signature gating** - A fresh resource is published only when its signature changed
//! - **Reload strategies** - Periodic timer, explicit [`Signal`], or file watching
//! - **Failure isolation** - A broken reload keeps the previous version serving
//! - **Rich diagnostics** - Errors implement [`miette::Diagnostic`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hotload::miette::IntoDiagnostic;
//! use hotload::{ReloadSpec, Resource, Target};
//!
//! struct Rules {
//!     source: String,
//!     compiled: Vec<Rule>,
//! }
//!
//! impl Resource for Rules {
//!     type Config = RuleOptions;
//!     type Input = Request;
//!     type Output = Verdict;
//!     type Error = RuleError;
//!
//!     fn init(&mut self, options: &RuleOptions) -> Result<(), RuleError> {
//!         self.compiled = compile(&self.source, options)?;
//!         Ok(())
//!     }
//!
//!     fn process(&self, request: Request) -> Result<Verdict, RuleError> {
//!         evaluate(&self.compiled, &request)
//!     }
//!
//!     fn signature(&self) -> u64 {
//!         hash(&self.source)
//!     }
//!
//!     fn reload_spec(&self) -> ReloadSpec {
//!         ReloadSpec::Watched(vec!["rules.conf".into()])
//!     }
//! }
//!
//! fn main() -> hotload::Result<()> {
//!     let target = Target::new(Rules::read, RuleOptions::default());
//!     target.load()?;
//!
//!     let verdict = target.process(request).into_diagnostic()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Signatures
//!
//! The signature is read from a fresh resource *before* `init` runs, so it
//! must describe the resource's inputs rather than its initialized state.
//! Two rules apply on every reload attempt:
//!
//! - A signature of `0` means "never reload": a fresh resource reporting it
//!   is dropped, and an active resource reporting it is never replaced
//! - A signature equal to the active one is a no-op
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `watch` | File-watching reloads via `notify` (default) |
//! | `serde` | `Deserialize`/`Serialize` for [`Settings`] |
//!
//! ## Error Handling
//!
//! All errors are [`Error`] values with a stable diagnostic code. Reload
//! failures on the trigger thread are logged through `tracing` and passed to
//! the `on_error` callback; they never replace the serving resource.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Re-export miette for error handling.
/// Users can use `hotload::miette` instead of adding miette as a dependency.
pub use miette;

// ============================================================================
// Core Modules
// ============================================================================

mod error;
pub use error::{Error, NoChangeReason, ProcessError};

/// A Result type that displays errors with miette's fancy formatting.
///
/// This is equivalent to `miette::Result<T>`.
pub type Result<T> = miette::Result<T>;

mod settings;
pub use settings::Settings;

mod resource;
pub use resource::{ReloadSpec, Resource, Signal};

// ============================================================================
// Swap Buffer
// ============================================================================

pub mod buffer;
pub use buffer::{Handle, Lease, SlotState, SwapBuffer};

// ============================================================================
// Reload Targets
// ============================================================================

pub mod target;
pub use target::{
    ErrorCallback, ReloadCallback, ReloadEvent, ReloadTrigger, Target, TargetBuilder,
};
