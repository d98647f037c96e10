//! The core, UI-agnostic library for the `imgseed` image builder.
//!
//! `imgseed-core` turns an empty directory into a bootable Raspberry Pi 2 SD
//! card image through a fixed sequence of slow, privileged stages. It is
//! built so that a build can be interrupted or crash at any point and simply
//! be run again: progress is recorded in a status file next to the image, and
//! loop devices and mounts are rediscovered from the host instead of being
//! remembered.
//!
//! The library is structured into several key modules:
//! - [`orchestrator`]: runs the pending stages and records progress.
//! - [`stage`] and [`pipeline`]: the ordered stage table and the standard
//!   stage bodies.
//! - [`resources`]: idempotent loop device, partition and mount handling on
//!   top of the [`host::Host`] trait.
//! - [`exec`]: runs commands on the host or in a chroot, with optional
//!   [`suppress`]ion of service start-up.
//! - [`status`] and [`target`]: the persistent marker and the image it
//!   belongs to.
//!
//! ## Example: Resuming a Build with Progress Reporting
//!
//! ```rust,no_run
//! use imgseed_core::{
//!     exec::Executor, host::LinuxHost, orchestrator::{BuildRequest, Orchestrator},
//!     pipeline::{self, Toolbox}, resources::Resources,
//!     target::{BuildTarget, BuildTargetOptions},
//! };
//! use std::sync::{Arc, atomic::AtomicBool};
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let target = BuildTarget::new(BuildTargetOptions::new("/srv/pi/raspseed.img"))?;
//!
//!     let runner = Arc::new(Executor::new());
//!     let resources = Arc::new(Resources::new(Arc::new(LinuxHost::new(runner.clone()))));
//!     let registry = pipeline::standard_stages(Toolbox::new(runner, resources.clone()));
//!
//!     // Set from a signal handler to stop between stages.
//!     let interrupt = Arc::new(AtomicBool::new(false));
//!
//!     let report = Orchestrator::new(&registry, &resources)
//!         .with_interrupt(interrupt)
//!         .run(
//!             &target,
//!             &BuildRequest::default(),
//!             |stage| println!("[{}] {}", stage.level, stage.name),
//!             |stage, took| println!("[{}] done in {:?}", stage.level, took),
//!         )?;
//!
//!     println!("went from level {} to {}", report.start_level, report.finish_level);
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod exec;
pub mod host;
pub mod mounts;
pub mod orchestrator;
pub mod pipeline;
pub mod poll;
pub mod preflight;
pub mod resources;
pub mod stage;
pub mod status;
pub mod suppress;
pub mod target;

pub use error::{BuildError, Result};
