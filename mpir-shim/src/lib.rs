//! A debugger-side shim that presents the MPIR process-acquisition interface
//! for jobs started through a PMIx launcher.
//!
//! The shim spawns (or attaches to) a launcher such as `mpirun` or `prterun`,
//! holds the application in its PMIx init barrier until a parallel debugger
//! has read the [`mpir`] symbol surface, then releases everything and mirrors
//! the launcher's exit code.
//!
//! ```no_run
//! use mpir_shim::pmix::sim::SimTool;
//! use mpir_shim::{run, ShimOptions};
//!
//! # fn main() -> Result<(), mpir_shim::Error> {
//! let mut options = ShimOptions::default();
//! options.run_args = vec!["mpirun".into(), "-n".into(), "4".into(), "./hello".into()];
//!
//! let exit = run(options, Box::new(SimTool::default()))?;
//! # std::process::exit(exit);
//! # }
//! ```
//!
//! The PMIx client library itself is an external collaborator reached through
//! the [`pmix::PmixTool`] trait; [`pmix::sim`] ships a scripted in-process
//! runtime for dry runs and tests.

pub mod error;
pub mod latch;
pub mod mode;
pub mod mpir;
pub mod pmix;

mod context;
mod driver;
mod events;
mod proctable;
mod shutdown;

pub use crate::driver::run;
pub use crate::error::Error;
pub use crate::mode::{RunMode, ShimOptions};
