//! Remote build orchestration.
//!
//! Handing one compile job to the fleet goes through these stages:
//! - **Assignment** ([`assignment`]): ask the scheduler for a worker and connect to it
//! - **Environment** ([`environment`]): ship the toolchain archive if the worker lacks it
//! - **Source** ([`source`]): run the preprocessor and stream its output live
//! - **Result** ([`result`]): read the compile result and install the object atomically
//!
//! [`RemoteBuildAttempt`] chains the stages for one copy of a job, and
//! [`RedundancyCoordinator`] runs one or more copies, falling back to a local
//! build for any redundant copy whose attempt fails.
//!
//! Bulk payloads in every direction use the chunk streams in [`chunk`].

pub mod assignment;
pub mod attempt;
pub mod chunk;
pub mod coordinator;
pub mod environment;
pub mod result;
pub mod source;

pub use assignment::Assignment;
pub use attempt::{AttemptSettings, RemoteBuildAttempt};
pub use coordinator::{AttemptRecord, BuildReport, RedundancyCoordinator};
pub use result::{OutputRelay, StdStreams};
