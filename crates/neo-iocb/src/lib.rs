//! Neo IOCB - I/O Control Block dispatch
//!
//! This crate correlates outbound requests to remote devices with their
//! eventual responses. It provides:
//! - `Iocb`: a unit of asynchronous request/response work
//! - `IoQueue`: priority ordered holding area for blocks awaiting dispatch
//! - `Controller`: admission control, one in-flight block per controller
//! - `SieveController`: one serializing controller per destination key
//! - `IoChain` / `IoGroup`: request pipelines and fan-in joins
//!
//! Scheduling is pluggable through the `Scheduler` trait, with a tokio backed
//! implementation and a dedicated reactor thread.

pub mod chain;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod group;
pub mod iocb;
pub mod queue;
pub mod scheduler;
pub mod sieve;

pub use chain::IoChain;
pub use config::{ConfigError, ControllerConfig, IoConfig, ReactorConfig};
pub use context::{Abortable, IoContext};
pub use controller::{Controller, ControllerState, ControllerStats, IoController, Transport};
pub use error::{IocbError, IocbResult};
pub use group::IoGroup;
pub use iocb::{Completion, Iocb, IocbId, IocbState, Outcome, DEFAULT_PRIORITY};
pub use queue::IoQueue;
pub use scheduler::{Scheduler, Task, ThreadReactor, TimerHandle, TokioScheduler};
pub use sieve::{KeyedTransport, SieveController};
