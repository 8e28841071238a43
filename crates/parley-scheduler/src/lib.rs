//! parley-scheduler
//!
//! Split deployment: a central Scheduler owns expert identities and wallet
//! secrets; Workers connect over a duplex WebSocket, advertise the expert
//! types they can run, and receive job dispatches. Workers stream job
//! status and signed events back; the scheduler forwards those events to
//! its relay pool. Heartbeats detect half-open links; cancellation is
//! acknowledged within a bounded grace period.

pub mod message;
pub mod scheduler;
pub mod worker;

pub use message::{Job, JobState, WireMessage};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use worker::{JobContext, JobRunner, RunningJob, Worker, WorkerConfig};
