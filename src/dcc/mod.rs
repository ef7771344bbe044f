//! DCC protocol layer.
//!
//! | Module | Runs in | Purpose |
//! |--------|---------|---------|
//! | [`loco`] | service | loco table entries and their JSON documents |
//! | [`cv`] | service | pending service mode and POM requests |
//! | [`scheduler`] | service | priority aging of the refresh traffic |
//! | `driver` | driver thread | transmits packets, reads cutouts, detects ACKs |
//! | `service` | service thread | fills the queues, answers front-ends |

pub mod cv;
pub mod loco;
pub mod scheduler;

#[cfg(feature = "std")]
pub mod driver;
#[cfg(feature = "std")]
pub mod service;

pub use cv::{CvPomRequest, CvRequest, CvRequestDeque, PomRequests, POM_TIMEOUT_MS};
pub use loco::{BiDiState, Loco, Mode, NvLocoBase, RailComData, RailComOptions, SpeedSteps};
pub use scheduler::PriorityScheduler;

#[cfg(feature = "std")]
pub use driver::DccDriver;
#[cfg(feature = "std")]
pub use service::DccService;
