//! # eventia-core
//!
//! Shared vocabulary between the event-sourcing core and its storage engines.
//!
//! - **Resumption tokens**: [`ResumptionToken`], the closed set of positions and filters a
//!   reader resumes from
//! - **Messages**: [`DomainEventMessage`] going into storage, [`TrackedDomainEventMessage`]
//!   coming out of it
//! - **Logging**: the [`Logger`] collaborator used for non-fatal anomaly reports, with a
//!   `tracing`-backed implementation and log capture for tests

#![deny(unsafe_code)]

pub mod logging;
pub mod messages;
pub mod token;

pub use logging::{Logger, TracingLogger, init_subscriber};
pub use messages::{DomainEventMessage, ReadMode, TrackedDomainEventMessage};
pub use token::{Position, ResumptionToken};
