//! Push pending health-check data to external systems.
//!
//! A [`Dispatcher`] runs one sync job per [`Destination`]: it takes the job's
//! lock through [`gate::run_exclusive`], scans the store for records not yet
//! delivered, calls the matching collaborator with bounded retries and marks
//! each record synced only after the call succeeds. Delivery is at least
//! once.
//!
//! Collaborators are traits in [`collaborator`]; [`http`] holds the `reqwest`
//! implementations used in production.
//!
//! [`Destination`]: healthcheck_core::destination::Destination

pub mod collaborator;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod http;
pub mod retry;


pub use config::SyncConfig;
pub use dispatcher::{Dispatcher, SyncOutcome};
pub use error::{Error, Result};
pub use retry::{RetryConfig, RetryPolicy};
