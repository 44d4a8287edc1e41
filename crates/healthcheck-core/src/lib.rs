//! Core types and operations for health-check ingestion and profile
//! consolidation.
//!
//! This crate is free of HTTP and database dependencies. Storage is reached
//! through [`store::HealthStore`].

// Native `async fn` in traits; the returned futures are `Send`-bounded in the
// trait declarations.
#![allow(async_fn_in_trait)]

pub mod arm;
pub mod destination;
pub mod error;
pub mod event;
pub mod geo;
pub mod merge;
pub mod principal;
pub mod profile;
pub mod service;
pub mod store;
pub mod validate;

pub use error::{Error, Result};
