//! NOA Cobros: multi-tenant invoicing and payment reminders.
//!
//! The library holds everything the binaries share: sled-backed storage,
//! the Axum REST layer, WhatsApp delivery and the daily reminder job.

pub mod auth;
pub mod config;
pub mod error;
pub mod export;
pub mod logging;
pub mod models;
pub mod notify;
// REST API: Axum handlers, auth middleware and the OpenAPI document
pub mod rest;
pub mod stats;
pub mod storage;
pub mod template;
pub mod tenancy;
pub mod worker;
