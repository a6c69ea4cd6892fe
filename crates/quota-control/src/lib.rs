//! Distributed quota and rate-limit control.
//!
//! A [`client::QuotaClient`] sits in front of a service and answers, for every
//! request, whether the caller may proceed and how much compute it consumed.
//! Descriptors and usage counters live in a shared cache so that every node
//! sees the same totals; the [`authority::Authority`] owns the durable state.

pub mod authority;
pub mod cache;
pub mod client;
pub mod configuration;
pub mod error;
pub mod metric;
pub mod middleware;
pub mod model;
pub mod origin;
pub mod proxy;
pub mod server;
pub mod usage;
