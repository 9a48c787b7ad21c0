//! # subcast-core
//!
//! Shared vocabulary for the subcast subscription fan-out engine.
//!
//! This crate provides everything the storage and server crates agree on:
//!
//! - **Wire protocol**: [`protocol::ClientMessage`] / [`protocol::ServerMessage`]
//!   with legacy-alias canonicalization at parse time
//! - **Domain types**: [`types::Connection`], [`types::Subscriber`],
//!   [`types::SubscriptionEvent`], operation requests
//! - **Collaborator traits**: [`traits::ConnectionManager`],
//!   [`traits::SubscriptionManager`], [`traits::EventPublisher`],
//!   [`traits::PushTransport`], [`traits::Executor`]
//! - **Errors**: [`errors::SubcastError`] taxonomy via `thiserror`
//! - **TTL**: [`ttl::compute_ttl`] and [`ttl::is_ttl_expired`] (lazy expiry)
//! - **Retry**: [`retry::RetryConfig`] with exponential backoff and jitter,
//!   plus [`retry::with_timeout`] for bounding application hooks
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by `subcast-store` and `subcast-server`.

#![deny(unsafe_code)]

pub mod errors;
pub mod execution;
pub mod protocol;
pub mod retry;
pub mod traits;
pub mod ttl;
pub mod types;

pub use errors::{Result, SubcastError, TransportError};
