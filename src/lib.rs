//! meshca - certificate authority for service mesh identities
//!
//! meshca keeps one active authority certificate, persists it in the cluster,
//! publishes it to every workload namespace, and signs workload CSRs over gRPC.
//!
//! # Modules
//!
//! - [`config`] - process options (flags with environment fallbacks)
//! - [`rotation`] - authority bootstrap and the scheduled refresh loop
//! - [`service`] - the `CreateCertificate` gRPC service
//! - [`server`] - listener setup and the server lifecycle
//!
//! PKI, the authority snapshot and the TLS resolver live in `meshca-infra`;
//! the trust store and telemetry live in `meshca-common`.

#![deny(missing_docs)]

pub mod config;
pub mod rotation;
pub mod server;
pub mod service;

pub use config::{ConfigError, Options};
pub use server::{CaServer, Phase, ServerError, ServingHandles};
