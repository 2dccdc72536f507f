//! Catalog synchronization engine.
//!
//! Pulls raw records from third-party systems (full resync) or receives them
//! through webhooks (live events), maps them into catalog entities with a
//! declarative mapping and reconciles the result against the catalog.

// Configuration loading and environment overrides
pub mod config;

// Error taxonomy
pub mod error;

// Outbound concurrency and rate limiting
pub mod rate_limit;
pub mod http;
pub mod retry;

// Mapping expression language
pub mod expr;

// Mapping specification and entity mapper
pub mod mapping;

// Entity model
pub mod entity;

// Catalog API clients
pub mod catalog;

// Diff and apply
pub mod reconcile;

// Full resync orchestration
pub mod resync;

// Live event model and validation
pub mod event;

// Webhook ingress, queue and dispatch
pub mod webhook;

// Resync status reporting
pub mod status;
