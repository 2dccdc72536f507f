//! Integration runner - hosts one integration on top of the sync engine.
//!
//! # Architecture
//!
//! ```text
//! Third-party API (GitHub, ...)          webhook deliveries
//!          ↓                                     ↓
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │  RawDataProducer         │   │  WebhookProcessors           │
//! │  (paged fetch per kind)  │   │  (auth, validate, fetch)     │
//! └──────────────────────────┘   └──────────────────────────────┘
//!          ↓                                     ↓
//!   ResyncCoordinator                 LiveEventQueue → EventDispatcher
//!          ↓                                     ↓
//!       EntityMapper → StateApplier (diff, ordered writes, deletes)
//!                            ↓
//!                         Catalog
//! ```
//!
//! # Core Types
//!
//! - [`Integration`] - what a connector supplies to the engine
//! - [`runtime::Runtime`] - wires the engine around one integration
//! - [`scheduler::ResyncScheduler`] - on-start and periodic resyncs
//! - [`api`] - management endpoints (`/api/resync`, `/api/status`, `/health`)

mod integration;
pub mod api;
pub mod config;
pub mod integrations;
pub mod registry;
pub mod runtime;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use config::RunnerConfig;
pub use integration::Integration;
pub use runtime::Runtime;
