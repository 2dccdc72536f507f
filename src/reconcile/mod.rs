//! Diff-based reconciliation of mapped entities against the catalog.
//!
//! A full resync hands a complete snapshot of one `(datasource, kind)` scope
//! to [`StateApplier::apply_snapshot`]; live events hand their changes to
//! [`StateApplier::apply_deltas`]. Applying the same snapshot twice against
//! the same catalog state issues no writes the second time.

pub mod applier;
pub mod diff;
pub mod order;

pub use applier::{ApplyOptions, ApplyReport, EntityDelta, StateApplier};
pub use diff::{compute_diff, EntityDiff};
pub use order::WritePlan;

#[cfg(test)]
mod tests;
