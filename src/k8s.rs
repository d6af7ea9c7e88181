//! Target cluster access: client construction and `PodDisruptionBudget` listing.

pub mod client;
pub mod pdb;

pub use client::build_kube_client;
pub use pdb::{DisruptionBudget, PdbLister, blocking_budgets};
