//! Sparse mixture-of-experts layers.

pub mod bank;
pub mod fused;
pub mod layer;
pub mod router;

pub use bank::ExpertWeightBank;
pub use layer::SparseMoeBlock;
pub use router::{MoeRouter, RoutingDecision};
