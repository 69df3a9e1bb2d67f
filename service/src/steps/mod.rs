//! The two side-effecting steps of the request lifecycle.

pub mod settle;
pub mod status;

pub use settle::SettlementStep;
pub use status::StatusTransitionStep;
