//! # Mint/Redeem
//!
//! Mint and redeem requests driven through a durable settlement lifecycle.
//!
//! A request is validated and stored as `pending` by [`intake::IntakeService`],
//! which launches a [`lifecycle::RequestLifecycle`] run keyed by the request id
//! and marks the request `started`. The run calls the settlement provider
//! once (idempotently, keyed by the request id) and writes the terminal
//! `completed` or `failed` status.
//!
//! ## Modules
//!
//! - [`config`]: environment configuration
//! - [`provider`]: HTTP and fake settlement clients
//! - [`steps`]: the settlement and status transition steps
//! - [`lifecycle`]: the process tying the steps together
//! - [`intake`]: submission entry point
//! - [`api`]: transport-neutral request/response mapping
//! - [`bootstrap`]: startup wiring

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod intake;
pub mod lifecycle;
pub mod provider;
pub mod steps;
