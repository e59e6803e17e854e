//! Straylight — a security and trust core.
//!
//! Token issuance and verification, role-based authorization with
//! resource policies, authenticated encryption with versioned key
//! rotation, a multi-backend secrets facade, input validation, and a
//! batching audit pipeline, composed per-request by the gateway.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod store;

pub mod audit;
pub mod authz;
pub mod crypto;
pub mod guard;
pub mod secrets;
pub mod token;

pub mod gateway;
