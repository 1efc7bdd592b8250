//! Turnstile - Distributed Admission Control
//!
//! This crate implements a sliding-window request rate limiter backed by a
//! shared external store, bounding how many operations an identity may
//! perform within a rolling window across any number of service instances.
//! A background sweeper reclaims stale state independently of the request
//! path.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
