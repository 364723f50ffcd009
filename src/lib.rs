//! Tollgate - Admission Control Engine
//!
//! This crate decides whether a principal may call an API endpoint right now.
//! Each `(principal, endpoint)` pair owns a token bucket whose capacity is
//! scaled by subscription tier, region and a slow-start ramp. Bucket state
//! lives in a shared Redis store when one is healthy and in an equivalent
//! in-process store otherwise; both run the same refill arithmetic under
//! per-key mutual exclusion.

pub mod app;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
