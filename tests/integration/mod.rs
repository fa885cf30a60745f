//! Integration test suite for taskhive.
//!
//! These tests drive a real `Orchestrator` end to end: submission, lane
//! routing, retries, timeouts, circuit breaking, autoscaling, cancellation,
//! and result retrieval. Payloads are small closures, so the suite needs no
//! external services.
//!
//! # Test Categories
//!
//! - `scenarios`: End-to-end submit and gather flows
//! - `ordering`: Priority ordering and stream completion order
//! - `resilience`: Breakers, cancellation, and shutdown
//! - `scaling`: Autoscaling and health reporting under load

mod fixtures;

mod scenarios;
mod ordering;
mod resilience;
mod scaling;
