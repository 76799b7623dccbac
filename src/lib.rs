//! Multi-round synchronization barriers for coordinating concurrent
//! participants.
//!
//! The centerpiece of this crate is the [`PhaseBarrier`](barrier::PhaseBarrier),
//! which drives a fixed set of participants through an unbounded sequence of
//! phases, collects the errors they report and lets participants fail fast
//! without deadlocking the remaining phases. One orchestrator waits for each
//! phase to complete and decides how to react to the collected errors.
//!
//! The remaining modules use the barrier to test publish/subscribe
//! messaging:
//! - [Relay](relay): An in-process publish/subscribe relay with clients and
//!   cluster services.
//! - [Pool](pool): A fixed-size worker pool for fanning out work.
//! - [Scenario](scenario): Many concurrent clients and services broadcasting
//!   through a relay, verified phase by phase.
//! - [Measure](measure): Broadcast latency and throughput measurements.
//!
//! # Important Notes
//! <div class="warning">
//! A participant that neither syncs nor exits blocks the barrier forever. Use
//! <code>PhaseBarrier::wait_timeout</code> when participants may get stuck.
//! </div>


pub mod barrier;
pub mod measure;
pub mod pool;
pub mod relay;
pub mod scenario;
