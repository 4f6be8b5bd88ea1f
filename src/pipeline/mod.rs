//! Pipeline Module
//!
//! A pipeline is an ordered list of stages, each wrapping one task. The
//! coordinator runs them one after the other through the work coordinator and
//! checkpoints the active stage, so a restarted process or a newly elected
//! coordinator resumes where the previous run stopped. `always` stages run
//! regardless of failures, stops or resumption; `only_if` stages run when
//! their condition holds.

pub mod coordinator;
pub mod types;
