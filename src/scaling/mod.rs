//! Scaling — per-function replica goals and the orchestrator they drive
//!
//! The autoscaler grows a deployment as soon as load asks for it and shrinks
//! it one replica at a time after the goal has been stable for a while.

pub mod autoscaler;
pub mod orchestrator;
