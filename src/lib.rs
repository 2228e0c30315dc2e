//! `conductor` - Distributed shell-command orchestration for network tests
//!
//! This library provides the conductor and player runtimes: a conductor
//! drives trials of startup/run/collect/reset phases across a set of
//! players, each of which executes shell-command steps and streams the
//! results back.

pub mod cli;
pub mod conduct;
pub mod config;
pub mod error;
pub mod net;
pub mod observability;
pub mod phase;
pub mod player;
pub mod protocol;
pub mod report;
pub mod step;
