//! Protocol message definitions and their handlers.

pub mod basic_message;
pub mod connection;
pub mod mediation;
pub mod out_of_band;
pub mod problem_report;
pub mod proof;
pub mod routing;
pub mod trust_ping;
