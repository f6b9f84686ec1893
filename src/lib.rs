//! # mailq
//!
//! Postgres-backed bulk email pipeline.
//!
//! Campaign recipients flow through two stages. The sort stage personalizes
//! each recipient into an email, the send stage hands those emails to the
//! local mail transport. In each stage a balancer levels pending work across
//! hosts and a per-host fleet of slot workers processes its share.

pub mod balancer;
pub mod config;
pub mod db;
pub mod error;
pub mod host;
pub mod model;
pub mod personalize;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod worker;
