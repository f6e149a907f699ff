//! saxsflow: molecular dynamics pipeline worker for SAXS/SANS analysis.
//!
//! This library sequences BilboMD-style jobs through their stage plans,
//! supervises the scientific binaries (CHARMM, FoXS, MultiFoXS,
//! Pepsi-SANS), persists per-stage status, and drives the asynchronous
//! trajectory-movie render sub-pipeline.

pub mod cli;
pub mod config;
pub mod ensemble;
pub mod exec;
pub mod hpc;
pub mod model;
pub mod movie;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod store;
