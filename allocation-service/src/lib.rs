//! allocation-service: matches incoming payments to open invoices and
//! commits allocations to the fee ledger, escalating what it cannot decide.

pub mod api;
pub mod config;
pub mod error;
pub mod matching;
pub mod models;
pub mod services;
pub mod startup;
