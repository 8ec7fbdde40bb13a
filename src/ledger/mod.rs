//! The unit DAG.
//!
//! Data model (`unit`), persistence (`storage`), atomic commits (`writer`),
//! and main-chain stabilization (`main_chain`). Everything that changes the
//! ledger flows through the writer; everything that reads it goes through the
//! `LedgerStore` trait.

pub mod main_chain;
pub mod storage;
pub mod unit;
pub mod writer;
