//! # Storage Module
//!
//! Transactional local storage for profiles and the profile whitelist.
//!
//! ## Storage Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Database                                                       │   │
//! │  │  ────────                                                       │   │
//! │  │  read(|tx| ...)   deferred transaction, snapshot of commits     │   │
//! │  │  write(|tx| ...)  immediate transaction, all-or-nothing         │   │
//! │  │                                                                 │   │
//! │  │  WriteGeneration  bumped on every commit that touched a profile │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SQLite (file or in-memory)                                     │   │
//! │  │  ──────────────────────────                                     │   │
//! │  │  • profiles          - one row per user                         │   │
//! │  │  • whitelist_users   - users we share our profile with          │   │
//! │  │  • whitelist_groups  - groups we share our profile with         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Committed transactions are durable once `write` returns.

mod database;
mod schema;
mod transaction;

pub use database::{Committed, Database};
pub use schema::SCHEMA_VERSION;
pub use transaction::{ChangeSet, ReadTransaction, WriteGeneration, WriteTransaction};
