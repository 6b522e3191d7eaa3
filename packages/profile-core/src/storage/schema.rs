//! # Database Schema
//!
//! SQL schema definitions for the profile database.
//!
//! ## Schema Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DATABASE SCHEMA                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌───────────────────────┐   ┌─────────────────┐   ┌─────────────────┐  │
//! │  │       profiles        │   │ whitelist_users │   │whitelist_groups │  │
//! │  ├───────────────────────┤   ├─────────────────┤   ├─────────────────┤  │
//! │  │ address_key (PK)      │   │ address_key (PK)│   │ group_id (PK)   │  │
//! │  │ uuid (UNIQUE)         │   │ uuid            │   │ added_at        │  │
//! │  │ phone_number (UNIQUE) │   │ phone_number    │   └─────────────────┘  │
//! │  │ profile_key           │   │ added_at        │                        │
//! │  │ given_name            │   └─────────────────┘                        │
//! │  │ family_name           │                                              │
//! │  │ username              │                                              │
//! │  │ avatar_url_path       │                                              │
//! │  │ avatar_blob           │                                              │
//! │  │ is_uuid_capable       │                                              │
//! │  │ last_fetch_at         │                                              │
//! │  │ last_fetch_attempt_at │                                              │
//! │  │ created_at            │                                              │
//! │  │ updated_at            │                                              │
//! │  └───────────────────────┘                                              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `address_key` is `uuid:<hyphenated>` when a UUID is known and
//! `e164:<number>` otherwise.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Profiles table
-- One row per user, keyed by the canonical address
CREATE TABLE IF NOT EXISTS profiles (
    address_key TEXT PRIMARY KEY,
    -- Lowercase hyphenated UUID
    uuid TEXT UNIQUE,
    -- E.164 phone number
    phone_number TEXT UNIQUE,
    -- 32-byte profile key
    profile_key BLOB,
    given_name TEXT,
    family_name TEXT,
    username TEXT,
    avatar_url_path TEXT,
    -- Decrypted avatar bytes
    avatar_blob BLOB,
    is_uuid_capable INTEGER NOT NULL DEFAULT 0,
    -- Unix millis of the last successful fetch
    last_fetch_at INTEGER,
    -- Unix millis of the last fetch attempt, successful or not
    last_fetch_attempt_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    CONSTRAINT has_identifier CHECK (uuid IS NOT NULL OR phone_number IS NOT NULL),
    CONSTRAINT avatar_has_url CHECK (avatar_blob IS NULL OR avatar_url_path IS NOT NULL),
    CONSTRAINT key_length CHECK (profile_key IS NULL OR length(profile_key) = 32)
);
CREATE INDEX IF NOT EXISTS idx_profiles_updated ON profiles(updated_at DESC);

-- Whitelisted users
CREATE TABLE IF NOT EXISTS whitelist_users (
    address_key TEXT PRIMARY KEY,
    uuid TEXT,
    phone_number TEXT,
    added_at INTEGER NOT NULL,
    CONSTRAINT has_identifier CHECK (uuid IS NOT NULL OR phone_number IS NOT NULL)
);
CREATE INDEX IF NOT EXISTS idx_whitelist_users_uuid ON whitelist_users(uuid);
CREATE INDEX IF NOT EXISTS idx_whitelist_users_phone ON whitelist_users(phone_number);

-- Whitelisted groups
CREATE TABLE IF NOT EXISTS whitelist_groups (
    group_id BLOB PRIMARY KEY,
    added_at INTEGER NOT NULL
);
"#;
