//! # Profiles Module
//!
//! Profile records, their wire envelope, and the store and cache that hold
//! them.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          READ / WRITE PATH                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  get_cached(addr) ──► ReadCache ──miss──► read tx ──► profiles table    │
//! │                                                                         │
//! │  write_tx(|tx| store.write(tx, addr, patch))                            │
//! │       │                                                                 │
//! │       ├─► commit (generation += 1)                                      │
//! │       ├─► ReadCache::invalidate_keys(touched)                           │
//! │       ├─► SyncHub::publish(outbound)                                    │
//! │       └─► ProfileEvent::RecordsChanged                                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod cache;
mod envelope;
mod record;
mod store;

pub use cache::ReadCache;
pub use envelope::{OpenedProfile, ProfileEnvelope, ENVELOPE_VERSION};
pub use record::{
    AvatarImage, ImageFormat, ProfilePatch, ProfileRecord, MAX_AVATAR_SIZE, MAX_NAME_LENGTH,
};
pub use store::{ProfileStore, WriteOutcome};
