//! # Profile Manager
//!
//! The facade consumers talk to. It owns every component and wires the
//! event channels between them.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          PROFILE MANAGER                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   ProfileManager ──owns──► ProfileStore ──► Database + ReadCache        │
//! │         │                                                               │
//! │         ├──owns──► WhitelistPolicy                                      │
//! │         ├──owns──► FetchCoordinator ──► ProfileNetwork                  │
//! │         └──owns──► SyncHub ──outbound──► sync collaborator              │
//! │                                                                         │
//! │   components ──broadcast<ProfileEvent>──► subscribers                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Methods that take a transaction never commit on their own; the caller
//! decides the transaction boundary. Their `was_locally_initiated` flag is
//! `true` for changes made on this device, which queues them for outbound
//! sync. Convenience methods without a transaction open one themselves and
//! are always locally initiated.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::address::Address;
use crate::config::ProfileConfig;
use crate::crypto::{self, ProfileKey};
use crate::error::{Error, Result};
use crate::events::ProfileEvent;
use crate::fetch::{FetchCoordinator, FetchHandle, FetchOptions, FetchPhase, ProfileNetwork};
use crate::profiles::{
    AvatarImage, OpenedProfile, ProfileEnvelope, ProfilePatch, ProfileRecord, ProfileStore,
};
use crate::storage::{Database, ReadTransaction, WriteTransaction};
use crate::sync::{SyncEvent, SyncHub};
use crate::time::{Clock, SystemClock};
use crate::whitelist::{ConversationThread, GroupId, ShareTarget, WhitelistEntry, WhitelistPolicy};

/// Buffered events per subscriber before old ones are dropped
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Prefix for avatar paths chosen by this device
const AVATAR_PATH_PREFIX: &str = "avatars/";

/// What to do with the local avatar
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AvatarChange {
    /// Leave it as it is
    #[default]
    Keep,
    /// Remove it
    Clear,
    /// Replace it with these image bytes
    Set(Vec<u8>),
}

/// An edit to the local user's profile
///
/// Name and username fields replace the stored values; `None` clears them.
#[derive(Debug, Clone, Default)]
pub struct LocalProfileUpdate {
    /// New given name
    pub given_name: Option<String>,
    /// New family name
    pub family_name: Option<String>,
    /// New username
    pub username: Option<String>,
    /// Avatar change
    pub avatar: AvatarChange,
}

/// Owns the profile components and exposes the profile operations
pub struct ProfileManager {
    local_address: Address,
    store: Arc<ProfileStore>,
    whitelist: WhitelistPolicy,
    coordinator: FetchCoordinator,
    sync: Arc<SyncHub>,
    network: Arc<dyn ProfileNetwork>,
    events: broadcast::Sender<ProfileEvent>,
}

impl ProfileManager {
    /// Open the profile database and start the components
    pub fn new(
        config: ProfileConfig,
        local_address: Address,
        network: Arc<dyn ProfileNetwork>,
    ) -> Result<Self> {
        Self::with_clock(config, local_address, network, Arc::new(SystemClock))
    }

    /// Like [`ProfileManager::new`] with an explicit clock
    pub fn with_clock(
        config: ProfileConfig,
        local_address: Address,
        network: Arc<dyn ProfileNetwork>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let db = Arc::new(Database::open(config.database_path.as_deref())?);
        let sync = Arc::new(SyncHub::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let store = Arc::new(ProfileStore::new(
            db,
            &config.cache,
            Arc::clone(&sync),
            events.clone(),
            Arc::clone(&clock),
        ));
        let whitelist = WhitelistPolicy::new(Arc::clone(&store));
        let coordinator = FetchCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&network),
            clock,
            config.fetch.clone(),
            config.host,
            events.clone(),
        );

        let manager = Self {
            local_address,
            store,
            whitelist,
            coordinator,
            sync,
            network,
            events,
        };
        manager.ensure_local_profile_key()?;

        tracing::info!(
            local = %manager.local_address,
            host = ?config.host,
            "Profile manager started"
        );
        Ok(manager)
    }

    fn ensure_local_profile_key(&self) -> Result<()> {
        self.store.write_tx(|tx| {
            let existing = self.store.read(tx, &self.local_address)?;
            if existing.and_then(|r| r.profile_key).is_none() {
                let key = ProfileKey::generate();
                tracing::info!(fingerprint = %key.fingerprint(), "Generated local profile key");
                self.store.write(
                    tx,
                    &self.local_address,
                    &ProfilePatch::new().profile_key(Some(key)),
                )?;
            }
            Ok(())
        })
    }

    /// The local user's address
    pub fn local_address(&self) -> &Address {
        &self.local_address
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<ProfileStore> {
        &self.store
    }

    /// Run a closure in a read transaction
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTransaction<'_>) -> Result<T>,
    {
        self.store.read_tx(f)
    }

    /// Run a closure in a write transaction
    pub fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<T>,
    {
        self.store.write_tx(f)
    }

    // ========================================================================
    // LOCAL PROFILE
    // ========================================================================

    fn local_record(&self) -> Result<Option<Arc<ProfileRecord>>> {
        self.store.get_cached(&self.local_address)
    }

    /// The local user's profile key
    pub fn local_profile_key(&self) -> Result<ProfileKey> {
        self.local_record()?
            .and_then(|r| r.profile_key.clone())
            .ok_or_else(|| Error::NotFound("local profile key".into()))
    }

    /// Local given name
    pub fn local_given_name(&self) -> Result<Option<String>> {
        Ok(self.local_record()?.and_then(|r| r.given_name.clone()))
    }

    /// Local family name
    pub fn local_family_name(&self) -> Result<Option<String>> {
        Ok(self.local_record()?.and_then(|r| r.family_name.clone()))
    }

    /// Local full name
    pub fn local_full_name(&self) -> Result<Option<String>> {
        Ok(self.local_record()?.and_then(|r| r.full_name()))
    }

    /// Local username
    pub fn local_username(&self) -> Result<Option<String>> {
        Ok(self.local_record()?.and_then(|r| r.username.clone()))
    }

    /// Local avatar, if the stored bytes are a known image format
    pub fn local_profile_avatar_image(&self) -> Result<Option<AvatarImage>> {
        Ok(self.local_record()?.and_then(|r| r.avatar_image()))
    }

    /// Raw local avatar bytes
    pub fn local_profile_avatar_data(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.local_record()?.and_then(|r| r.avatar_blob.clone()))
    }

    /// Whether the local profile has a name or an avatar
    pub fn has_local_profile(&self) -> Result<bool> {
        Ok(self
            .local_record()?
            .map(|r| r.has_name() || r.has_avatar())
            .unwrap_or(false))
    }

    /// Whether the local profile has a name
    pub fn has_profile_name(&self) -> Result<bool> {
        Ok(self.local_record()?.map(|r| r.has_name()).unwrap_or(false))
    }

    /// Whether any local record exists
    pub fn local_profile_exists(&self) -> Result<bool> {
        Ok(self.local_record()?.is_some())
    }

    /// Edit the local profile and upload the sealed result
    ///
    /// The local write commits before the upload; an upload failure is
    /// returned but does not roll the edit back.
    pub async fn update_local_profile(&self, update: LocalProfileUpdate) -> Result<ProfileRecord> {
        let avatar = match update.avatar {
            AvatarChange::Keep => None,
            AvatarChange::Clear => Some((None, None)),
            AvatarChange::Set(data) => {
                let image = AvatarImage::from_bytes(data)?;
                let path = format!("{}{}", AVATAR_PATH_PREFIX, Uuid::new_v4());
                Some((Some(path), Some(image.into_data())))
            }
        };

        let local = self.local_address.clone();
        let record = self.store.write_tx(|tx| {
            let mut patch = ProfilePatch::new()
                .name(update.given_name.clone(), update.family_name.clone())
                .username(update.username.clone());
            let avatar_url_path = avatar.as_ref().map(|(path, _)| path.clone());
            if let Some((path, blob)) = avatar {
                patch = patch.avatar(path, blob);
            }

            let outcome = self.store.write(tx, &local, &patch)?;
            if outcome.changed {
                tx.enqueue_sync(SyncEvent::ProfileNameChanged {
                    address: local.clone(),
                    given_name: update.given_name.clone(),
                    family_name: update.family_name.clone(),
                    avatar_url_path,
                });
            }
            Ok(outcome.record)
        })?;

        let key = record
            .profile_key
            .clone()
            .ok_or_else(|| Error::NotFound("local profile key".into()))?;
        let envelope = ProfileEnvelope::seal(
            &key,
            &OpenedProfile {
                given_name: record.given_name.clone(),
                family_name: record.family_name.clone(),
                username: record.username.clone(),
                avatar_url_path: record.avatar_url_path.clone(),
                avatar: record.avatar_blob.clone(),
                uuid_capable: true,
            },
        )?;

        self.network
            .upload_profile(envelope.to_bytes()?)
            .await
            .map_err(Error::from)?;

        tracing::info!(has_avatar = record.has_avatar(), "Uploaded local profile");
        Ok(record)
    }

    // ========================================================================
    // PROFILES BY ADDRESS
    // ========================================================================

    /// Stored profile for an address, through the cache
    pub fn profile_for_address(&self, address: &Address) -> Result<Option<Arc<ProfileRecord>>> {
        self.store.get_cached(address)
    }

    /// Stored profile key for an address
    pub fn profile_key_for_address(
        &self,
        address: &Address,
        tx: &ReadTransaction<'_>,
    ) -> Result<Option<ProfileKey>> {
        Ok(self.store.read(tx, address)?.and_then(|r| r.profile_key))
    }

    /// Display name for an address
    pub fn full_name_for_address(
        &self,
        address: &Address,
        tx: &ReadTransaction<'_>,
    ) -> Result<Option<String>> {
        Ok(self.store.read(tx, address)?.and_then(|r| r.full_name()))
    }

    /// Whether the peer advertises UUID support
    pub fn recipient_address_is_uuid_capable(
        &self,
        address: &Address,
        tx: &ReadTransaction<'_>,
    ) -> Result<bool> {
        Ok(self
            .store
            .read(tx, address)?
            .map(|r| r.is_uuid_capable)
            .unwrap_or(false))
    }

    /// Store a profile key; returns whether it changed
    ///
    /// Replacing a different key on a remote profile drops the name, the
    /// avatar and the last fetch time, since they were decrypted with the
    /// old key.
    pub fn set_profile_key(
        &self,
        key: ProfileKey,
        address: &Address,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        let existing = self.store.read(tx, address)?.and_then(|r| r.profile_key);
        if existing.as_ref() == Some(&key) {
            return Ok(false);
        }

        let mut patch = ProfilePatch::new().profile_key(Some(key.clone()));
        if existing.is_some() && !self.is_local(address) {
            tracing::info!(address = %address, "Profile key rotated, dropping decrypted fields");
            patch = patch.name(None, None).avatar(None, None);
            patch.last_fetch_at = Some(None);
        }

        let outcome = self.store.write(tx, address, &patch)?;
        if outcome.changed && was_locally_initiated {
            tx.enqueue_sync(SyncEvent::ProfileKeyChanged {
                address: address.clone(),
                profile_key: key,
            });
        }
        Ok(outcome.changed)
    }

    /// Store keys only where none is known yet; returns how many were set
    pub fn fill_in_missing_profile_keys<I>(&self, keys: I, tx: &mut WriteTransaction<'_>) -> Result<usize>
    where
        I: IntoIterator<Item = (Address, ProfileKey)>,
    {
        let mut filled = 0;
        for (address, key) in keys {
            let known = self
                .store
                .read(tx, &address)?
                .map(|r| r.profile_key.is_some())
                .unwrap_or(false);
            if known {
                continue;
            }
            if self
                .store
                .write(tx, &address, &ProfilePatch::new().profile_key(Some(key)))?
                .changed
            {
                filled += 1;
            }
        }
        if filled > 0 {
            tracing::debug!(filled, "Filled in missing profile keys");
        }
        Ok(filled)
    }

    /// Store a profile name; returns whether it changed
    pub fn set_profile_name(
        &self,
        given_name: Option<String>,
        family_name: Option<String>,
        address: &Address,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        let patch = ProfilePatch::new().name(given_name.clone(), family_name.clone());
        let outcome = self.store.write(tx, address, &patch)?;
        if outcome.changed && was_locally_initiated {
            tx.enqueue_sync(SyncEvent::ProfileNameChanged {
                address: address.clone(),
                given_name,
                family_name,
                avatar_url_path: None,
            });
        }
        Ok(outcome.changed)
    }

    /// Store a profile name and avatar path; returns whether it changed
    ///
    /// A new path drops the stored avatar bytes.
    pub fn set_profile_name_and_avatar(
        &self,
        given_name: Option<String>,
        family_name: Option<String>,
        avatar_url_path: Option<String>,
        address: &Address,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        let current_path = self
            .store
            .read(tx, address)?
            .and_then(|r| r.avatar_url_path);

        let patch = ProfilePatch::new().name(given_name.clone(), family_name.clone());
        let patch = if current_path == avatar_url_path {
            patch
        } else {
            patch.avatar(avatar_url_path.clone(), None)
        };

        let outcome = self.store.write(tx, address, &patch)?;
        if outcome.changed && was_locally_initiated {
            tx.enqueue_sync(SyncEvent::ProfileNameChanged {
                address: address.clone(),
                given_name,
                family_name,
                avatar_url_path: Some(avatar_url_path),
            });
        }
        Ok(outcome.changed)
    }

    /// Apply profile fields that were fetched elsewhere
    ///
    /// The name ciphertext is decrypted with the stored key.
    pub fn update_profile_for_address_with(
        &self,
        address: &Address,
        profile_name_encrypted: Option<&[u8]>,
        username: Option<String>,
        is_uuid_capable: bool,
        avatar_url_path: Option<String>,
    ) -> Result<ProfileRecord> {
        let now = self.store.clock().wall_millis();
        self.store.write_tx(|tx| {
            let existing = self.store.read(tx, address)?;
            let key = existing.as_ref().and_then(|r| r.profile_key.as_ref());

            let (given, family) = match (profile_name_encrypted, key) {
                (None, _) => (None, None),
                (Some(ciphertext), Some(key)) => crypto::decrypt_name(key, ciphertext)?,
                (Some(_), None) => {
                    return Err(Error::DecryptFailure(format!(
                        "no profile key for {}",
                        address
                    )))
                }
            };

            let current_path = existing.as_ref().and_then(|r| r.avatar_url_path.clone());
            let patch = ProfilePatch::new()
                .name(given, family)
                .username(username)
                .uuid_capable(is_uuid_capable)
                .fetched_at(now);
            let patch = if current_path == avatar_url_path {
                patch
            } else {
                patch.avatar(avatar_url_path, None)
            };

            Ok(self.store.write(tx, address, &patch)?.record)
        })
    }

    /// Unify the records of two addresses that name the same user
    pub fn merge_addresses(&self, a: &Address, b: &Address) -> Result<ProfileRecord> {
        self.store.write_tx(|tx| self.store.merge(tx, a, b))
    }

    /// Load recently used profiles into the read cache
    pub fn warm_caches(&self) -> Result<usize> {
        self.store.warm()
    }

    fn is_local(&self, address: &Address) -> bool {
        self.local_address == *address
    }

    // ========================================================================
    // FETCHING
    // ========================================================================

    /// Request a profile from the network
    pub fn fetch_profile(&self, address: &Address, options: FetchOptions) -> FetchHandle {
        self.coordinator.request(address, options)
    }

    /// Fetch state for an address
    pub fn fetch_phase(&self, address: &Address) -> FetchPhase {
        self.coordinator.phase(address)
    }

    /// Refresh the local profile without waiting for it
    pub fn fetch_and_update_local_users_profile(&self) {
        self.fetch_local_users_profile().detach();
    }

    /// Refresh the local profile, bypassing the cooldown
    pub fn fetch_local_users_profile(&self) -> FetchHandle {
        self.coordinator
            .request(&self.local_address, FetchOptions::forced())
    }

    /// Refresh a profile without waiting for it
    pub fn update_profile_for_address(&self, address: &Address) {
        self.coordinator
            .request(address, FetchOptions::default())
            .detach();
    }

    /// Refresh a profile
    pub fn update_profile_for_address_promise(
        &self,
        address: &Address,
        main_app_only: bool,
        ignore_throttling: bool,
    ) -> FetchHandle {
        self.coordinator.request(
            address,
            FetchOptions {
                main_app_only,
                ignore_throttling,
                require_fresh: false,
            },
        )
    }

    // ========================================================================
    // WHITELIST
    // ========================================================================

    /// Whether the local profile may be shared with the target
    pub fn share_profile_with(&self, target: &ShareTarget, tx: &ReadTransaction<'_>) -> Result<bool> {
        self.whitelist.share_profile_with(target, tx)
    }

    /// Whether a user is whitelisted
    pub fn is_user_in_profile_whitelist(
        &self,
        address: &Address,
        tx: &ReadTransaction<'_>,
    ) -> Result<bool> {
        self.whitelist
            .contains(&WhitelistEntry::User(address.clone()), tx)
    }

    /// Whether a group is whitelisted
    pub fn is_group_id_in_profile_whitelist(
        &self,
        group_id: &GroupId,
        tx: &ReadTransaction<'_>,
    ) -> Result<bool> {
        self.whitelist
            .contains(&WhitelistEntry::Group(group_id.clone()), tx)
    }

    /// Whether whatever governs a thread is whitelisted
    pub fn is_thread_in_profile_whitelist(
        &self,
        thread: &ConversationThread,
        tx: &ReadTransaction<'_>,
    ) -> Result<bool> {
        self.whitelist.contains(&thread.whitelist_entry(), tx)
    }

    /// Every whitelist entry
    pub fn profile_whitelist(&self, tx: &ReadTransaction<'_>) -> Result<Vec<WhitelistEntry>> {
        self.whitelist.all(tx)
    }

    /// Add a user to the whitelist
    pub fn add_user_to_profile_whitelist(
        &self,
        address: &Address,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        self.whitelist.add_user(address, was_locally_initiated, tx)
    }

    /// Add users to the whitelist
    pub fn add_users_to_profile_whitelist(
        &self,
        addresses: &[Address],
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<usize> {
        self.whitelist.add_users(addresses, was_locally_initiated, tx)
    }

    /// Remove a user from the whitelist
    pub fn remove_user_from_profile_whitelist(
        &self,
        address: &Address,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        self.whitelist.remove_user(address, was_locally_initiated, tx)
    }

    /// Add a group to the whitelist
    pub fn add_group_id_to_profile_whitelist(
        &self,
        group_id: &GroupId,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        self.whitelist.add_group(group_id, was_locally_initiated, tx)
    }

    /// Remove a group from the whitelist
    pub fn remove_group_id_from_profile_whitelist(
        &self,
        group_id: &GroupId,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        self.whitelist
            .remove_group(group_id, was_locally_initiated, tx)
    }

    /// Add whatever governs a thread to the whitelist
    pub fn add_thread_to_profile_whitelist(
        &self,
        thread: &ConversationThread,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        self.whitelist.add_thread(thread, was_locally_initiated, tx)
    }

    /// Whitelist a user from this device
    pub fn whitelist_user(&self, address: &Address) -> Result<bool> {
        self.write(|tx| self.add_user_to_profile_whitelist(address, true, tx))
    }

    /// Whitelist users from this device
    pub fn whitelist_users(&self, addresses: &[Address]) -> Result<usize> {
        self.write(|tx| self.add_users_to_profile_whitelist(addresses, true, tx))
    }

    /// Remove a user from the whitelist from this device
    pub fn unwhitelist_user(&self, address: &Address) -> Result<bool> {
        self.write(|tx| self.remove_user_from_profile_whitelist(address, true, tx))
    }

    /// Whitelist a group from this device
    pub fn whitelist_group(&self, group_id: &GroupId) -> Result<bool> {
        self.write(|tx| self.add_group_id_to_profile_whitelist(group_id, true, tx))
    }

    /// Remove a group from the whitelist from this device
    pub fn unwhitelist_group(&self, group_id: &GroupId) -> Result<bool> {
        self.write(|tx| self.remove_group_id_from_profile_whitelist(group_id, true, tx))
    }

    /// Whitelist a thread from this device
    pub fn whitelist_thread(&self, thread: &ConversationThread) -> Result<bool> {
        self.write(|tx| self.add_thread_to_profile_whitelist(thread, true, tx))
    }

    // ========================================================================
    // SYNC AND EVENTS
    // ========================================================================

    /// Apply a change mirrored from another device
    ///
    /// Returns `false` if the event mirrored one of this device's own
    /// changes or changed nothing. A mirror of a local change that a later
    /// local change superseded is dropped too, so it cannot undo it.
    pub fn apply_inbound_sync(&self, event: SyncEvent) -> Result<bool> {
        let inbound = self.sync.classify(&event);
        if !inbound.should_apply() {
            tracing::debug!(entity = ?event.entity(), ?inbound, "Dropped mirrored sync event");
            return Ok(false);
        }

        self.write(|tx| match event {
            SyncEvent::WhitelistUserAdded { address } => self.add_user_to_profile_whitelist(&address, false, tx),
            SyncEvent::WhitelistUserRemoved { address } => {
                self.remove_user_from_profile_whitelist(&address, false, tx)
            }
            SyncEvent::WhitelistGroupAdded { group_id } => {
                self.add_group_id_to_profile_whitelist(&group_id, false, tx)
            }
            SyncEvent::WhitelistGroupRemoved { group_id } => {
                self.remove_group_id_from_profile_whitelist(&group_id, false, tx)
            }
            SyncEvent::ProfileKeyChanged {
                address,
                profile_key,
            } => self.set_profile_key(profile_key, &address, false, tx),
            SyncEvent::ProfileNameChanged {
                address,
                given_name,
                family_name,
                avatar_url_path: None,
            } => self.set_profile_name(given_name, family_name, &address, false, tx),
            SyncEvent::ProfileNameChanged {
                address,
                given_name,
                family_name,
                avatar_url_path: Some(path),
            } => self.set_profile_name_and_avatar(given_name, family_name, path, &address, false, tx),
        })
    }

    /// Subscribe to profile events
    pub fn subscribe(&self) -> broadcast::Receiver<ProfileEvent> {
        self.events.subscribe()
    }

    /// Hand the outbound sync stream to the sync collaborator
    ///
    /// Returns `None` after the first call.
    pub fn take_outbound_sync(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.sync.take_outbound()
    }

    /// Stop fetching; pending and later fetches fail with `Unavailable`
    pub fn shutdown(&self) {
        self.coordinator.close();
    }

    /// Whether [`ProfileManager::shutdown`] was called
    pub fn is_shut_down(&self) -> bool {
        self.coordinator.is_closed()
    }
}

// ============================================================================
// CAPABILITY SURFACE
// ============================================================================

/// The profile capabilities other subsystems depend on
#[async_trait]
pub trait ProfileService: Send + Sync {
    /// The local user's address
    fn local_address(&self) -> &Address;

    /// The local user's profile key
    fn local_profile_key(&self) -> Result<ProfileKey>;

    /// Stored profile for an address
    fn profile_for_address(&self, address: &Address) -> Result<Option<Arc<ProfileRecord>>>;

    /// Whether the local profile may be shared with the target
    fn may_share_profile_with(&self, target: &ShareTarget) -> Result<bool>;

    /// Whitelist a user from this device
    fn whitelist_user(&self, address: &Address) -> Result<bool>;

    /// Request a profile from the network
    fn fetch_profile(&self, address: &Address, options: FetchOptions) -> FetchHandle;

    /// Edit and upload the local profile
    async fn update_local_profile(&self, update: LocalProfileUpdate) -> Result<ProfileRecord>;

    /// Apply a change mirrored from another device
    fn apply_inbound_sync(&self, event: SyncEvent) -> Result<bool>;

    /// Subscribe to profile events
    fn subscribe(&self) -> broadcast::Receiver<ProfileEvent>;
}

#[async_trait]
impl ProfileService for ProfileManager {
    fn local_address(&self) -> &Address {
        ProfileManager::local_address(self)
    }

    fn local_profile_key(&self) -> Result<ProfileKey> {
        ProfileManager::local_profile_key(self)
    }

    fn profile_for_address(&self, address: &Address) -> Result<Option<Arc<ProfileRecord>>> {
        ProfileManager::profile_for_address(self, address)
    }

    fn may_share_profile_with(&self, target: &ShareTarget) -> Result<bool> {
        self.read(|tx| self.share_profile_with(target, tx))
    }

    fn whitelist_user(&self, address: &Address) -> Result<bool> {
        ProfileManager::whitelist_user(self, address)
    }

    fn fetch_profile(&self, address: &Address, options: FetchOptions) -> FetchHandle {
        ProfileManager::fetch_profile(self, address, options)
    }

    async fn update_local_profile(&self, update: LocalProfileUpdate) -> Result<ProfileRecord> {
        ProfileManager::update_local_profile(self, update).await
    }

    fn apply_inbound_sync(&self, event: SyncEvent) -> Result<bool> {
        ProfileManager::apply_inbound_sync(self, event)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProfileEvent> {
        ProfileManager::subscribe(self)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::mock::ScriptedNetwork;
    use crate::fetch::FetchError;
    use std::time::Duration;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0];

    fn me() -> Address {
        Address::from_uuid(Uuid::from_u128(0xAA))
    }

    fn bob() -> Address {
        Address::from_uuid(Uuid::from_u128(0xB0B))
    }

    fn manager() -> (ProfileManager, Arc<ScriptedNetwork>) {
        let network = ScriptedNetwork::new(Err(FetchError::NotFound), Duration::ZERO);
        let manager = ProfileManager::new(ProfileConfig::default(), me(), network.clone()).unwrap();
        (manager, network)
    }

    #[test]
    fn test_local_key_generated_once() {
        let (manager, _) = manager();
        let key = manager.local_profile_key().unwrap();

        manager.ensure_local_profile_key().unwrap();
        assert_eq!(manager.local_profile_key().unwrap(), key);
        assert!(manager.local_profile_exists().unwrap());
        assert!(!manager.has_local_profile().unwrap());
    }

    #[test]
    fn test_set_profile_key_rotation_drops_decrypted_fields() {
        let (manager, _) = manager();
        let first = ProfileKey::generate();

        manager
            .write(|tx| {
                manager.set_profile_key(first.clone(), &bob(), false, tx)?;
                manager.set_profile_name(Some("Bob".into()), None, &bob(), false, tx)
            })
            .unwrap();

        // Same key again is a no-op
        assert!(!manager
            .write(|tx| manager.set_profile_key(first.clone(), &bob(), false, tx))
            .unwrap());

        let second = ProfileKey::generate();
        assert!(manager
            .write(|tx| manager.set_profile_key(second.clone(), &bob(), true, tx))
            .unwrap());

        let record = manager.profile_for_address(&bob()).unwrap().unwrap();
        assert_eq!(record.profile_key.as_ref(), Some(&second));
        assert!(record.given_name.is_none());
    }

    #[test]
    fn test_fill_in_missing_profile_keys_never_overwrites() {
        let (manager, _) = manager();
        let carol = Address::from_phone("+15550003").unwrap();
        let existing = ProfileKey::generate();

        manager
            .write(|tx| manager.set_profile_key(existing.clone(), &bob(), false, tx))
            .unwrap();

        let fresh = ProfileKey::generate();
        let filled = manager
            .write(|tx| {
                manager.fill_in_missing_profile_keys(
                    vec![(bob(), ProfileKey::generate()), (carol.clone(), fresh.clone())],
                    tx,
                )
            })
            .unwrap();

        assert_eq!(filled, 1);
        manager
            .read(|tx| {
                assert_eq!(manager.profile_key_for_address(&bob(), tx)?, Some(existing.clone()));
                assert_eq!(manager.profile_key_for_address(&carol, tx)?, Some(fresh.clone()));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_local_name_change_is_synced_once() {
        let (manager, _) = manager();
        let mut outbound = manager.take_outbound_sync().unwrap();

        for _ in 0..2 {
            manager
                .write(|tx| manager.set_profile_name(Some("Ada".into()), None, &me(), true, tx))
                .unwrap();
        }

        assert!(matches!(
            outbound.try_recv().unwrap(),
            SyncEvent::ProfileNameChanged { .. }
        ));
        assert!(outbound.try_recv().is_err());
        assert_eq!(manager.local_full_name().unwrap().as_deref(), Some("Ada"));
    }

    #[test]
    fn test_inbound_sync_applies_without_echo() {
        let (manager, _) = manager();
        let mut outbound = manager.take_outbound_sync().unwrap();
        let group = GroupId::new(vec![7u8; 16]);

        let applied = manager
            .apply_inbound_sync(SyncEvent::WhitelistGroupAdded {
                group_id: group.clone(),
            })
            .unwrap();

        assert!(applied);
        assert!(outbound.try_recv().is_err());
        assert!(manager
            .read(|tx| manager.is_group_id_in_profile_whitelist(&group, tx))
            .unwrap());
    }

    #[test]
    fn test_late_echo_does_not_undo_newer_local_change() {
        let (manager, _) = manager();
        let mut outbound = manager.take_outbound_sync().unwrap();

        assert!(manager.whitelist_user(&bob()).unwrap());
        assert!(manager.unwhitelist_user(&bob()).unwrap());
        let added = outbound.try_recv().unwrap();
        let removed = outbound.try_recv().unwrap();
        assert_eq!(added, SyncEvent::WhitelistUserAdded { address: bob() });

        assert!(!manager.apply_inbound_sync(added).unwrap());
        assert!(!manager
            .read(|tx| manager.is_user_in_profile_whitelist(&bob(), tx))
            .unwrap());

        assert!(!manager.apply_inbound_sync(removed).unwrap());

        // Both echoes consumed; a later change from another device applies
        assert!(manager
            .apply_inbound_sync(SyncEvent::WhitelistUserAdded { address: bob() })
            .unwrap());
        assert!(manager
            .read(|tx| manager.is_user_in_profile_whitelist(&bob(), tx))
            .unwrap());
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let (manager, _) = manager();
        let manager = Arc::new(manager);
        let mut outbound = manager.take_outbound_sync().unwrap();
        let peers: Arc<Vec<(Address, ProfileKey)>> = Arc::new(
            (0..32u128)
                .map(|n| (Address::from_uuid(Uuid::from_u128(0x1000 + n)), ProfileKey::generate()))
                .collect(),
        );

        let writers = (0..4).map(|w| {
            let manager = Arc::clone(&manager);
            let peers = Arc::clone(&peers);
            std::thread::spawn(move || {
                for (address, key) in peers.iter().skip(w).step_by(4) {
                    manager
                        .write(|tx| manager.set_profile_key(key.clone(), address, false, tx))
                        .unwrap();
                    assert!(manager.whitelist_user(address).unwrap());
                }
            })
        });
        let readers = (0..4).map(|_| {
            let manager = Arc::clone(&manager);
            let peers = Arc::clone(&peers);
            std::thread::spawn(move || {
                for _ in 0..20 {
                    for (address, key) in peers.iter() {
                        let record = manager.profile_for_address(address).unwrap();
                        if let Some(found) = record.as_ref().and_then(|r| r.profile_key.as_ref()) {
                            assert_eq!(found, key);
                        }
                        manager
                            .read(|tx| manager.is_user_in_profile_whitelist(address, tx))
                            .unwrap();
                    }
                }
            })
        });

        let handles: Vec<_> = writers.chain(readers).collect();
        for handle in handles {
            handle.join().unwrap();
        }

        manager
            .read(|tx| {
                assert_eq!(manager.profile_whitelist(tx)?.len(), peers.len());
                for (address, key) in peers.iter() {
                    assert_eq!(manager.profile_key_for_address(address, tx)?.as_ref(), Some(key));
                    assert!(manager.is_user_in_profile_whitelist(address, tx)?);
                }
                Ok(())
            })
            .unwrap();

        let mut synced = 0;
        while outbound.try_recv().is_ok() {
            synced += 1;
        }
        assert_eq!(synced, peers.len());
    }

    #[test]
    fn test_update_with_encrypted_name() {
        let (manager, _) = manager();
        let key = ProfileKey::generate();
        manager
            .write(|tx| manager.set_profile_key(key.clone(), &bob(), false, tx))
            .unwrap();

        let ciphertext = crypto::encrypt_name(&key, Some("Bob"), Some("Builder")).unwrap();
        let record = manager
            .update_profile_for_address_with(
                &bob(),
                Some(ciphertext.as_slice()),
                Some("bob.01".into()),
                true,
                Some("avatars/b".into()),
            )
            .unwrap();

        assert_eq!(record.full_name().as_deref(), Some("Bob Builder"));
        assert_eq!(record.avatar_url_path.as_deref(), Some("avatars/b"));
        assert!(record.is_uuid_capable);
        assert!(record.last_fetch_at.is_some());

        let unknown = Address::from_uuid(Uuid::from_u128(0xC0));
        let result = manager.update_profile_for_address_with(&unknown, Some(ciphertext.as_slice()), None, false, None);
        assert!(matches!(result, Err(Error::DecryptFailure(_))));
    }

    #[tokio::test]
    async fn test_update_local_profile_uploads_sealed_envelope() {
        let (manager, network) = manager();

        let record = manager
            .update_local_profile(LocalProfileUpdate {
                given_name: Some("Ada".into()),
                family_name: Some("Lovelace".into()),
                avatar: AvatarChange::Set(PNG.to_vec()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(record
            .avatar_url_path
            .as_deref()
            .unwrap()
            .starts_with(AVATAR_PATH_PREFIX));
        assert_eq!(
            manager.local_profile_avatar_image().unwrap().unwrap().format(),
            crate::profiles::ImageFormat::Png
        );

        let uploads = network.uploads.lock().clone();
        assert_eq!(uploads.len(), 1);
        let opened = ProfileEnvelope::from_bytes(&uploads[0])
            .unwrap()
            .open(Some(&manager.local_profile_key().unwrap()))
            .unwrap();
        assert_eq!(opened.given_name.as_deref(), Some("Ada"));
        assert_eq!(opened.avatar.as_deref(), Some(PNG));
    }

    #[tokio::test]
    async fn test_update_local_profile_rejects_unknown_avatar_format() {
        let (manager, network) = manager();

        let result = manager
            .update_local_profile(LocalProfileUpdate {
                avatar: AvatarChange::Set(b"not an image".to_vec()),
                ..Default::default()
            })
            .await;

        assert!(matches!(result, Err(Error::InvalidProfile(_))));
        assert!(network.uploads.lock().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_makes_fetching_unavailable() {
        let (manager, _) = manager();
        manager.shutdown();

        assert!(manager.is_shut_down());
        let result = manager.fetch_profile(&bob(), FetchOptions::default()).await;
        assert!(matches!(result, Err(Error::Unavailable)));
    }

    #[test]
    fn test_usable_as_trait_object() {
        let (manager, _) = manager();
        let service: Arc<dyn ProfileService> = Arc::new(manager);

        assert!(service.whitelist_user(&bob()).unwrap());
        assert!(service.may_share_profile_with(&bob().into()).unwrap());
        assert_eq!(service.local_address(), &me());
    }
}
