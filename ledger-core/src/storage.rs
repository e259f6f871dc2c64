//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Account rows (key: account_id)
//! - `entries` - Append-only audit log (key: entry_id)
//! - `indices` - Secondary indices: account -> entries, unique external references
//! - `idempotency` - Bounded-retention request/response cache (key: external_reference)
//! - `reservations` - Pending-debit workflow rows (key: reservation_id)
//! - `meta` - Advisory leases for single-flight sweeps
//!
//! The `indices` column family carries the uniqueness constraint on
//! `external_reference`: registration of a reference and the writes it
//! describes commit in one `WriteBatch`, serialized through a store-level
//! guard, so exactly one of two racing writers wins and the loser observes
//! [`Error::DuplicateReference`].

use crate::{
    error::{Error, Result},
    types::{Account, AccountId, IdempotencyRecord, LedgerEntry, Reservation, ReservationStatus},
    Config,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, IteratorMode, Options, WriteBatch, DB,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_ENTRIES: &str = "entries";
const CF_INDICES: &str = "indices";
const CF_IDEMPOTENCY: &str = "idempotency";
const CF_RESERVATIONS: &str = "reservations";
const CF_META: &str = "meta";

/// Prefix for unique external-reference registrations in `indices`
const XREF_PREFIX: &[u8] = b"xref|";

/// Advisory lease row stored in `meta`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,

    /// Serializes external-reference registration so check-and-insert is
    /// atomic at the store level, not merely in application code
    ref_guard: Mutex<()>,

    /// Serializes lease read-modify-write cycles
    lease_guard: Mutex<()>,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_level_zero_file_num_compaction_trigger(
            config.rocksdb.level0_file_num_compaction_trigger,
        );

        // Universal compaction for write-heavy workload
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        // Column family descriptors
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_accounts()),
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_entries()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_IDEMPOTENCY, Self::cf_options_idempotency()),
            ColumnFamilyDescriptor::new(CF_RESERVATIONS, Self::cf_options_reservations()),
            ColumnFamilyDescriptor::new(CF_META, Self::cf_options_meta()),
        ];

        // Open database
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB with 6 column families");

        Ok(Self {
            db: Arc::new(db),
            ref_guard: Mutex::new(()),
            lease_guard: Mutex::new(()),
        })
    }

    // Column family options

    fn cf_options_accounts() -> Options {
        let mut opts = Options::default();
        // Account rows are hot, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_entries() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        // Point lookups on external references benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_idempotency() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_reservations() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_meta() -> Options {
        Options::default()
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Account operations

    /// Put account row (unbatched; used for provisioning)
    pub fn put_account(&self, account: &Account) -> Result<()> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let key = account.account_id.as_str().as_bytes();
        let value = bincode::serialize(account)?;

        self.db.put_cf(cf, key, &value)?;

        Ok(())
    }

    /// Get account, erroring when absent
    pub fn get_account(&self, account_id: &AccountId) -> Result<Account> {
        self.try_get_account(account_id)?
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))
    }

    /// Get account if it exists
    pub fn try_get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let key = account_id.as_str().as_bytes();

        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // Entry operations

    /// Commit one mutation: entry, updated account row, indices, and the
    /// optional idempotency record, all in a single atomic batch
    ///
    /// When the entry carries an external reference, its uniqueness is
    /// checked and registered under the store guard; a racing writer with
    /// the same reference gets [`Error::DuplicateReference`] and no write.
    pub fn append_entry_atomic(
        &self,
        account: &Account,
        entry: &LedgerEntry,
        idempotency: Option<&IdempotencyRecord>,
    ) -> Result<()> {
        let mut batch = WriteBatch::default();

        // 1. Entry
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        batch.put_cf(cf_entries, entry.entry_id.as_bytes(), bincode::serialize(entry)?);

        // 2. Account row
        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        batch.put_cf(
            cf_accounts,
            account.account_id.as_str().as_bytes(),
            bincode::serialize(account)?,
        );

        // 3. Index: account || entry_id -> empty
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let idx_key = Self::index_key_account_entry(&entry.account_id, entry.entry_id);
        batch.put_cf(cf_indices, &idx_key, []);

        // 4. Idempotency record (cache of the first response)
        if let Some(record) = idempotency {
            let cf_idem = self.cf_handle(CF_IDEMPOTENCY)?;
            batch.put_cf(
                cf_idem,
                record.external_reference.as_bytes(),
                bincode::serialize(record)?,
            );
        }

        match &entry.external_reference {
            Some(reference) => {
                // 5. Unique registration: xref|reference -> entry_id
                let xref_key = Self::index_key_external_reference(reference);
                batch.put_cf(cf_indices, &xref_key, entry.entry_id.as_bytes());

                // Check-and-commit under the guard; this is the tie-break
                // between two writers racing on the same reference.
                let _guard = self.ref_guard.lock();
                if self.db.get_cf(cf_indices, &xref_key)?.is_some() {
                    return Err(Error::DuplicateReference(reference.clone()));
                }
                self.db.write(batch)?;
            }
            None => {
                self.db.write(batch)?;
            }
        }

        tracing::debug!(
            entry_id = %entry.entry_id,
            account_id = %entry.account_id,
            delta = entry.delta,
            reason = %entry.reason,
            "Entry appended"
        );

        Ok(())
    }

    /// Commit a transfer: both account rows and both entries in one batch
    pub fn apply_transfer_atomic(
        &self,
        source: &Account,
        debit: &LedgerEntry,
        dest: &Account,
        credit: &LedgerEntry,
    ) -> Result<()> {
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        let cf_indices = self.cf_handle(CF_INDICES)?;

        let mut batch = WriteBatch::default();

        batch.put_cf(cf_entries, debit.entry_id.as_bytes(), bincode::serialize(debit)?);
        batch.put_cf(cf_entries, credit.entry_id.as_bytes(), bincode::serialize(credit)?);

        batch.put_cf(
            cf_accounts,
            source.account_id.as_str().as_bytes(),
            bincode::serialize(source)?,
        );
        batch.put_cf(
            cf_accounts,
            dest.account_id.as_str().as_bytes(),
            bincode::serialize(dest)?,
        );

        batch.put_cf(
            cf_indices,
            &Self::index_key_account_entry(&debit.account_id, debit.entry_id),
            [],
        );
        batch.put_cf(
            cf_indices,
            &Self::index_key_account_entry(&credit.account_id, credit.entry_id),
            [],
        );

        self.db.write(batch)?;

        tracing::debug!(
            source = %source.account_id,
            dest = %dest.account_id,
            amount = credit.delta,
            "Transfer applied"
        );

        Ok(())
    }

    /// Get entry by ID
    pub fn get_entry(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>> {
        let cf = self.cf_handle(CF_ENTRIES)?;

        match self.db.get_cf(cf, entry_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Get all entries for an account, in insertion order
    pub fn get_account_entries(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;

        let prefix = Self::index_key_account_entry_prefix(account_id);
        let iter = self.db.iterator_cf(
            cf_indices,
            IteratorMode::From(prefix.as_slice(), rocksdb::Direction::Forward),
        );

        let mut entries = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }

            // Entry id is the trailing 16 bytes of the index key
            if key.len() >= prefix.len() + 16 {
                let entry_id_bytes: [u8; 16] = key[key.len() - 16..]
                    .try_into()
                    .map_err(|_| Error::Storage("Malformed index key".to_string()))?;
                let entry_id = Uuid::from_bytes(entry_id_bytes);

                let entry = self.get_entry(entry_id)?.ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "Index references missing entry {}",
                        entry_id
                    ))
                })?;
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    /// Resolve an external reference to the entry that consumed it
    pub fn lookup_external_reference(&self, reference: &str) -> Result<Option<Uuid>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let key = Self::index_key_external_reference(reference);

        match self.db.get_cf(cf, &key)? {
            Some(value) => {
                let bytes: [u8; 16] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("Malformed external reference value".to_string()))?;
                Ok(Some(Uuid::from_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    // Idempotency cache operations

    /// Get cached idempotency record
    pub fn get_idempotency(&self, reference: &str) -> Result<Option<IdempotencyRecord>> {
        let cf = self.cf_handle(CF_IDEMPOTENCY)?;

        match self.db.get_cf(cf, reference.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Delete expired idempotency records, returning how many were purged
    ///
    /// Safe to run at any time: the unique reference registration in
    /// `indices` outlives the cache and keeps replays from re-crediting.
    pub fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<usize> {
        let cf = self.cf_handle(CF_IDEMPOTENCY)?;

        let mut batch = WriteBatch::default();
        let mut purged = 0usize;

        let iter = self.db.iterator_cf(cf, IteratorMode::Start);
        for item in iter {
            let (key, value) = item?;
            let record: IdempotencyRecord = bincode::deserialize(&value)?;
            if record.is_expired(now) {
                batch.delete_cf(cf, &key);
                purged += 1;
            }
        }

        if purged > 0 {
            self.db.write(batch)?;
        }

        Ok(purged)
    }

    // Reservation operations

    /// Put reservation row (insert or update)
    pub fn put_reservation(&self, reservation: &Reservation) -> Result<()> {
        let cf = self.cf_handle(CF_RESERVATIONS)?;
        let value = bincode::serialize(reservation)?;

        self.db
            .put_cf(cf, reservation.reservation_id.as_bytes(), &value)?;

        Ok(())
    }

    /// Get reservation by ID
    pub fn get_reservation(&self, reservation_id: Uuid) -> Result<Option<Reservation>> {
        let cf = self.cf_handle(CF_RESERVATIONS)?;

        match self.db.get_cf(cf, reservation_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// List debited reservations created before `cutoff`
    ///
    /// The reservations column family is small and ephemeral, so a filtered
    /// scan is sufficient for the recovery sweep.
    pub fn list_stale_debited(&self, cutoff: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let cf = self.cf_handle(CF_RESERVATIONS)?;

        let mut stale = Vec::new();
        let iter = self.db.iterator_cf(cf, IteratorMode::Start);
        for item in iter {
            let (_, value) = item?;
            let reservation: Reservation = bincode::deserialize(&value)?;
            if reservation.status == ReservationStatus::Debited && reservation.created_at < cutoff {
                stale.push(reservation);
            }
        }

        Ok(stale)
    }

    /// Delete terminal reservations resolved before `cutoff`
    pub fn purge_resolved_reservations(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cf = self.cf_handle(CF_RESERVATIONS)?;

        let mut batch = WriteBatch::default();
        let mut purged = 0usize;

        let iter = self.db.iterator_cf(cf, IteratorMode::Start);
        for item in iter {
            let (key, value) = item?;
            let reservation: Reservation = bincode::deserialize(&value)?;
            if reservation.is_terminal()
                && reservation.resolved_at.map_or(false, |t| t < cutoff)
            {
                batch.delete_cf(cf, &key);
                purged += 1;
            }
        }

        if purged > 0 {
            self.db.write(batch)?;
        }

        Ok(purged)
    }

    // Advisory leases (single-flight sweeps)

    /// Try to acquire the named lease for `ttl`
    ///
    /// Succeeds when the lease is free, expired, or already held by the
    /// same holder (renewal). Returns false when another holder owns it.
    pub fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let cf = self.cf_handle(CF_META)?;
        let key = Self::lease_key(name);

        let _guard = self.lease_guard.lock();

        if let Some(value) = self.db.get_cf(cf, &key)? {
            let lease: Lease = bincode::deserialize(&value)?;
            if lease.expires_at > now && lease.holder != holder {
                return Ok(false);
            }
        }

        let lease = Lease {
            holder: holder.to_string(),
            expires_at: now + ttl,
        };
        self.db.put_cf(cf, &key, bincode::serialize(&lease)?)?;

        Ok(true)
    }

    /// Release the named lease if held by `holder`
    pub fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let cf = self.cf_handle(CF_META)?;
        let key = Self::lease_key(name);

        let _guard = self.lease_guard.lock();

        if let Some(value) = self.db.get_cf(cf, &key)? {
            let lease: Lease = bincode::deserialize(&value)?;
            if lease.holder == holder {
                self.db.delete_cf(cf, &key)?;
            }
        }

        Ok(())
    }

    // Index key helpers

    fn index_key_account_entry_prefix(account_id: &AccountId) -> Vec<u8> {
        let mut key = account_id.as_str().as_bytes().to_vec();
        key.push(b'|'); // Separator
        key
    }

    fn index_key_account_entry(account_id: &AccountId, entry_id: Uuid) -> Vec<u8> {
        let mut key = Self::index_key_account_entry_prefix(account_id);
        key.extend_from_slice(entry_id.as_bytes());
        key
    }

    fn index_key_external_reference(reference: &str) -> Vec<u8> {
        let mut key = XREF_PREFIX.to_vec();
        key.extend_from_slice(reference.as_bytes());
        key
    }

    fn lease_key(name: &str) -> Vec<u8> {
        let mut key = b"lease|".to_vec();
        key.extend_from_slice(name.as_bytes());
        key
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let cf_reservations = self.cf_handle(CF_RESERVATIONS)?;

        Ok(StorageStats {
            total_accounts: self.approximate_count(cf_accounts)?,
            total_entries: self.approximate_count(cf_entries)?,
            total_reservations: self.approximate_count(cf_reservations)?,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        // RocksDB property for approximate count
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Approximate number of account rows
    pub total_accounts: u64,
    /// Approximate number of audit log entries
    pub total_entries: u64,
    /// Approximate number of reservation rows
    pub total_reservations: u64,
}
