mod error;
pub mod keys;
pub mod records;
pub mod schema;
pub mod sources;
mod upgrades;

pub use error::{DbError, ErrorKind};
pub use upgrades::{upgrade_db, upgrade_db_with_sources};

use keys::{payment_height_prefix, share_key};
use records::{decode, encode, Payment, Share};
use schema::{
    Bucket, INITIAL_VERSION, LATEST_VERSION, PAYMENT_ID_VERSION, SHARE_ID_VERSION, VERSION_KEY,
};
use upgrades::{check_payment_entry, check_share_entry};

use std::{convert::TryInto, path::Path};

use sled::{
    transaction::{abort, ConflictableTransactionResult},
    Transactional, Tree,
};

/// A handle to the pool database.
///
/// The underlying engine holds a lock on the database directory for as long as the
/// handle lives, so only one process at a time may use it.
pub struct Database {
    db: sled::Db,
}

pub(crate) fn decode_version(value: &[u8]) -> Result<u32, DbError> {
    let bytes: [u8; 4] = value.try_into().map_err(|_| {
        DbError::new(
            ErrorKind::CorruptRecord,
            format!("invalid version marker '{}'", hex::encode(value)),
        )
    })?;
    let version = u32::from_be_bytes(bytes);
    if version < INITIAL_VERSION {
        return Err(DbError::new(
            ErrorKind::CorruptRecord,
            format!("invalid version {}", version),
        ));
    }

    Ok(version)
}

impl Database {
    pub fn open(path: &Path) -> Result<Database, DbError> {
        let db = sled::open(path)?;
        Ok(Database { db })
    }

    // An in-memory database, removed once dropped.
    #[cfg(any(test, feature = "fuzztesting"))]
    pub(crate) fn temporary() -> Result<Database, DbError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Database { db })
    }

    /// Flush everything to disk and release the database.
    pub fn close(self) -> Result<(), DbError> {
        self.db.flush()?;
        Ok(())
    }

    pub(crate) fn flush(&self) -> Result<(), DbError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn has_bucket(&self, bucket: Bucket) -> bool {
        let path = bucket.path();
        self.db
            .tree_names()
            .iter()
            .any(|name| &name[..] == path.as_bytes())
    }

    /// Get an existing bucket. Never creates it.
    pub fn bucket(&self, bucket: Bucket) -> Result<Tree, DbError> {
        if !self.has_bucket(bucket) {
            return Err(DbError::bucket_not_found(&bucket.path()));
        }
        Ok(self.db.open_tree(bucket.path())?)
    }

    pub(crate) fn create_bucket(&self, bucket: Bucket) -> Result<Tree, DbError> {
        Ok(self.db.open_tree(bucket.path())?)
    }

    pub(crate) fn drop_bucket(&self, bucket: Bucket) -> Result<(), DbError> {
        self.db.drop_tree(bucket.path())?;
        Ok(())
    }

    /// Lay out a brand new database at the latest version. Returns false, without
    /// touching anything, if the database already exists.
    pub fn create_buckets(&self) -> Result<bool, DbError> {
        if self.has_bucket(Bucket::Pool) {
            return Ok(false);
        }

        log::info!(
            "Creating a new pool database at version {}",
            LATEST_VERSION
        );
        let buckets = schema::buckets(LATEST_VERSION).unwrap_or(&[]);
        // The root bucket goes last, its presence is what tells a database exists.
        for bucket in buckets.iter().filter(|b| **b != Bucket::Pool) {
            self.create_bucket(*bucket)?;
        }
        let pool = self.create_bucket(Bucket::Pool)?;
        pool.insert(VERSION_KEY, &LATEST_VERSION.to_be_bytes()[..])?;
        self.flush()?;

        Ok(true)
    }

    /// The schema version the database is at.
    pub fn fetch_version(&self) -> Result<u32, DbError> {
        match self.bucket(Bucket::Pool)?.get(VERSION_KEY)? {
            Some(value) => decode_version(&value),
            None => Ok(INITIAL_VERSION),
        }
    }

    /// Store a newly accepted share. Shares are immutable: storing the same share
    /// twice is fine, storing a different one under the same UUID is not.
    pub fn persist_share(&self, share: &Share) -> Result<(), DbError> {
        if share.uuid.is_empty() {
            return Err(DbError::new(
                ErrorKind::InvariantViolation,
                "share has an empty uuid",
            ));
        }
        let shares = self.bucket(Bucket::Shares)?;
        let value = encode(share)?;

        let swapped = shares.compare_and_swap(
            share_key(share),
            None as Option<&[u8]>,
            Some(value.as_slice()),
        )?;
        match swapped {
            Ok(()) => Ok(()),
            Err(e) if e.current.as_deref() == Some(value.as_slice()) => Ok(()),
            Err(_) => Err(DbError::new(
                ErrorKind::InvariantViolation,
                format!("a different share with uuid '{}' already exists", share.uuid),
            )),
        }
    }

    pub fn fetch_share(&self, uuid: &str) -> Result<Option<Share>, DbError> {
        let shares = self.bucket(Bucket::Shares)?;
        match shares.get(uuid.as_bytes())? {
            Some(value) => {
                check_share_entry(uuid.as_bytes(), &value)?;
                decode(&value, &format!("share '{}'", uuid)).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Store a pending payment under its id, replacing a previous version of it.
    /// An archived payment is final and can't be made pending again.
    pub fn persist_payment(&self, payment: &Payment) -> Result<(), DbError> {
        let payments = self.bucket(Bucket::Payments)?;
        let archive = self.bucket(Bucket::PaymentArchive)?;
        let id = payment.id();
        let value = encode(payment)?;

        (&payments, &archive).transaction(
            |(payments, archive)| -> ConflictableTransactionResult<(), DbError> {
                if archive.get(id.as_slice())?.is_some() {
                    return abort(DbError::new(
                        ErrorKind::InvariantViolation,
                        format!("payment {} is already archived", hex::encode(&id)),
                    ));
                }
                payments.insert(id.as_slice(), value.as_slice())?;
                Ok(())
            },
        )?;

        Ok(())
    }

    pub fn fetch_payment(&self, id: &[u8]) -> Result<Option<Payment>, DbError> {
        fetch_payment_from(&self.bucket(Bucket::Payments)?, id)
    }

    pub fn fetch_archived_payment(&self, id: &[u8]) -> Result<Option<Payment>, DbError> {
        fetch_payment_from(&self.bucket(Bucket::PaymentArchive)?, id)
    }

    /// All pending payments, ordered by height then creation time then account.
    pub fn pending_payments(&self) -> Result<Vec<Payment>, DbError> {
        let payments = self.bucket(Bucket::Payments)?;
        decode_payments(payments.iter())
    }

    pub fn pending_payments_at_height(&self, height: u32) -> Result<Vec<Payment>, DbError> {
        let payments = self.bucket(Bucket::Payments)?;
        decode_payments(payments.scan_prefix(payment_height_prefix(height)))
    }

    pub fn archived_payments(&self) -> Result<Vec<Payment>, DbError> {
        let archive = self.bucket(Bucket::PaymentArchive)?;
        decode_payments(archive.iter())
    }

    /// Atomically move a paid payment from the pending bucket to the archive.
    pub fn archive_payment(&self, payment: &Payment) -> Result<(), DbError> {
        if !payment.is_paid() {
            return Err(DbError::new(
                ErrorKind::InvariantViolation,
                format!(
                    "refusing to archive unpaid payment {}",
                    hex::encode(payment.id())
                ),
            ));
        }
        let payments = self.bucket(Bucket::Payments)?;
        let archive = self.bucket(Bucket::PaymentArchive)?;
        let id = payment.id();
        let value = encode(payment)?;

        (&payments, &archive).transaction(
            |(payments, archive)| -> ConflictableTransactionResult<(), DbError> {
                if let Some(archived) = archive.get(id.as_slice())? {
                    if &archived[..] != value.as_slice() {
                        return abort(DbError::new(
                            ErrorKind::InvariantViolation,
                            format!(
                                "a different payment {} is already archived",
                                hex::encode(&id)
                            ),
                        ));
                    }
                }
                if payments.remove(id.as_slice())?.is_none() {
                    return abort(DbError::new(
                        ErrorKind::InvariantViolation,
                        format!("no pending payment {}", hex::encode(&id)),
                    ));
                }
                archive.insert(id.as_slice(), value.as_slice())?;
                Ok(())
            },
        )?;

        Ok(())
    }

    /// Check every record satisfies the invariants of the version the database is at.
    pub fn check_invariants(&self) -> Result<(), DbError> {
        let version = self.fetch_version()?;
        let buckets = schema::buckets(version).ok_or_else(|| {
            DbError::new(
                ErrorKind::UnsupportedVersion,
                format!(
                    "database is at version {} but we only know up to version {}",
                    version, LATEST_VERSION
                ),
            )
        })?;
        for bucket in buckets {
            if !self.has_bucket(*bucket) {
                return Err(DbError::bucket_not_found(&bucket.path()));
            }
        }

        if version >= SHARE_ID_VERSION {
            check_bucket(&self.bucket(Bucket::Shares)?, check_share_entry)?;
        }
        if version >= PAYMENT_ID_VERSION {
            check_bucket(&self.bucket(Bucket::Payments)?, check_payment_entry)?;
            check_bucket(&self.bucket(Bucket::PaymentArchive)?, check_payment_entry)?;
        }
        let pool = self.bucket(Bucket::Pool)?;
        for key in schema::removed_scalars(version) {
            if pool.contains_key(key)? {
                return Err(DbError::new(
                    ErrorKind::InvariantViolation,
                    format!(
                        "unexpected value found for {}",
                        String::from_utf8_lossy(key)
                    ),
                ));
            }
        }

        Ok(())
    }
}

fn fetch_payment_from(bucket: &Tree, id: &[u8]) -> Result<Option<Payment>, DbError> {
    match bucket.get(id)? {
        Some(value) => {
            check_payment_entry(id, &value)?;
            decode(&value, &format!("payment {}", hex::encode(id))).map(Some)
        }
        None => Ok(None),
    }
}

fn decode_payments(entries: sled::Iter) -> Result<Vec<Payment>, DbError> {
    entries
        .map(|entry| {
            let (key, value) = entry?;
            decode(&value, &format!("payment {}", hex::encode(&key)))
        })
        .collect()
}

fn check_bucket(
    bucket: &Tree,
    check: fn(&[u8], &[u8]) -> Result<(), DbError>,
) -> Result<(), DbError> {
    for entry in bucket.iter() {
        let (key, value) = entry?;
        check(&key, &value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzz::builder::{payment, share};

    #[test]
    fn fresh_database_is_latest() {
        let db = Database::temporary().unwrap();
        assert!(!db.has_bucket(Bucket::Pool));
        assert_eq!(
            db.fetch_version().unwrap_err().kind(),
            ErrorKind::BucketNotFound
        );

        assert!(db.create_buckets().unwrap());
        assert_eq!(db.fetch_version().unwrap(), LATEST_VERSION);
        for bucket in schema::buckets(LATEST_VERSION).unwrap() {
            assert!(db.has_bucket(*bucket));
        }
        db.check_invariants().unwrap();

        // Second time is a no-op
        assert!(!db.create_buckets().unwrap());
        assert_eq!(db.fetch_version().unwrap(), LATEST_VERSION);
    }

    #[test]
    fn version_marker_decoding() {
        assert_eq!(decode_version(&3u32.to_be_bytes()).unwrap(), 3);
        assert_eq!(
            decode_version(&0u32.to_be_bytes()).unwrap_err().kind(),
            ErrorKind::CorruptRecord
        );
        assert_eq!(
            decode_version(b"4").unwrap_err().kind(),
            ErrorKind::CorruptRecord
        );
    }

    #[test]
    fn bucket_lookup_does_not_create() {
        let db = Database::temporary().unwrap();
        assert_eq!(
            db.bucket(Bucket::Shares).unwrap_err().kind(),
            ErrorKind::BucketNotFound
        );
        assert!(!db.has_bucket(Bucket::Shares));
    }

    #[test]
    fn shares_are_immutable() {
        let db = Database::temporary().unwrap();
        db.create_buckets().unwrap();

        let s = share("uuid-1", "acct", 1);
        db.persist_share(&s).unwrap();
        db.persist_share(&s).unwrap();
        assert_eq!(db.fetch_share("uuid-1").unwrap(), Some(s.clone()));
        assert_eq!(db.fetch_share("uuid-2").unwrap(), None);

        let mut other = s;
        other.weight = 2.0;
        assert_eq!(
            db.persist_share(&other).unwrap_err().kind(),
            ErrorKind::InvariantViolation
        );
        let empty = share("", "acct", 1);
        assert_eq!(
            db.persist_share(&empty).unwrap_err().kind(),
            ErrorKind::InvariantViolation
        );
    }

    #[test]
    fn payments_lifecycle() {
        let db = Database::temporary().unwrap();
        db.create_buckets().unwrap();

        let first = payment(10, 200, "bob").with_source(crate::fuzz::builder::source(10));
        let second = payment(10, 100, "alice").with_source(crate::fuzz::builder::source(10));
        let third = payment(11, 50, "alice").with_source(crate::fuzz::builder::source(11));
        for p in &[&third, &first, &second] {
            db.persist_payment(p).unwrap();
        }

        assert_eq!(
            db.pending_payments().unwrap(),
            vec![second.clone(), first.clone(), third.clone()]
        );
        assert_eq!(
            db.pending_payments_at_height(10).unwrap(),
            vec![second.clone(), first.clone()]
        );
        assert_eq!(db.fetch_payment(&first.id()).unwrap(), Some(first.clone()));

        // Can't archive until it's paid
        assert_eq!(
            db.archive_payment(&first).unwrap_err().kind(),
            ErrorKind::InvariantViolation
        );
        let mut paid = first.clone();
        paid.paid_on_height = 20;
        paid.transaction_id = "c0ffee".to_string();
        db.archive_payment(&paid).unwrap();
        assert_eq!(db.fetch_payment(&first.id()).unwrap(), None);
        assert_eq!(db.fetch_archived_payment(&paid.id()).unwrap(), Some(paid.clone()));
        assert_eq!(db.archived_payments().unwrap(), vec![paid.clone()]);

        // Not pending anymore, archiving it again aborts without touching the archive
        assert_eq!(
            db.archive_payment(&paid).unwrap_err().kind(),
            ErrorKind::InvariantViolation
        );
        assert_eq!(db.archived_payments().unwrap().len(), 1);

        // Nor can it become pending again
        assert_eq!(
            db.persist_payment(&paid).unwrap_err().kind(),
            ErrorKind::InvariantViolation
        );
        assert_eq!(
            db.persist_payment(&first).unwrap_err().kind(),
            ErrorKind::InvariantViolation
        );
        assert_eq!(
            db.pending_payments().unwrap(),
            vec![second.clone(), third.clone()]
        );

        db.check_invariants().unwrap();
    }

    #[test]
    fn archived_payments_are_final() {
        let db = Database::temporary().unwrap();
        db.create_buckets().unwrap();

        let mut paid = payment(10, 200, "bob").with_source(crate::fuzz::builder::source(10));
        paid.paid_on_height = 20;
        paid.transaction_id = "c0ffee".to_string();
        db.persist_payment(&paid).unwrap();
        db.archive_payment(&paid).unwrap();

        // Sneak a pending copy back in, paid by another transaction
        let mut other = paid.clone();
        other.transaction_id = "f00d".to_string();
        db.bucket(Bucket::Payments)
            .unwrap()
            .insert(other.id(), encode(&other).unwrap())
            .unwrap();

        assert_eq!(
            db.archive_payment(&other).unwrap_err().kind(),
            ErrorKind::InvariantViolation
        );
        // Nothing moved
        assert_eq!(db.fetch_archived_payment(&paid.id()).unwrap(), Some(paid.clone()));
        assert_eq!(db.fetch_payment(&other.id()).unwrap(), Some(other.clone()));

        // The very same record can still be archived over itself
        db.bucket(Bucket::Payments)
            .unwrap()
            .insert(paid.id(), encode(&paid).unwrap())
            .unwrap();
        db.archive_payment(&paid).unwrap();
        assert_eq!(db.pending_payments().unwrap(), vec![]);
        assert_eq!(db.archived_payments().unwrap(), vec![paid]);
    }

    #[test]
    fn fetch_detects_mis_keyed_records() {
        let db = Database::temporary().unwrap();
        db.create_buckets().unwrap();
        let s = share("uuid-1", "acct", 1);
        db.bucket(Bucket::Shares)
            .unwrap()
            .insert("uuid-2", encode(&s).unwrap())
            .unwrap();

        assert_eq!(
            db.fetch_share("uuid-2").unwrap_err().kind(),
            ErrorKind::InvariantViolation
        );
        assert_eq!(
            db.check_invariants().unwrap_err().kind(),
            ErrorKind::InvariantViolation
        );
    }
}
