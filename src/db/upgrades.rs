//! Bring a database written by an older pool version up to the current schema.
//!
//! Each upgrade moves the database exactly one version forward, in a single
//! transaction which also records the new version. Upgrades compute the target
//! state from whatever is on disk rather than assuming a known starting point, so
//! re-running one after a crash is always safe.

use crate::db::{
    decode_version,
    error::{DbError, ErrorKind},
    keys::share_key,
    records::{decode, encode, v2, Share},
    schema::{
        self, Bucket, INITIAL_VERSION, LATEST_VERSION, PAYMENT_ID_VERSION,
        REMOVE_TX_FEE_RESERVE_VERSION, SHARE_ID_VERSION, TX_FEE_RESERVE_KEY, VERSION_KEY,
    },
    sources::{NoSourceIndex, SourceIndex},
    Database,
};

use std::collections::BTreeMap;

use sled::{
    transaction::{ConflictableTransactionResult, TransactionalTree, UnabortableTransactionError},
    IVec, Transactional, Tree,
};

struct Upgrade {
    to: u32,
    description: &'static str,
    apply: fn(&Database, &dyn SourceIndex) -> Result<(), DbError>,
}

// Indexed by the version upgraded from, minus the initial version.
const UPGRADES: &[Upgrade] = &[
    Upgrade {
        to: SHARE_ID_VERSION,
        description: "key shares by their UUID",
        apply: share_id_upgrade,
    },
    Upgrade {
        to: PAYMENT_ID_VERSION,
        description: "key payments by their id and record their source",
        apply: payment_id_upgrade,
    },
    Upgrade {
        to: REMOVE_TX_FEE_RESERVE_VERSION,
        description: "remove the transaction fee reserve",
        apply: remove_tx_fee_reserve_upgrade,
    },
];

/// Where the upgrade process stands.
struct UpgradeState<'a> {
    version: u32,
    db: &'a Database,
}

impl<'a> UpgradeState<'a> {
    fn load(db: &'a Database) -> Result<UpgradeState<'a>, DbError> {
        let version = match db.bucket(Bucket::Pool)?.get(VERSION_KEY)? {
            Some(value) => decode_version(&value)?,
            None => INITIAL_VERSION,
        };
        if version > LATEST_VERSION {
            return Err(DbError::new(
                ErrorKind::UnsupportedVersion,
                format!(
                    "database is at version {} but this build only knows up to version {}",
                    version, LATEST_VERSION
                ),
            ));
        }

        Ok(UpgradeState { version, db })
    }

    fn step(self, sources: &dyn SourceIndex) -> Result<UpgradeState<'a>, DbError> {
        let upgrade = &UPGRADES[(self.version - INITIAL_VERSION) as usize];
        check_buckets(self.db, self.version)?;

        log::info!(
            "Upgrading database from version {} to {}: {}",
            self.version,
            upgrade.to,
            upgrade.description
        );
        (upgrade.apply)(self.db, sources)?;
        self.db.flush()?;

        Ok(UpgradeState {
            version: upgrade.to,
            db: self.db,
        })
    }
}

/// Upgrade the database to the latest version.
///
/// Payments recorded before their source was tracked can't be upgraded by this
/// function, see [upgrade_db_with_sources].
pub fn upgrade_db(db: &Database) -> Result<(), DbError> {
    upgrade_db_with_sources(db, &NoSourceIndex)
}

/// Upgrade the database to the latest version, looking up the source of payments
/// which lack one in `sources`.
///
/// On error the database is left at the last version successfully upgraded to.
pub fn upgrade_db_with_sources(db: &Database, sources: &dyn SourceIndex) -> Result<(), DbError> {
    let mut state = UpgradeState::load(db)?;
    if state.version == LATEST_VERSION {
        log::debug!("Database is at the latest version ({})", LATEST_VERSION);
        return Ok(());
    }

    while state.version < LATEST_VERSION {
        state = state.step(sources)?;
    }
    log::info!("Database upgraded to version {}", state.version);

    Ok(())
}

fn check_buckets(db: &Database, version: u32) -> Result<(), DbError> {
    for bucket in schema::buckets(version).unwrap_or(&[]) {
        if !db.has_bucket(*bucket) {
            return Err(DbError::bucket_not_found(&bucket.path()));
        }
    }
    Ok(())
}

fn put_version(pool: &TransactionalTree, version: u32) -> Result<(), UnabortableTransactionError> {
    pool.insert(VERSION_KEY, &version.to_be_bytes()[..])?;
    Ok(())
}

pub(crate) fn check_share_entry(key: &[u8], value: &[u8]) -> Result<(), DbError> {
    let share: Share = decode(value, &format!("share under key {}", hex::encode(key)))?;
    let id = share_key(&share);
    if id != key {
        return Err(DbError::new(
            ErrorKind::InvariantViolation,
            format!(
                "expected share id ({}) to be the same as its key ({})",
                share.uuid,
                hex::encode(key)
            ),
        ));
    }
    Ok(())
}

// Decodes the lenient shape so that a missing source is reported as such.
pub(crate) fn check_payment_entry(key: &[u8], value: &[u8]) -> Result<(), DbError> {
    let payment: v2::Payment = decode(value, &format!("payment under key {}", hex::encode(key)))?;
    let id = payment.id();
    if id != key {
        return Err(DbError::new(
            ErrorKind::InvariantViolation,
            format!(
                "expected payment id ({}) to be the same as its key ({})",
                hex::encode(&id),
                hex::encode(key)
            ),
        ));
    }
    if payment.source.is_none() {
        return Err(DbError::new(
            ErrorKind::InvariantViolation,
            format!("payment {} has no source", hex::encode(key)),
        ));
    }
    Ok(())
}

/// A record as it must be in the target state of a bucket.
struct Planned {
    value: Vec<u8>,
    // Not stored under this key with these bytes yet
    dirty: bool,
}

/// The writes turning a bucket into its target state.
struct Rekey {
    target: BTreeMap<Vec<u8>, Planned>,
    removals: Vec<IVec>,
}

impl Rekey {
    /// Read the whole bucket and compute where each record belongs. `convert` maps a
    /// stored entry to the key and value it must have in the target state.
    fn plan<F>(bucket: &Tree, mut convert: F) -> Result<Rekey, DbError>
    where
        F: FnMut(&[u8], &[u8]) -> Result<(Vec<u8>, Vec<u8>), DbError>,
    {
        // Stored key -> stored value, both refcounted by the engine
        let mut current: BTreeMap<IVec, IVec> = BTreeMap::new();
        // New key -> (value, the key it was found under)
        let mut target: BTreeMap<Vec<u8>, (Vec<u8>, IVec)> = BTreeMap::new();

        for entry in bucket.iter() {
            let (key, value) = entry?;
            let (new_key, new_value) = convert(&key[..], &value[..])?;
            match target.get(&new_key) {
                Some((existing, origin)) if *existing != new_value => {
                    return Err(DbError::new(
                        ErrorKind::InvariantViolation,
                        format!(
                            "distinct records under keys {} and {} both belong under key {}",
                            hex::encode(origin),
                            hex::encode(&key),
                            hex::encode(&new_key)
                        ),
                    ));
                }
                Some(_) => {
                    log::debug!("Dropping duplicate record under key {}", hex::encode(&key));
                }
                None => {
                    target.insert(new_key, (new_value, key.clone()));
                }
            }
            current.insert(key, value);
        }

        let target: BTreeMap<Vec<u8>, Planned> = target
            .into_iter()
            .map(|(key, (value, _))| {
                let dirty = current
                    .get(key.as_slice())
                    .map_or(true, |stored| &stored[..] != value.as_slice());
                (key, Planned { value, dirty })
            })
            .collect();
        let removals = current
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| !target.contains_key(&key[..]))
            .collect();

        Ok(Rekey { target, removals })
    }

    /// Check the planned state of the bucket satisfies `check`, before writing anything.
    fn verify(&self, check: fn(&[u8], &[u8]) -> Result<(), DbError>) -> Result<(), DbError> {
        for (key, planned) in self.target.iter() {
            check(key, &planned.value)?;
        }
        Ok(())
    }

    fn insertions(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.target
            .iter()
            .filter(|(_, planned)| planned.dirty)
            .map(|(key, planned)| (key.as_slice(), planned.value.as_slice()))
    }

    fn is_noop(&self) -> bool {
        self.removals.is_empty() && self.insertions().next().is_none()
    }

    fn apply(&self, bucket: &TransactionalTree) -> Result<(), UnabortableTransactionError> {
        for key in self.removals.iter() {
            bucket.remove(key.clone())?;
        }
        for (key, value) in self.insertions() {
            bucket.insert(key, value)?;
        }
        Ok(())
    }
}

fn share_id_upgrade(db: &Database, _: &dyn SourceIndex) -> Result<(), DbError> {
    let pool = db.bucket(Bucket::Pool)?;
    let shares = db.bucket(Bucket::Shares)?;

    let rekey = Rekey::plan(&shares, |key, value| {
        let share: Share = decode(value, &format!("share under key {}", hex::encode(key)))?;
        if share.uuid.is_empty() {
            return Err(DbError::new(
                ErrorKind::InvariantViolation,
                format!("share under key {} has an empty uuid", hex::encode(key)),
            ));
        }
        // Only the key changes, the record is kept byte for byte.
        Ok((share_key(&share), value.to_vec()))
    })?;
    rekey.verify(check_share_entry)?;
    log::debug!(
        "Re-keying shares: {} to remove, {} to insert",
        rekey.removals.len(),
        rekey.insertions().count()
    );

    (&pool, &shares).transaction(
        |(pool, shares)| -> ConflictableTransactionResult<(), DbError> {
            rekey.apply(shares)?;
            put_version(pool, SHARE_ID_VERSION)?;
            Ok(())
        },
    )?;

    Ok(())
}

// The key and value a payment found under `key` must have as of version 3.
fn sourced_payment(
    key: &[u8],
    value: &[u8],
    sources: &dyn SourceIndex,
) -> Result<(Vec<u8>, Vec<u8>), DbError> {
    let payment: v2::Payment = decode(value, &format!("payment under key {}", hex::encode(key)))?;
    let id = payment.id();

    if payment.source.is_some() {
        return Ok((id, value.to_vec()));
    }
    let source = sources
        .payment_source(payment.height, &payment.account)
        .ok_or_else(|| {
            DbError::new(
                ErrorKind::InvariantViolation,
                format!(
                    "no source known for the payment to '{}' at height {} created on {}",
                    payment.account, payment.height, payment.created_on
                ),
            )
        })?;

    Ok((id, encode(&payment.with_source(source))?))
}

fn payment_id_upgrade(db: &Database, sources: &dyn SourceIndex) -> Result<(), DbError> {
    let created_archive = !db.has_bucket(Bucket::PaymentArchive);
    if created_archive {
        log::debug!("Creating the payment archive bucket");
    }
    let archive = db.create_bucket(Bucket::PaymentArchive)?;

    let res = rekey_payments(db, &archive, sources);
    if res.is_err() && created_archive {
        if let Err(e) = db.drop_bucket(Bucket::PaymentArchive) {
            log::error!("Error removing the payment archive bucket: {}", e);
        }
    }

    res
}

fn rekey_payments(db: &Database, archive: &Tree, sources: &dyn SourceIndex) -> Result<(), DbError> {
    let pool = db.bucket(Bucket::Pool)?;
    let payments = db.bucket(Bucket::Payments)?;

    let pending = Rekey::plan(&payments, |key, value| sourced_payment(key, value, sources))?;
    pending.verify(check_payment_entry)?;
    let archived = Rekey::plan(archive, |key, value| sourced_payment(key, value, sources))?;
    archived.verify(check_payment_entry)?;
    log::debug!(
        "Re-keying payments: {} to remove, {} to insert. Archived payments: {} to remove, {} to insert",
        pending.removals.len(),
        pending.insertions().count(),
        archived.removals.len(),
        archived.insertions().count()
    );

    (&pool, &payments, archive).transaction(
        |(pool, payments, archive)| -> ConflictableTransactionResult<(), DbError> {
            if !pending.is_noop() {
                pending.apply(payments)?;
            }
            if !archived.is_noop() {
                archived.apply(archive)?;
            }
            put_version(pool, PAYMENT_ID_VERSION)?;
            Ok(())
        },
    )?;

    Ok(())
}

fn remove_tx_fee_reserve_upgrade(db: &Database, _: &dyn SourceIndex) -> Result<(), DbError> {
    let pool = db.bucket(Bucket::Pool)?;
    if pool.contains_key(TX_FEE_RESERVE_KEY)? {
        log::debug!("Removing the transaction fee reserve");
    }

    pool.transaction(|pool| -> ConflictableTransactionResult<(), DbError> {
        pool.remove(TX_FEE_RESERVE_KEY)?;
        put_version(pool, REMOVE_TX_FEE_RESERVE_VERSION)?;
        Ok(())
    })?;

    Ok(())
}
