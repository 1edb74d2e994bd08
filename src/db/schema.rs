//! On-disk layout of the pool database, per schema version.
//!
//! Buckets nest under the root `pool` bucket. The storage engine only knows flat
//! trees, so a nested bucket is the tree named after its full path.

/// The schema version a database created by this build is laid out at.
pub const LATEST_VERSION: u32 = 4;

/// Databases without a version marker predate versioning and are at version 1.
pub const INITIAL_VERSION: u32 = 1;

/// Shares are keyed by their UUID.
pub const SHARE_ID_VERSION: u32 = 2;
/// Payments are keyed by their id, carry a source, and may be archived.
pub const PAYMENT_ID_VERSION: u32 = 3;
/// The transaction fee reserve isn't persisted anymore.
pub const REMOVE_TX_FEE_RESERVE_VERSION: u32 = 4;

/// Scalar keys stored directly under the `pool` bucket.
pub const VERSION_KEY: &[u8] = b"version";
pub const TX_FEE_RESERVE_KEY: &[u8] = b"txfeereserve";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Pool,
    Shares,
    Payments,
    PaymentArchive,
}

impl Bucket {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pool => "pool",
            Self::Shares => "shares",
            Self::Payments => "payments",
            Self::PaymentArchive => "paymentArchive",
        }
    }

    pub fn parent(&self) -> Option<Bucket> {
        match self {
            Self::Pool => None,
            Self::Shares | Self::Payments | Self::PaymentArchive => Some(Self::Pool),
        }
    }

    /// The name of the tree backing this bucket, eg `pool/shares`.
    pub fn path(&self) -> String {
        match self.parent() {
            Some(parent) => format!("{}/{}", parent.path(), self.name()),
            None => self.name().to_string(),
        }
    }
}

const V1_BUCKETS: &[Bucket] = &[Bucket::Pool, Bucket::Shares, Bucket::Payments];
const V3_BUCKETS: &[Bucket] = &[
    Bucket::Pool,
    Bucket::Shares,
    Bucket::Payments,
    Bucket::PaymentArchive,
];

/// The buckets a database at `version` must contain. None for versions we don't know.
pub fn buckets(version: u32) -> Option<&'static [Bucket]> {
    match version {
        1 | 2 => Some(V1_BUCKETS),
        3 | 4 => Some(V3_BUCKETS),
        _ => None,
    }
}

/// Scalars under `pool` that are deprecated as of `version` and must not be present.
pub fn removed_scalars(version: u32) -> &'static [&'static [u8]] {
    if version >= REMOVE_TX_FEE_RESERVE_VERSION {
        &[TX_FEE_RESERVE_KEY]
    } else {
        &[]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_paths() {
        assert_eq!(Bucket::Pool.path(), "pool");
        assert_eq!(Bucket::Shares.path(), "pool/shares");
        assert_eq!(Bucket::PaymentArchive.path(), "pool/paymentArchive");
    }

    #[test]
    fn every_version_has_a_layout() {
        for version in INITIAL_VERSION..=LATEST_VERSION {
            let bkts = buckets(version).expect("Known version");
            assert!(bkts.contains(&Bucket::Pool));
            assert!(bkts.contains(&Bucket::Shares));
        }
        assert!(buckets(0).is_none());
        assert!(buckets(LATEST_VERSION + 1).is_none());
        assert!(!buckets(2).unwrap().contains(&Bucket::PaymentArchive));
        assert!(buckets(3).unwrap().contains(&Bucket::PaymentArchive));
    }
}
