use crate::db::{
    records::{encode, v2, PaymentSource, Share},
    schema::{self, Bucket, INITIAL_VERSION, LATEST_VERSION, VERSION_KEY},
    Database,
};

/// Lays out a temporary database the way a given pool version left it.
pub struct PoolDbTestBuilder {
    db: Database,
}

impl PoolDbTestBuilder {
    /// An empty database at `version`. Version 1 databases have no version marker.
    pub fn new(version: u32) -> Self {
        let db = Database::temporary().unwrap();
        let buckets = schema::buckets(version)
            .or_else(|| schema::buckets(LATEST_VERSION))
            .unwrap();
        for bucket in buckets {
            db.create_bucket(*bucket).unwrap();
        }
        let builder = PoolDbTestBuilder { db };

        if version > INITIAL_VERSION {
            builder.version_marker(&version.to_be_bytes())
        } else {
            builder
        }
    }

    pub fn version_marker(self, value: &[u8]) -> Self {
        self.raw(Bucket::Pool, VERSION_KEY, value)
    }

    pub fn bucket(self, bucket: Bucket) -> Self {
        self.db.create_bucket(bucket).unwrap();
        self
    }

    pub fn raw(self, bucket: Bucket, key: &[u8], value: &[u8]) -> Self {
        self.db.bucket(bucket).unwrap().insert(key, value).unwrap();
        self
    }

    pub fn scalar(self, key: &[u8], value: &[u8]) -> Self {
        self.raw(Bucket::Pool, key, value)
    }

    pub fn share(self, key: &[u8], share: &Share) -> Self {
        let value = encode(share).unwrap();
        self.raw(Bucket::Shares, key, &value)
    }

    pub fn payment(self, bucket: Bucket, key: &[u8], payment: &v2::Payment) -> Self {
        let value = encode(payment).unwrap();
        self.raw(bucket, key, &value)
    }

    pub fn build(self) -> Database {
        self.db.flush().unwrap();
        self.db
    }
}

pub fn share(uuid: &str, account: &str, created_on: i64) -> Share {
    Share {
        uuid: uuid.to_string(),
        account: account.to_string(),
        weight: 1.0,
        created_on,
    }
}

/// A pending payment of 1 DCR, without a source.
pub fn payment(height: u32, created_on: i64, account: &str) -> v2::Payment {
    v2::Payment {
        account: account.to_string(),
        estimated_maturity: height + 16,
        height,
        amount: 100_000_000,
        created_on,
        paid_on_height: 0,
        transaction_id: String::new(),
        source: None,
    }
}

pub fn source(height: u32) -> PaymentSource {
    PaymentSource {
        block_hash: format!("{:064x}", height),
        coinbase: format!("{:064x}", u64::from(height) << 32),
    }
}
