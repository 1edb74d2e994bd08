use honggfuzz::fuzz;
use pooldb::{
    db::{schema::Bucket, upgrade_db, ErrorKind},
    fuzz::builder::{share, PoolDbTestBuilder},
};

fn main() {
    loop {
        fuzz!(|data: &[u8]| {
            // A version 1 database with a well-formed share and whatever is fed to us
            let db = PoolDbTestBuilder::new(1)
                .share(b"legacy-key", &share("uuid-1", "acct", 1))
                .raw(Bucket::Shares, b"fuzzed", data)
                .build();

            match upgrade_db(&db) {
                Ok(()) => db.check_invariants().unwrap(),
                Err(e) => {
                    assert!(matches!(
                        e.kind(),
                        ErrorKind::CorruptRecord | ErrorKind::InvariantViolation
                    ));
                    assert_eq!(db.fetch_version().unwrap(), 1);
                }
            }
        });
    }
}
