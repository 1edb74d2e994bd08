use crate::db::{
    error::{DbError, ErrorKind},
    records::PaymentSource,
};

use std::{collections::BTreeMap, fs, path::Path};

/// Where the origin of payments recorded before sources were tracked can be found.
pub trait SourceIndex {
    fn payment_source(&self, height: u32, account: &str) -> Option<PaymentSource>;
}

/// Knows nothing. Upgrading a database with unsourced payments against it fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSourceIndex;

impl SourceIndex for NoSourceIndex {
    fn payment_source(&self, _: u32, _: &str) -> Option<PaymentSource> {
        None
    }
}

/// The block mined at each height, as exported by the operator.
///
/// Every payment created at a given height originates from the block at that
/// height, so the account is not needed to find it. The file is a JSON object:
/// `{"12345": {"blockhash": "..", "coinbase": ".."}}`.
#[derive(Debug, Default, Clone)]
pub struct BlockSourceIndex {
    blocks: BTreeMap<u32, PaymentSource>,
}

impl BlockSourceIndex {
    pub fn new(blocks: BTreeMap<u32, PaymentSource>) -> BlockSourceIndex {
        BlockSourceIndex { blocks }
    }

    pub fn from_file(path: &Path) -> Result<BlockSourceIndex, DbError> {
        let content = fs::read(path).map_err(|e| {
            DbError::with_cause(
                ErrorKind::Storage,
                format!("reading payment sources file '{}'", path.display()),
                e,
            )
        })?;
        let blocks = serde_json::from_slice(&content).map_err(|e| {
            DbError::with_cause(
                ErrorKind::CorruptRecord,
                format!("parsing payment sources file '{}'", path.display()),
                e,
            )
        })?;

        Ok(BlockSourceIndex { blocks })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl SourceIndex for BlockSourceIndex {
    fn payment_source(&self, height: u32, _: &str) -> Option<PaymentSource> {
        self.blocks.get(&height).cloned()
    }
}
