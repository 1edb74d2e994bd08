use crate::db::records::Share;

use std::convert::TryInto;

const HEIGHT_LEN: usize = 4;
const CREATED_ON_LEN: usize = 8;

/// A share is stored under its UUID, verbatim.
pub fn share_key(share: &Share) -> Vec<u8> {
    share.uuid.as_bytes().to_vec()
}

/// The key of a payment, in both the live and the archive buckets.
///
/// Height and creation time are fixed width big-endian, so the account takes the whole
/// remainder of the key: no two distinct (height, created_on, account) map to the
/// same key, and keys sort by height, then creation time, then account. Creation
/// times are unix timestamps and never negative.
pub fn payment_id(height: u32, created_on: i64, account: &str) -> Vec<u8> {
    let mut id = Vec::with_capacity(HEIGHT_LEN + CREATED_ON_LEN + account.len());
    id.extend_from_slice(&height.to_be_bytes());
    id.extend_from_slice(&created_on.to_be_bytes());
    id.extend_from_slice(account.as_bytes());
    id
}

/// The first key a payment at `height` can have.
pub fn payment_height_prefix(height: u32) -> [u8; HEIGHT_LEN] {
    height.to_be_bytes()
}

/// Split a payment key back into (height, created_on, account).
pub fn parse_payment_id(id: &[u8]) -> Option<(u32, i64, String)> {
    if id.len() < HEIGHT_LEN + CREATED_ON_LEN {
        return None;
    }
    let (height, rest) = id.split_at(HEIGHT_LEN);
    let (created_on, account) = rest.split_at(CREATED_ON_LEN);
    let height = u32::from_be_bytes(height.try_into().ok()?);
    let created_on = i64::from_be_bytes(created_on.try_into().ok()?);
    let account = String::from_utf8(account.to_vec()).ok()?;

    Some((height, created_on, account))
}
