//! Entities stored in the pool database and their wire form.
//!
//! Records are stored as JSON. Every schema version whose record shape differs from
//! the current one keeps its own struct in a versioned module, and upgrades convert
//! explicitly from the old shape to the new one.

use crate::db::{
    error::{DbError, ErrorKind},
    keys::payment_id,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// An accepted unit of proof-of-work, credited to an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub uuid: String,
    pub account: String,
    pub weight: f64,
    #[serde(rename = "createdon")]
    pub created_on: i64,
}

/// The block a payment originates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSource {
    #[serde(rename = "blockhash")]
    pub block_hash: String,
    pub coinbase: String,
}

/// An amount owed (or paid) to an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub account: String,
    #[serde(rename = "estimatedmaturity")]
    pub estimated_maturity: u32,
    pub height: u32,
    /// In atoms
    pub amount: i64,
    #[serde(rename = "createdon")]
    pub created_on: i64,
    #[serde(rename = "paidonheight")]
    pub paid_on_height: u32,
    #[serde(rename = "transactionid")]
    pub transaction_id: String,
    pub source: PaymentSource,
}

impl Payment {
    pub fn id(&self) -> Vec<u8> {
        payment_id(self.height, self.created_on, &self.account)
    }

    pub fn is_paid(&self) -> bool {
        self.paid_on_height > 0 && !self.transaction_id.is_empty()
    }
}

/// Record shapes as of schema version 2.
pub mod v2 {
    use super::{Payment as CurrentPayment, PaymentSource};
    use crate::db::keys::payment_id;

    use serde::{Deserialize, Serialize};

    /// Before version 3 the source of a payment wasn't tracked.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Payment {
        pub account: String,
        #[serde(rename = "estimatedmaturity")]
        pub estimated_maturity: u32,
        pub height: u32,
        pub amount: i64,
        #[serde(rename = "createdon")]
        pub created_on: i64,
        #[serde(rename = "paidonheight")]
        pub paid_on_height: u32,
        #[serde(rename = "transactionid")]
        pub transaction_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub source: Option<PaymentSource>,
    }

    impl Payment {
        pub fn id(&self) -> Vec<u8> {
            payment_id(self.height, self.created_on, &self.account)
        }

        /// The current shape, given the source this payment originates from.
        pub fn with_source(self, source: PaymentSource) -> CurrentPayment {
            CurrentPayment {
                account: self.account,
                estimated_maturity: self.estimated_maturity,
                height: self.height,
                amount: self.amount,
                created_on: self.created_on,
                paid_on_height: self.paid_on_height,
                transaction_id: self.transaction_id,
                source,
            }
        }
    }
}

pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, DbError> {
    serde_json::to_vec(record)
        .map_err(|e| DbError::with_cause(ErrorKind::CorruptRecord, "encoding record", e))
}

/// Decode a stored value. `what` names the record in the error, eg "share 'abcd'".
pub fn decode<T: DeserializeOwned>(value: &[u8], what: &str) -> Result<T, DbError> {
    serde_json::from_slice(value).map_err(|e| {
        DbError::with_cause(
            ErrorKind::CorruptRecord,
            format!("unable to decode {}", what),
            e,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment() -> Payment {
        Payment {
            account: "abc".to_string(),
            estimated_maturity: 12357,
            height: 12345,
            amount: 500_000_000,
            created_on: 1_600_000_000,
            paid_on_height: 0,
            transaction_id: String::new(),
            source: PaymentSource {
                block_hash: "00000000000000001d7fbbd8b6d4ed73".to_string(),
                coinbase: "8c1ab7f4f2be9aa1d6a5de9f25ac4f66".to_string(),
            },
        }
    }

    #[test]
    fn wire_field_names() {
        let json: serde_json::Value =
            serde_json::from_slice(&encode(&payment()).unwrap()).unwrap();
        assert_eq!(json["height"], 12345);
        assert_eq!(json["createdon"], 1_600_000_000i64);
        assert_eq!(json["paidonheight"], 0);
        assert_eq!(json["source"]["blockhash"], "00000000000000001d7fbbd8b6d4ed73");

        let share: Share = decode(
            br#"{"uuid":"u1","account":"abc","weight":1.5,"createdon":42}"#,
            "share",
        )
        .unwrap();
        assert_eq!(share.uuid, "u1");
        assert_eq!(share.created_on, 42);
    }

    #[test]
    fn garbage_is_corrupt_not_default() {
        let garbages: [&[u8]; 4] = [b"", b"{}", b"not json", br#"{"uuid":1}"#];
        for garbage in garbages.iter() {
            let err = decode::<Share>(garbage, "share").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::CorruptRecord);
        }
    }

    #[test]
    fn legacy_payment_without_source() {
        let mut json: serde_json::Value =
            serde_json::from_slice(&encode(&payment()).unwrap()).unwrap();
        json.as_object_mut().unwrap().remove("source");
        let raw = serde_json::to_vec(&json).unwrap();

        // Not a codec error for the legacy shape..
        let legacy: v2::Payment = decode(&raw, "payment").unwrap();
        assert!(legacy.source.is_none());
        assert_eq!(legacy.id(), payment().id());
        // .. but the current shape requires it.
        assert_eq!(
            decode::<Payment>(&raw, "payment").unwrap_err().kind(),
            ErrorKind::CorruptRecord
        );

        let upgraded = legacy.with_source(payment().source);
        assert_eq!(upgraded, payment());
    }

    #[test]
    fn paid_status() {
        let mut p = payment();
        assert!(!p.is_paid());
        p.paid_on_height = 12400;
        assert!(!p.is_paid());
        p.transaction_id = "f00d".to_string();
        assert!(p.is_paid());
    }
}
