// src/utils/id_generator.rs
use chrono::{NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

const SUFFIX_LEN: usize = 5;
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyz23456789";

/// Entity kinds that carry a prefixed, date-stamped identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdType {
    User,
    Driver,
    Booking,
    Earning,
}

impl IdType {
    const ALL: [IdType; 4] = [IdType::User, IdType::Driver, IdType::Booking, IdType::Earning];

    pub fn prefix(&self) -> &'static str {
        match self {
            IdType::User => "usr",
            IdType::Driver => "drv",
            IdType::Booking => "bkg",
            IdType::Earning => "ern",
        }
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Decoded form of `{prefix}-{yymmdd}-{suffix}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedId {
    pub id_type: IdType,
    pub issued_on: NaiveDate,
    pub suffix: String,
}

pub struct IdGenerator;

impl IdGenerator {
    pub fn generate(id_type: IdType) -> String {
        Self::generate_on(id_type, Utc::now().date_naive())
    }

    pub fn generate_on(id_type: IdType, day: NaiveDate) -> String {
        let mut rng = rand::rng();
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect();
        format!("{}-{}-{}", id_type.prefix(), day.format("%y%m%d"), suffix)
    }

    pub fn parse_id(id: &str) -> Option<ParsedId> {
        let mut parts = id.splitn(3, '-');
        let (prefix, stamp, suffix) = (parts.next()?, parts.next()?, parts.next()?);

        let id_type = IdType::ALL.into_iter().find(|t| t.prefix() == prefix)?;
        if stamp.len() != 6 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let issued_on = NaiveDate::parse_from_str(&format!("20{}", stamp), "%Y%m%d").ok()?;
        if suffix.len() != SUFFIX_LEN || !suffix.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return None;
        }

        Some(ParsedId {
            id_type,
            issued_on,
            suffix: suffix.to_string(),
        })
    }

    /// True when `id` is well formed and, if given, of the expected kind.
    pub fn validate_id(id: &str, expected: Option<IdType>) -> bool {
        Self::parse_id(id).is_some_and(|parsed| expected.is_none_or(|t| parsed.id_type == t))
    }
}
