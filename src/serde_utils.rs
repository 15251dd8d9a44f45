//! Wei-amount encoding for stored records.
//!
//! Values that fit an `u64` are written as plain JSON numbers, matching
//! records produced by earlier revisions; larger amounts are written as
//! decimal strings, since a bare JSON number cannot carry them. Reading
//! accepts numbers, decimal strings and `0x`-hex strings.

use std::fmt;

use serde::de::{Error as DeError, Visitor};
use serde::{Deserializer, Serializer};

pub mod wei {
    use super::*;

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        if let Ok(small) = u64::try_from(*value) {
            serializer.serialize_u64(small)
        } else {
            serializer.collect_str(value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        deserializer.deserialize_any(WeiVisitor)
    }
}

pub mod wei_opt {
    use super::*;
    use serde::Serialize;

    struct Wei(u128);

    impl Serialize for Wei {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            wei::serialize(&self.0, serializer)
        }
    }

    pub fn serialize<S: Serializer>(
        value: &Option<u128>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&Wei(*value)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u128>, D::Error> {
        deserializer.deserialize_option(OptWeiVisitor)
    }

    struct OptWeiVisitor;

    impl<'de> Visitor<'de> for OptWeiVisitor {
        type Value = Option<u128>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a wei amount or null")
        }

        fn visit_none<E: DeError>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: DeError>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
            wei::deserialize(deserializer).map(Some)
        }
    }
}

struct WeiVisitor;

impl<'de> Visitor<'de> for WeiVisitor {
    type Value = u128;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a wei amount as a number or string")
    }

    fn visit_u64<E: DeError>(self, value: u64) -> Result<Self::Value, E> {
        Ok(u128::from(value))
    }

    fn visit_u128<E: DeError>(self, value: u128) -> Result<Self::Value, E> {
        Ok(value)
    }

    fn visit_i64<E: DeError>(self, value: i64) -> Result<Self::Value, E> {
        u128::try_from(value).map_err(|_| E::custom("wei amount cannot be negative"))
    }

    fn visit_str<E: DeError>(self, value: &str) -> Result<Self::Value, E> {
        let parsed = if let Some(hex) = value.strip_prefix("0x") {
            u128::from_str_radix(hex, 16)
        } else {
            value.parse()
        };
        parsed.map_err(|err| E::custom(format!("malformed wei amount: {err}")))
    }
}
