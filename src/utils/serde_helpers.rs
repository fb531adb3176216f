/// 平台行数据的序列化/反序列化辅助模块

use serde::{Deserialize, Deserializer, Serializer};

/// 行 ID：表主键可能是 bigint 也可能是 uuid，统一为字符串
pub mod row_id {
    use super::*;

    pub fn serialize<S>(id: &str, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(id)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum IdValue {
            String(String),
            Signed(i64),
            Unsigned(u64),
        }

        match IdValue::deserialize(deserializer)? {
            IdValue::String(s) => Ok(s),
            IdValue::Signed(n) => Ok(n.to_string()),
            IdValue::Unsigned(n) => Ok(n.to_string()),
        }
    }
}

/// Optional integer that may arrive as a JSON number or as a string
/// (URL fragments carry everything as text).
pub mod lenient_i64 {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum IntValue {
            Int(i64),
            Text(String),
        }

        match Option::<IntValue>::deserialize(deserializer)? {
            None => Ok(None),
            Some(IntValue::Int(n)) => Ok(Some(n)),
            Some(IntValue::Text(s)) if s.trim().is_empty() => Ok(None),
            Some(IntValue::Text(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
