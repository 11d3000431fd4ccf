//! Contains the cache entry and its wire form as persisted by the storage engines.
//!
//! Each entry is stored as a JSON object `{"key": ..., "value": ..., "created": ...}` where
//! **created** is an RFC 3339 timestamp in UTC with millisecond precision. As the timestamp is
//! truncated to milliseconds upon creation, decoding and re-encoding an entry yields the very same
//! bytes.
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Represents a cache entry of a service (tenant).
///
/// The value is treated as opaque payload. The creation timestamp is set once when the entry is
/// created and carried along unchanged by updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Contains the key which is unique per service.
    pub key: String,

    /// Contains the opaque value.
    pub value: String,

    /// Contains the id of the service which owns this entry.
    pub service_id: String,

    /// Contains the timestamp of the initial creation.
    pub created: DateTime<Utc>,
}

impl KeyValue {
    /// Creates a new entry which is stamped with the current time.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::storage::KeyValue;
    /// let entry = KeyValue::new("gateway", "token", "abc");
    /// assert_eq!(entry.service_id, "gateway");
    /// assert_eq!(entry.key, "token");
    /// assert_eq!(entry.value, "abc");
    /// ```
    pub fn new(
        service_id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        KeyValue {
            key: key.into(),
            value: value.into(),
            service_id: service_id.into(),
            created: Utc::now().trunc_subsecs(3),
        }
    }

    /// Returns a copy of this entry carrying the given value but the original creation timestamp.
    pub fn with_value(&self, value: impl Into<String>) -> Self {
        KeyValue {
            key: self.key.clone(),
            value: value.into(),
            service_id: self.service_id.clone(),
            created: self.created,
        }
    }

    /// Renders the creation timestamp as it is sent to clients.
    pub fn created_string(&self) -> String {
        self.created.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Encodes this entry into its JSON wire form.
    pub fn encode(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(&StoredEntry {
            key: self.key.clone(),
            value: self.value.clone(),
            created: self.created,
        })?)
    }

    /// Decodes an entry of the given service which has been stored in the given field.
    ///
    /// Fails if the JSON is invalid, if a field is missing or if the embedded key doesn't match
    /// the field name the entry was stored under.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::storage::KeyValue;
    /// let data = r#"{"key":"token","value":"abc","created":"2024-03-01T12:00:00.250Z"}"#;
    /// let entry = KeyValue::decode("gateway", "token", data).unwrap();
    /// assert_eq!(entry.value, "abc");
    /// assert_eq!(entry.encode().unwrap(), data);
    ///
    /// assert_eq!(KeyValue::decode("gateway", "other", data).is_err(), true);
    /// assert_eq!(KeyValue::decode("gateway", "token", "{\"key\":").is_err(), true);
    /// ```
    pub fn decode(service_id: &str, field: &str, data: &str) -> anyhow::Result<Self> {
        let entry: StoredEntry = serde_json::from_str(data)?;
        if entry.key != field {
            return Err(anyhow::anyhow!(
                "The entry stored as '{}' claims to be '{}'",
                field,
                entry.key
            ));
        }

        Ok(KeyValue {
            key: entry.key,
            value: entry.value,
            service_id: service_id.to_owned(),
            created: entry.created,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    value: String,
    #[serde(serialize_with = "write_timestamp", deserialize_with = "read_timestamp")]
    created: DateTime<Utc>,
}

fn write_timestamp<S: Serializer>(
    timestamp: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn read_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let timestamp = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&timestamp)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use crate::storage::KeyValue;

    #[test]
    fn new_entries_survive_encoding() {
        let entry = KeyValue::new("gateway", "token", "{\"user\":\"alice\"}");
        let data = entry.encode().unwrap();

        let decoded = KeyValue::decode("gateway", "token", &data).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.encode().unwrap(), data);
    }

    #[test]
    fn updates_keep_the_creation_timestamp() {
        let entry = KeyValue::new("gateway", "token", "old");
        let updated = entry.with_value("new");

        assert_eq!(updated.value, "new");
        assert_eq!(updated.created, entry.created);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        for data in [
            "",
            "null",
            "{}",
            "[1,2,3]",
            r#"{"key":"token","value":"abc"}"#,
            r#"{"key":"token","value":42,"created":"2024-03-01T12:00:00.000Z"}"#,
            r#"{"key":"token","value":"abc","created":"yesterday"}"#,
        ] {
            assert_eq!(
                KeyValue::decode("gateway", "token", data).is_err(),
                true,
                "{} should be rejected",
                data
            );
        }
    }

    #[test]
    fn offsets_are_normalized_to_utc() {
        let entry = KeyValue::decode(
            "gateway",
            "token",
            r#"{"key":"token","value":"abc","created":"2024-03-01T14:00:00+02:00"}"#,
        )
        .unwrap();

        assert_eq!(entry.created_string(), "2024-03-01T12:00:00.000Z");
    }
}
