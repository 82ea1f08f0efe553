//! Shared serde helpers for configuration

/// Serialize a `Duration` as whole seconds
///
/// ```ignore
/// #[serde(with = "cvdr_core::config::serde_utils::duration_secs")]
/// log_files_delete_threshold: Duration,
/// ```
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Threshold {
        #[serde(with = "duration_secs")]
        max_age: Duration,
    }

    #[test]
    fn test_duration_as_seconds_in_toml() {
        let value = Threshold {
            max_age: Duration::from_secs(604_800),
        };
        let text = toml::to_string(&value).unwrap();
        assert_eq!(text.trim(), "max_age = 604800");

        let parsed: Threshold = toml::from_str("max_age = 60").unwrap();
        assert_eq!(parsed.max_age, Duration::from_secs(60));
    }
}
