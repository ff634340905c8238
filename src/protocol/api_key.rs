//! ApiKey to tag request types.
//!
//! # References
//! - <https://kafka.apache.org/protocol#protocol_api_keys>

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum ApiKey {
    Produce,
    Fetch,
    ListOffsets,
    Metadata,
    SaslHandshake,
    ApiVersions,
    SaslAuthenticate,
    Unknown(i16),
}

impl From<i16> for ApiKey {
    fn from(key: i16) -> Self {
        match key {
            0 => Self::Produce,
            1 => Self::Fetch,
            2 => Self::ListOffsets,
            3 => Self::Metadata,
            17 => Self::SaslHandshake,
            18 => Self::ApiVersions,
            36 => Self::SaslAuthenticate,
            _ => Self::Unknown(key),
        }
    }
}

impl From<ApiKey> for i16 {
    fn from(key: ApiKey) -> Self {
        match key {
            ApiKey::Produce => 0,
            ApiKey::Fetch => 1,
            ApiKey::ListOffsets => 2,
            ApiKey::Metadata => 3,
            ApiKey::SaslHandshake => 17,
            ApiKey::ApiVersions => 18,
            ApiKey::SaslAuthenticate => 36,
            ApiKey::Unknown(code) => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn code_survives_conversion(code: i16) {
            let api_key = ApiKey::from(code);
            assert_eq!(code, i16::from(api_key));
        }

        #[test]
        fn key_survives_conversion(key: ApiKey) {
            // an arbitrary `Unknown(x)` may shadow a known key
            let key = match key {
                ApiKey::Unknown(x) => ApiKey::from(x),
                _ => key,
            };

            assert_eq!(key, ApiKey::from(i16::from(key)));
        }
    }

    #[test]
    fn known_codes() {
        assert_eq!(ApiKey::from(0), ApiKey::Produce);
        assert_eq!(ApiKey::from(18), ApiKey::ApiVersions);
        assert_eq!(ApiKey::from(36), ApiKey::SaslAuthenticate);
        assert_eq!(ApiKey::from(11), ApiKey::Unknown(11));
    }
}
