//! `SaslHandshake` and `SaslAuthenticate`.
//!
//! # References
//! - [KIP-43](https://cwiki.apache.org/confluence/display/KAFKA/KIP-43%3A+Kafka+SASL+enhancements)
//! - [KIP-152](https://cwiki.apache.org/confluence/display/KAFKA/KIP-152+-+Improve+diagnostics+for+SASL+authentication+failures)

use std::io::{Read, Write};

use super::{
    ReadVersionedError, ReadVersionedType, RequestBody, WriteVersionedError, WriteVersionedType,
};
use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    error::Error as ApiError,
    traits::{ReadType, WriteType},
};

#[derive(Debug, PartialEq, Eq)]
pub struct SaslHandshakeRequest {
    /// The SASL mechanism chosen by the client, e.g. `PLAIN`.
    pub mechanism: String,
}

impl SaslHandshakeRequest {
    pub fn new(mechanism: &str) -> Self {
        Self {
            mechanism: mechanism.to_string(),
        }
    }
}

impl<W> WriteVersionedType<W> for SaslHandshakeRequest
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!(version.0 <= 1);

        self.mechanism.write(writer)?;
        Ok(())
    }
}

impl RequestBody for SaslHandshakeRequest {
    type ResponseBody = SaslHandshakeResponse;
    const API_KEY: ApiKey = ApiKey::SaslHandshake;
    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion::new(0), ApiVersion::new(1));
}

#[derive(Debug, PartialEq, Eq)]
pub struct SaslHandshakeResponse {
    /// The error code, or 0 if there was no error.
    pub error_code: Option<ApiError>,

    /// The mechanisms enabled in the server.
    pub mechanisms: Vec<String>,
}

impl<R> ReadVersionedType<R> for SaslHandshakeResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert!(version.0 <= 1);

        Ok(Self {
            error_code: ApiError::new(i16::read(reader)?),
            mechanisms: Vec::<String>::read(reader)?,
        })
    }
}

// only needed to fake brokers in tests
impl<W> WriteVersionedType<W> for SaslHandshakeResponse
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!(version.0 <= 1);

        self.error_code.write(writer)?;
        self.mechanisms.write(writer)?;
        Ok(())
    }
}

/// Carries the mechanism's token inside a regular request.
///
/// Only exists if the handshake was done with version 1 or later; with a version 0 handshake the token is sent as a
/// bare frame instead.
#[derive(Debug, PartialEq, Eq)]
pub struct SaslAuthenticateRequest {
    /// The SASL authentication bytes from the client, as defined by the SASL mechanism.
    pub auth_bytes: Vec<u8>,
}

impl SaslAuthenticateRequest {
    pub fn new(auth_bytes: Vec<u8>) -> Self {
        Self { auth_bytes }
    }
}

impl<W> WriteVersionedType<W> for SaslAuthenticateRequest
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!(version.0 <= 1);

        self.auth_bytes.write(writer)?;
        Ok(())
    }
}

impl RequestBody for SaslAuthenticateRequest {
    type ResponseBody = SaslAuthenticateResponse;
    const API_KEY: ApiKey = ApiKey::SaslAuthenticate;
    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion::new(0), ApiVersion::new(1));
}

#[derive(Debug, PartialEq, Eq)]
pub struct SaslAuthenticateResponse {
    /// The error code, or 0 if there was no error.
    pub error_code: Option<ApiError>,

    /// The error message, or null if there was no error.
    pub error_message: Option<String>,

    /// The SASL authentication bytes from the server, as defined by the SASL mechanism.
    pub auth_bytes: Vec<u8>,

    /// Number of milliseconds after which only re-authentication over the existing connection is allowed.
    ///
    /// Added in version 1.
    pub session_lifetime_ms: Option<i64>,
}

impl<R> ReadVersionedType<R> for SaslAuthenticateResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        let v = version.0;
        assert!(v <= 1);

        Ok(Self {
            error_code: ApiError::new(i16::read(reader)?),
            error_message: Option::<String>::read(reader)?,
            auth_bytes: Vec::<u8>::read(reader)?,
            session_lifetime_ms: (v >= 1).then(|| i64::read(reader)).transpose()?,
        })
    }
}

// only needed to fake brokers in tests
impl<W> WriteVersionedType<W> for SaslAuthenticateResponse
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        let v = version.0;
        assert!(v <= 1);

        self.error_code.write(writer)?;
        self.error_message.write(writer)?;
        self.auth_bytes.write(writer)?;
        if v >= 1 {
            self.session_lifetime_ms.unwrap_or_default().write(writer)?;
        }
        Ok(())
    }
}
