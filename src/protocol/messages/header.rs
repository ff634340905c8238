//! Request and response headers.
//!
//! Only the non-flexible header versions exist here: requests always carry header v1 (with client ID), responses
//! header v0.

use std::io::{Read, Write};

use crate::protocol::{
    api_key::ApiKey,
    api_version::ApiVersion,
    traits::{ReadType, WriteType},
};

use super::{ReadVersionedError, ReadVersionedType, WriteVersionedError, WriteVersionedType};

pub const REQUEST_HEADER_VERSION: ApiVersion = ApiVersion(1);
pub const RESPONSE_HEADER_VERSION: ApiVersion = ApiVersion(0);

#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct RequestHeader {
    /// The API key of this request.
    pub request_api_key: ApiKey,

    /// The API version of this request.
    pub request_api_version: ApiVersion,

    /// The correlation ID of this request.
    pub correlation_id: i32,

    /// The client ID string.
    ///
    /// Added in version 1.
    pub client_id: Option<String>,
}

impl<R> ReadVersionedType<R> for RequestHeader
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        let v = version.0;
        assert!(v <= 1);

        Ok(Self {
            request_api_key: ApiKey::from(i16::read(reader)?),
            request_api_version: ApiVersion(i16::read(reader)?),
            correlation_id: i32::read(reader)?,
            client_id: if v >= 1 { ReadType::read(reader)? } else { None },
        })
    }
}

impl<W> WriteVersionedType<W> for RequestHeader
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

        if v < 1 && self.client_id.is_some() {
            return Err(WriteVersionedError::FieldNotAvailable {
                version,
                field: "client_id".to_string(),
            });
        }

        i16::from(self.request_api_key).write(writer)?;
        self.request_api_version.0.write(writer)?;
        self.correlation_id.write(writer)?;

        if v >= 1 {
            self.client_id.write(writer)?;
        }

        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct ResponseHeader {
    /// The correlation ID of this response.
    pub correlation_id: i32,
}

impl<R> ReadVersionedType<R> for ResponseHeader
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0, 0);

        Ok(Self {
            correlation_id: i32::read(reader)?,
        })
    }
}

// only needed to fake brokers in tests
impl<W> WriteVersionedType<W> for ResponseHeader
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert_eq!(version.0, 0);

        self.correlation_id.write(writer)?;
        Ok(())
    }
}
