//! `Produce` request and response.
//!
//! Version 3 is the first one that carries message format v2 ([KIP-98]).
//!
//! [KIP-98]: https://cwiki.apache.org/confluence/display/KAFKA/KIP-98+-+Exactly+Once+Delivery+and+Transactional+Messaging

use std::io::{Read, Write};

use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    error::Error as ApiError,
    primitives::Records,
    traits::{ReadType, WriteType},
};

use super::{
    read_versioned_array, write_versioned_array, ReadVersionedError, ReadVersionedType,
    RequestBody, WriteVersionedError, WriteVersionedType,
};

#[derive(Debug)]
pub struct ProduceRequestPartitionData {
    /// The partition index.
    pub index: i32,

    /// The record data to be produced.
    pub records: Records,
}

impl<W> WriteVersionedType<W> for ProduceRequestPartitionData
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!((3..=7).contains(&version.0));

        self.index.write(writer)?;
        self.records.write(writer)?;

        Ok(())
    }
}

#[derive(Debug)]
pub struct ProduceRequestTopicData {
    /// The topic name.
    pub name: String,

    /// Each partition to produce to.
    pub partition_data: Vec<ProduceRequestPartitionData>,
}

impl<W> WriteVersionedType<W> for ProduceRequestTopicData
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!((3..=7).contains(&version.0));

        self.name.write(writer)?;
        write_versioned_array(writer, version, Some(&self.partition_data))?;

        Ok(())
    }
}

#[derive(Debug)]
pub struct ProduceRequest {
    /// The transactional ID, or null if the producer is not transactional.
    pub transactional_id: Option<String>,

    /// The number of acknowledgments the producer requires the leader to have received before considering a request
    /// complete.
    ///
    /// Allowed values: 0 for no acknowledgments, 1 for only the leader and -1 for the full ISR.
    pub acks: i16,

    /// The timeout to await a response in milliseconds.
    pub timeout_ms: i32,

    /// Each topic to produce to.
    pub topic_data: Vec<ProduceRequestTopicData>,
}

impl<W> WriteVersionedType<W> for ProduceRequest
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!((3..=7).contains(&version.0));

        self.transactional_id.write(writer)?;
        self.acks.write(writer)?;
        self.timeout_ms.write(writer)?;
        write_versioned_array(writer, version, Some(&self.topic_data))?;

        Ok(())
    }
}

impl RequestBody for ProduceRequest {
    type ResponseBody = ProduceResponse;

    const API_KEY: ApiKey = ApiKey::Produce;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion::new(3), ApiVersion::new(7));
}

#[derive(Debug, PartialEq, Eq)]
pub struct ProduceResponsePartitionResponse {
    /// The partition index.
    pub index: i32,

    /// The error code, or 0 if there was no error.
    pub error: Option<ApiError>,

    /// The base offset.
    pub base_offset: i64,

    /// The timestamp returned by broker after appending the messages.
    ///
    /// -1 unless the topic uses `LogAppendTime`.
    pub log_append_time_ms: i64,

    /// The log start offset.
    ///
    /// Added in version 5.
    pub log_start_offset: Option<i64>,
}

impl<R> ReadVersionedType<R> for ProduceResponsePartitionResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        let v = version.0;
        assert!((3..=7).contains(&v));

        Ok(Self {
            index: i32::read(reader)?,
            error: ApiError::new(i16::read(reader)?),
            base_offset: i64::read(reader)?,
            log_append_time_ms: i64::read(reader)?,
            log_start_offset: (v >= 5).then(|| i64::read(reader)).transpose()?,
        })
    }
}

// only needed to fake brokers in tests
impl<W> WriteVersionedType<W> for ProduceResponsePartitionResponse
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        let v = version.0;
        assert!((3..=7).contains(&v));

        self.index.write(writer)?;
        self.error.write(writer)?;
        self.base_offset.write(writer)?;
        self.log_append_time_ms.write(writer)?;
        if v >= 5 {
            self.log_start_offset.unwrap_or(-1).write(writer)?;
        }

        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ProduceResponseResponse {
    /// The topic name.
    pub name: String,

    /// Each partition that we produced to within the topic.
    pub partition_responses: Vec<ProduceResponsePartitionResponse>,
}

impl<R> ReadVersionedType<R> for ProduceResponseResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert!((3..=7).contains(&version.0));

        Ok(Self {
            name: String::read(reader)?,
            partition_responses: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

impl<W> WriteVersionedType<W> for ProduceResponseResponse
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!((3..=7).contains(&version.0));

        self.name.write(writer)?;
        write_versioned_array(writer, version, Some(&self.partition_responses))?;

        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ProduceResponse {
    /// Each produce response.
    pub responses: Vec<ProduceResponseResponse>,

    /// The duration in milliseconds for which the request was throttled due to a quota violation, or zero if the
    /// request did not violate any quota.
    pub throttle_time_ms: i32,
}

impl<R> ReadVersionedType<R> for ProduceResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert!((3..=7).contains(&version.0));

        Ok(Self {
            responses: read_versioned_array(reader, version)?.unwrap_or_default(),
            throttle_time_ms: i32::read(reader)?,
        })
    }
}

impl<W> WriteVersionedType<W> for ProduceResponse
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!((3..=7).contains(&version.0));

        write_versioned_array(writer, version, Some(&self.responses))?;
        self.throttle_time_ms.write(writer)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::test_utils::{assert_read_versioned, assert_write_versioned};

    #[test]
    fn request_without_records() {
        assert_write_versioned!(
            ProduceRequest {
                transactional_id: None,
                acks: -1,
                timeout_ms: 10_000,
                topic_data: vec![ProduceRequestTopicData {
                    name: "t".to_string(),
                    partition_data: vec![ProduceRequestPartitionData {
                        index: 2,
                        records: Records::default(),
                    }],
                }],
            },
            7,
            [
                0xFF, 0xFF, // transactional id
                0xFF, 0xFF, // acks
                0x00, 0x00, 0x27, 0x10, // timeout
                0x00, 0x00, 0x00, 0x01, 0x00, 0x01, b't', // topic
                0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, // partition
                0x00, 0x00, 0x00, 0x00, // empty record set
            ]
        );
    }

    #[test]
    fn response_v3() {
        assert_read_versioned!(
            ProduceResponse,
            &[
                0x00, 0x00, 0x00, 0x01, 0x00, 0x01, b't', // topic
                0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, // partition
                0x00, 0x00, // no error
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A, // base offset
                0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, // log append time
                0x00, 0x00, 0x00, 0x00, // throttle time
            ],
            3,
            ProduceResponse {
                responses: vec![ProduceResponseResponse {
                    name: "t".to_string(),
                    partition_responses: vec![ProduceResponsePartitionResponse {
                        index: 2,
                        error: None,
                        base_offset: 42,
                        log_append_time_ms: -1,
                        log_start_offset: None,
                    }],
                }],
                throttle_time_ms: 0,
            }
        );
    }

    #[test]
    fn response_v5_with_error() {
        assert_read_versioned!(
            ProduceResponse,
            &[
                0x00, 0x00, 0x00, 0x01, 0x00, 0x01, b't', // topic
                0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // partition
                0x00, 0x0A, // MessageTooLarge
                0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, // base offset
                0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, // log append time
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, // log start offset
                0x00, 0x00, 0x00, 0x05, // throttle time
            ],
            5,
            ProduceResponse {
                responses: vec![ProduceResponseResponse {
                    name: "t".to_string(),
                    partition_responses: vec![ProduceResponsePartitionResponse {
                        index: 0,
                        error: Some(ApiError::MessageTooLarge),
                        base_offset: -1,
                        log_append_time_ms: -1,
                        log_start_offset: Some(3),
                    }],
                }],
                throttle_time_ms: 5,
            }
        );
    }
}
