use std::io::{Read, Write};

use super::{
    read_versioned_array, write_versioned_array, ReadVersionedError, ReadVersionedType,
    RequestBody, WriteVersionedError, WriteVersionedType,
};
use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    error::Error,
    traits::{ReadType, WriteType},
};

#[derive(Debug)]
pub struct MetadataRequest {
    /// The topics to fetch metadata for.
    ///
    /// Requests data for all topics if `None`.
    pub topics: Option<Vec<MetadataRequestTopic>>,

    /// If this is true, the broker may auto-create topics that we requested which do not already exist, if it is
    /// configured to do so.
    ///
    /// Added in version 4.
    pub allow_auto_topic_creation: Option<bool>,
}

impl RequestBody for MetadataRequest {
    type ResponseBody = MetadataResponse;

    const API_KEY: ApiKey = ApiKey::Metadata;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion::new(0), ApiVersion::new(4));
}

impl<W> WriteVersionedType<W> for MetadataRequest
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        let v = version.0;
        assert!(v <= 4);

        if v < 4 && self.allow_auto_topic_creation.is_some() {
            return Err(WriteVersionedError::FieldNotAvailable {
                version,
                field: "allow_auto_topic_creation".to_string(),
            });
        }

        match (v, self.topics.as_deref()) {
            // version 0 has no way to say "all topics" but an empty list
            (0, None) => {
                write_versioned_array::<W, MetadataRequestTopic>(writer, version, Some(&[][..]))?
            }
            (_, topics) => write_versioned_array(writer, version, topics)?,
        }

        if v >= 4 {
            // the broker default is to allow topic creation
            self.allow_auto_topic_creation.unwrap_or(true).write(writer)?;
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct MetadataRequestTopic {
    /// The topic name.
    pub name: String,
}

impl<W> WriteVersionedType<W> for MetadataRequestTopic
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!(version.0 <= 4);
        Ok(self.name.write(writer)?)
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MetadataResponse {
    /// The duration in milliseconds for which the request was throttled due to a quota violation, or zero if the
    /// request did not violate any quota.
    ///
    /// Added in version 3.
    pub throttle_time_ms: Option<i32>,

    /// Each broker in the response.
    pub brokers: Vec<MetadataResponseBroker>,

    /// The cluster ID that responding broker belongs to.
    ///
    /// Added in version 2.
    pub cluster_id: Option<String>,

    /// The ID of the controller broker.
    ///
    /// Added in version 1.
    pub controller_id: Option<i32>,

    /// Each topic in the response.
    pub topics: Vec<MetadataResponseTopic>,
}

impl<R> ReadVersionedType<R> for MetadataResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        let v = version.0;
        assert!(v <= 4);

        let throttle_time_ms = (v >= 3).then(|| i32::read(reader)).transpose()?;
        let brokers = read_versioned_array(reader, version)?.unwrap_or_default();
        let cluster_id = if v >= 2 {
            ReadType::read(reader)?
        } else {
            None
        };
        let controller_id = (v >= 1).then(|| i32::read(reader)).transpose()?;
        let topics = read_versioned_array(reader, version)?.unwrap_or_default();

        Ok(Self {
            throttle_time_ms,
            brokers,
            cluster_id,
            controller_id,
            topics,
        })
    }
}

// this is not technically required for production but helpful for testing
impl<W> WriteVersionedType<W> for MetadataResponse
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        let v = version.0;
        assert!(v <= 4);

        if v >= 3 {
            self.throttle_time_ms.unwrap_or_default().write(writer)?;
        }
        write_versioned_array(writer, version, Some(&self.brokers))?;
        if v >= 2 {
            self.cluster_id.write(writer)?;
        }
        if v >= 1 {
            self.controller_id.unwrap_or(-1).write(writer)?;
        }
        write_versioned_array(writer, version, Some(&self.topics))?;

        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MetadataResponseBroker {
    /// The broker ID.
    pub node_id: i32,

    /// The broker hostname.
    pub host: String,

    /// The broker port.
    pub port: i32,

    /// The rack of the broker, or null if it has not been assigned to a rack.
    ///
    /// Added in version 1.
    pub rack: Option<String>,
}

impl<R> ReadVersionedType<R> for MetadataResponseBroker
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        let v = version.0;
        assert!(v <= 4);

        Ok(Self {
            node_id: i32::read(reader)?,
            host: String::read(reader)?,
            port: i32::read(reader)?,
            rack: if v >= 1 { ReadType::read(reader)? } else { None },
        })
    }
}

impl<W> WriteVersionedType<W> for MetadataResponseBroker
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        let v = version.0;
        assert!(v <= 4);

        self.node_id.write(writer)?;
        self.host.write(writer)?;
        self.port.write(writer)?;
        if v >= 1 {
            self.rack.write(writer)?;
        }

        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MetadataResponseTopic {
    /// The topic error if any.
    pub error: Option<Error>,

    /// The topic name.
    pub name: String,

    /// True if the topic is internal.
    ///
    /// Added in version 1.
    pub is_internal: Option<bool>,

    /// Each partition in the topic.
    pub partitions: Vec<MetadataResponsePartition>,
}

impl<R> ReadVersionedType<R> for MetadataResponseTopic
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        let v = version.0;
        assert!(v <= 4);

        Ok(Self {
            error: Error::new(i16::read(reader)?),
            name: String::read(reader)?,
            is_internal: (v >= 1).then(|| bool::read(reader)).transpose()?,
            partitions: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

impl<W> WriteVersionedType<W> for MetadataResponseTopic
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        let v = version.0;
        assert!(v <= 4);

        self.error.write(writer)?;
        self.name.write(writer)?;
        if v >= 1 {
            self.is_internal.unwrap_or_default().write(writer)?;
        }
        write_versioned_array(writer, version, Some(&self.partitions))?;

        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MetadataResponsePartition {
    /// The partition error if any.
    pub error: Option<Error>,

    /// The partition index.
    pub partition_index: i32,

    /// The ID of the leader broker.
    pub leader_id: i32,

    /// The set of all nodes that host this partition.
    pub replica_nodes: Vec<i32>,

    /// The set of all nodes that are in sync with the leader for this partition.
    pub isr_nodes: Vec<i32>,
}

impl<R> ReadVersionedType<R> for MetadataResponsePartition
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert!(version.0 <= 4);

        Ok(Self {
            error: Error::new(i16::read(reader)?),
            partition_index: i32::read(reader)?,
            leader_id: i32::read(reader)?,
            replica_nodes: ReadType::read(reader)?,
            isr_nodes: ReadType::read(reader)?,
        })
    }
}

impl<W> WriteVersionedType<W> for MetadataResponsePartition
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!(version.0 <= 4);

        self.error.write(writer)?;
        self.partition_index.write(writer)?;
        self.leader_id.write(writer)?;
        self.replica_nodes.write(writer)?;
        self.isr_nodes.write(writer)?;

        Ok(())
    }
}
