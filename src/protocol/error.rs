//! Error codes returned by brokers.
//!
//! # References
//! - <https://kafka.apache.org/protocol#protocol_error_codes>

use std::io::{Read, Write};

use thiserror::Error;

use super::traits::{ReadError, ReadType, WriteError, WriteType};

macro_rules! error_codes {
    ($($name:ident = $code:literal: $msg:literal,)+) => {
        /// A non-zero error code. Code 0 is represented as `None`.
        #[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum Error {
            $(
                #[error($msg)]
                $name,
            )+

            #[error("Unknown error code: {0}")]
            Unknown(i16),
        }

        impl Error {
            pub fn new(code: i16) -> Option<Self> {
                match code {
                    0 => None,
                    $($code => Some(Self::$name),)+
                    _ => Some(Self::Unknown(code)),
                }
            }

            pub fn code(&self) -> i16 {
                match self {
                    $(Self::$name => $code,)+
                    Self::Unknown(code) => *code,
                }
            }
        }
    };
}

error_codes! {
    UnknownServerError = -1: "The server experienced an unexpected error when processing the request.",
    OffsetOutOfRange = 1: "The requested offset is not within the range of offsets maintained by the server.",
    CorruptMessage = 2: "This message has failed its CRC checksum, exceeds the valid size, has a null key for a compacted topic, or is otherwise corrupt.",
    UnknownTopicOrPartition = 3: "This server does not host this topic-partition.",
    InvalidFetchSize = 4: "The requested fetch size is invalid.",
    LeaderNotAvailable = 5: "There is no leader for this topic-partition as we are in the middle of a leadership election.",
    NotLeaderOrFollower = 6: "For requests intended only for the leader, this error indicates that the broker is not the current leader.",
    RequestTimedOut = 7: "The request timed out.",
    BrokerNotAvailable = 8: "The broker is not available.",
    ReplicaNotAvailable = 9: "The replica is not available for the requested topic-partition.",
    MessageTooLarge = 10: "The request included a message larger than the max message size the server will accept.",
    StaleControllerEpoch = 11: "The controller moved to another broker.",
    OffsetMetadataTooLarge = 12: "The metadata field of the offset request was too large.",
    NetworkException = 13: "The server disconnected before a response was received.",
    CoordinatorLoadInProgress = 14: "The coordinator is loading and hence can't process requests.",
    CoordinatorNotAvailable = 15: "The coordinator is not available.",
    NotCoordinator = 16: "This is not the correct coordinator.",
    InvalidTopicException = 17: "The request attempted to perform an operation on an invalid topic.",
    RecordListTooLarge = 18: "The request included message batch larger than the configured segment size on the server.",
    NotEnoughReplicas = 19: "Messages are rejected since there are fewer in-sync replicas than required.",
    NotEnoughReplicasAfterAppend = 20: "Messages are written to the log, but to fewer in-sync replicas than required.",
    InvalidRequiredAcks = 21: "Produce request specified an invalid value for required acks.",
    IllegalGeneration = 22: "Specified group generation id is not valid.",
    InconsistentGroupProtocol = 23: "The group member's supported protocols are incompatible with those of existing members.",
    InvalidGroupId = 24: "The configured groupId is invalid.",
    UnknownMemberId = 25: "The coordinator is not aware of this member.",
    InvalidSessionTimeout = 26: "The session timeout is not within the range allowed by the broker.",
    RebalanceInProgress = 27: "The group is rebalancing, so a rejoin is needed.",
    InvalidCommitOffsetSize = 28: "The committing offset data size is not valid.",
    TopicAuthorizationFailed = 29: "Topic authorization failed.",
    GroupAuthorizationFailed = 30: "Group authorization failed.",
    ClusterAuthorizationFailed = 31: "Cluster authorization failed.",
    InvalidTimestamp = 32: "The timestamp of the message is out of acceptable range.",
    UnsupportedSaslMechanism = 33: "The broker does not support the requested SASL mechanism.",
    IllegalSaslState = 34: "Request is not valid given the current SASL state.",
    UnsupportedVersion = 35: "The version of API is not supported.",
    TopicAlreadyExists = 36: "Topic with this name already exists.",
    InvalidPartitions = 37: "Number of partitions is below 1.",
    InvalidReplicationFactor = 38: "Replication factor is below 1 or larger than the number of available brokers.",
    InvalidReplicaAssignment = 39: "Replica assignment is invalid.",
    InvalidConfig = 40: "Configuration is invalid.",
    NotController = 41: "This is not the correct controller for this cluster.",
    InvalidRequest = 42: "This most likely occurs because of a request being malformed by the client library or the message was sent to an incompatible broker.",
    UnsupportedForMessageFormat = 43: "The message format version on the broker does not support the request.",
    PolicyViolation = 44: "Request parameters do not satisfy the configured policy.",
    OutOfOrderSequenceNumber = 45: "The broker received an out of order sequence number.",
    DuplicateSequenceNumber = 46: "The broker received a duplicate sequence number.",
    InvalidProducerEpoch = 47: "Producer attempted to produce with an old epoch.",
    InvalidTxnState = 48: "The producer attempted a transactional operation in an invalid state.",
    InvalidProducerIdMapping = 49: "The producer attempted to use a producer id which is not currently assigned to its transactional id.",
    InvalidTransactionTimeout = 50: "The transaction timeout is larger than the maximum value allowed by the broker.",
    ConcurrentTransactions = 51: "The producer attempted to update a transaction while another concurrent operation on the same transaction was ongoing.",
    TransactionCoordinatorFenced = 52: "Indicates that the transaction coordinator sending a WriteTxnMarker is no longer the current coordinator for a given producer.",
    TransactionalIdAuthorizationFailed = 53: "Transactional Id authorization failed.",
    SecurityDisabled = 54: "Security features are disabled.",
    OperationNotAttempted = 55: "The broker did not attempt to execute this operation.",
    KafkaStorageError = 56: "Disk error when trying to access log file on the disk.",
    LogDirNotFound = 57: "The user-specified log directory is not found in the broker config.",
    SaslAuthenticationFailed = 58: "SASL Authentication failed.",
    UnknownProducerId = 59: "The broker could not locate the producer metadata associated with the producer id.",
    ReassignmentInProgress = 60: "A partition reassignment is in progress.",
    DelegationTokenAuthDisabled = 61: "Delegation Token feature is not enabled.",
    DelegationTokenNotFound = 62: "Delegation Token is not found on server.",
    DelegationTokenOwnerMismatch = 63: "Specified Principal is not valid Owner/Renewer.",
    DelegationTokenRequestNotAllowed = 64: "Delegation Token requests are not allowed on PLAINTEXT/1-way SSL channels and on delegation token authenticated channels.",
    DelegationTokenAuthorizationFailed = 65: "Delegation Token authorization failed.",
    DelegationTokenExpired = 66: "Delegation Token is expired.",
    InvalidPrincipalType = 67: "Supplied principalType is not supported.",
    NonEmptyGroup = 68: "The group is not empty.",
    GroupIdNotFound = 69: "The group id does not exist.",
    FetchSessionIdNotFound = 70: "The fetch session ID was not found.",
    InvalidFetchSessionEpoch = 71: "The fetch session epoch is invalid.",
    ListenerNotFound = 72: "There is no listener on the leader broker that matches the listener on which metadata request was processed.",
    TopicDeletionDisabled = 73: "Topic deletion is disabled.",
    FencedLeaderEpoch = 74: "The leader epoch in the request is older than the epoch on the broker.",
    UnknownLeaderEpoch = 75: "The leader epoch in the request is newer than the epoch on the broker.",
    UnsupportedCompressionType = 76: "The requesting client does not support the compression type of given partition.",
    StaleBrokerEpoch = 77: "Broker epoch has changed.",
    OffsetNotAvailable = 78: "The leader high watermark has not caught up from a recent leader election so the offsets cannot be guaranteed to be monotonically increasing.",
    MemberIdRequired = 79: "The group member needs to have a valid member id before actually entering a consumer group.",
    PreferredLeaderNotAvailable = 80: "The preferred leader was not available.",
    GroupMaxSizeReached = 81: "The consumer group has reached its max size.",
    FencedInstanceId = 82: "The broker rejected this static consumer since another consumer with the same group.instance.id has registered with a different member.id.",
    EligibleLeadersNotAvailable = 83: "Eligible topic partition leaders are not available.",
    ElectionNotNeeded = 84: "Leader election not needed for topic partition.",
    NoReassignmentInProgress = 85: "No partition reassignment is in progress.",
    GroupSubscribedToTopic = 86: "Deleting offsets of a topic is forbidden while the consumer group is actively subscribed to it.",
    InvalidRecord = 87: "This record has failed the validation on broker and hence will be rejected.",
    UnstableOffsetCommit = 88: "There are unstable offsets that need to be cleared.",
}

impl<R: Read> ReadType<R> for Option<Error> {
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        Ok(Error::new(i16::read(reader)?))
    }
}

impl<W: Write> WriteType<W> for Option<Error> {
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        self.map(|e| e.code()).unwrap_or_default().write(writer)
    }
}
