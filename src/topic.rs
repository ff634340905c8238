use std::collections::BTreeMap;

use crate::protocol::messages::{MetadataResponsePartition, MetadataResponseTopic};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    /// The name of this topic.
    pub name: String,

    /// Partition information, keyed by partition index.
    pub partitions: BTreeMap<i32, Partition>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Partition {
    /// The ID of the leader broker, `-1` during a leader election.
    pub leader_id: i32,

    /// The set of all nodes that host this partition.
    pub replica_nodes: Vec<i32>,

    /// The set of all nodes that are in sync with the leader for this partition.
    pub isr_nodes: Vec<i32>,
}

impl From<MetadataResponsePartition> for Partition {
    fn from(p: MetadataResponsePartition) -> Self {
        Self {
            leader_id: p.leader_id,
            replica_nodes: p.replica_nodes,
            isr_nodes: p.isr_nodes,
        }
    }
}

impl From<MetadataResponseTopic> for Topic {
    fn from(t: MetadataResponseTopic) -> Self {
        Self {
            name: t.name,
            partitions: t
                .partitions
                .into_iter()
                .map(|p| (p.partition_index, Partition::from(p)))
                .collect(),
        }
    }
}

impl Topic {
    /// Partition indexes in ascending order.
    pub fn partition_ids(&self) -> Vec<i32> {
        self.partitions.keys().copied().collect()
    }
}
