use std::{
    io::{ErrorKind, Write},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Local;
use clap::Args;
use futures::StreamExt;
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{info, warn};

use super::{
    format::{FormatError, Message, OutputTemplate, DEFAULT_FORMAT},
    topics,
};
use crate::{
    client::{
        consumer::{FetchConfig, PartitionConsumer, StartOffset},
        Client,
    },
    record::RecordAndOffset,
};

#[derive(Debug, Args)]
pub struct ConsumeArgs {
    /// topics to consume
    pub topics: Vec<String>,

    /// partition to consume, -1 for all partitions
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub partition: i32,

    /// offset to consume (OffsetNewest=-1, OffsetOldest=-2)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub offset: i64,

    /// the format of output, supported variables:
    /// CreateTime, LogAppendTime, ConsumeTime, Key, Topic, Partition, Offset, Value
    #[arg(long, default_value = DEFAULT_FORMAT)]
    pub format: String,

    /// the maximum amount of time the broker will wait for fetch.min bytes to become available
    #[arg(long = "maxwaittime", default_value = "250ms", value_parser = humantime::parse_duration)]
    pub max_wait_time: Duration,

    /// the minimum number of message bytes to fetch in a request
    #[arg(long = "fetch.min", default_value_t = 1)]
    pub fetch_min: i32,

    /// the default number of message bytes to fetch from the broker in each request
    #[arg(long = "fetch.default", default_value_t = 32768)]
    pub fetch_default: i32,

    /// the maximum number of message bytes to fetch from the broker in a single request, 0 means no limit
    #[arg(long = "fetch.max", default_value_t = 0)]
    pub fetch_max: i32,

    /// how long to wait after failing to read from a partition before trying again
    #[arg(long = "retry.backoff", default_value = "2s", value_parser = humantime::parse_duration)]
    pub retry_backoff: Duration,
}

impl ConsumeArgs {
    pub(super) fn template(&self) -> Result<OutputTemplate, FormatError> {
        self.format.parse()
    }

    fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            min_bytes: self.fetch_min,
            default_bytes: self.fetch_default,
            max_bytes: self.fetch_max,
            max_wait: self.max_wait_time,
            retry_backoff: self.retry_backoff,
        }
    }
}

#[derive(Debug)]
struct ConsumedMessage {
    topic: Arc<str>,
    partition: i32,
    record: RecordAndOffset,
}

pub(super) async fn run(
    client: Arc<Client>,
    args: ConsumeArgs,
    template: OutputTemplate,
    buffer_size: usize,
) -> Result<ExitCode> {
    if args.topics.is_empty() {
        println!("topic is required");
        topics::run(&client).await?;
        return Ok(ExitCode::from(255));
    }

    let (tx, mut rx) = mpsc::channel(buffer_size.max(1));
    let mut tasks = JoinSet::new();

    for topic in &args.topics {
        let partitions = if args.partition >= 0 {
            vec![args.partition]
        } else {
            client
                .partitions(topic)
                .await
                .with_context(|| format!("cannot get partitions of topic {topic}"))?
        };

        let topic: Arc<str> = Arc::from(topic.as_str());
        for partition in partitions {
            let consumer = PartitionConsumer::new(
                client.partition_client(topic.as_ref(), partition),
                StartOffset::from(args.offset),
                args.fetch_config(),
            );
            tasks.spawn(consume_partition(
                consumer,
                Arc::clone(&topic),
                tx.clone(),
            ));
        }
    }
    drop(tx);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            Some(msg) = rx.recv() => {
                if !print_message(&mut stdout, &template, &msg) {
                    return Ok(ExitCode::SUCCESS);
                }
            }
            Some(res) = tasks.join_next() => {
                res.context("partition consumer crashed")??;
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping");
                return Ok(ExitCode::SUCCESS);
            }
        }
    }
}

/// Forward every record of one partition until the receiver is gone.
async fn consume_partition(
    consumer: PartitionConsumer,
    topic: Arc<str>,
    tx: mpsc::Sender<ConsumedMessage>,
) -> Result<()> {
    let partition = consumer.partition();
    let mut stream = consumer.into_stream().boxed();

    while let Some(record) = stream.next().await {
        let record = record
            .with_context(|| format!("cannot consume topic {topic} partition {partition}"))?;

        let msg = ConsumedMessage {
            topic: Arc::clone(&topic),
            partition,
            record,
        };
        if tx.send(msg).await.is_err() {
            break;
        }
    }

    Ok(())
}

/// Write one line, returns `false` once stdout is closed.
fn print_message<W: Write>(out: &mut W, template: &OutputTemplate, msg: &ConsumedMessage) -> bool {
    let record = &msg.record;
    let line = template.render(&Message {
        topic: &msg.topic,
        partition: msg.partition,
        offset: record.offset,
        key: record.record.key.as_deref(),
        value: record.record.value.as_deref(),
        create_time: record.record.timestamp,
        log_append_time: record.log_append_time,
        consume_time: Local::now(),
    });

    match writeln!(out, "{line}").and_then(|_| out.flush()) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::BrokenPipe => false,
        Err(e) => {
            warn!(%e, "cannot write message");
            true
        }
    }
}
