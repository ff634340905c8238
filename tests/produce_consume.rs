
use std::{
    io::{BufRead, BufReader, Write},
    process::{Child, ChildStdout, Command, Stdio},
    sync::mpsc,
    time::Duration,
};

use regex::Regex;
use tempfile::NamedTempFile;

use crate::test_helpers::maybe_start_logging;

const TOPIC: &str = "kafka-cli-test";

const BIN: &str = env!("CARGO_BIN_EXE_kafka-cli");

/// Kills the wrapped process when dropped.
struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        // the process might have exited already
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// A running `kafka-cli consume`.
struct Consumer {
    _child: KillOnDrop,
    stdout: BufReader<ChildStdout>,
    started: mpsc::Receiver<()>,
}

impl Consumer {
    /// Block until `partitions` partition consumers resolved their start offset.
    fn wait_started(&self, partitions: usize) {
        for _ in 0..partitions {
            self.started
                .recv_timeout(Duration::from_secs(60))
                .expect("consumer did not start");
        }
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.stdout.read_line(&mut line).unwrap();
        line
    }
}

fn spawn_consumer(brokers: &str, args: &[&str]) -> Consumer {
    let mut child = Command::new(BIN)
        .arg(brokers)
        .args(["-v", "consume"])
        .args(args)
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let stdout = child.stdout.take().unwrap();
    let stderr = child.stderr.take().unwrap();

    // keeps draining stderr so the consumer never blocks on a full pipe
    let (tx, started) = mpsc::channel();
    std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            if line.contains("Start consuming") {
                let _ = tx.send(());
            }
        }
    });

    Consumer {
        _child: KillOnDrop(child),
        stdout: BufReader::new(stdout),
        started,
    }
}

/// Partition count of `topic` as printed by `kafka-cli topics`.
fn partition_count(brokers: &str, topic: &str) -> usize {
    let topics = run_ok(brokers, &["topics"]);
    let prefix = format!("{topic} (partitions: ");

    topics
        .lines()
        .find_map(|l| l.strip_prefix(prefix.as_str()))
        .and_then(|rest| rest.strip_suffix(')'))
        .unwrap_or_else(|| panic!("topic {topic} not listed: {topics}"))
        .parse()
        .unwrap()
}

fn produce(brokers: &str, topic: &str, value: &[u8], key: &str) -> String {
    let mut file = tempfile::Builder::new()
        .prefix("kafka-cli")
        .tempfile()
        .unwrap();
    file.write_all(value).unwrap();
    file.flush().unwrap();

    run_ok(brokers, &["produce", topic, path(&file), key])
}

fn path(file: &NamedTempFile) -> &str {
    file.path().to_str().unwrap()
}

fn run_ok(brokers: &str, args: &[&str]) -> String {
    let output = Command::new(BIN).arg(brokers).args(args).output().unwrap();
    assert!(
        output.status.success(),
        "kafka-cli {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn produce_then_consume() {
    maybe_start_logging();
    let test_cfg = maybe_skip_kafka_integration!();
    let brokers = test_cfg.brokers_flag();

    // make sure the topic exists so every partition consumer can report its start
    produce(&brokers, TOPIC, b"warm-up", "key");
    let partitions = partition_count(&brokers, TOPIC);

    let mut consumer = spawn_consumer(&brokers, &[TOPIC]);
    // the consumer starts at the latest offset, anything produced before it looked that up is skipped
    consumer.wait_started(partitions);

    produce(&brokers, TOPIC, b"TEST", "key");

    let line = consumer.read_line();

    let pattern = Regex::new(&format!(
        r"\d{{4}}-\d{{2}}-\d{{2}}T\d{{2}}:\d{{2}}:\d{{2}}\+\d{{2}}:\d{{2}} {TOPIC}\(\d+:\d+\) TEST"
    ))
    .unwrap();
    assert!(pattern.is_match(&line), "unexpected output: {line:?}");
}

#[test]
fn consume_from_earliest_with_custom_format() {
    maybe_start_logging();
    let test_cfg = maybe_skip_kafka_integration!();
    let brokers = test_cfg.brokers_flag();
    // relies on the brokers creating topics on first use
    let topic = format!("kafka-cli-test-{}", uuid::Uuid::new_v4());

    let sent = produce(&brokers, &topic, b"hello", "some-key");
    let sent_pattern = Regex::new(&format!(
        r"^Sent to {topic}, partition: (\d+), offset: (\d+)\n$"
    ))
    .unwrap();
    let captures = sent_pattern
        .captures(&sent)
        .unwrap_or_else(|| panic!("unexpected output: {sent:?}"));
    let (partition, offset) = (&captures[1], &captures[2]);

    let mut consumer = spawn_consumer(
        &brokers,
        &[
            "--offset=-2",
            "--format={{.Topic}} {{.Partition}} {{.Offset}} {{.Key}}={{.Value}}",
            &topic,
        ],
    );

    let line = consumer.read_line();
    assert_eq!(
        line,
        format!("{topic} {partition} {offset} some-key=hello\n")
    );

    assert!(partition_count(&brokers, &topic) > partition.parse().unwrap());
}
