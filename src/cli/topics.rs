use std::{io::Write, process::ExitCode};

use anyhow::{Context, Result};

use crate::{client::Client, topic::Topic};

pub(super) async fn run(client: &Client) -> Result<ExitCode> {
    let topics = client
        .list_topics()
        .await
        .context("cannot list topics")?;

    let mut stdout = std::io::stdout().lock();
    write_topics(&mut stdout, topics)?;

    Ok(ExitCode::SUCCESS)
}

/// One `<name> (partitions: <n>)` line per topic, sorted by name.
fn write_topics<W: Write>(out: &mut W, mut topics: Vec<Topic>) -> std::io::Result<()> {
    topics.sort_by(|a, b| a.name.cmp(&b.name));

    for topic in topics {
        writeln!(out, "{} (partitions: {})", topic.name, topic.partitions.len())?;
    }

    out.flush()
}
