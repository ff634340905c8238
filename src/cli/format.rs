//! Output template for consumed messages.
//!
//! Templates use Go template actions such as `{{.Topic}}`. Only plain variable references are supported, anything
//! else is rejected when the template is parsed.
use std::str::FromStr;

use chrono::{DateTime, Local, SecondsFormat, TimeZone, Utc};
use thiserror::Error;

pub const DEFAULT_FORMAT: &str = "{{.ConsumeTime}} {{.Topic}}({{.Partition}}:{{.Offset}}) {{.Value}}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("unclosed action at byte {0}")]
    Unclosed(usize),

    #[error("unsupported action \"{{{{{0}}}}}\", expected a variable like {{{{.Topic}}}}")]
    UnsupportedAction(String),

    #[error(
        "unknown variable \"{0}\", supported: CreateTime, LogAppendTime, ConsumeTime, Key, Topic, Partition, Offset, Value"
    )]
    UnknownVariable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variable {
    CreateTime,
    LogAppendTime,
    ConsumeTime,
    Key,
    Topic,
    Partition,
    Offset,
    Value,
}

impl FromStr for Variable {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CreateTime" => Self::CreateTime,
            "LogAppendTime" => Self::LogAppendTime,
            "ConsumeTime" => Self::ConsumeTime,
            "Key" => Self::Key,
            "Topic" => Self::Topic,
            "Partition" => Self::Partition,
            "Offset" => Self::Offset,
            "Value" => Self::Value,
            other => return Err(FormatError::UnknownVariable(other.to_owned())),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(Variable),
}

/// A consumed message as seen by the template.
#[derive(Debug)]
pub struct Message<'a> {
    pub topic: &'a str,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<&'a [u8]>,
    pub value: Option<&'a [u8]>,
    pub create_time: DateTime<Utc>,

    /// Only set for topics where the broker stamps records.
    pub log_append_time: Option<DateTime<Utc>>,

    pub consume_time: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTemplate {
    segments: Vec<Segment>,
}

impl Default for OutputTemplate {
    /// Same as parsing [`DEFAULT_FORMAT`].
    fn default() -> Self {
        let literal = |s: &str| Segment::Literal(s.to_owned());

        Self {
            segments: vec![
                Segment::Variable(Variable::ConsumeTime),
                literal(" "),
                Segment::Variable(Variable::Topic),
                literal("("),
                Segment::Variable(Variable::Partition),
                literal(":"),
                Segment::Variable(Variable::Offset),
                literal(") "),
                Segment::Variable(Variable::Value),
            ],
        }
    }
}

impl FromStr for OutputTemplate {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = vec![];
        let mut rest = s;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_owned()));
            }

            let action_start = s.len() - rest.len() + start;
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or(FormatError::Unclosed(action_start))?;

            let action = after[..end].trim();
            let name = action
                .strip_prefix('.')
                .filter(|name| !name.is_empty() && name.chars().all(char::is_alphanumeric))
                .ok_or_else(|| FormatError::UnsupportedAction(action.to_owned()))?;
            segments.push(Segment::Variable(name.parse()?));

            rest = &after[end + 2..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_owned()));
        }

        Ok(Self { segments })
    }
}

/// RFC 3339 in local time with second precision and a numeric offset, e.g. `2017-06-01T10:00:00+08:00`.
fn format_time<Tz: TimeZone>(t: &DateTime<Tz>) -> String {
    t.with_timezone(&Local)
        .to_rfc3339_opts(SecondsFormat::Secs, false)
}

impl OutputTemplate {
    /// Render one message, without a trailing newline.
    pub fn render(&self, msg: &Message<'_>) -> String {
        let mut out = String::new();

        for segment in &self.segments {
            let variable = match segment {
                Segment::Literal(s) => {
                    out.push_str(s);
                    continue;
                }
                Segment::Variable(variable) => variable,
            };

            match variable {
                Variable::CreateTime => out.push_str(&format_time(&msg.create_time)),
                Variable::LogAppendTime => {
                    if let Some(t) = &msg.log_append_time {
                        out.push_str(&format_time(t));
                    }
                }
                Variable::ConsumeTime => out.push_str(&format_time(&msg.consume_time)),
                Variable::Key => out.push_str(&String::from_utf8_lossy(msg.key.unwrap_or_default())),
                Variable::Topic => out.push_str(msg.topic),
                Variable::Partition => out.push_str(&msg.partition.to_string()),
                Variable::Offset => out.push_str(&msg.offset.to_string()),
                Variable::Value => {
                    out.push_str(&String::from_utf8_lossy(msg.value.unwrap_or_default()))
                }
            }
        }

        out
    }
}
