use std::{ffi::OsString, fmt::Display};

use changefeed::types::{KeyStrategy, ValueFormat};
use changefeed_kafka::StartOffset;
use clap::{CommandFactory, Parser, error::ErrorKind};

pub const MENU: &str = "Welcome to changefeed! Please enter the argument for the action you want to perform
1. list-topics - Lists all the topics
2. start-producer <topic> - Reads the stream and produces in topic
3. start-consumer <topic> - Consumes a topic partition
4. start-consumer-group <topic> <group-id> - Consumes using Kafka consumer groups
5. close - Closes the application";

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// One line with id, type, title, user and comment
    Summary,
    /// The complete event as JSON
    Json,
}

impl Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let matched = match self {
            Format::Summary => "summary",
            Format::Json => "json",
        };
        f.write_str(matched)
    }
}

impl From<Format> for ValueFormat {
    fn from(value: Format) -> Self {
        match value {
            Format::Summary => ValueFormat::Summary,
            Format::Json => ValueFormat::Json,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// Messages are not keyed
    None,
    /// Key by wiki database name
    Wiki,
    /// Key by wiki domain
    Domain,
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let matched = match self {
            Key::None => "none",
            Key::Wiki => "wiki",
            Key::Domain => "domain",
        };
        f.write_str(matched)
    }
}

impl From<Key> for KeyStrategy {
    fn from(value: Key) -> Self {
        match value {
            Key::None => KeyStrategy::None,
            Key::Wiki => KeyStrategy::Wiki,
            Key::Domain => KeyStrategy::Domain,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    /// Oldest retained message
    Beginning,
    /// Only messages produced from now on
    End,
}

impl Display for Start {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let matched = match self {
            Start::Beginning => "beginning",
            Start::End => "end",
        };
        f.write_str(matched)
    }
}

impl From<Start> for StartOffset {
    fn from(value: Start) -> Self {
        match value {
            Start::Beginning => StartOffset::Beginning,
            Start::End => StartOffset::End,
        }
    }
}

/// Moves a live change feed into Kafka and reads it back.
#[derive(clap::Parser, Debug)]
#[command(name = "changefeed", version, about, long_about = None)]
pub struct Changefeed {
    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Lists all the topics
    ListTopics,
    /// Reads the stream and produces in topic
    StartProducer {
        /// Topic to produce to
        topic: String,
        /// Partition to produce to
        #[arg(short, long, default_value_t = 0)]
        partition: i32,
        /// Message value format
        #[arg(short, long, default_value_t = Format::Summary)]
        format: Format,
        /// Event field used as message key
        #[arg(short, long, default_value_t = Key::None)]
        key: Key,
    },
    /// Consumes a topic partition
    StartConsumer {
        /// Topic to consume
        topic: String,
        /// Partition to consume
        #[arg(short, long, default_value_t = 0)]
        partition: i32,
        /// Bytes to wait for before a batch is returned
        #[arg(long, default_value_t = 10)]
        min_bytes: usize,
        /// Upper bound of a batch in bytes
        #[arg(long, default_value_t = 1_000_000)]
        max_bytes: usize,
        /// Where to start reading
        #[arg(long, default_value_t = Start::Beginning)]
        from: Start,
    },
    /// Consumes using Kafka consumer groups
    StartConsumerGroup {
        /// Topic to consume
        topic: String,
        /// Consumer group to join
        group_id: String,
        /// Upper bound of a single fetch in bytes
        #[arg(long, default_value_t = 10_000_000)]
        max_bytes: usize,
        /// Commit every offset right after reading it instead of in the background
        #[arg(long)]
        manual_commit: bool,
    },
    /// Closes the application
    Close,
}

/// What the command line asked for
#[derive(Debug)]
pub enum Parsed {
    Run(Action),
    /// No action given
    Menu,
    /// First argument is not an action we know
    UnknownAction,
    /// A known action with required arguments missing
    Usage(&'static str),
    /// Help, version or invalid values, clap renders these itself
    Clap(clap::Error),
}

pub fn parse_from<I, T>(args: I) -> Parsed
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let first = args.get(1).and_then(|a| a.to_str());
    match Changefeed::try_parse_from(&args) {
        Ok(Changefeed { action: Some(action) }) => Parsed::Run(action),
        Ok(Changefeed { action: None }) => Parsed::Menu,
        Err(e) => match e.kind() {
            ErrorKind::MissingRequiredArgument => match first.and_then(usage) {
                Some(usage) => Parsed::Usage(usage),
                None => Parsed::Clap(e),
            },
            ErrorKind::InvalidSubcommand | ErrorKind::UnknownArgument
                if !first.is_some_and(is_action) =>
            {
                Parsed::UnknownAction
            }
            _ => Parsed::Clap(e),
        },
    }
}

fn is_action(name: &str) -> bool {
    Changefeed::command().find_subcommand(name).is_some()
}

fn usage(action: &str) -> Option<&'static str> {
    match action {
        "start-producer" => Some("Usage: changefeed start-producer <topic>. Missing argument."),
        "start-consumer" => Some("Usage: changefeed start-consumer <topic>. Missing argument."),
        "start-consumer-group" => Some(
            "Usage: changefeed start-consumer-group <topic> <group-id>. Missing argument/s.",
        ),
        _ => None,
    }
}
