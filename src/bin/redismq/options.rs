use redismq::module::delivery::DeliveryOptions;
use redismq::module::options::RedisOptions;
use std::str::FromStr;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(about = "Reliable publish/subscribe messaging on top of Redis streams.")]
pub struct MainOptions {
    /// Log level, scopable to different modules
    ///
    /// Levels: trace, debug, info, warn, error
    #[structopt(
        short,
        long,
        global = true,
        default_value = "info,redis=warn",
        env = "RUST_LOG",
        value_name = "level"
    )]
    pub log: String,

    /// Format of log output [text, compact, json]
    #[structopt(long, global = true, env, default_value = "text")]
    pub log_format: LogFormat,

    #[structopt(flatten)]
    pub redis: RedisOptions,

    #[structopt(flatten)]
    pub delivery: DeliveryOptions,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Text,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Publishes a JSON payload to a topic
    Publish(PublishOptions),
    /// Consumes topics on behalf of a group until interrupted
    Consume(ConsumeOptions),
}

#[derive(Debug, StructOpt)]
pub struct PublishOptions {
    /// Topic to publish to
    pub topic: String,

    /// Payload formatted as JSON
    pub payload: String,

    /// Name used to route the message, defaults to the topic
    #[structopt(long)]
    pub name: Option<String>,

    /// Identifier correlating the message with others
    #[structopt(long)]
    pub correlation_id: Option<String>,

    /// Number of copies to publish
    #[structopt(long, default_value = "1")]
    pub count: usize,
}

#[derive(Debug, StructOpt)]
pub struct ConsumeOptions {
    /// Consumer group to join
    #[structopt(short, long)]
    pub group: String,

    /// Topics to consume
    #[structopt(required = true, min_values = 1)]
    pub topics: Vec<String>,

    /// Reject every message, useful to observe retries and dead-lettering
    #[structopt(long)]
    pub reject: bool,
}
