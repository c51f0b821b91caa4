//! plugin process configs

pub mod cli {
    //! Parse the invocation from environment variables. CNI plugins are
    //! exec'd with no arguments, everything arrives through `CNI_*` vars.

    /// default log filter. Can use this argument or CNI_LOG env var
    pub const DEFAULT_CNI_LOG: &str = "warn";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub const DEFAULT_LOG_FORMAT: &str = "standard";

    use std::path::PathBuf;

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq, Default)]
    #[clap(author, about, long_about = None)]
    /// parses from cli & environment var
    pub struct Config {
        /// operation to run: ADD, DEL, CHECK or VERSION
        #[clap(long, env = "CNI_COMMAND")]
        pub command: Option<String>,
        /// id of the container being attached
        #[clap(long, env = "CNI_CONTAINERID")]
        pub container_id: Option<String>,
        /// path to the container's network namespace
        #[clap(long, env = "CNI_NETNS")]
        pub netns: Option<PathBuf>,
        /// name of the interface inside the container
        #[clap(long, env = "CNI_IFNAME")]
        pub if_name: Option<String>,
        /// extra `key=value;key=value` arguments
        #[clap(long, env = "CNI_ARGS", default_value = "")]
        pub args: String,
        /// search path for plugin binaries
        #[clap(long, env = "CNI_PATH")]
        pub path: Option<String>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env = "CNI_LOG", default_value = DEFAULT_CNI_LOG)]
        pub log: String,
        /// log output format
        #[clap(long, env = "LOG_FORMAT", default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
    }
}

pub mod trace {
    //! tracing configuration. stdout carries the protocol document, so all
    //! logging goes to stderr.
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Configuration for logging
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// install the global subscriber
        pub fn parse(log: &str, log_frmt: &str) -> Result<Self> {
            let filter = EnvFilter::try_new(log)
                .or_else(|_| EnvFilter::try_new(super::cli::DEFAULT_CNI_LOG))?
                // sqlx logs every statement at info
                .add_directive("sqlx=warn".parse()?);

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json().with_writer(std::io::stderr))
                        .try_init()?;
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new())
                                .with_writer(std::io::stderr),
                        )
                        .try_init()?;
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().with_writer(std::io::stderr))
                        .try_init()?;
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}
