use crate::http::transport::TransportConfig;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_URL: &str = "http://google.com";

/// Trace the network phases of a single HTTP GET request.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
pub struct Cli {
    /// The request url,like http://www.google.com
    #[arg(default_value = DEFAULT_URL)]
    pub url: String,
    /// Verify the server certificate chain and host name
    #[arg(long = "verify-certificates")]
    pub verify_certificates: bool,
    /// Allow the server to keep the connection open
    #[arg(long = "keep-alive")]
    pub keep_alive: bool,
    /// The pem path.
    #[arg(short = 'c', long = "cacert", value_name = "file")]
    pub certificate_path_option: Option<PathBuf>,
    /// Maximum time allowed for the whole trace, 0 waits forever
    #[arg(short = 'm', long = "max-time", value_name = "seconds", default_value_t = 30)]
    pub max_time: u64,
    ///  Make the operation more talkative
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbosity: u8,
}

impl From<&Cli> for TransportConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            verify_certificates: cli.verify_certificates,
            keep_alive: cli.keep_alive,
            ca_file: cli.certificate_path_option.clone(),
            timeout: (cli.max_time > 0).then(|| Duration::from_secs(cli.max_time)),
        }
    }
}
