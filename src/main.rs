#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate tracing;
mod app;
mod cli;
mod http;
mod tls;
mod trace;
use crate::app::run::main_with_error;

#[tokio::main]
async fn main() {
    if let Err(e) = main_with_error().await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
