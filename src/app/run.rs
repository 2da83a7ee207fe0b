use crate::cli::app_config::Cli;
use crate::http::runner::RequestRunner;
use crate::http::transport::{Transport, TransportConfig};
use crate::trace::sink::TraceContext;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

pub async fn main_with_error() -> Result<(), anyhow::Error> {
    let cli: Cli = Cli::parse();
    init_logger(cli.verbosity);

    do_request(cli).await
}

fn init_logger(verbosity: u8) {
    let log_level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt()
        .with_level(true)
        .with_target(false)
        .with_span_events(FmtSpan::NONE)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn do_request(cli: Cli) -> Result<(), anyhow::Error> {
    let transport = Transport::new(TransportConfig::from(&cli))?;
    let runner = RequestRunner::new(transport, &cli.url)?;
    let mut ctx = TraceContext::for_target(&cli.url);

    let status = runner.trace(&mut ctx).await?;
    info!("{} responded with {}, trace {}", cli.url, status, ctx.state());

    let record = ctx.tracer.record();
    println!("{}", record.to_report()?);
    debug!("{}", record.breakdown());
    Ok(())
}
