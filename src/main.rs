use clap::Parser;
use color_eyre::eyre::Result;
use pod_data::{CliOpts, do_main};

fn init_tracing(verbose: bool) -> Result<()> {
    use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
    use tracing_error::ErrorLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let default_directives = if verbose {
        "warn,pod_data=debug"
    } else {
        "warn,pod_data=info"
    };
    let filter_layer =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_directives))?;
    // stdout is kept for the cluster ID
    let formatting_layer =
        BunyanFormattingLayer::new(env!("CARGO_PKG_NAME").to_string(), std::io::stderr);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(JsonStorageLayer)
        .with(formatting_layer)
        .with(ErrorLayer::default())
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_opts = CliOpts::parse();
    init_tracing(cli_opts.verbose)?;
    color_eyre::config::HookBuilder::default()
        .panic_section("consider reporting the bug with the log above")
        .install()?;

    do_main(&cli_opts).await?;
    Ok(())
}
