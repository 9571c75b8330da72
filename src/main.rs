use std::process;

use postcache::{
    application::{commands, context::CacheContext, error::AppError},
    config::{self, Command, SyncArgs},
    infra::telemetry,
};
use serde_json::Value;
use tracing::{Dispatch, Level, dispatcher, error};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(Command::Daemon(SyncArgs::default()));

    telemetry::init(&settings.logging)?;

    let ctx = CacheContext::build(&settings).await?;

    let output = match command {
        Command::Sync(_) => commands::sync(&ctx).await?,
        Command::Daemon(_) => commands::daemon(&ctx).await?,
        Command::Get(args) => commands::get(&ctx, &args.key).await?,
        Command::Invalidate(args) => commands::invalidate(&ctx, &args.key).await?,
        Command::Stats => commands::stats(&ctx).await?,
        Command::Clear => commands::clear(&ctx).await?,
    };

    print_json(&output)
}

fn print_json(value: &Value) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
