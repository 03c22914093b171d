use clap::Parser;
use werf::cli::{Cli, Commands};
use werf::commands;
use werf::error::exit_code;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with env-filter support.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let started = std::time::Instant::now();

    let result = match &cli.command {
        Commands::Build {
            images,
            introspect,
            credentials,
        } => commands::build::run(&cli.global, images, introspect, credentials).await,
        Commands::Bp {
            images,
            repo,
            with_stages,
            tags,
            introspect,
            credentials,
        } => {
            commands::bp::run(
                &cli.global,
                images,
                repo.as_deref(),
                *with_stages,
                tags,
                introspect,
                credentials,
            )
            .await
        }
    };

    tracing::info!("running time {:.2} seconds", started.elapsed().as_secs_f64());

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}
