//! Creates the error-log monitor that feeds the webhook ingress.

use anyhow::bail;
use clap::Parser;
use pipeline_core::action::DEFAULT_SITE;
use pipeline_server::monitor::{MonitorClient, MonitorScope, monitor_definition, webhook_instructions};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "setup-monitor", about = "Set up a Datadog log monitor that calls the incident pipeline")]
struct Args {
    /// Public URL of the pipeline server, e.g. https://ops.example.com
    #[arg(long)]
    backend_url: String,
    /// Service to monitor, `*` for all services
    #[arg(long, default_value = "*")]
    service: String,
    /// Environment to monitor, `*` for all environments
    #[arg(long, default_value = "*")]
    env: String,
    /// Print the monitor definition instead of creating it
    #[arg(long)]
    dry_run: bool,
    /// Only print the webhook integration instructions
    #[arg(long)]
    webhook_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let site = std::env::var("DD_SITE").unwrap_or_else(|_| DEFAULT_SITE.to_string());

    if !args.webhook_only {
        let scope = MonitorScope::new(&args.service, &args.env);
        let definition = monitor_definition(&scope);

        if args.dry_run {
            println!("{}", serde_json::to_string_pretty(&definition)?);
        } else {
            let (Ok(api_key), Ok(app_key)) = (std::env::var("DD_API_KEY"), std::env::var("DD_APP_KEY")) else {
                bail!("DD_API_KEY and DD_APP_KEY must be set in environment");
            };
            info!(service = %scope.service, env = %scope.env, %site, "creating monitor");
            let created = MonitorClient::new(&site, api_key, app_key)
                .create(&definition)
                .await?;
            println!("Monitor created");
            println!("  id:    {}", created.id);
            println!("  name:  {}", created.name);
            println!("  query: {}", created.query);
        }
    }

    println!();
    println!("{}", webhook_instructions(&args.backend_url, &site));
    Ok(())
}
