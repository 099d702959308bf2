use anyhow::Context;
use pipeline_core::action::ActionStage;
use pipeline_core::config::PipelineConfig;
use pipeline_core::decision::TriagePolicy;
use pipeline_core::event_log::EventLog;
use pipeline_core::gateway::{GatewayRouter, StdioGateway, StdioGatewayConfig, ToolFilter, ToolGateway};
use pipeline_core::hypothesis::LlmHypothesis;
use pipeline_core::investigation::InvestigationStage;
use pipeline_core::orchestrator::Pipeline;
use pipeline_core::queue::RunQueue;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = PipelineConfig::from_env()?;
    info!(
        port = config.port,
        workers = config.workers,
        search_limit = config.search_limit,
        project = %config.ado.project,
        "configuration loaded"
    );

    let archive = match &config.event_log_path {
        Some(path) => {
            let log = EventLog::open(path)
                .with_context(|| format!("open event log at {}", path.display()))?;
            for run in log.unfinished_runs()? {
                warn!(alert_id = %run.alert_id, run_id = %run.run_id, "run did not finish before last shutdown");
            }
            Some(log)
        }
        None => None,
    };

    let mut router = GatewayRouter::new();
    for gateway_config in [config.datadog_gateway_config(), config.ado_gateway_config()] {
        let (tools, gateway) = launch(gateway_config).await?;
        router = router.route(tools, gateway);
    }
    let gateways: Arc<dyn ToolGateway> = Arc::new(router);

    let mut investigation = InvestigationStage::new(gateways.clone())
        .with_limit(config.search_limit)
        .with_timeout(config.gateway_timeout);
    if let Some(llm) = config.llm.clone() {
        info!(provider = %llm.provider, model = %llm.model, "LLM hypothesis enabled");
        investigation = investigation.with_hypothesis(Arc::new(LlmHypothesis::new(llm)));
    }
    let action = ActionStage::new(gateways, config.ado.project.clone())
        .with_work_item_type(config.ado.work_item_type.clone())
        .with_site(config.datadog.site.clone())
        .with_timeout(config.gateway_timeout);

    let mut pipeline = Pipeline::new(investigation, TriagePolicy::default(), action);
    if let Some(log) = archive {
        pipeline = pipeline.with_archive(log);
    }
    let queue = Arc::new(RunQueue::start(
        Arc::new(pipeline),
        config.workers,
        config.queue_capacity,
    ));

    let app = pipeline_server::webhook::webhook_router(queue.clone());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    info!(%addr, "pipeline-server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "could not listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("serve")?;

    info!("draining run queue");
    queue.shutdown().await;
    Ok(())
}

async fn launch(config: StdioGatewayConfig) -> anyhow::Result<(ToolFilter, Arc<dyn ToolGateway>)> {
    let name = config.name.clone();
    let tools = config.tools.clone();
    let gateway = StdioGateway::spawn(config)
        .await
        .with_context(|| format!("start {name} tool gateway"))?;
    Ok((tools, Arc::new(gateway)))
}
