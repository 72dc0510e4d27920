use std::sync::Arc;

use futures::StreamExt;
use kube::Client;
use search_operator::{
    cluster::KubeCluster,
    config::OperatorConfig,
    search_controller::{self as search, Reconciler},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = OperatorConfig::from_env();
    info!(
        namespace = %config.operator_namespace,
        api_timeout = ?config.api_timeout,
        resync = ?config.resync_interval,
        "search-operator starting up"
    );

    let client = Client::try_default().await?;
    let ctx = Arc::new(search::Ctx {
        reconciler: Reconciler::new(Arc::new(KubeCluster::new(client.clone())), config),
    });
    let controller = search::controller(client)
        .run(search::reconcile, search::error_policy, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                tracing::warn!(error=?e, "search reconcile error");
            }
        });

    tokio::select! {
        _ = controller => {},
        _ = tokio::signal::ctrl_c() => { info!("shutdown signal received"); }
    }
    Ok(())
}
