use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use envconfig::Envconfig;
use kube::Client;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use canopy::disruption::DisruptionController;
use canopy::disruption::queue::OrchestrationQueue;
use canopy::events::EventSink;
use canopy::providers::kwok::KwokProvider;
use canopy::providers::provider::CloudProvider;
use canopy::provisioning::{Batcher, Provisioner};
use canopy::settings::Settings;
use canopy::state::Cluster;
use canopy::store::{KubeStore, Store};

/// Poll-driven mirror refresh: feed the cluster state from full list reads
/// and synthesize deletion events by diffing against the previous pass.
async fn sync_mirror(
    store: &Store,
    cluster: &Cluster,
    batcher: &Batcher,
    seen_nodes: &mut HashSet<String>,
    seen_claims: &mut HashSet<String>,
    seen_pods: &mut HashSet<(String, String)>,
) -> anyhow::Result<()> {
    let nodes = store.list_nodes().await?;
    let claims = store.list_node_claims().await?;
    let pods = store.list_pods().await?;
    let pools = store.list_node_pools().await?;
    let daemonsets = store.list_daemon_sets().await?;

    let mut next_nodes = HashSet::new();
    for node in &nodes {
        cluster.update_node(node);
        if let Some(name) = &node.metadata.name {
            next_nodes.insert(name.clone());
        }
    }
    for gone in seen_nodes.difference(&next_nodes) {
        cluster.delete_node(gone);
    }
    *seen_nodes = next_nodes;

    let mut next_claims = HashSet::new();
    for claim in &claims {
        cluster.update_node_claim(claim);
        if let Some(name) = &claim.metadata.name {
            next_claims.insert(name.clone());
        }
    }
    for gone in seen_claims.difference(&next_claims) {
        cluster.delete_node_claim(gone);
    }
    *seen_claims = next_claims;

    let mut next_pods = HashSet::new();
    let mut pending = false;
    for pod in &pods {
        cluster.update_pod(pod);
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let name = pod.metadata.name.clone().unwrap_or_default();
        next_pods.insert((namespace, name));
        let unbound = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_ref())
            .is_none();
        if unbound && !canopy::resources::pod_is_terminal(pod) {
            pending = true;
        }
    }
    for (namespace, name) in seen_pods.difference(&next_pods) {
        cluster.delete_pod(namespace, name);
    }
    *seen_pods = next_pods;

    for pool in &pools {
        cluster.update_node_pool(pool);
    }
    for ds in &daemonsets {
        cluster.update_daemonset(ds);
    }

    if pending {
        batcher.trigger();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let settings = Settings::init_from_env()?;
    info!(?settings, "starting canopy");

    let client = Client::try_default().await?;
    let cluster = Arc::new(Cluster::new());
    let store = Arc::new(Store::Kube(KubeStore::new(client.clone())));
    let provider = Arc::new(CloudProvider::Kwok(KwokProvider::new(client)));
    let events = Arc::new(EventSink::new());
    let batcher = Arc::new(Batcher::new());

    let queue = Arc::new(OrchestrationQueue::new(
        cluster.clone(),
        store.clone(),
        provider.clone(),
        events.clone(),
    ));
    let provisioner = Arc::new(Provisioner::new(
        store.clone(),
        provider.clone(),
        cluster.clone(),
        events.clone(),
    ));
    let disruption = Arc::new(DisruptionController::new(
        store.clone(),
        provider.clone(),
        cluster.clone(),
        queue.clone(),
        events.clone(),
        settings.validation_ttl(),
        settings.consolidation_timeout(),
        settings.multi_consolidation_timeout(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let ready = Arc::new(AtomicBool::new(false));

    // Mirror refresher.
    {
        let store = store.clone();
        let cluster = cluster.clone();
        let batcher = batcher.clone();
        let ready = ready.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut seen_nodes = HashSet::new();
            let mut seen_claims = HashSet::new();
            let mut seen_pods = HashSet::new();
            loop {
                match sync_mirror(
                    &store,
                    &cluster,
                    &batcher,
                    &mut seen_nodes,
                    &mut seen_claims,
                    &mut seen_pods,
                )
                .await
                {
                    Ok(()) => ready.store(true, Ordering::Relaxed),
                    Err(err) => warn!(error = %err, "mirror sync failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // Provisioning singleton.
    {
        let provisioner = provisioner.clone();
        let batcher = batcher.clone();
        let shutdown = shutdown_rx.clone();
        let idle = settings.batch_idle();
        let max = settings.batch_max();
        let tick = Duration::from_millis(settings.provision_interval_ms);
        tokio::spawn(async move {
            provisioner.run(batcher, idle, max, tick, shutdown).await;
        });
    }

    // Disruption singleton.
    {
        let disruption = disruption.clone();
        let shutdown = shutdown_rx.clone();
        let interval = Duration::from_millis(settings.disruption_interval_ms);
        tokio::spawn(async move {
            disruption.run(interval, shutdown).await;
        });
    }

    // Orchestration queue consumer.
    {
        let queue = queue.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            queue.run(shutdown).await;
        });
    }

    // Termination sweep: a deleted claim leaves its node behind to be
    // cordoned, drained, and removed.
    {
        let store = store.clone();
        let provider = provider.clone();
        let cluster = cluster.clone();
        let events = events.clone();
        let opts = canopy::termination::TerminationOptions {
            concurrency: settings.drain_concurrency,
            ..Default::default()
        };
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = shutdown.changed() => return,
                }
                let Ok(claims) = store.list_node_claims().await else {
                    continue;
                };
                let live: HashSet<String> = claims
                    .into_iter()
                    .filter_map(|c| c.metadata.name)
                    .collect();
                for (_, state) in cluster.nodes_with_keys() {
                    let (Some(node_name), Some(claim_name)) =
                        (state.node_name(), state.claim_name())
                    else {
                        continue;
                    };
                    if live.contains(&claim_name) {
                        continue;
                    }
                    let Some(claim) = state.node_claim.clone() else {
                        continue;
                    };
                    if let Err(err) = canopy::termination::terminate_node(
                        &store, &provider, &events, &claim, &node_name, &opts,
                    )
                    .await
                    {
                        warn!(node = %node_name, error = %err, "termination failed; will retry");
                    }
                }
            }
        });
    }

    // Health endpoints.
    let app = {
        let ready = ready.clone();
        Router::new()
            .route("/healthz", get(|| async { "ok" }))
            .route(
                "/readyz",
                get(move || {
                    let ready = ready.clone();
                    async move {
                        if ready.load(Ordering::Relaxed) {
                            (StatusCode::OK, "ok")
                        } else {
                            (StatusCode::SERVICE_UNAVAILABLE, "syncing")
                        }
                    }
                }),
            )
    };
    let listener = tokio::net::TcpListener::bind(&settings.health_addr).await?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!(error = %err, "health endpoint stopped");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    Ok(())
}
