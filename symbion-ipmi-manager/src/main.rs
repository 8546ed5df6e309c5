/**
 * SYMBION IPMI MANAGER - Point d'entrée
 *
 * RÔLE : Bootstrap du coordinateur : config, collaborateurs par défaut,
 * pont MQTT, pollers enfants, API REST, publication health, puis boucle du manager.
 *
 * ARRÊT : Ctrl-C, ou perte fatale d'un poller (code de sortie non nul).
 */

use anyhow::{Context, Result};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use symbion_ipmi_manager::config::load_config;
use symbion_ipmi_manager::directory::ConfigDirectory;
use symbion_ipmi_manager::health::HealthTracker;
use symbion_ipmi_manager::history::LatestValues;
use symbion_ipmi_manager::http::{api_key_from_env, build_router, AppState};
use symbion_ipmi_manager::mqtt::{create_mqtt_client, run_bridge};
use symbion_ipmi_manager::pool::PollerPool;
use symbion_ipmi_manager::schedule::MemorySchedule;
use symbion_ipmi_manager::Manager;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cfg = load_config().await;
    info!(
        pool_size = cfg.pool_size,
        hosts = cfg.hosts.len(),
        items = cfg.items.len(),
        "configuration loaded"
    );

    // identité de famille : seuls les pollers lancés avec elle sont acceptés
    let family = std::env::var("SYMBION_IPMI_FAMILY").unwrap_or_else(|_| Uuid::new_v4().to_string());

    let values = LatestValues::new();
    let schedule = MemorySchedule::new(cfg.schedule_items(OffsetDateTime::now_utc()));
    let manager = Manager::new(
        &cfg,
        family.clone(),
        Box::new(schedule),
        Box::new(values.clone()),
        Box::new(ConfigDirectory::new(cfg.hosts.clone())),
    );

    let (events_tx, events_rx) = mpsc::channel(1024);
    let health = HealthTracker::new();

    // MQTT : pont vers les pollers + publication health sur le même client
    let client_id = format!("symbion-ipmi-manager-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let (client, eventloop) = create_mqtt_client(&client_id, &cfg.mqtt);
    tokio::spawn(run_bridge(client.clone(), eventloop, events_tx.clone(), health.clone()));
    health.spawn_health_publisher(client, events_tx.clone(), Duration::from_secs(30));

    let mut pool = match &cfg.poller_binary {
        Some(binary) => Some(
            PollerPool::spawn(binary, manager.pool_size(), &family, &cfg.mqtt)
                .context("failed to start pollers")?,
        ),
        None => {
            warn!(%family, "no poller_binary configured, waiting for external pollers");
            None
        }
    };

    let api_key = api_key_from_env();
    if api_key.is_none() {
        warn!("SYMBION_API_KEY not set, REST API open without authentication");
    }
    let app = build_router(AppState {
        events: events_tx.clone(),
        values,
        health,
        command_timeout: Duration::from_secs(cfg.command_timeout_secs),
        api_key,
    });
    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    info!("listening on http://{}", cfg.http.bind);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    drop(events_tx);
    let pool_size = manager.pool_size();
    let mut reap = tokio::time::interval(Duration::from_secs(30));
    let manager_task = manager.run(events_rx);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(manager_task, shutdown);

    let outcome = loop {
        tokio::select! {
            res = &mut manager_task => break res.context("manager stopped"),
            _ = &mut shutdown => {
                info!("shutdown requested");
                break Ok(());
            }
            _ = reap.tick() => {
                if let Some(pool) = pool.as_mut() {
                    let alive = pool.reap();
                    if alive < pool_size {
                        warn!(alive, "pollers missing");
                    }
                }
            }
        }
    };

    if let Some(pool) = pool.as_mut() {
        pool.shutdown().await;
    }
    outcome
}
