//! Conductor binary: wires the store, clients, registry, workers, the sync
//! reconciler and the HTTP surface, then runs until ctrl-c.

use anyhow::{Context, Result};
use clap::Parser;
use reelforge_clients::{
    HttpPlanningClient, HttpUploadClient, OauthCache, OauthConfig, RateGate, WebhookAlertSink,
};
use reelforge_conductor::{config::Config, context::AppContext, dispatcher, http, sync};
use reelforge_db::DbConfig;
use reelforge_logging::{init_logging, LogConfig};
use reelforge_vault::Vault;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    init_logging(LogConfig {
        app_name: "conductor",
        verbose: config.verbose,
    })?;

    let vault = Vault::from_env().context("credential vault unavailable")?;

    let pool = reelforge_db::open(DbConfig::from_url(&config.database_url)?)
        .await
        .context("open database")?;

    let rate_gate = Arc::new(RateGate::planning());
    let planning = Arc::new(HttpPlanningClient::new(
        &config.planning_api_url,
        Arc::clone(&rate_gate),
    )?);
    let uploader = Arc::new(HttpUploadClient::new(&config.upload_api_url)?);
    let oauth = OauthCache::new(OauthConfig {
        token_url: config.oauth_token_url.clone(),
        client_id: config.oauth_client_id.clone(),
        client_secret: config.oauth_client_secret.clone(),
    })?;
    let alerts = Arc::new(WebhookAlertSink::new(config.alert_webhook_url.clone()));

    let ctx = AppContext::new(
        pool,
        &config,
        vault,
        rate_gate,
        planning,
        uploader,
        oauth,
        alerts,
    );

    let report = ctx.registry.reload(&ctx.pool, &ctx.vault).await?;
    if report.loaded.is_empty() {
        warn!("no channels loaded; the dispatcher will idle until configs appear");
    }

    let mut handles = Vec::new();
    for n in 0..config.workers.max(1) {
        let ctx = Arc::clone(&ctx);
        let worker_id = format!("{}-w{n}", hostname());
        handles.push(tokio::spawn(async move {
            dispatcher::run_worker(&ctx, worker_id).await;
        }));
    }
    {
        let ctx = Arc::clone(&ctx);
        handles.push(tokio::spawn(async move {
            dispatcher::run_sweeper(&ctx).await;
        }));
    }
    {
        let ctx = Arc::clone(&ctx);
        handles.push(tokio::spawn(async move {
            sync::run_mirror_loop(&ctx).await;
        }));
    }
    {
        let ctx = Arc::clone(&ctx);
        handles.push(tokio::spawn(async move {
            sync::run_poll_loop(&ctx).await;
        }));
    }

    // SIGHUP reloads channel configuration without a restart.
    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let Ok(mut hup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hup.recv().await.is_some() {
                info!("SIGHUP: reloading channel registry");
                if let Err(err) = ctx.registry.reload(&ctx.pool, &ctx.vault).await {
                    error!(error = %err, "registry reload failed");
                }
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("bind {}", config.http_addr))?;
    info!(addr = %config.http_addr, "control surface listening");

    let router = http::build_router(Arc::clone(&ctx));
    let server_ctx = Arc::clone(&ctx);
    let server = tokio::spawn(async move {
        let shutdown_ctx = Arc::clone(&server_ctx);
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while !shutdown_ctx.is_shutting_down() {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                }
            })
            .await;
        if let Err(err) = result {
            error!(error = %err, "http server exited");
        }
    });

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested; draining in-flight work");
    ctx.request_shutdown();

    for handle in handles {
        let _ = handle.await;
    }
    let _ = server.await;
    info!("conductor stopped");
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("pid{}", std::process::id()))
}
