//! Hub process lifecycle
//!
//! Bind, bootstrap, then acquire the serving resources one by one. Each
//! acquired resource pushes its release onto a [`ShutdownStack`]; the stack
//! is released in reverse whether serving ends normally or a later step
//! fails, so a hub that registered always deregisters.

use crate::agent::Agent;
use crate::healthz::serve_healthz;
use crate::listener::HubListener;
use crate::shutdown::ShutdownStack;
use anyhow::{Context, Result};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Listener addresses for one hub process
#[derive(Debug, Clone)]
pub struct HubPorts {
    pub bind_host: String,
    pub port: u16,
    pub http_port: Option<u16>,
    pub healthz_port: u16,
}

/// Bootstrap `agent`, serve until `shutdown`, then release in reverse order
pub async fn serve_hub(
    agent: Arc<Agent>,
    ports: HubPorts,
    web_namespace: &str,
    shutdown: CancellationToken,
    force: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind((ports.bind_host.as_str(), ports.port))
        .await
        .with_context(|| format!("Failed to bind hub port {}", ports.port))?;

    let config = agent
        .bootstrap_config(&shutdown)
        .await
        .context("Failed to bootstrap hub configuration")?;
    info!(
        hub_id = %agent.stable_id(),
        domain = %config.domain,
        version = config.tls_version,
        "Hub configured"
    );

    let mut stack = ShutdownStack::new();
    {
        let agent = agent.clone();
        let force = force.clone();
        stack.push("registration", move || async move {
            agent.close(&force).await?;
            Ok::<_, anyhow::Error>(())
        });
    }

    let result = serve_registered(
        &agent,
        &ports,
        web_namespace,
        listener,
        &mut stack,
        &shutdown,
        force,
    )
    .await;
    shutdown.cancel();

    let failed = stack.release_all().await;
    if failed > 0 {
        warn!(failed, "Some resources were not released cleanly");
    }
    result?;
    info!("Hub stopped");
    Ok(())
}

async fn serve_registered(
    agent: &Arc<Agent>,
    ports: &HubPorts,
    web_namespace: &str,
    listener: TcpListener,
    stack: &mut ShutdownStack,
    shutdown: &CancellationToken,
    force: CancellationToken,
) -> Result<()> {
    agent
        .request_service_token(shutdown, web_namespace)
        .await
        .context("Failed to obtain service token")?;

    let healthz = TcpListener::bind((ports.bind_host.as_str(), ports.healthz_port))
        .await
        .with_context(|| format!("Failed to bind healthz port {}", ports.healthz_port))?;
    {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(serve_healthz(healthz, agent.clone(), stop.clone()));
        stack.push("healthz", move || async move {
            stop.cancel();
            handle.await??;
            Ok::<_, anyhow::Error>(())
        });
    }

    if let Some(http_port) = ports.http_port {
        let listener = TcpListener::bind((ports.bind_host.as_str(), http_port))
            .await
            .with_context(|| format!("Failed to bind HTTP port {}", http_port))?;
        let stop = CancellationToken::new();
        let app = Router::new().fallback(redirect_to_https);
        let handle = {
            let stop = stop.clone();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(stop.cancelled_owned())
                    .await
            })
        };
        info!(port = http_port, "HTTP redirect listening");
        stack.push("http redirect", move || async move {
            stop.cancel();
            handle.await??;
            Ok::<_, anyhow::Error>(())
        });
    }

    let run_loop = {
        let agent = agent.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = agent.run(cancel).await {
                error!(error = %e, "Sync loop stopped, serving last configuration until shutdown");
            }
        })
    };
    stack.push("sync loop", move || async move {
        run_loop.await?;
        Ok::<_, anyhow::Error>(())
    });

    HubListener::new(agent.clone())
        .serve(listener, shutdown.clone(), force)
        .await?;
    Ok(())
}

async fn redirect_to_https(headers: HeaderMap, uri: Uri) -> Response {
    let Some(host) = headers.get(header::HOST).and_then(|h| h.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing host").into_response();
    };
    let host = host.split(':').next().unwrap_or(host);
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Redirect::permanent(&format!("https://{}{}", host, path)).into_response()
}
