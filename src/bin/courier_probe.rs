//! Connects with settings from the environment and logs every bus event until
//! Ctrl-C.
//!
//! Reads `COURIER_*` variables (see `courier::config`), plus:
//! - `COURIER_TOKEN`: access token attached to the socket URL and requests
//! - `COURIER_REFRESH_URL` / `COURIER_REFRESH_TOKEN`: enable token renewal
//! - `COURIER_PROBE_PATH`: optional path fetched once through the gateway

use std::sync::Arc;
use std::time::Duration;

use courier::credentials::RefreshTokenCredentials;
use courier::{
    ConnectionConfig, Courier, Credential, CredentialSource, GatewayConfig, StaticCredentials,
};

#[tokio::main]
async fn main() {
    courier::init_tracing();
    if let Err(error) = run().await {
        eprintln!("courier probe failed: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let mut probe_path = env_var("COURIER_PROBE_PATH");

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--help" || arg == "-h" {
            print_help();
            return Ok(());
        }
        if let Some(value) = arg.strip_prefix("--get=") {
            probe_path = Some(value.to_string());
            continue;
        }
        if arg == "--get" {
            let value = args
                .next()
                .ok_or_else(|| "--get requires a value".to_string())?;
            probe_path = Some(value);
            continue;
        }
        return Err(format!("unknown argument '{arg}'. Use --help for usage"));
    }

    let connection_config = ConnectionConfig::from_env().map_err(|e| e.to_string())?;
    let gateway_config = GatewayConfig::from_env().map_err(|e| e.to_string())?;
    let credentials = credentials_from_env(gateway_config.request_timeout())?;

    let courier = Courier::new(connection_config, gateway_config, credentials)
        .map_err(|e| e.to_string())?;

    let mut events = courier.bus().subscribe();
    tokio::spawn(async move {
        while let Ok(envelope) = events.recv().await {
            match serde_json::to_string(&envelope.event) {
                Ok(json) => tracing::info!(seq = envelope.seq, "{json}"),
                Err(e) => tracing::warn!("unprintable event: {e}"),
            }
        }
    });

    courier.connection().connect();

    if let Some(path) = probe_path {
        match courier.gateway().get(&path).await {
            Ok(response) => {
                tracing::info!(status = response.status().as_u16(), "{}", response.text())
            }
            Err(e) if e.is_session_expired() => {
                tracing::error!("session expired; sign in again")
            }
            Err(e) => tracing::error!("probe request failed: {e}"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to wait for ctrl-c: {e}"))?;
    courier.connection().disconnect();
    // Let the subscriber print the final event.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

fn credentials_from_env(timeout: Duration) -> Result<Arc<dyn CredentialSource>, String> {
    let access = env_var("COURIER_TOKEN").map(Credential::new);
    match (env_var("COURIER_REFRESH_URL"), env_var("COURIER_REFRESH_TOKEN")) {
        (Some(url), Some(refresh)) => {
            let source =
                RefreshTokenCredentials::new(url, access, Some(Credential::new(refresh)), timeout)
                    .map_err(|e| e.to_string())?;
            Ok(Arc::new(source))
        }
        _ => Ok(Arc::new(StaticCredentials::new(access))),
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn print_help() {
    println!(
        "courier-probe\n\n\
         Connects to COURIER_WS_URL, logs connection events and exits on Ctrl-C.\n\n\
         Options:\n  \
         --get <path>   fetch <path> from COURIER_API_URL through the gateway\n  \
         -h, --help     show this help"
    );
}
