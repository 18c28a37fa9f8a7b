mod config;
mod logging;

use std::sync::Arc;

use backend_rest::{RestBackendClient, RestBackendConfig};
use liveness_core::{ConnectionMonitor, MonitorEvent};
use session_platform::{CredentialStore, JsonFileCredentialStore, ScopedCredentialStore};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::config::SmokeConfig;

const CACHE_SERVICE: &str = "liveness-smoke";

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            eprintln!("Required: LIVENESS_BACKEND_URL and LIVENESS_BACKEND_API_KEY");
            std::process::exit(2);
        }
    };

    let backend_config = match RestBackendConfig::new(&config.backend_url, config.api_key.clone()) {
        Ok(backend_config) => backend_config
            .with_accounts_table(config.accounts_table.clone())
            .with_health_table(config.health_table.clone())
            .with_request_timeout(config.monitor.probe_timeout),
        Err(err) => {
            eprintln!("Invalid backend url: {err}");
            std::process::exit(2);
        }
    };
    let client = match RestBackendClient::new(backend_config) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("Failed to initialize backend client: {err}");
            std::process::exit(1);
        }
    };

    let credentials: Arc<dyn CredentialStore> =
        Arc::new(JsonFileCredentialStore::new(config.cache_path.clone()));
    let cache = ScopedCredentialStore::new(credentials, CACHE_SERVICE);
    let monitor = ConnectionMonitor::new(config.monitor.clone(), Arc::new(client), cache);

    match monitor.restore_session() {
        Ok(Some(session)) => info!(user_id = %session.user_id, "resuming cached session"),
        Ok(None) => info!("no cached session; monitoring connectivity only"),
        Err(err) => warn!(error = %err, "ignoring unusable session cache"),
    }

    let mut events = monitor.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Err(err) = monitor.start() {
        error!(error = %err, "failed to start monitor");
        std::process::exit(1);
    }
    println!("Monitoring {}. Press Ctrl-C to stop.", config.backend_url);

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
    }

    monitor.stop().await;
    drop(monitor);
    printer.abort();
    println!("Stopped.");
}

fn print_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::ConnectionChanged(state) if state.connected => {
            println!("[connection] backend reachable");
        }
        MonitorEvent::ConnectionChanged(_) => println!("[connection] backend unreachable"),
        MonitorEvent::RetryScheduled { attempt, delay } => {
            println!("[retry] attempt {attempt} in {}ms", delay.as_millis());
        }
        MonitorEvent::CooldownStarted { attempts, duration } => println!(
            "[retry] {attempts} attempts failed; pausing for {}s",
            duration.as_secs()
        ),
        MonitorEvent::PersistentFailure(signal) => println!(
            "[retry] {} manual retries failed: {}",
            signal.consecutive_failures, signal.last_error
        ),
        MonitorEvent::SessionInvalidated(signal) => println!(
            "[session] signed out {} ({:?})",
            signal.user_id, signal.reason
        ),
        MonitorEvent::SessionSignedOut => println!("[session] signed out"),
    }
}
