use std::io::BufRead;
use std::sync::Arc;

use duplex_voice::audio::{CpalCapture, CpalSink};
use duplex_voice::credentials::{
    mask_token, CredentialProvider, EnvCredentials, FallbackCredentials, KeyringCredentials,
};
use duplex_voice::session::{SessionCapabilities, SessionObserver, SessionOrchestrator, SessionState};
use duplex_voice::settings::{load_settings, settings_path, SessionSettings};
use duplex_voice::streaming::{Role, WsConnector};

/// Prints finished utterances to stdout
struct ConsoleObserver;

impl SessionObserver for ConsoleObserver {
    fn on_utterance(&self, role: Role, text: &str) {
        let speaker = match role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        println!("{:>9}: {}", speaker, text);
    }

    fn on_session_state(&self, state: SessionState, reason: Option<&str>) {
        if let Some(reason) = reason {
            eprintln!("session {:?}: {}", state, reason);
        }
    }
}

fn main() {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let result = match std::env::args().nth(1).as_deref() {
        Some("store-key") => store_key(),
        Some(other) => Err(format!("unknown command: {} (expected `store-key`)", other)),
        None => run_session(),
    };

    if let Err(message) = result {
        log::error!("{}", message);
        std::process::exit(1);
    }
}

/// Read an API key from stdin and save it in the OS keyring.
fn store_key() -> Result<(), String> {
    eprintln!("Paste the API key and press Enter:");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| e.to_string())?;
    let key = line.trim();

    KeyringCredentials::default()
        .store(Some(key))
        .map_err(|e| e.to_string())?;
    eprintln!("Stored {}", mask_token(key));
    Ok(())
}

fn load_configured_settings() -> SessionSettings {
    let mut settings = match settings_path() {
        Ok(path) => {
            log::info!("Settings: loading {:?}", path);
            load_settings(&path)
        }
        Err(e) => {
            log::warn!("Settings: {}, using defaults", e);
            SessionSettings::default()
        }
    };
    settings.apply_env_overrides();
    settings
}

fn run_session() -> Result<(), String> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start runtime: {}", e))?;

    runtime.block_on(converse())
}

async fn converse() -> Result<(), String> {
    let settings = load_configured_settings();

    let capture = CpalCapture::new().map_err(|e| e.to_string())?;
    let sink = CpalSink::open().map_err(|e| e.to_string())?;
    let connector = WsConnector::new(settings.endpoint.clone(), settings.connect_timeout());
    let credentials: Vec<Arc<dyn CredentialProvider>> = vec![
        Arc::new(EnvCredentials::default()),
        Arc::new(KeyringCredentials::default()),
    ];

    let capabilities = SessionCapabilities::new(
        Box::new(capture),
        Arc::new(sink),
        Arc::new(connector),
        Arc::new(FallbackCredentials::new(credentials)),
    )
    .with_observer(Arc::new(ConsoleObserver));

    let mut session = SessionOrchestrator::new(settings, capabilities);
    let mut state = session.watch();
    session.start().await.map_err(|e| e.to_string())?;
    eprintln!("Connected. Speak any time; Ctrl-C ends the conversation.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Main: interrupted, stopping session");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() || state.borrow_and_update().session.is_terminal() {
                    break;
                }
            }
        }
    }

    session.stop().await.map_err(|e| e.to_string())?;

    let summary = session.metrics().summary();
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => log::info!("Main: session summary\n{}", json),
        Err(e) => log::warn!("Main: could not serialize summary: {}", e),
    }

    match session.snapshot().failure {
        Some(reason) => Err(reason),
        None => Ok(()),
    }
}
