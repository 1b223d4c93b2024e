//! Signal handling for graceful shutdown and live reload.
//!
//! SIGINT and SIGTERM end the process. SIGHUP re-reads the server settings
//! document and re-fingerprints the rule bundle on the main loop, so edited
//! rules reach new rooms without a restart.

use tabletop_server::{MainHandle, ServerError};
use tokio::signal;
use tracing::{info, warn};

/// Returns when a termination signal arrives, serving reload requests until
/// then.
pub async fn wait_for_shutdown(main: MainHandle) -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("📡 Received SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("📡 Received SIGTERM");
                    break;
                }
                _ = sighup.recv() => {
                    info!("📡 Received SIGHUP, reloading");
                    if let Err(e) = reload(&main).await {
                        warn!("❌ Reload failed: {}", e);
                    }
                }
            }
        }
    }

    #[cfg(windows)]
    {
        let _ = &main;
        signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C");
    }

    Ok(())
}

/// Reloads the settings document, then checks the bundle for changes.
pub async fn reload(main: &MainHandle) -> Result<(), ServerError> {
    main.call(|state| {
        state.reload_settings()?;
        state.refresh_fingerprint()
    })
    .await?
}
