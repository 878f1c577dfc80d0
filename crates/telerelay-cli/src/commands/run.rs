use anyhow::{Context, Result};
use std::sync::Arc;
use telerelay_core::{
    ChatSurface, CommandDispatcher, LocalBus, MessageBus, ModeSwitch, MqttBus, RelayConfig,
    RelayController, StopOutcome, TelegramSurface,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::RunArgs;

pub async fn run(config: RelayConfig, args: RunArgs) -> Result<()> {
    config.validate()?;

    let telegram = Arc::new(TelegramSurface::new(config.telegram.clone()));
    let me = telegram
        .test_connection()
        .await
        .context("Failed to reach the Telegram Bot API")?;
    let bot_name = me.username.unwrap_or_else(|| me.id.to_string());
    info!(bot = %bot_name, "Connected to Telegram");

    let mqtt = if args.local_bus {
        None
    } else {
        let bus = MqttBus::connect(&config.mqtt).context("Failed to set up the MQTT client")?;
        info!(host = %config.mqtt.host, port = config.mqtt.port, "MQTT client started");
        Some(Arc::new(bus))
    };
    let bus: Arc<dyn MessageBus> = match &mqtt {
        Some(mqtt) => mqtt.clone(),
        None => {
            warn!("Using the in-process bus, no broker traffic will be seen");
            Arc::new(LocalBus::new())
        }
    };

    let chat: Arc<dyn ChatSurface> = telegram.clone();
    let relay = Arc::new(RelayController::new(bus.clone(), chat.clone()));
    let modes = Arc::new(ModeSwitch::new(
        relay.clone(),
        bus,
        chat.clone(),
        config.modes.clone(),
    ));
    let dispatcher = CommandDispatcher::new(chat.clone(), modes, relay.clone());

    let events = chat
        .start_receiving()
        .context("Telegram polling could not be started")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    println!("telerelay running as @{}. Press Ctrl+C to stop.", bot_name);
    dispatcher.run(events, shutdown).await;

    // Relayed messages must not outlive the process
    match relay.shutdown().await {
        StopOutcome::Stopped {
            deleted, failed, ..
        } => info!(deleted, failed, "Relay cleaned up"),
        StopOutcome::NotRunning => {}
    }
    telegram.stop_polling();
    if let Some(mqtt) = mqtt {
        mqtt.disconnect().await;
    }

    println!("telerelay stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler, Ctrl+C only");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
            }
            shutdown.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        });
    }
}
