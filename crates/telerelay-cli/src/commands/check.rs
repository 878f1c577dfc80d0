use anyhow::{Context, Result};
use colored::Colorize;
use telerelay_core::{RelayConfig, TelegramSurface};

use crate::cli::CheckArgs;

pub async fn run(config: RelayConfig, args: CheckArgs) -> Result<()> {
    config.validate()?;

    if args.json {
        let masked = masked(&config);
        println!("{}", serde_json::to_string_pretty(&masked)?);
    } else {
        print_summary(&config);
    }

    if args.offline {
        return Ok(());
    }

    let me = TelegramSurface::new(config.telegram.clone())
        .test_connection()
        .await
        .context("Failed to reach the Telegram Bot API")?;
    println!(
        "{} Telegram bot @{} (id {})",
        "✓".green(),
        me.username.as_deref().unwrap_or("-"),
        me.id
    );
    Ok(())
}

fn print_summary(config: &RelayConfig) {
    println!("{} Configuration is valid", "✓".green());
    println!(
        "  MQTT broker:   {}:{} ({})",
        config.mqtt.host,
        config.mqtt.port,
        if config.mqtt.ca_cert.is_some() {
            "tls"
        } else {
            "plain"
        }
    );
    println!("  Client id:     {}", config.mqtt.client_id);
    println!("  Mode topic:    {}", config.modes.mode_topic);
    println!("  Data topic:    {}", config.modes.data_topic);
    println!("  Publishes:     {}x per mode change", config.modes.publish_repeats);
}

fn masked(config: &RelayConfig) -> RelayConfig {
    let mut masked = config.clone();
    masked.telegram.bot_token = mask_secret(&config.telegram.bot_token);
    masked.mqtt.password = config.mqtt.password.as_deref().map(mask_secret);
    masked
}

/// Keep the bot id part of a token (`<id>:<secret>`) and hide the rest
fn mask_secret(secret: &str) -> String {
    match secret.split_once(':') {
        Some((id, _)) => format!("{id}:***"),
        None => "***".to_string(),
    }
}
