use colored::Colorize;

pub fn handle_error(err: anyhow::Error) -> ! {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    let msg = format!("{:#}", err).to_lowercase();

    if msg.contains("bot token is not set") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  Set the token in the config file or the environment:");
        eprintln!("  {} export TELEGRAM_BOT_TOKEN=<token>", "$".dimmed());
    }

    if msg.contains("failed to read config file") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  Check the --config path, or omit it to use the default location.");
    }

    if msg.contains("ca certificate") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  Point mqtt.ca_cert at the broker's PEM file, or remove it to disable TLS.");
    }

    if msg.contains("connection refused") || msg.contains("network") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  Check your internet connection and try again.");
    }

    std::process::exit(1);
}
