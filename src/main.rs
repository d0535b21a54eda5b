mod auth;
mod authorization;
mod firewall_backend;
mod firewall_controller;
mod knock_server;
mod program_config;

use crate::auth::password::PasswordAuthProvider;
use crate::auth::AuthProvider;
use crate::authorization::{AuthorizationReactor, Event, EVENT_QUEUE_CAPACITY};
use crate::firewall_backend::iptables::IptablesFirewallBackend;
use crate::firewall_backend::noop::NoopFirewallBackend;
use crate::firewall_backend::FirewallBackend;
use crate::firewall_controller::{ChainName, FirewallController};
use crate::knock_server::{ConnectionHandler, KnockServer};
use crate::program_config::{AuthConfig, FirewallKind, ProgramConfig};
use anyhow::Context;
use env_logger::{Env, WriteStyle};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse options
    let config = ProgramConfig::parse();

    // Set up logging
    let mut logger =
        env_logger::Builder::from_env(Env::default().default_filter_or(if cfg!(debug_assertions) {
            "debug"
        } else {
            "info"
        }));
    logger.format_timestamp(None).format_module_path(false);
    if config.daemon {
        logger.write_style(WriteStyle::Never);
    }
    logger.init();

    run(config).await
}

async fn run(config: ProgramConfig) -> anyhow::Result<()> {
    config.validate().context("Invalid configuration")?;

    let chain = ChainName::for_protected_port(config.protected_port)?;

    let auth_provider: Box<dyn AuthProvider> = match &config.auth {
        AuthConfig::Password { password } => {
            Box::new(PasswordAuthProvider::new(password.as_bytes())?)
        }
    };
    log::info!("Using {} authentication", auth_provider.name());

    let (events, receiver) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    let handler = ConnectionHandler::new(
        auth_provider,
        Duration::from_secs(config.knock_server.timeout as u64),
        config.grant_time(),
        events.clone(),
    );
    let knock_server = KnockServer::new(config.knock_server, handler)
        .await
        .context("Failed to start knock server")?;
    let service_port = knock_server.local_port()?;

    let firewall_backend: Box<dyn FirewallBackend> = match config.firewall {
        FirewallKind::none => Box::new(NoopFirewallBackend::new()),
        FirewallKind::iptables => Box::new(
            IptablesFirewallBackend::new()
                .await
                .context("Failed to initialize iptables firewall backend")?,
        ),
    };

    // Registered before any rule is installed, so a signal during setup still leads to teardown
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to listen for SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    let mut sigquit = signal(SignalKind::quit()).context("Failed to listen for SIGQUIT")?;

    let firewall =
        FirewallController::new(firewall_backend, chain, service_port, config.protected_port);
    if let Err(e) = firewall.setup().await {
        // Leave no half-installed rules behind
        if let Err(e) = firewall.teardown().await {
            log::error!("Cleanup after failed setup incomplete: {}", e);
        }
        return Err(e).context("Failed to install firewall rules");
    }

    log::info!(
        "Server is listening on port {}, protecting port {} (chain {})",
        service_port,
        config.protected_port,
        firewall.chain()
    );

    let reactor = tokio::spawn(AuthorizationReactor::new(firewall, receiver).run());

    // Run until a fatal error is encountered or one of the specified signals are received
    let result = tokio::select! {
        r = knock_server.run() => r,
        _ = sigint.recv() => Ok(()),
        _ = sigterm.recv() => Ok(()),
        _ = sigquit.recv() => Ok(()),
    };

    log::info!("Server stopped, removing firewall rules");

    // The reactor may already be gone if it terminated on its own
    let _ = events.send(Event::Shutdown).await;
    match reactor.await {
        Ok(Ok(())) => (),
        Ok(Err(e)) => log::error!("Firewall rules may be left behind: {}", e),
        Err(e) => log::error!("Authorization reactor failed: {}", e),
    }

    log::info!("Good bye");

    result
}
