use std::path::Path;
use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};

use adapters::dns::UdpResolver;
use adapters::engine::new_engine;
use application::error::OrchestratorError;
use application::fleet;
use infrastructure::constants::{
    APP_NAME, FORCED_EXIT_CODE, OUTRO, SIGINT_FORCE_EXIT_COUNT, SUPPORT_CHANNEL, SUPPORT_MSG,
};
use ports::secondary::dns_resolver_port::DnsResolverPort;

use crate::cli::Cli;
use crate::signals::{SigintAction, SigintCounter};

/// Log an error for the user, with the support channel.
fn error_user_print(err: &OrchestratorError) {
    error!("{err}");
    info!("{SUPPORT_MSG} {SUPPORT_CHANNEL}");
}

/// Run the daemon. Returns the process exit code.
pub async fn run(cli: &Cli) -> i32 {
    info!("{APP_NAME} {}", env!("CARGO_PKG_VERSION"));

    let resolver: Arc<dyn DnsResolverPort> = Arc::new(UdpResolver::new());
    let config_path = Path::new(&cli.config);

    debug!("initializing load balancer");
    let mut lbs = match fleet::init(config_path, &new_engine, &resolver).await {
        Ok(lbs) => lbs,
        Err(e) => {
            error_user_print(&e);
            error!("load balancer initialization failed, exiting");
            return 1;
        }
    };

    debug!("initialization succeeded, starting load balancer engines");
    for lb in &lbs {
        if let Err(e) = lb.start().await {
            error_user_print(&e);
            error!("load balancer start-up failed, exiting");
            return 1;
        }
    }

    info!("traffic being load balanced");

    let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigints = SigintCounter::new(SIGINT_FORCE_EXIT_COUNT);

    // Serve until a shutdown is requested; SIGHUP reconfigures in place.
    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("received signal 'SIGHUP', reconfiguring");
                match fleet::reconfig(&mut lbs, config_path, &new_engine, &resolver).await {
                    Ok(()) => info!("reconfigured successfully"),
                    Err(e) => {
                        warn!("reconfiguration failed, previous configuration was retained");
                        info!("{e}");
                    }
                }
            }
            _ = sigint.recv() => {
                match sigints.record() {
                    SigintAction::StartShutdown => {
                        error!(
                            "received signal 'SIGINT', graceful shutdown initiated; to abort and \
                             forcefully quit, send {} more SIGINTs",
                            sigints.limit() - 1
                        );
                        break;
                    }
                    // With a limit of 1 there is no graceful phase at all.
                    SigintAction::ForceExit => return FORCED_EXIT_CODE,
                    SigintAction::Note(_) => {}
                }
            }
            _ = sigterm.recv() => {
                error!("received signal 'SIGTERM', graceful shutdown initiated");
                break;
            }
        }
    }

    // Graceful teardown, abandoned outright once the SIGINT limit is hit.
    let shutdown = async {
        for lb in &lbs {
            error!(engine = %lb.kind(), "stopping load balancer engine");
            if let Err(e) = lb.stop().await {
                error_user_print(&e);
            }
        }
        info!("{OUTRO}");
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => return 0,
            _ = sigint.recv() => {
                match sigints.record() {
                    SigintAction::ForceExit => {
                        error!(
                            "graceful shutdown interrupted, SIGINT signal counter limit reached, \
                             exiting"
                        );
                        return FORCED_EXIT_CODE;
                    }
                    SigintAction::Note(count) => {
                        info!("SIGINT signal counter {count}/{}", sigints.limit());
                    }
                    SigintAction::StartShutdown => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[tokio::test]
    async fn run_with_missing_config_exits_1() {
        let cli = Cli::parse_from(["lobby", "-c", "/nonexistent/lobby.conf"]);
        assert_eq!(run(&cli).await, 1);
    }

    #[tokio::test]
    async fn run_with_invalid_config_exits_1() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "lb:\n  - engine: bleh\n    targets: []").unwrap();
        let cli = Cli::parse_from(["lobby", "-c", f.path().to_str().unwrap()]);
        assert_eq!(run(&cli).await, 1);
    }
}
