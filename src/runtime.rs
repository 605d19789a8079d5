//! Process runtime
//!
//! Wires intake, counter engine, evaluator and attack manager together and
//! owns their threads. The hot path is plain threads over UDP sockets; the
//! async side only handles signals and shutdown sequencing.
//!
//! Signals: SIGHUP reloads the configuration (atomic resolver-generation
//! swap; a bad config is rejected and the old one keeps running), SIGTERM
//! and SIGINT shut down gracefully with one final drain tick.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::ban::{AttackObserver, BanConfig, BanManager, ExecScriptObserver, LogObserver};
use crate::config::Config;
use crate::core::ema_alpha;
use crate::engine::tick::{run_tick_loop, TickContext};
use crate::engine::{EngineStats, HostMap, HostMapConfig, TrafficProcessor};
use crate::mitigation::{LogMitigator, Mitigator};
use crate::resolver::{Generation, HostGroupResolver};
use crate::telemetry::netflow::NetflowDecoder;
use crate::telemetry::sflow::SflowDecoder;
use crate::telemetry::{spawn_mirror_replay, spawn_udp_listener, IntakeStats, PacketSink};

/// Exit codes per the operational contract
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG_ERROR: i32 = 64;
pub const EXIT_BIND_FAILURE: i32 = 69;
pub const EXIT_FATAL: i32 = 70;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The assembled daemon. Start/stop bracket the worker threads; the value
/// itself is the explicit process-wide state.
pub struct Runtime {
    config: Config,
    config_path: Option<PathBuf>,

    resolver: Arc<HostGroupResolver>,
    map: Arc<HostMap>,
    ban: Arc<BanManager>,
    pub engine_stats: Arc<EngineStats>,
    pub intake_stats: Arc<IntakeStats>,

    cancel: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    /// A rejected reload is remembered and reported via the exit code
    config_error_seen: AtomicBool,
}

impl Runtime {
    /// Build the runtime from a validated configuration.
    pub fn new(config: Config, config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let generation = Generation::build(&config).context("Building resolver")?;
        let resolver = Arc::new(HostGroupResolver::new(generation));

        let map = Arc::new(HostMap::new(HostMapConfig {
            max_hosts_per_group: config.detection.max_hosts_per_group,
            host_idle_timeout_secs: config.detection.host_idle_timeout,
            conntrack_capacity: config.detection.conntrack_capacity,
        }));

        let mitigator: Arc<dyn Mitigator> = Arc::new(LogMitigator);
        let mut observers: Vec<Box<dyn AttackObserver>> = vec![Box::new(LogObserver)];
        if let Some(script) = &config.notify.script_path {
            observers.push(Box::new(ExecScriptObserver::new(script.clone())));
        }

        let ban = Arc::new(BanManager::new(
            BanConfig::from_config(&config),
            mitigator,
            observers,
        ));

        Ok(Self {
            config,
            config_path,
            resolver,
            map,
            ban,
            engine_stats: Arc::new(EngineStats::default()),
            intake_stats: Arc::new(IntakeStats::default()),
            cancel: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
            config_error_seen: AtomicBool::new(false),
        })
    }

    /// Bind listeners and spawn the worker threads. A bind failure aborts
    /// startup with the dedicated exit code.
    pub fn start(&mut self) -> Result<(), StartError> {
        let sink: Arc<dyn PacketSink> = Arc::new(TrafficProcessor::new(
            Arc::clone(&self.resolver),
            Arc::clone(&self.map),
            Arc::clone(&self.engine_stats),
            self.ban.capture_index(),
        ));

        let capture_payload = self.config.capture.enabled;

        if self.config.intake.sflow.enabled {
            let handle = spawn_udp_listener(
                "sflow",
                self.config.intake.sflow.listen,
                Box::new(SflowDecoder::new(capture_payload)),
                Arc::clone(&sink),
                Arc::clone(&self.intake_stats),
                Arc::clone(&self.cancel),
            )
            .map_err(StartError::Bind)?;
            self.threads.push(handle);
        }

        if self.config.intake.netflow.enabled {
            let handle = spawn_udp_listener(
                "netflow",
                self.config.intake.netflow.listen,
                Box::new(NetflowDecoder::new(self.config.intake.netflow_sampling_ratio)),
                Arc::clone(&sink),
                Arc::clone(&self.intake_stats),
                Arc::clone(&self.cancel),
            )
            .map_err(StartError::Bind)?;
            self.threads.push(handle);
        }

        if self.config.intake.mirror.enabled {
            match &self.config.intake.mirror.pcap_file {
                Some(path) => {
                    let handle = spawn_mirror_replay(
                        path.clone(),
                        Arc::clone(&sink),
                        Arc::clone(&self.intake_stats),
                        Arc::clone(&self.cancel),
                        capture_payload,
                    )
                    .map_err(StartError::Bind)?;
                    self.threads.push(handle);
                }
                None => warn!("mirror intake enabled without a pcap_file; ignoring"),
            }
        }

        let tick_ctx = TickContext {
            map: Arc::clone(&self.map),
            resolver: Arc::clone(&self.resolver),
            ban: Arc::clone(&self.ban),
            stats: Arc::clone(&self.engine_stats),
            alpha: ema_alpha(self.config.detection.average_calculation_time.max(1) as f64),
        };
        let cancel = Arc::clone(&self.cancel);
        let handle = std::thread::Builder::new()
            .name("tick-driver".to_string())
            .spawn(move || run_tick_loop(tick_ctx, cancel))
            .map_err(|err| StartError::Other(anyhow::Error::new(err).context("Spawning tick driver")))?;
        self.threads.push(handle);

        info!("Runtime started with {} worker threads", self.threads.len());
        Ok(())
    }

    /// Reload configuration and swap the resolver generation atomically.
    /// On any error the running generation stays in place; the failure is
    /// remembered for the shutdown exit code.
    pub fn reload(&self) {
        let Some(path) = &self.config_path else {
            warn!("Reload requested but no config file was given; ignoring");
            return;
        };

        info!("Reloading configuration from {}", path.display());

        let rebuilt = Config::load(path).and_then(|config| Generation::build(&config));
        match rebuilt {
            Ok(generation) => {
                self.resolver.swap(generation);
                info!("Configuration reloaded");
            }
            Err(err) => {
                error!("Reload rejected, keeping the running configuration: {:#}", err);
                self.config_error_seen.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Graceful shutdown: raise the cancel flag, let workers drain (the
    /// tick driver runs one final tick and withdraws outstanding
    /// mitigations), and join everything.
    pub fn stop(&mut self) {
        info!("Shutting down");
        self.cancel.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("A worker thread panicked during shutdown");
            }
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.config_error_seen.load(Ordering::Relaxed) {
            EXIT_CONFIG_ERROR
        } else {
            EXIT_OK
        }
    }

    pub fn ban_manager(&self) -> Arc<BanManager> {
        Arc::clone(&self.ban)
    }

    pub fn host_map(&self) -> Arc<HostMap> {
        Arc::clone(&self.map)
    }
}

/// Run the daemon until a termination signal arrives. Returns the process
/// exit code.
pub async fn run_daemon(config: Config, config_path: Option<PathBuf>) -> i32 {
    let mut runtime = match Runtime::new(config, config_path) {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Invalid configuration: {:#}", err);
            return EXIT_CONFIG_ERROR;
        }
    };

    match runtime.start() {
        Ok(()) => {}
        Err(StartError::Bind(err)) => {
            error!("Listener bind failed: {}", err);
            return EXIT_BIND_FAILURE;
        }
        Err(StartError::Other(err)) => {
            error!("Startup failed: {:#}", err);
            return EXIT_FATAL;
        }
    }

    wait_for_shutdown(&runtime).await;

    runtime.stop();
    runtime.exit_code()
}

#[cfg(unix)]
async fn wait_for_shutdown(runtime: &Runtime) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            error!("Failed to install SIGHUP handler: {}", err);
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!("Failed to install SIGTERM handler: {}", err);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sighup.recv() => runtime.reload(),
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!("Signal wait failed: {}", err);
                }
                info!("Interrupt received");
                break;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_runtime: &Runtime) {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_listeners(sflow_port: u16, netflow_port: u16) -> Config {
        let mut config = Config::default();
        config.networks_list = vec!["10.0.0.0/8".to_string()];
        config.intake.sflow.enabled = true;
        config.intake.sflow.listen = format!("127.0.0.1:{}", sflow_port).parse().unwrap();
        config.intake.netflow.enabled = true;
        config.intake.netflow.listen = format!("127.0.0.1:{}", netflow_port).parse().unwrap();
        config
    }

    #[test]
    fn test_start_stop() {
        let mut runtime = Runtime::new(config_with_listeners(0, 0), None).unwrap();
        runtime.start().unwrap();
        runtime.stop();
        assert_eq!(runtime.exit_code(), EXIT_OK);
    }

    #[test]
    fn test_bind_conflict_reported() {
        let mut first = Runtime::new(config_with_listeners(39_431, 39_432), None).unwrap();
        first.start().unwrap();

        let mut second = Runtime::new(config_with_listeners(39_431, 39_432), None).unwrap();
        match second.start() {
            Err(StartError::Bind(_)) => {}
            other => panic!("expected bind failure, got {:?}", other.map(|_| ())),
        }

        second.stop();
        first.stop();
    }

    #[test]
    fn test_reload_without_path_is_noop() {
        let runtime = Runtime::new(config_with_listeners(0, 0), None).unwrap();
        runtime.reload();
        assert_eq!(runtime.exit_code(), EXIT_OK);
    }

    #[test]
    fn test_failed_reload_sets_exit_code() {
        let dir = std::env::temp_dir().join("ddosmon-runtime-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "networks_list = [\"10.0.0.0/8\"]\n").unwrap();

        let runtime = Runtime::new(config_with_listeners(0, 0), Some(path.clone())).unwrap();
        runtime.reload();
        assert_eq!(runtime.exit_code(), EXIT_OK);

        // Now break the file: the reload is rejected and remembered
        std::fs::write(&path, "networks_list = [\"not-a-cidr\"]\n").unwrap();
        runtime.reload();
        assert_eq!(runtime.exit_code(), EXIT_CONFIG_ERROR);

        std::fs::remove_file(&path).ok();
    }
}
