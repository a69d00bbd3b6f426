use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use harbor_components::{EchoComponent, HeartbeatComponent, MaskingLayer};
use harbor_core::{ffi, print_logo, AppConfig, LayerRegistry, ServiceBuilder, ServiceManager};
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

const EXIT_OK: i32 = 0;
const EXIT_START_FAILURE: i32 = 1;
const EXIT_FATAL: i32 = 2;
const EXIT_SIGNALLED: i32 = 130;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: String,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
    print_logo();

    let args = Args::parse();
    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("load config {}: {e:#}", args.config);
            return EXIT_START_FAILURE;
        }
    };

    let mut layers = LayerRegistry::new();
    if let Err(e) = MaskingLayer::register(&mut layers, 0x5A) {
        error!("register codec layers: {e}");
        return EXIT_START_FAILURE;
    }

    let manager = Arc::new(ServiceManager::new(config.manager.clone(), layers));
    ffi::install_app(manager.clone());

    for service_config in &config.services {
        let builder = ServiceBuilder::new(service_config.clone())
            .component(EchoComponent::default())
            .component(HeartbeatComponent::new(1000));
        if let Err(e) = manager.create(builder) {
            error!("start service '{}': {e:#}", service_config.name);
            let _ = manager.stop_all().err();
            return EXIT_START_FAILURE;
        }
    }
    info!("harbor is up with {} service(s)", config.services.len());

    let term = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&term)) {
            error!("register signal handler: {e}");
            let _ = manager.stop_all().err();
            return EXIT_START_FAILURE;
        }
    }

    loop {
        std::thread::sleep(Duration::from_millis(200));
        if term.load(Ordering::Relaxed) {
            info!("signal received, stopping all services");
            if let Err(e) = manager.stop_all().err() {
                error!("shutdown error: {e:#}");
            }
            return EXIT_SIGNALLED;
        }
        if manager.fatal_occurred() {
            error!("a service died; tearing down");
            let _ = manager.stop_all().err();
            return EXIT_FATAL;
        }
        if manager.service_ids().is_empty() {
            info!("all services stopped, exiting");
            return EXIT_OK;
        }
    }
}
