#[macro_use]
extern crate log;
extern crate ctrlc;
extern crate simplelog;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};

use crate::config::Args;
use crate::dtu::TcpConnector;
use crate::metrics::MetricRegistry;
use crate::poller::{PollTiming, Poller};
use crate::session::{EncryptionConfig, SessionManager};
use clap::Parser;
use std::fs::OpenOptions;
use std::sync::Arc;
use tokio::sync::watch;

mod config;
mod dtu;
mod metrics;
mod normalizer;
mod poller;
mod protocol;
mod session;
mod webserver;

fn logging_init(log_path: Option<String>) {
    let conf = ConfigBuilder::new()
        .set_time_format_str("%F, %H:%M:%S%.3f")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![];

    let console_logger: Box<dyn SharedLogger> = TermLogger::new(
        LevelFilter::Debug,
        conf.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
    loggers.push(console_logger);

    let mut logfile_error: Option<String> = None;
    if let Some(ref log_path) = log_path {
        let logfile = OpenOptions::new().create(true).append(true).open(log_path);
        match logfile {
            Ok(logfile) => {
                loggers.push(WriteLogger::new(LevelFilter::Info, conf, logfile));
            }
            Err(e) => {
                logfile_error = Some(format!(
                    "Error creating/opening log file: {:?}: {:?}",
                    log_path, e
                ));
            }
        }
    }

    CombinedLogger::init(loggers).expect("Cannot initialize logging subsystem");
    if let Some(e) = logfile_error {
        error!("{}", e);
        warn!("Will do console logging only...");
    }
}

async fn run(config: config::Config, shutdown: watch::Receiver<bool>) -> i32 {
    let metrics = match MetricRegistry::new() {
        Ok(m) => Arc::new(m),
        Err(e) => {
            error!("Cannot create metric registry: {}", e);
            return 1;
        }
    };

    //creating webserver task
    let mut web = webserver::WebServer {
        name: "webserver".to_string(),
        port: config.address.exporter_port,
        metrics: metrics.clone(),
        shutdown: shutdown.clone(),
    };
    let mut server = tokio::spawn(async move { web.worker().await });

    //creating DTU poller
    let timing = PollTiming {
        poll_interval: config.poll_interval,
        timeout: config.address.timeout,
        max_soft_misses: config.max_soft_misses,
    };
    let manager = SessionManager::new(
        "hoymiles".to_string(),
        TcpConnector,
        config.address,
        config.encryption,
    );
    let mut poller = Poller::new("poller".to_string(), manager, metrics, timing, shutdown);

    debug!("Entering main loop...");
    let polled = tokio::select! {
        res = &mut server => {
            return match res {
                Ok(Ok(())) => 0,
                Ok(Err(e)) => {
                    error!("webserver: {}", e);
                    1
                }
                Err(e) => {
                    error!("webserver: task failed: {}", e);
                    1
                }
            };
        }
        res = poller.worker() => res,
    };
    if let Err(e) = polled {
        error!("{}: {}", poller.name, e);
    }

    info!("Waiting for webserver to stop...");
    match server.await {
        Ok(Err(e)) => error!("webserver: {}", e),
        Err(e) => error!("webserver: task failed: {}", e),
        Ok(Ok(())) => {}
    }
    0
}

fn main() {
    let args = Args::parse();
    logging_init(config::log_location(&args));
    info!("Welcome to hoymiles-exporter (Hoymiles DTU prometheus exporter)");

    let config = match config::Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "DTU: {}:{}, encryption: {:?}, poll interval: {}, timeout: {}",
        config.address.host,
        config.address.dtu_port,
        config.encryption,
        humantime::format_duration(config.poll_interval),
        humantime::format_duration(config.address.timeout),
    );
    if let Some(ref log) = config.log {
        debug!("Logging to file: {}", log);
    }
    if let EncryptionConfig::PresharedKey(_) = config.encryption {
        warn!("Preshared key given: encrypted DTU payloads cannot be decoded, no device metrics will be published");
    }

    //Ctrl-C / SIGTERM support
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Ctrl-C or SIGTERM signal detected, exiting...");
        let _ = shutdown_tx.send(true);
    }) {
        error!("Error setting Ctrl-C handler: {}", e);
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Cannot start async runtime: {}", e);
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(run(config, shutdown_rx));
    drop(runtime);

    info!("Done, exiting");
    std::process::exit(code);
}
