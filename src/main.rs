#![warn(unused_extern_crates)]
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;

mod chain;
mod clients;
mod com;
mod config;
mod logger;
mod proxy;
mod refresher;
mod server;
mod stats;
mod upstream;

use crate::chain::{Chain, ChainState};
use crate::clients::ClientRegistry;
use crate::com::client::Client;
use crate::com::ws::WsTransport;
use crate::config::{load_cfg, Cfg};
use crate::proxy::Proxy;
use crate::refresher::Refresher;
use crate::upstream::Upstream;
use clap::{Arg, Command};
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

fn main() {
    let matches = Command::new("Aggregator - a PoC mining proxy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sits between a fleet of PoC miners and up to two upstream pools or wallets")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Location of the config file")
                .default_value("config.yaml"),
        )
        .get_matches();
    let config = matches.get_one::<String>("config").unwrap();

    let cfg = load_cfg(config);
    logger::init_logger(&cfg);

    info!("aggregator v.{}", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start runtime");
    rt.block_on(run(cfg));
}

fn build_upstream(url: &Url, passphrase: &str, account_key: &str, cfg: &Cfg) -> Upstream {
    if url.scheme() == "wss" {
        let transport = WsTransport::new(
            url.clone(),
            account_key.to_owned(),
            cfg.miner_name.clone(),
        );
        transport.clone().start();
        Upstream::Push(transport)
    } else {
        Upstream::Pull(Client::new(
            url.clone(),
            passphrase.to_owned(),
            account_key.to_owned(),
            cfg.miner_name.clone(),
            cfg.miner_alias.clone(),
            cfg.timeout,
        ))
    }
}

async fn run(cfg: Cfg) {
    let secondary_push = cfg
        .secondary_submit_url
        .as_ref()
        .map(|url| url.scheme() == "wss")
        .unwrap_or(false);
    if cfg.primary_submit_url.scheme() == "wss" && secondary_push {
        error!("at most one streaming upstream is supported");
        process::exit(1);
    }

    info!("primary upstream: {}", cfg.primary_submit_url);
    if let Some(url) = &cfg.secondary_submit_url {
        info!("secondary upstream: {}", url);
    }
    info!(
        "primary mode: {}",
        if cfg.primary_passphrase.is_empty() { "pool" } else { "wallet" }
    );
    info!("primary target deadline: {}", cfg.primary_target_deadline);
    if cfg.secondary_submit_url.is_some() {
        info!("secondary target deadline: {}", cfg.secondary_target_deadline);
    }

    let clients = Arc::new(ClientRegistry::new());

    let primary_upstream = build_upstream(
        &cfg.primary_submit_url,
        &cfg.primary_passphrase,
        &cfg.primary_account_key,
        &cfg,
    );
    let secondary_upstream = cfg.secondary_submit_url.as_ref().map(|url| {
        build_upstream(url, &cfg.secondary_passphrase, &cfg.secondary_account_key, &cfg)
    });

    let primary_chain = Chain::new(
        "primary",
        cfg.primary_target_deadline,
        cfg.primary_ignore_worse_deadlines,
        cfg.primary_ip_forwarding,
    );
    let secondary_chain = cfg.secondary_submit_url.as_ref().map(|_| {
        Chain::new(
            "secondary",
            cfg.secondary_target_deadline,
            cfg.secondary_ignore_worse_deadlines,
            cfg.secondary_ip_forwarding,
        )
    });
    let chains = Arc::new(ChainState::new(primary_chain, secondary_chain));

    let refresher = Refresher {
        chains: chains.clone(),
        primary: primary_upstream.clone(),
        secondary: secondary_upstream.clone(),
        clients: clients.clone(),
        scan_time: Duration::from_secs(cfg.scan_time),
    };

    // miners must never see an empty round, so the first refresh gates the
    // listeners
    if let Err(e) = refresher.refresh_once().await {
        error!("initial refresh failed: {}", e);
        process::exit(1);
    }
    tokio::spawn(refresher.run());

    let proxy = Arc::new(Proxy::new(
        chains,
        primary_upstream,
        secondary_upstream,
        clients.clone(),
        cfg.miners_per_ip,
        cfg.lie_detector,
    ));

    let listen: SocketAddr = cfg.listen_address.parse().unwrap_or_else(|e| {
        error!("bad listen_address: {}", e);
        process::exit(1);
    });
    let stats_listen: SocketAddr = cfg.stats_listen_address.parse().unwrap_or_else(|e| {
        error!("bad stats_listen_address: {}", e);
        process::exit(1);
    });

    let stats_clients = clients.clone();
    let stats_limiter = server::limiter(cfg.rate_limit, cfg.burst_rate);
    tokio::spawn(async move {
        if let Err(e) = stats::run(stats_clients, stats_listen, stats_limiter).await {
            error!("stats listener failed: {}", e);
        }
    });

    let limiter = server::limiter(cfg.rate_limit, cfg.burst_rate);
    if let Err(e) = server::run(proxy, listen, limiter).await {
        error!("miner listener failed: {}", e);
        process::exit(1);
    }
}
