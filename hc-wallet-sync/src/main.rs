//! Command-line entry point for the Hc wallet synchronization daemon.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Arg, ArgAction, Command, value_parser};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use hc_wallet_sync::bridge::ProcessBridge;
use hc_wallet_sync::notifications::Dispatcher;
use hc_wallet_sync::rpc::WsChainClient;
use hc_wallet_sync::storage::{IMPORTED_ACCOUNT, LedgerStore};
use hc_wallet_sync::{
    Address, LevelFilter, LogFileConfig, LoggingConfig, Network, Wallet, WalletConfig,
};

/// Archived daemon logs kept in the data directory.
const MAX_LOG_FILES: usize = 10;

fn cli() -> Command {
    Command::new("hc-walletd")
        .version(hc_wallet_sync::VERSION)
        .about("Hc wallet daemon: keeps the wallet ledger in sync with a full node")
        .arg(
            Arg::new("network")
                .short('n')
                .long("network")
                .value_name("NETWORK")
                .help("Network to operate on")
                .value_parser(["mainnet", "testnet", "simnet"])
                .default_value("mainnet"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Directory for the ledger and logs")
                .default_value("./hc-walletd-data"),
        )
        .arg(
            Arg::new("node")
                .long("node")
                .value_name("HOST:PORT")
                .help("Websocket endpoint of the full node (defaults to the network's local port)"),
        )
        .arg(Arg::new("rpc-user").long("rpc-user").value_name("USER").default_value(""))
        .arg(Arg::new("rpc-pass").long("rpc-pass").value_name("PASSWORD").default_value(""))
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info"),
        )
        .arg(
            Arg::new("no-log-file")
                .long("no-log-file")
                .help("Log to the console only")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("enable-voting")
                .long("enable-voting")
                .help("Vote with winning tickets and revoke missed ones")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("vote-bits")
                .long("vote-bits")
                .value_name("BITS")
                .help("Vote bits placed in votes")
                .value_parser(value_parser!(u16))
                .default_value("1"),
        )
        .arg(
            Arg::new("stake-pool")
                .long("stake-pool")
                .help("Operate as a stake-pool backend")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("pool-fees")
                .long("pool-fees")
                .value_name("PERCENT")
                .help("Pool fee in percent")
                .value_parser(value_parser!(f64))
                .default_value("0"),
        )
        .arg(
            Arg::new("pool-address")
                .long("pool-address")
                .value_name("ADDRESS")
                .help("Cold wallet fee address (can be used multiple times)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("relay-fee")
                .long("relay-fee")
                .value_name("ATOMS")
                .help("Relay fee in atoms per kilobyte")
                .value_parser(value_parser!(i64)),
        )
        .arg(
            Arg::new("allow-high-fees")
                .long("allow-high-fees")
                .help("Let the node accept transactions with high fees")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("bridge")
                .long("bridge")
                .value_name("PROGRAM")
                .help("Token-protocol engine to launch and keep in sync"),
        )
        .arg(
            Arg::new("bridge-arg")
                .long("bridge-arg")
                .value_name("ARG")
                .help("Argument passed to the token-protocol engine (can be used multiple times)")
                .action(ArgAction::Append)
                .allow_hyphen_values(true),
        )
        .arg(
            Arg::new("max-reorg-depth")
                .long("max-reorg-depth")
                .value_name("BLOCKS")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("rescan-batch-size")
                .long("rescan-batch-size")
                .value_name("BLOCKS")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("watch-address")
                .short('w')
                .long("watch-address")
                .value_name("ADDRESS")
                .help("Address to watch for transactions (can be used multiple times)")
                .action(ArgAction::Append),
        )
}

fn parse_addresses(
    matches: &clap::ArgMatches,
    id: &str,
    network: Network,
) -> Result<Vec<Address>, String> {
    let Some(values) = matches.get_many::<String>(id) else {
        return Ok(Vec::new());
    };
    values
        .map(|s| {
            let address: Address = s.parse().map_err(|e| format!("Invalid address '{}': {}", s, e))?;
            if address.network() != network {
                return Err(format!("Address '{}' is not valid for network {}", s, network));
            }
            Ok(address)
        })
        .collect()
}

fn build_config(matches: &clap::ArgMatches) -> Result<WalletConfig, String> {
    let network: Network = matches
        .get_one::<String>("network")
        .ok_or("network is required")?
        .parse()
        .map_err(|e| format!("{e}"))?;
    let data_dir = PathBuf::from(matches.get_one::<String>("data-dir").ok_or("data-dir is required")?);

    let mut config = WalletConfig::new(network).with_data_dir(data_dir);

    if let Some(node) = matches.get_one::<String>("node") {
        config.node_endpoint = node.clone();
    }
    let user = matches.get_one::<String>("rpc-user").cloned().unwrap_or_default();
    let password = matches.get_one::<String>("rpc-pass").cloned().unwrap_or_default();
    let endpoint = config.node_endpoint.clone();
    config = config.with_node(endpoint, user, password);

    if matches.get_flag("enable-voting") {
        let bits = matches.get_one::<u16>("vote-bits").copied().unwrap_or(1);
        config = config.with_voting(bits);
    }
    if matches.get_flag("stake-pool") {
        let fees = matches.get_one::<f64>("pool-fees").copied().unwrap_or_default();
        config = config.with_stake_pool(fees, parse_addresses(matches, "pool-address", network)?);
    }
    if let Some(fee) = matches.get_one::<i64>("relay-fee") {
        config = config.with_relay_fee(*fee);
    }
    config = config.with_allow_high_fees(matches.get_flag("allow-high-fees"));
    if let Some(program) = matches.get_one::<String>("bridge") {
        let args = matches.get_many::<String>("bridge-arg").map(|a| a.cloned().collect()).unwrap_or_default();
        config = config.with_bridge(program, args);
    }
    if let Some(depth) = matches.get_one::<usize>("max-reorg-depth") {
        config = config.with_max_reorg_depth(*depth);
    }
    if let Some(size) = matches.get_one::<usize>("rescan-batch-size") {
        config = config.with_rescan_batch_size(*size);
    }

    let level: LevelFilter = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info")
        .parse()
        .map_err(|e| format!("Invalid log level: {e}"))?;
    let file = (!matches.get_flag("no-log-file"))
        .then(|| LogFileConfig::in_data_dir(&config.data_dir, MAX_LOG_FILES));
    config = config.with_logging(LoggingConfig {
        level: Some(level),
        console: true,
        file,
    });

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = cli().get_matches();

    let config = match build_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };

    let _logging_guard = hc_wallet_sync::init_logging(config.logging.clone())?;

    tracing::info!("Starting Hc wallet daemon");
    tracing::info!("Network: {}", config.network);
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Node: {}", config.node_endpoint);

    let ledger = match LedgerStore::open(&config.data_dir).await {
        Ok(ledger) => ledger,
        Err(e) => {
            eprintln!("Failed to open wallet ledger: {}", e);
            process::exit(1);
        }
    };

    let mut wallet = Wallet::new(config.clone(), ledger)?;
    if let Some(bridge_config) = &config.bridge {
        let bridge = ProcessBridge::spawn(bridge_config)?;
        wallet = wallet.with_bridge(Arc::new(bridge));
    }
    if config.enable_voting {
        tracing::warn!("Voting is enabled but this daemon holds no signing keys, votes will not be sent");
    }
    let wallet = Arc::new(wallet);

    for address in parse_addresses(&matches, "watch-address", config.network)? {
        match wallet.import_address(address, IMPORTED_ACCOUNT, false, 0).await {
            Ok(()) => tracing::info!("Watching address {}", address),
            Err(e) if e.is_duplicate() => tracing::debug!("Address {} is already watched", address),
            Err(e) => return Err(e.into()),
        }
    }

    let (client, streams) = match WsChainClient::connect(&config).await {
        Ok(connected) => connected,
        Err(e) => {
            eprintln!("Failed to connect to node {}: {}", config.node_endpoint, e);
            process::exit(1);
        }
    };
    let client = Arc::new(client);
    wallet.associate_chain_client(client.clone()).await?;

    match wallet.main_chain_tip()? {
        Some(tip) => tracing::info!("Wallet tip: {} at height {}", tip.hash, tip.height),
        None => tracing::info!("Wallet has no blocks yet"),
    }

    let shutdown = CancellationToken::new();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl-C: {}", e);
            return;
        }
        tracing::info!("Received Ctrl-C, shutting down");
        ctrl_c_shutdown.cancel();
    });

    Dispatcher::new(wallet.clone(), streams, shutdown.clone()).run().await;

    shutdown.cancel();
    client.disconnect();
    wallet.disassociate_chain_client().await;
    tracing::info!("Hc wallet daemon stopped");
    Ok(())
}
