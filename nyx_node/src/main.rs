#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;

mod cli_config;
mod keys;
mod node_config;
mod udp_link;

use std::sync::Arc;

use tokio::net::UdpSocket;

use nyx_binary_io::FromBytes;
use nyx_core::nodedb::disk::DiskWorker;
use nyx_core::nodedb::NodeDb;
use nyx_core::router::{Router, RouterConfig};
use nyx_core::time::now_ms;
use nyx_packet::router_contact::{AddressInfo, NetId, RouterContact};

use crate::cli_config::{cli_parse, CliConfig};
use crate::udp_link::UdpLink;

fn fatal(msg: String) -> ! {
    error!("{}", msg);
    std::process::exit(1);
}

fn load_bootstrap(config: &CliConfig, net_id: &NetId) -> Vec<RouterContact> {
    let now = now_ms();
    let mut rcs = Vec::new();
    for path in &config.bootstrap {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("cannot read bootstrap file {}: {}", path.display(), e);
                continue;
            }
        };
        match RouterContact::from_bytes(&bytes) {
            Ok((_, rc)) if rc.verify(net_id, now) => rcs.push(rc),
            Ok(_) => warn!("bootstrap file {} holds an invalid RC", path.display()),
            Err(_) => warn!("bootstrap file {} is not an RC", path.display()),
        }
    }
    rcs
}

#[tokio::main]
async fn main() {
    let config = cli_parse();

    env_logger::Builder::new()
        .parse_filters(&config.log)
        .init();
    info!("nyx {}", nyx::crate_version());

    let net_id = match NetId::new(&config.netid) {
        Some(net_id) => net_id,
        None => fatal(format!("invalid netid {:?}", config.netid)),
    };

    if let Err(e) = std::fs::create_dir_all(&config.keys_dir) {
        fatal(format!("cannot create {}: {}", config.keys_dir.display(), e));
    }
    let identity = match keys::load_or_create_identity(&config.keys_dir.join("identity.key")) {
        Ok(key) => key,
        Err(e) => fatal(format!("identity key unavailable: {}", e)),
    };
    let encryption = match keys::load_or_create_encryption(&config.keys_dir.join("encryption.key")) {
        Ok(key) => key,
        Err(e) => fatal(format!("encryption key unavailable: {}", e)),
    };

    let (disk, disk_task) = DiskWorker::new();
    tokio::spawn(disk_task);

    let nodedb = NodeDb::new(config.nodedb.clone(), net_id.clone(), disk.clone());
    match nodedb.load_dir() {
        Ok(count) => info!("loaded {} descriptors from {}", count, config.nodedb.display()),
        Err(e) => warn!("could not load nodedb: {}", e),
    }

    let advertise_addrs = match config.public_address {
        Some(addr) => vec![AddressInfo {
            dialect: "udp".to_owned(),
            ip: addr.ip(),
            port: addr.port(),
            rank: 1,
        }],
        None => Vec::new(),
    };
    let bootstrap = load_bootstrap(&config, &net_id);
    for rc in &bootstrap {
        nodedb.insert(rc.clone());
    }

    let router_config = RouterConfig {
        net_id: net_id.clone(),
        allow_transit: config.allow_transit,
        allow_exit: config.allow_exit,
        is_service_node: config.public_address.is_some(),
        advertise_addrs,
        bootstrap,
        our_rc_file: Some(config.nodedb.join("our_rc.signed")),
        profiles_file: Some(config.nodedb.join("profiles.dat")),
        ..RouterConfig::default()
    };

    let socket = match UdpSocket::bind(config.udp_address).await {
        Ok(socket) => socket,
        Err(e) => fatal(format!("cannot bind {}: {}", config.udp_address, e)),
    };
    info!("listening on {}", config.udp_address);

    // the link introduces us with the same descriptor the router signs
    let mut our_rc = RouterContact::new(&identity, encryption.public_key(), net_id);
    our_rc.addrs = router_config.advertise_addrs.clone();
    if let Err(e) = our_rc.sign(&identity, now_ms()) {
        fatal(format!("cannot sign our RC: {:?}", e));
    }

    let (link, events, driver) = UdpLink::new(socket, our_rc);
    tokio::spawn(driver);

    let router = Router::new(
        identity,
        encryption,
        router_config,
        nodedb,
        link as Arc<dyn nyx_core::link::LinkLayer>,
        disk,
    );
    info!("router {} running", router.id);

    let runner = router.clone();
    let run = tokio::spawn(async move { runner.run(events).await });

    wait_for_shutdown().await;
    router.stop().await;
    run.abort();
    info!("bye");
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => fatal(format!("cannot install signal handler: {}", e)),
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt"),
        _ = terminate.recv() => info!("terminate"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    if tokio::signal::ctrl_c().await.is_err() {
        fatal("cannot install signal handler".to_owned());
    }
    info!("interrupt");
}
