//! Command line parsing and the merge with the optional config file.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{App, Arg};

use crate::node_config::NodeConfig;

/// Effective node configuration after merging CLI over the config file.
#[derive(Clone, Debug)]
pub struct CliConfig {
    /// UDP address to bind.
    pub udp_address: SocketAddr,
    /// Publicly reachable address to advertise, if any.
    pub public_address: Option<SocketAddr>,
    /// NodeDB directory.
    pub nodedb: PathBuf,
    /// Directory holding the secret key files.
    pub keys_dir: PathBuf,
    /// Network tag.
    pub netid: String,
    /// Relay paths and DHT lookups for others.
    pub allow_transit: bool,
    /// Grant exit requests.
    pub allow_exit: bool,
    /// Files containing bootstrap descriptors.
    pub bootstrap: Vec<PathBuf>,
    /// Log filter.
    pub log: String,
}

fn parse_or_exit<T: std::str::FromStr>(value: &str, what: &str) -> T {
    match value.parse() {
        Ok(value) => value,
        Err(_) => {
            eprintln!("invalid {}: {}", what, value);
            std::process::exit(1);
        }
    }
}

/// Parse command line arguments, loading `--config` when given.
pub fn cli_parse() -> CliConfig {
    let matches = App::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(Arg::with_name("config")
            .short("c")
            .long("config")
            .help("Path to a YAML config file")
            .takes_value(true))
        .arg(Arg::with_name("udp-address")
            .short("u")
            .long("udp-address")
            .help("UDP address to bind")
            .takes_value(true))
        .arg(Arg::with_name("public-address")
            .short("p")
            .long("public-address")
            .help("Publicly reachable address to advertise (makes this a service node)")
            .takes_value(true))
        .arg(Arg::with_name("nodedb")
            .short("n")
            .long("nodedb")
            .help("Directory for the router descriptor database")
            .takes_value(true))
        .arg(Arg::with_name("keys-dir")
            .short("k")
            .long("keys-dir")
            .help("Directory holding the secret key files")
            .takes_value(true))
        .arg(Arg::with_name("netid")
            .long("netid")
            .help("Network tag; mismatched peers are rejected")
            .takes_value(true))
        .arg(Arg::with_name("allow-transit")
            .long("allow-transit")
            .help("Relay paths and DHT lookups for other routers"))
        .arg(Arg::with_name("allow-exit")
            .long("allow-exit")
            .help("Grant exit requests on paths terminating here"))
        .arg(Arg::with_name("bootstrap")
            .short("b")
            .long("bootstrap")
            .help("File containing a bootstrap descriptor")
            .multiple(true)
            .takes_value(true))
        .arg(Arg::with_name("log")
            .long("log")
            .help("Log filter, e.g. info or nyx_core=debug")
            .takes_value(true))
        .get_matches();

    let file = match matches.value_of("config") {
        Some(path) => match NodeConfig::load(std::path::Path::new(path)) {
            Ok(file) => file,
            Err(e) => {
                eprintln!("failed to load config {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => NodeConfig::default(),
    };

    let udp_address = matches
        .value_of("udp-address")
        .map(|v| parse_or_exit(v, "udp address"))
        .or(file.udp_address)
        .unwrap_or_else(|| "0.0.0.0:1090".parse().expect("default bind address"));
    let public_address = matches
        .value_of("public-address")
        .map(|v| parse_or_exit(v, "public address"))
        .or(file.public_address);
    let nodedb = matches
        .value_of("nodedb")
        .map(PathBuf::from)
        .or(file.nodedb)
        .unwrap_or_else(|| PathBuf::from("nodedb"));
    let keys_dir = matches
        .value_of("keys-dir")
        .map(PathBuf::from)
        .or(file.keys_dir)
        .unwrap_or_else(|| PathBuf::from("keys"));
    let netid = matches
        .value_of("netid")
        .map(str::to_owned)
        .or(file.netid)
        .unwrap_or_else(|| "nyx".to_owned());
    let allow_transit =
        matches.is_present("allow-transit") || file.allow_transit.unwrap_or(false);
    let allow_exit = matches.is_present("allow-exit") || file.allow_exit.unwrap_or(false);
    let mut bootstrap: Vec<PathBuf> = file.bootstrap.unwrap_or_default();
    if let Some(values) = matches.values_of("bootstrap") {
        bootstrap.extend(values.map(PathBuf::from));
    }
    let log = matches
        .value_of("log")
        .map(str::to_owned)
        .or(file.log)
        .unwrap_or_else(|| "info".to_owned());

    CliConfig {
        udp_address,
        public_address,
        nodedb,
        keys_dir,
        netid,
        allow_transit,
        allow_exit,
        bootstrap,
        log,
    }
}
