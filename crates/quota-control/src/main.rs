use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use pingora::server::configuration::Opt;
use quota_control::configuration::ServerConfig;
use quota_control::metric::Metrics;
use quota_control::server::Server;

fn main() {
    // Enable basic logging; set RUST_LOG=info for visibility.
    env_logger::init();

    let opt = Opt::parse();

    // The file passed with -c carries both pingora's settings and ours.
    let conf_path = opt.conf.clone().unwrap_or_else(|| "conf.yaml".to_string());
    let conf_str = std::fs::read_to_string(&conf_path).expect("Failed to read config file");
    let server_conf: ServerConfig =
        serde_yaml::from_str(&conf_str).expect("Failed to parse server config");
    let base = Path::new(&conf_path)
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let mut server = Server::new(Some(opt)).expect("Failed to create server");
    server
        .bootstrap(server_conf, &base, None, Arc::new(Metrics::new()))
        .expect("Failed to bootstrap server");

    server.run_forever();
}
