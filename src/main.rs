use clap::{Arg, ArgMatches, Command};
use tcp_balancer::{config::Settings, monitoring, proxy::ProxyServer};
use tracing::{error, info};

// 版本信息常量
const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_TIME: &str = env!("BUILD_TIME");
const GIT_HASH: &str = env!("GIT_HASH");
const GIT_BRANCH: &str = env!("GIT_BRANCH");
const RUST_VERSION: &str = env!("RUST_VERSION");
const TARGET_ARCH: &str = env!("TARGET_ARCH");
const BUILD_PROFILE: &str = env!("BUILD_PROFILE");

fn get_version_info() -> String {
    format!(
        "TCP Balancer v{}\n\
        Build Information:\n\
        ├─ Build Time: {}\n\
        ├─ Git Hash: {}\n\
        ├─ Git Branch: {}\n\
        ├─ Rust Version: {}\n\
        ├─ Target Architecture: {}\n\
        └─ Build Profile: {}",
        VERSION, BUILD_TIME, GIT_HASH, GIT_BRANCH, RUST_VERSION, TARGET_ARCH, BUILD_PROFILE
    )
}

fn build_cli() -> Command {
    Command::new("tcp-balancer")
        .version(VERSION)
        .about("A round-robin TCP load balancer with active health checking")
        .long_about(
            "TCP Balancer accepts client connections and forwards each request to one of the\n\
            configured backends in round-robin order. Backends are probed periodically; ones\n\
            that fail a probe are skipped until they answer again.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (TOML)"),
        )
        .arg(
            Arg::new("host")
                .short('H')
                .long("host")
                .value_name("HOST")
                .help("Listen host"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("Listen port"),
        )
        .arg(
            Arg::new("servers")
                .short('s')
                .long("servers")
                .value_name("HOST:PORT,...")
                .help("Comma-separated list of backend addresses"),
        )
        .arg(
            Arg::new("health-interval")
                .long("health-interval")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64))
                .help("Seconds between health check rounds"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Set log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("write-config")
                .long("write-config")
                .value_name("FILE")
                .help("Write the effective configuration to FILE and exit"),
        )
        .arg(
            Arg::new("version-info")
                .long("version-info")
                .help("Show detailed version and build information")
                .action(clap::ArgAction::SetTrue),
        )
}

/// 命令行参数覆盖配置文件
fn apply_overrides(settings: &mut Settings, matches: &ArgMatches) {
    if let Some(host) = matches.get_one::<String>("host") {
        settings.server.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        settings.server.port = *port;
    }
    if let Some(servers) = matches.get_one::<String>("servers") {
        settings.set_backends_from_list(servers);
    }
    if let Some(interval) = matches.get_one::<u64>("health-interval") {
        settings.health_check.interval_secs = *interval;
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        settings.monitoring.log_level = level.clone();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();

    if matches.get_flag("version-info") {
        println!("{}", get_version_info());
        return Ok(());
    }

    let mut settings = match matches.get_one::<String>("config") {
        Some(path) => Settings::load_from_path(path).await?,
        None => Settings::default(),
    };
    apply_overrides(&mut settings, &matches);

    if let Some(path) = matches.get_one::<String>("write-config") {
        settings.save_to_path(path).await?;
        println!("Configuration written to {}", path);
        return Ok(());
    }

    monitoring::setup_logging(&settings.monitoring.log_level)?;

    info!("Starting TCP Balancer v{}", VERSION);
    info!("Build: {} ({})", GIT_HASH, BUILD_TIME);
    info!("Branch: {} | Profile: {}", GIT_BRANCH, BUILD_PROFILE);
    info!("Balancer Configuration:");
    info!("  Listen: {}", settings.server.bind_address());
    info!("  Backends: {}", settings.backends.join(", "));
    info!("  Health check interval: {}s", settings.health_check.interval_secs);
    if settings.monitoring.enable_metrics {
        info!("  Metrics: {}", settings.monitoring.metrics_bind);
    } else {
        info!("  Metrics: Disabled");
    }
    info!("  Process ID: {}", std::process::id());

    let server = ProxyServer::bind(settings).await?;

    // 阻塞直到收到关机信号
    match server.run().await {
        Ok(()) => {
            info!("TCP Balancer stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("TCP Balancer error: {:#}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let matches = build_cli().get_matches_from([
            "tcp-balancer",
            "--host",
            "0.0.0.0",
            "-p",
            "9000",
            "-s",
            "localhost:8001,localhost:8002",
            "--health-interval",
            "3",
        ]);

        let mut settings = Settings::default();
        apply_overrides(&mut settings, &matches);

        assert_eq!(settings.server.bind_address(), "0.0.0.0:9000");
        assert_eq!(settings.backends, vec!["localhost:8001", "localhost:8002"]);
        assert_eq!(settings.health_check.interval_secs, 3);
        assert_eq!(settings.monitoring.log_level, "info");
    }

    #[test]
    fn test_cli_is_well_formed() {
        build_cli().debug_assert();
    }
}
