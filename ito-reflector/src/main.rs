#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use ito_reflector_lib::config::{BackendKind, ReflectMode, SigFilter, StatsFormat};
use ito_reflector_lib::{nic, signal, Reflector, Stats};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Layer-2 reflector for ITO and RFC2544/Y.1564 test traffic")]
struct Cli {
    /// Network interface to reflect on (e.g. eth0, en0)
    interface: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output statistics as JSON
    #[arg(long, conflicts_with = "csv")]
    json: bool,

    /// Output statistics as CSV
    #[arg(long)]
    csv: bool,

    /// Enable latency measurements
    #[arg(long)]
    latency: bool,

    /// Statistics update interval in seconds
    #[arg(long, value_name = "SEC", default_value_t = 10)]
    stats_interval: u32,

    /// Required UDP destination port (0 = any)
    #[arg(long, value_name = "N", default_value_t = 3842)]
    port: u16,

    /// Disable the source-MAC OUI check
    #[arg(long)]
    no_oui_filter: bool,

    /// Expected source-MAC OUI
    #[arg(long, value_name = "XX:XX:XX", default_value = "00:c0:17")]
    oui: String,

    /// Which header layers to swap
    #[arg(long, value_enum, default_value = "all")]
    mode: Mode,

    /// Which signature families to accept
    #[arg(long, value_enum, default_value = "all")]
    sig_filter: Filter,

    /// Platform backend selection
    #[arg(long, value_enum, default_value = "auto")]
    backend: Backend,

    /// Worker thread count (0 = one per RX queue)
    #[arg(long, value_name = "N", default_value_t = 0)]
    workers: usize,

    /// Frames per backend batch
    #[arg(long, value_name = "N", default_value_t = 64)]
    batch_size: usize,

    /// Pin worker 0 to this CPU (-1 = per-queue heuristic)
    #[arg(long, value_name = "N", default_value_t = -1, allow_hyphen_values = true)]
    cpu: i32,

    /// Recompute IP/UDP checksums in software
    #[arg(long)]
    software_checksum: bool,

    /// Back the packet buffers with huge pages
    #[arg(long)]
    huge_pages: bool,

    /// Spin instead of sleeping on an idle RX path
    #[arg(long)]
    busy_poll: bool,

    /// Capture in promiscuous mode (bpf backend)
    #[arg(long)]
    promiscuous: bool,

    /// Bounded RX wait in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 100)]
    poll_timeout: u32,

    /// Compiled XDP filter object for the kernel-bypass backend
    #[arg(long, value_name = "PATH", default_value = "ito-reflector-xdp.o")]
    xdp_filter: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Mac,
    MacIp,
    All,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Filter {
    All,
    Ito,
    Rfc2544,
    Y1564,
    Custom,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Auto,
    Xdp,
    Ring,
    Bpf,
}

impl From<Mode> for ReflectMode {
    fn from(m: Mode) -> ReflectMode {
        match m {
            Mode::Mac => ReflectMode::Mac,
            Mode::MacIp => ReflectMode::MacIp,
            Mode::All => ReflectMode::All,
        }
    }
}

impl From<Filter> for SigFilter {
    fn from(f: Filter) -> SigFilter {
        match f {
            Filter::All => SigFilter::All,
            Filter::Ito => SigFilter::Ito,
            Filter::Rfc2544 => SigFilter::Rfc2544,
            Filter::Y1564 => SigFilter::Y1564,
            Filter::Custom => SigFilter::Custom,
        }
    }
}

impl From<Backend> for BackendKind {
    fn from(b: Backend) -> BackendKind {
        match b {
            Backend::Auto => BackendKind::Auto,
            Backend::Xdp => BackendKind::XdpBypass,
            Backend::Ring => BackendKind::PacketRing,
            Backend::Bpf => BackendKind::BpfDevice,
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();
}

fn main() -> ExitCode {
    // Invalid arguments exit 1; --help and --version exit 0.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    init_tracing(cli.verbose);

    let Some(oui) = nic::parse_oui(&cli.oui) else {
        error!(oui = %cli.oui, "invalid OUI, expected XX:XX:XX");
        return ExitCode::FAILURE;
    };

    let stats_format = if cli.json {
        StatsFormat::Json
    } else if cli.csv {
        StatsFormat::Csv
    } else {
        StatsFormat::Text
    };

    let mut reflector = match Reflector::new(&cli.interface) {
        Ok(r) => r,
        Err(err) => {
            error!(interface = %cli.interface, %err, "initialization failed");
            return ExitCode::FAILURE;
        }
    };

    let mut config = reflector.config().clone();
    config.num_workers = cli.workers;
    config.batch_size = cli.batch_size;
    config.ito_port = cli.port;
    config.filter_oui = !cli.no_oui_filter;
    config.oui = oui;
    config.reflect_mode = cli.mode.into();
    config.sig_filter = cli.sig_filter.into();
    config.software_checksum = cli.software_checksum;
    config.use_huge_pages = cli.huge_pages;
    config.busy_poll = cli.busy_poll;
    config.measure_latency = cli.latency;
    config.promiscuous = cli.promiscuous;
    config.poll_timeout_ms = cli.poll_timeout;
    config.cpu = cli.cpu;
    config.backend = cli.backend.into();
    config.xdp_object_path = cli.xdp_filter.clone();
    config.stats_format = stats_format;
    config.stats_interval_secs = cli.stats_interval.max(1);

    if let Err(err) = reflector.set_config(config) {
        error!(%err, "invalid configuration");
        return ExitCode::FAILURE;
    }

    if let Err(err) = signal::install_stop_handler() {
        error!(%err, "failed to install signal handlers");
        return ExitCode::FAILURE;
    }

    if let Err(err) = reflector.start() {
        error!(interface = %cli.interface, %err, "failed to start reflector");
        return ExitCode::FAILURE;
    }

    if stats_format == StatsFormat::Csv {
        println!("{}", Stats::csv_header());
    }
    if stats_format == StatsFormat::Text {
        info!("reflector running, press Ctrl-C to stop");
        if cli.latency {
            info!("latency measurement enabled");
        }
    }

    let interval = Duration::from_secs(u64::from(cli.stats_interval.max(1)));
    let mut last_print = Instant::now();
    while !signal::stop_requested() {
        std::thread::sleep(Duration::from_millis(200));
        if last_print.elapsed() >= interval {
            print_stats(&reflector.get_stats(), stats_format);
            last_print = Instant::now();
        }
    }

    info!("stopping reflector");
    reflector.stop();

    let final_stats = reflector.get_stats();
    if stats_format == StatsFormat::Text {
        println!("\nFinal statistics:");
    }
    print_stats(&final_stats, stats_format);

    ExitCode::SUCCESS
}

fn print_stats(stats: &Stats, format: StatsFormat) {
    match format {
        StatsFormat::Text => print!("{}", stats.render_text()),
        StatsFormat::Json => println!("{}", stats.render_json()),
        StatsFormat::Csv => println!("{}", stats.render_csv_row()),
    }
}
