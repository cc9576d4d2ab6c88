use std::process::exit;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use env_logger::Env;

use flowlens::node;
use flowlens::report::{self, ActivityFilter};
use flowlens_common::{FLOW_TABLE_CAPACITY, MONITORED_PORTS_CAPACITY};

#[derive(Parser)]
#[command(name = "flowlens")]
#[command(about = "Per-port flow telemetry agent", long_about = None)]
struct Cli {
    /// Log filter, e.g. `info` or `flowlens=debug`. RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify traffic from an AF_PACKET ring in userspace
    Node(NodeCommand),
    /// Load the kernel classifier and attach it to an interface
    #[cfg(feature = "kernel")]
    Attach(AttachCommand),
    /// Print the flows of a pinned kernel flow table as JSON
    #[cfg(feature = "kernel")]
    Dump(DumpCommand),
}

#[derive(Args)]
struct ReportArgs {
    /// Seconds between flow table reports
    #[arg(long, default_value_t = 5)]
    report_interval_secs: u64,
    /// Only flows seen within this many seconds count as active
    #[arg(long, value_name = "SECS", default_value_t = report::DEFAULT_ACTIVITY_WINDOW.as_secs())]
    activity_window_secs: u64,
    /// Minimum packets for a flow to count as active
    #[arg(long, default_value_t = report::DEFAULT_MIN_PACKETS)]
    min_packets: u64,
    /// Minimum bytes for a flow to count as active
    #[arg(long, default_value_t = report::DEFAULT_MIN_BYTES)]
    min_bytes: u64,
    /// Empty the flow table after each report
    #[arg(long, action = ArgAction::SetTrue)]
    drain: bool,
    /// Emit reports as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

impl ReportArgs {
    fn interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }

    fn activity(&self) -> ActivityFilter {
        ActivityFilter {
            window: Duration::from_secs(self.activity_window_secs),
            min_packets: self.min_packets,
            min_bytes: self.min_bytes,
        }
    }
}

#[derive(Args)]
struct NodeCommand {
    /// Network interface to join via AF_PACKET
    #[arg(long, value_name = "IFACE")]
    iface: String,
    /// Destination port to monitor; repeat or separate with commas
    #[arg(long = "port", value_name = "PORT", value_delimiter = ',')]
    ports: Vec<u16>,
    /// Number of worker tasks pulling frames from the fanout group
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Optional PACKET_FANOUT group id
    #[arg(long, value_name = "GROUP")]
    fanout_group: Option<u16>,
    /// Flow table capacity
    #[arg(long, value_name = "ENTRIES", default_value_t = FLOW_TABLE_CAPACITY as usize)]
    capacity: usize,
    /// Size of each tpacket block (bytes)
    #[arg(long, value_name = "BYTES", default_value_t = node::DEFAULT_BLOCK_SIZE)]
    block_size: u32,
    /// Number of blocks provisioned for the RX ring
    #[arg(long, value_name = "COUNT", default_value_t = node::DEFAULT_BLOCK_COUNT)]
    block_count: u32,
    /// Size of each frame within a block (bytes)
    #[arg(long, value_name = "BYTES", default_value_t = node::DEFAULT_FRAME_SIZE)]
    frame_size: u32,
    /// Milliseconds before an idle block is recycled
    #[arg(long, value_name = "MILLIS", default_value_t = node::DEFAULT_BLOCK_TIMEOUT_MS)]
    block_timeout_ms: u32,
    #[command(flatten)]
    report: ReportArgs,
}

#[cfg(feature = "kernel")]
#[derive(Args)]
struct AttachCommand {
    /// Interface to attach to
    #[arg(long, value_name = "IFACE")]
    iface: String,
    /// Destination port to monitor; repeat or separate with commas
    #[arg(long = "port", value_name = "PORT", value_delimiter = ',')]
    ports: Vec<u16>,
    /// Hook the classifier runs on
    #[arg(long, value_enum, default_value_t = flowlens::loader::AttachPoint::TcIngress)]
    attach_point: flowlens::loader::AttachPoint,
    /// XDP attach mode
    #[arg(long, value_enum, default_value_t = flowlens::loader::XdpMode::Skb)]
    xdp_mode: flowlens::loader::XdpMode,
    /// Kernel flow table capacity
    #[arg(long, value_name = "ENTRIES", default_value_t = FLOW_TABLE_CAPACITY)]
    capacity: u32,
    /// Directory under bpffs to pin the flow and port maps in
    #[arg(long, value_name = "DIR")]
    pin_dir: Option<std::path::PathBuf>,
    #[command(flatten)]
    report: ReportArgs,
}

#[cfg(feature = "kernel")]
#[derive(Args)]
struct DumpCommand {
    /// Path of the pinned flow_stats map
    #[arg(long, value_name = "PATH")]
    pin: std::path::PathBuf,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("flowlens error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(cli.log_level.as_str()))
        .init();

    match cli.command {
        Some(Commands::Node(cmd)) => {
            let opts = node::NodeOptions {
                iface: cmd.iface,
                workers: cmd.workers,
                fanout_group: cmd.fanout_group,
                ring: node::RingConfig {
                    block_size: cmd.block_size,
                    block_count: cmd.block_count,
                    frame_size: cmd.frame_size,
                    block_timeout_ms: cmd.block_timeout_ms,
                },
                ports: normalize_ports(cmd.ports),
                port_capacity: MONITORED_PORTS_CAPACITY as usize,
                table_capacity: cmd.capacity,
                report_interval: cmd.report.interval(),
                activity: cmd.report.activity(),
                drain: cmd.report.drain,
                json: cmd.report.json,
            };
            node::run_packet_pipeline(opts).await?;
        }
        #[cfg(feature = "kernel")]
        Some(Commands::Attach(cmd)) => {
            let opts = flowlens::loader::AttachOptions {
                iface: cmd.iface,
                attach_point: cmd.attach_point,
                xdp_mode: cmd.xdp_mode,
                flow_map_entries: cmd.capacity,
                ports: normalize_ports(cmd.ports),
                pin_dir: cmd.pin_dir,
                report_interval: cmd.report.interval(),
                activity: cmd.report.activity(),
                drain: cmd.report.drain,
                json: cmd.report.json,
            };
            flowlens::loader::attach_program(opts).await?;
        }
        #[cfg(feature = "kernel")]
        Some(Commands::Dump(cmd)) => {
            let flows = flowlens::loader::read_pinned_flows(&cmd.pin)?;
            println!("{}", report::flows_to_json(flows));
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

fn normalize_ports(mut ports: Vec<u16>) -> Vec<u16> {
    ports.sort_unstable();
    ports.dedup();
    ports
}
