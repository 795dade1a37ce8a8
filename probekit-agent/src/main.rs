//! probekit-agent - runs one probekit bundle on this host
//!
//! The agent:
//! - Loads the bundle and rewrites its constants from `--param`
//! - Attaches every program and tracks the processes given with `--pid`
//! - Prints streamed or snapshotted events as JSON lines
//! - Stops on Ctrl+C or after `--timeout`

use anyhow::Result;
use clap::Parser;
use probekit::ebpf::RingBufferPolicy;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "probekit-agent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a probekit bundle against the local kernel")]
#[command(long_about = "Run a probekit bundle against the local kernel.

Streaming bundles need BPF ring buffers (Linux 5.8+). This agent cannot retype \
a ring buffer map into a perf event array, so the perf fallback chosen by \
--ring-buffer off, or by auto on older kernels, fails to load.")]
struct Args {
    #[arg(short, long, help = "Bundle directory")]
    bundle: PathBuf,

    #[arg(short, long = "param", value_parser = parse_param, help = "Bundle parameter as key=value")]
    params: Vec<(String, String)>,

    #[arg(long = "pid", help = "Track the namespaces of this process")]
    pids: Vec<u32>,

    #[arg(short, long, help = "Stop after this many seconds")]
    timeout: Option<u64>,

    #[arg(
        long,
        default_value = "auto",
        help = "Ring buffer use: auto, on or off",
        long_help = "Ring buffer use: auto, on or off. \
                     The perf event array fallback (off) is not supported by this agent"
    )]
    ring_buffer: RingBufferPolicy,

    #[arg(long, help = "Print tracer metrics on exit")]
    metrics: bool,
}

fn parse_param(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {:?}", s))
}

impl Args {
    fn param_map(&self) -> BTreeMap<String, String> {
        self.params.iter().cloned().collect()
    }
}

#[cfg(not(target_os = "linux"))]
fn main() -> Result<()> {
    let _ = Args::parse();
    eprintln!("Error: probekit-agent requires Linux to run eBPF programs");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> Result<()> {
    use log::{info, warn};
    use probekit::clock::SystemBootClock;
    use probekit::container::HostNetns;
    use probekit::ebpf::{BundleLoader, Event};
    use probekit::metrics::PrometheusExporter;
    use probekit::{Environment, RunContext, Tracer, TracerConfig};
    use probekit_agent::host::{NoNetworkTracers, NoSocketEnricher};
    use probekit_agent::kernel_types::BtfKernelTypes;
    use probekit_agent::probe_loader::AyaKernel;
    use probekit_agent::procfs::ProcResolver;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::signal;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    info!("probekit-agent starting...");

    let env = Environment {
        kernel: Arc::new(AyaKernel::new()?),
        kernel_types: Arc::new(BtfKernelTypes::load()),
        network_tracers: Arc::new(NoNetworkTracers),
        socket_enricher: Arc::new(NoSocketEnricher),
        clock: Arc::new(SystemBootClock),
        netns: Arc::new(HostNetns::new()),
    };
    let config = TracerConfig {
        params: args.param_map(),
        ring_buffer: args.ring_buffer,
        mntns_map: None,
    };

    let loader = BundleLoader::new(args.bundle.clone());
    let mut tracer = Tracer::new(&loader, env, config).await?;

    let print = |event: &Event| match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to serialize event: {}", e),
    };
    tracer.set_event_handler(move |event| print(&event));
    tracer.set_event_array_handler(move |events| events.iter().for_each(print));

    let resolver = ProcResolver::new();
    for &pid in &args.pids {
        let container = resolver.resolve(pid)?;
        info!("Tracking {} (netns {})", container.id, container.netns);
        tracer.attach_container(container)?;
    }

    let mut ctx = RunContext::new();
    if let Some(secs) = args.timeout {
        ctx = ctx.with_timeout(Duration::from_secs(secs));
    }
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            cancel.cancel();
        }
    });

    info!("probekit-agent running. Press Ctrl+C to exit.");
    let result = tracer.run(&ctx).await;
    tracer.close();

    if args.metrics {
        print!(
            "{}",
            PrometheusExporter::new(tracer.metrics().clone()).format_metrics()?
        );
    }

    info!("probekit-agent stopped");
    Ok(result?)
}
