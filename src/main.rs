use std::{
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};

use netsensor_topology::{
    Settings, TopologyEngine, TopologyReport,
    ingest::{pump, spawn_ingest},
    logging,
    topology::source::JsonLinesSource,
};
use tokio::io::BufReader;
use tracing::info;

// Reads JSON-lines observations from stdin, prints the resulting report as JSON on stdout
// and a short human summary on stderr. An optional first argument names a JSON settings file.
fn main() -> ExitCode {
    if let Err(e) = logging::init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let settings = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => match Settings::load(&path) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Failed to load settings from {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => Settings::default(),
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(settings)) {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Error serializing report: {}", e);
                    return ExitCode::FAILURE;
                }
            }
            print_summary(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Ingest failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> Result<TopologyReport, Box<dyn std::error::Error>> {
    let engine = Arc::new(TopologyEngine::new(settings.engine.clone()));
    let (handle, task) = spawn_ingest(Arc::clone(&engine), &settings.ingest);

    let mut source = JsonLinesSource::new(BufReader::new(tokio::io::stdin()));
    let pumped = pump(&mut source, &handle).await;
    handle.shutdown();
    let stats = task.await?;
    let forwarded = pumped?;

    info!(
        forwarded,
        applied = stats.applied,
        rejected = stats.rejected,
        evicted = stats.evicted,
        "input exhausted"
    );
    Ok(engine.report())
}

fn print_summary(report: &TopologyReport) {
    eprintln!(
        "{} subnets, {} hosts",
        report.topology.len(),
        report.host_count()
    );
    for subnet in &report.topology {
        let changed = UNIX_EPOCH + Duration::from_millis(subnet.last_change_time);
        eprintln!(
            "  {:<20} {:>5} hosts  last change {}",
            subnet.subnet_key.to_string(),
            subnet.ips.len(),
            humantime::format_rfc3339_millis(changed)
        );
    }
    match &report.netproxy {
        Some(np) => {
            eprintln!("Local netproxy:");
            eprintln!("  internal: {}", np.internal_interface);
            eprintln!("  external: {}", np.external_interface);
            eprintln!(
                "  remote peers: {}",
                np.remote_netproxy_addresses
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        None => eprintln!("No local netproxy detected"),
    }
}
