use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::info;
use memsys::cache::falru::size_label;
use memsys::checkpoint::Checkpoint;
use memsys::sim::top::{System, SystemConfig};
use toml::Table;

#[derive(Parser)]
#[command(version, about)]
struct MemsysArgs {
    #[arg(help = "Path to config.toml")]
    config_path: PathBuf,
    #[arg(long, help = "Override simulation timeout in cycles")]
    timeout: Option<u64>,
    #[arg(long, help = "Override traffic seed")]
    seed: Option<u64>,
    #[arg(long, help = "Override number of CPUs")]
    num_cpus: Option<usize>,
    #[arg(long, help = "Restore from checkpoint before running")]
    checkpoint_in: Option<PathBuf>,
    #[arg(long, help = "Drain and write a checkpoint after the run")]
    checkpoint_out: Option<PathBuf>,
    #[arg(long, help = "Write statistics as JSON to this path instead of stdout")]
    stats_json: Option<PathBuf>,
}

pub fn main() -> anyhow::Result<()> {
    env_logger::init();

    let argv = MemsysArgs::parse();
    let config = fs::read_to_string(&argv.config_path)
        .with_context(|| format!("failed to read config file {}", argv.config_path.display()))?;
    let config_table: Table = toml::from_str(&config).context("cannot parse config toml")?;
    let mut config = SystemConfig::from_table(&config_table);

    // override toml configs with argv
    config.sim.timeout = argv.timeout.unwrap_or(config.sim.timeout);
    config.sim.seed = argv.seed.unwrap_or(config.sim.seed);
    config.traffic.num_cpus = argv.num_cpus.unwrap_or(config.traffic.num_cpus);

    let mut sys = System::new(config).context("invalid system configuration")?;
    if let Some(path) = argv.checkpoint_in.as_ref() {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?;
        let cp = Checkpoint::parse(&text)?;
        sys.restore(&cp)?;
    }

    let summary = sys.run()?;
    info!(
        "finished at cycle {}: {} issued, {} completed{}",
        summary.cycles,
        summary.issued,
        summary.completed,
        if summary.timed_out { " (timed out)" } else { "" }
    );

    for cpu in 0.. {
        let Some(port) = sys.cpu_port(cpu) else {
            break;
        };
        if let Some(tags) = port.borrow().tags() {
            for class in tags.size_stats() {
                info!(
                    "{} {}: {} hits, {} misses ({} / {} after warm-up)",
                    tags.name(),
                    size_label(class.size_bytes),
                    class.hits,
                    class.misses,
                    class.warm_hits,
                    class.warm_misses
                );
            }
        }
    }

    if let Some(path) = argv.checkpoint_out.as_ref() {
        sys.drain()?;
        let text = sys.checkpoint()?.to_toml_string()?;
        fs::write(path, text)
            .with_context(|| format!("failed to write checkpoint {}", path.display()))?;
        info!("checkpoint written to {}", path.display());
    }

    let stats = sys.stats().dump_json()?;
    match argv.stats_json.as_ref() {
        Some(path) => {
            fs::write(path, stats)
                .with_context(|| format!("failed to write stats {}", path.display()))?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        None => println!("{}", stats),
    }
    Ok(())
}
