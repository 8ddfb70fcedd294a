use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use lpse_core::{RecordKind, YearRange};
use lpse_sync::{HarvestConfig, HarvestPipeline, HostOutcome};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lpse-cli")]
#[command(about = "Harvest tender and non-tender packages from SPSE v4 hosts")]
struct Cli {
    /// Host(s) to harvest, comma separated
    #[arg(long, value_delimiter = ',')]
    host: Vec<String>,

    /// File listing hosts, separated by whitespace or commas
    #[arg(short, long)]
    read: Option<PathBuf>,

    /// Fiscal year `YYYY` or range `YYYY,YYYY` (defaults to the current year)
    #[arg(long = "tahun-anggaran")]
    tahun_anggaran: Option<YearRange>,

    #[arg(short, long)]
    workers: Option<usize>,

    #[arg(short, long)]
    pool_size: Option<usize>,

    #[arg(short, long)]
    fetch_size: Option<u64>,

    /// Per-request timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Keep the per-host working directory
    #[arg(short, long)]
    keep: bool,

    /// Harvest non-tender packages instead of tenders
    #[arg(short, long)]
    non_tender: bool,

    #[arg(short, long)]
    output_dir: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> HarvestConfig {
        let mut config = HarvestConfig::from_env();
        if let Some(years) = self.tahun_anggaran {
            config.years = years;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(pool_size) = self.pool_size {
            config.pool_size = pool_size;
        }
        if let Some(fetch_size) = self.fetch_size {
            config.fetch_size = fetch_size;
        }
        if let Some(timeout) = self.timeout {
            config.http.timeout = Duration::from_secs(timeout);
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        config.keep_intermediates = self.keep;
        if self.non_tender {
            config.kind = RecordKind::NonTender;
        }
        config
    }
}

fn parse_hosts(text: &str) -> Vec<String> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

async fn collect_hosts(cli: &Cli) -> Result<Vec<String>> {
    let mut hosts = parse_hosts(&cli.host.join(","));
    if let Some(path) = &cli.read {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading host list {}", path.display()))?;
        hosts.extend(parse_hosts(&text));
    }
    if hosts.is_empty() {
        bail!("no hosts given; pass --host or --read FILE");
    }
    Ok(hosts)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let hosts = collect_hosts(&cli).await?;
    let config = cli.into_config();
    tracing::info!(
        hosts = hosts.len(),
        kind = %config.kind,
        years = %config.years,
        workers = config.workers,
        pool_size = config.pool_size,
        "starting harvest"
    );

    let report = HarvestPipeline::new(config).run(&hosts).await?;

    for outcome in &report.hosts {
        match outcome {
            HostOutcome::Completed(summary) => println!(
                "{}: {} rows ({} admitted, {} failed) -> {}",
                summary.host,
                summary.merge.rows,
                summary.admitted,
                summary.dispatch.failed,
                summary.finalize.dataset.display()
            ),
            HostOutcome::Failed { host, error } => println!("{host}: failed: {error}"),
            HostOutcome::Cancelled { host } => println!("{host}: cancelled"),
        }
    }
    println!(
        "harvest complete: run_id={} ok={} failed={} cancelled={}",
        report.run_id,
        report.completed(),
        report.failed(),
        report.cancelled()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_lists_split_on_commas_and_whitespace() {
        assert_eq!(
            parse_hosts("lpse.a.go.id\nlpse.b.go.id, lpse.c.go.id\t\n"),
            vec!["lpse.a.go.id", "lpse.b.go.id", "lpse.c.go.id"]
        );
        assert!(parse_hosts(" \n").is_empty());
    }

    #[test]
    fn malformed_year_range_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["lpse-cli", "--host", "a", "--tahun-anggaran", "2023,2022"]).is_err());
        assert!(Cli::try_parse_from(["lpse-cli", "--host", "a", "--tahun-anggaran", "2021,2022,2023"]).is_err());
        assert!(Cli::try_parse_from(["lpse-cli", "--host", "a", "--tahun-anggaran", "duaribu"]).is_err());
    }

    #[test]
    fn flags_overlay_the_config() {
        let cli = Cli::try_parse_from([
            "lpse-cli",
            "--host",
            "lpse.a.go.id,lpse.b.go.id",
            "--tahun-anggaran",
            "2022,2023",
            "-w",
            "16",
            "--non-tender",
            "--keep",
        ])
        .unwrap();
        assert_eq!(cli.host.len(), 2);
        let config = cli.into_config();
        assert_eq!(config.years, YearRange::new(2022, 2023).unwrap());
        assert_eq!(config.workers, 16);
        assert_eq!(config.kind, RecordKind::NonTender);
        assert!(config.keep_intermediates);
    }
}
