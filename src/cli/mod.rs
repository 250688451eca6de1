//! CLI argument parsing and run orchestration

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use boutsim_client::{Client, HttpConfig};
use boutsim_core::persona::{self, PERSONAS};
use boutsim_core::{EngineBuilder, EngineConfig, RateProfile, RunReport, StopReason, Transport};
use clap::Parser;
use tokio_util::sync::CancellationToken;

/// Header carrying the rate-limit bypass key
const BYPASS_HEADER: &str = "x-loadtest-bypass";

/// boutsim - cost-bounded synthetic traffic for the bout arena
#[derive(Parser, Debug)]
#[command(name = "boutsim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Target base URL
    #[arg(short, long, env = "BOUTSIM_TARGET", default_value = "http://localhost:3000")]
    pub target: String,

    /// Number of concurrent workers
    #[arg(short, long, default_value = "10")]
    pub workers: usize,

    /// Run length, e.g. "90", "30s", "5m", "1h"
    #[arg(short, long, default_value = "60s", value_parser = parse_duration)]
    pub duration: Duration,

    /// Spend ceiling in GBP (0 = unlimited)
    #[arg(short, long, default_value = "1.0")]
    pub budget: f64,

    /// Rate profile: flood, steady:<rps>, ramp:<from>:<to>,
    /// spike:<base>:<peak>:<start%>:<end%> or trickle:<per_min>
    #[arg(short, long, default_value = "flood")]
    pub rate: RateProfile,

    /// Persona ids to run (comma separated; default all)
    #[arg(short, long, value_delimiter = ',')]
    pub personas: Vec<String>,

    /// Persona tags to run (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Accounts as id=token (comma separated)
    #[arg(long, env = "BOUTSIM_ACCOUNTS", value_delimiter = ',', value_parser = parse_account)]
    pub accounts: Vec<(String, String)>,

    /// Rate-limit bypass key sent on every request
    #[arg(long, env = "BOUTSIM_BYPASS_KEY", hide_env_values = true)]
    pub bypass_key: Option<String>,

    /// Retries for buffered requests
    #[arg(long, default_value = "3")]
    pub max_retries: u32,

    /// Per-request timeout
    #[arg(long, default_value = "300s", value_parser = parse_duration)]
    pub request_timeout: Duration,

    /// Progress log interval
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub monitor_interval: Duration,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,

    /// List available personas and exit
    #[arg(long)]
    pub list_personas: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Run the simulation based on CLI arguments
    pub async fn run(&self) -> Result<()> {
        if self.list_personas {
            print_personas();
            return Ok(());
        }

        let personas = persona::resolve(&self.personas, &self.tags)
            .context("Failed to resolve personas")?;
        anyhow::ensure!(
            !personas.is_empty(),
            "No personas match ids {:?} and tags {:?}",
            self.personas,
            self.tags
        );

        let mut http = HttpConfig::new(&self.target)
            .with_max_retries(self.max_retries)
            .with_request_timeout(self.request_timeout)
            .with_pool_max_idle(self.workers.max(1));
        if let Some(ref key) = self.bypass_key {
            http = http.with_header(BYPASS_HEADER, key);
        }

        let client = Arc::new(
            Client::new(http).with_context(|| format!("Failed to create client for: {}", self.target))?,
        );
        for (account, token) in &self.accounts {
            client.register_token(account, token);
        }

        let config = EngineConfig::new(self.workers)
            .with_duration(self.duration)
            .with_rate(self.rate)
            .with_monitor_interval(self.monitor_interval)
            .with_accounts(self.accounts.iter().map(|(id, _)| id.clone()).collect());

        tracing::info!(
            base_url = %self.target,
            workers = self.workers,
            duration_secs = self.duration.as_secs_f64(),
            budget_gbp = self.budget,
            rate = %self.rate,
            personas = ?personas.iter().map(|p| p.id).collect::<Vec<_>>(),
            accounts = self.accounts.len(),
            "Configured target"
        );

        let transport: Arc<dyn Transport> = client.clone();
        let engine = EngineBuilder::new()
            .config(config)
            .personas(personas)
            .budget_gbp(self.budget)
            .transport(transport)
            .build()
            .context("Invalid engine configuration")?;

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, stopping workers");
                    cancel.cancel();
                }
            });
        }

        let report = engine.run(cancel).await.context("Simulation failed")?;
        drop(engine);

        match Arc::try_unwrap(client) {
            Ok(client) => client.close(),
            Err(_) => tracing::debug!("Client still shared at shutdown"),
        }

        if self.json {
            let out = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
            println!("{out}");
        } else {
            print_results(&report);
        }

        Ok(())
    }
}

/// Parse "90", "30s", "500ms", "5m" or "1h"
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    let value: f64 = value
        .parse()
        .map_err(|_| format!("invalid duration '{s}'"))?;
    let secs = match unit {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit '{other}' in '{s}'")),
    };
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration '{s}': {e}"))
}

/// Parse "id=token"
pub fn parse_account(s: &str) -> Result<(String, String), String> {
    match s.trim().split_once('=') {
        Some((id, token)) if !id.is_empty() && !token.is_empty() => {
            Ok((id.to_string(), token.to_string()))
        }
        _ => Err(format!("expected id=token, got '{s}'")),
    }
}

fn print_personas() {
    println!("{:<20} {:<10} {:<6} {:<8} Tags", "Persona", "Tier", "Auth", "Session");
    for p in PERSONAS {
        println!(
            "{:<20} {:<10} {:<6} {:<8} {}",
            p.id,
            format!("{:?}", p.tier),
            if p.requires_auth { "yes" } else { "no" },
            format!("{}-{}", p.session_min, p.session_max),
            p.tags.join(",")
        );
    }
}

/// Print the final report in a readable format
fn print_results(report: &RunReport) {
    let m = &report.snapshot.metrics;
    let b = &report.snapshot.budget;
    let agg = &report.aggregated;

    let reason = match report.reason {
        StopReason::DurationElapsed => "duration elapsed",
        StopReason::Cancelled => "cancelled",
        StopReason::BudgetExhausted => "budget exhausted",
    };

    println!("{}", "=".repeat(70));
    println!("   Simulation Results");
    println!("{}", "=".repeat(70));
    println!();
    println!("Run:");
    println!("  Stopped by:           {reason}");
    println!("  Elapsed:              {:.1} s", m.elapsed_secs);
    println!("  Workers:              {}", agg.total_workers);
    println!("  Sessions:             {}", agg.total_sessions);
    println!(
        "  Tickets:              {} issued, {} dropped",
        report.tickets.issued, report.tickets.dropped
    );
    println!();

    println!("Requests:");
    println!("  Total:                {}", m.requests);
    println!(
        "  Successful:           {} ({:.1}%)",
        m.successes,
        if m.requests > 0 {
            m.successes as f64 / m.requests as f64 * 100.0
        } else {
            0.0
        }
    );
    println!("  Errors:               {} ({:.1}%)", m.errors, m.error_rate * 100.0);
    println!("  Retries:              {}", m.retries);
    println!("  Rate limited (429):   {}", m.rate_limited);
    println!("  Budget skips:         {}", m.budget_skips);
    println!("  Throughput:           {:.2} req/s", m.requests_per_second);
    println!();

    println!("Bouts:");
    println!("  Started:              {}", m.bouts_started);
    println!("  Completed:            {}", m.bouts_completed);
    println!("  Stream errors:        {}", m.stream_errors);
    println!("    broken off:         {}", m.stream_failures);
    println!("  Peak streams:         {}", m.peak_streams);
    println!("  Deltas / chars:       {} / {}", m.deltas, m.chars);
    println!();

    println!("Budget:");
    match b.remaining_gbp {
        Some(remaining) => println!(
            "  Spent:                £{:.4} of £{:.2} (£{:.4} left)",
            b.spent_gbp, b.ceiling_gbp, remaining
        ),
        None => println!("  Spent:                £{:.4} (unlimited)", b.spent_gbp),
    }
    for (model, spent) in &b.per_model {
        println!("    {model:<26} £{spent:.4}");
    }
    println!();

    if !m.latency.is_empty() {
        println!("Latency (ms):");
        println!(
            "  {:<28} {:>7} {:>9} {:>9} {:>9} {:>9}",
            "Endpoint", "Count", "Mean", "P50", "P95", "P99"
        );
        for (endpoint, s) in &m.latency {
            println!(
                "  {:<28} {:>7} {:>9.1} {:>9.1} {:>9.1} {:>9.1}",
                endpoint, s.count, s.mean, s.p50, s.p95, s.p99
            );
        }
        println!();
    }

    if !m.ttfb.is_empty() {
        println!("Time to first byte (ms):");
        for (endpoint, s) in &m.ttfb {
            println!(
                "  {:<28} {:>7} {:>9.1} {:>9.1} {:>9.1} {:>9.1}",
                endpoint, s.count, s.mean, s.p50, s.p95, s.p99
            );
        }
        println!();
    }

    if !m.statuses.is_empty() {
        let statuses: Vec<String> = m.statuses.iter().map(|(s, n)| format!("{s}={n}")).collect();
        println!("Statuses:               {}", statuses.join(" "));
    }
    if !m.endpoint_errors.is_empty() {
        println!("Errors by endpoint:");
        for (endpoint, n) in &m.endpoint_errors {
            println!("  {endpoint:<28} {n}");
        }
    }

    println!("{}", "=".repeat(70));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert!(parse_duration("5 minutes").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("-3s").is_err());
    }

    #[test]
    fn test_parse_account() {
        assert_eq!(
            parse_account("alice=tok_123").unwrap(),
            ("alice".to_string(), "tok_123".to_string())
        );
        assert_eq!(parse_account("bob=a=b").unwrap().1, "a=b");
        assert!(parse_account("alice").is_err());
        assert!(parse_account("=tok").is_err());
        assert!(parse_account("alice=").is_err());
    }

    #[test]
    fn test_cli_parses_full_invocation() {
        let cli = Cli::try_parse_from([
            "boutsim",
            "--target",
            "https://arena.test",
            "-w",
            "4",
            "-d",
            "2m",
            "--budget",
            "0.5",
            "--rate",
            "ramp:1:10",
            "--personas",
            "lurker,spammer",
            "--accounts",
            "a=t1,b=t2",
        ])
        .unwrap();

        assert_eq!(cli.target, "https://arena.test");
        assert_eq!(cli.workers, 4);
        assert_eq!(cli.duration, Duration::from_secs(120));
        assert_eq!(cli.rate, RateProfile::Ramp { from: 1.0, to: 10.0 });
        assert_eq!(cli.personas, vec!["lurker", "spammer"]);
        assert_eq!(cli.accounts.len(), 2);
    }

    #[test]
    fn test_cli_rejects_bad_rate() {
        assert!(Cli::try_parse_from(["boutsim", "--rate", "wobble:3"]).is_err());
    }
}
