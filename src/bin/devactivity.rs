use clap::{Parser, Subcommand};

use devactivity::{DevActivity, EngineConfig, MetricFamily, Period, WindowStrategy};

#[derive(Parser)]
#[command(name = "devactivity", about = "Developer activity analytics over a commit store")]
struct Cli {
    /// Database path (default: ~/.devactivity/devactivity.db)
    #[arg(long)]
    db: Option<String>,

    /// Engine config file (default: ~/.devactivity/config.json if present)
    #[arg(long)]
    config: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sum of monthly active developers over a period, with YoY
    Mad {
        /// Period: 2025, 2025-Q1, 2025-01, ytd, qtd, mtd, 30d, 2025-01-01..2025-03-01, or an era key
        period: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Contributors whose first-ever commit falls in a period
    NewDevs {
        period: String,
        #[arg(long)]
        json: bool,
    },
    /// Distinct contributors per window
    Series {
        /// Window strategy: month, quarter, rolling, single
        #[arg(long, default_value = "month")]
        strategy: String,
        /// Start date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        from: String,
        /// End date, exclusive (default: now)
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Per-repository activity for a period, most active first
    Repos {
        period: String,
        /// Maximum repositories to show
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Load repositories and commits from a JSON fixture
    Import {
        /// Path to the fixture file
        path: String,
    },
    /// Show commit store and cache status
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Manage the result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Manage configuration overrides
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete expired entries
    Sweep,
    /// Delete all entries, or those of one metric family
    Clear {
        /// mad_sum, new_developers, time_series or repository_activity
        #[arg(long)]
        family: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// Remove a config value
    Unset { key: String },
    /// List all config values
    List,
}

fn parse_instant(s: &str) -> anyhow::Result<chrono::DateTime<chrono::Utc>> {
    devactivity::date_util::parse_ts(s)
        .ok_or_else(|| anyhow::anyhow!("invalid date '{s}' (expected YYYY-MM-DD or RFC 3339)"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_default()?,
    };
    let db = match &cli.db {
        Some(path) => devactivity::Database::open_at(path).await?,
        None => devactivity::Database::open().await?,
    };
    let mut engine = DevActivity::new(db, config).await?;

    match cli.command {
        Commands::Mad { period, json } => {
            let p = Period::parse_with_eras(&period, &engine.config().eras)?;
            let r = engine.mad_sum(&p).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&r)?);
            } else {
                println!("MAD sum: {} ({} windows)", r.period, r.strategy.as_str());
                for w in &r.windows {
                    println!("  {:<24} {:>6}", w.label, w.count);
                }
                println!("  Total: {}", r.total);
                print_yoy(r.previous_total, r.yoy_percent);
                print_degraded(&r.degraded_windows);
            }
        }
        Commands::NewDevs { period, json } => {
            let p = Period::parse_with_eras(&period, &engine.config().eras)?;
            let r = engine.new_developers(&p).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&r)?);
            } else {
                println!("New developers: {}", r.period);
                println!("  Count: {}", r.count);
                print_yoy(r.previous_count, r.yoy_percent);
                print_degraded(&r.degraded_windows);
            }
        }
        Commands::Series {
            strategy,
            from,
            to,
            json,
        } => {
            let strategy = WindowStrategy::parse(&strategy)?;
            let start = parse_instant(&from)?;
            let end = to.as_deref().map(parse_instant).transpose()?;
            let r = engine.time_series(strategy, start, end).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&r)?);
            } else {
                for p in &r.points {
                    println!(
                        "  {:<24} {:>6}  {}",
                        p.label,
                        p.count,
                        p.era.as_deref().unwrap_or("")
                    );
                }
                print_degraded(&r.degraded_windows);
            }
        }
        Commands::Repos {
            period,
            limit,
            json,
        } => {
            let p = Period::parse_with_eras(&period, &engine.config().eras)?;
            let r = engine.repository_activity(&p, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&r)?);
            } else {
                println!("Repository activity: {}", r.period);
                for repo in &r.repositories {
                    println!(
                        "  {:<40} {:>6} commits {:>4} contributors  last {}",
                        format!("{}/{}", repo.owner, repo.name),
                        repo.commit_count,
                        repo.contributor_count,
                        repo.last_commit_at
                            .map(|t| t.format("%Y-%m-%d").to_string())
                            .unwrap_or_else(|| "-".into())
                    );
                }
                if r.repositories.is_empty() {
                    println!("  (no qualifying commits)");
                }
                print_degraded(&r.degraded_windows);
            }
        }
        Commands::Import { path } => {
            let text = std::fs::read_to_string(&path)?;
            let fixture: devactivity::ImportFixture = serde_json::from_str(&text)?;
            let report = engine.import(fixture).await?;
            println!(
                "Imported {} repositories: {} commits added, {} already present",
                report.repositories, report.commits_inserted, report.commits_skipped
            );
        }
        Commands::Status { json } => {
            let s = engine.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&s)?);
            } else {
                println!("Commit Store Status");
                println!("  Repositories: {}", s.store.repositories);
                println!("  Commits:      {}", s.store.commits);
                println!("  Identities:   {}", s.store.identities);
                println!(
                    "  Range:        {} .. {}",
                    s.store.first_commit_at.as_deref().unwrap_or("-"),
                    s.store.last_commit_at.as_deref().unwrap_or("-")
                );
                println!(
                    "  Fork column:  {}",
                    if s.capabilities.has_fork_column { "present" } else { "absent (fork exclusion off)" }
                );
                println!(
                    "  Exclusions:   {} identity tokens, {} repositories",
                    s.identity_exclusions, s.repository_exclusions
                );
                if !s.eras.is_empty() {
                    println!("  Eras:         {}", s.eras.join(", "));
                }
                println!("Cache");
                if s.cache_entries.is_empty() {
                    println!("  (empty)");
                }
                for (family, count) in &s.cache_entries {
                    println!("  {family:<22} {count}");
                }
            }
        }
        Commands::Cache { action } => match action {
            CacheAction::Sweep => {
                let n = engine.sweep_cache().await?;
                println!("Removed {n} expired entries");
            }
            CacheAction::Clear { family } => {
                let family = family.as_deref().map(MetricFamily::parse).transpose()?;
                let n = engine.clear_cache(family).await?;
                println!("Removed {n} entries");
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => match engine.config_get(&key).await? {
                Some(val) => println!("{key} = {val}"),
                None => println!("{key} is not set"),
            },
            ConfigAction::Set { key, value } => {
                engine.config_set(&key, &value).await?;
                println!("Set {key} = {value}");
            }
            ConfigAction::Unset { key } => {
                if engine.config_unset(&key).await? {
                    println!("Removed {key}");
                } else {
                    println!("{key} was not set");
                }
            }
            ConfigAction::List => {
                let items = engine.config_list().await?;
                if items.is_empty() {
                    println!("No config values set.");
                }
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        },
    }

    Ok(())
}

fn print_yoy(previous: Option<u64>, yoy: Option<f64>) {
    match (previous, yoy) {
        (Some(prev), Some(pct)) => println!("  Prior year: {prev} ({pct:+.1}%)"),
        (Some(prev), None) => println!("  Prior year: {prev}"),
        _ => {}
    }
}

fn print_degraded(labels: &[String]) {
    if !labels.is_empty() {
        println!("  Partial result; zeroed windows: {}", labels.join(", "));
    }
}
