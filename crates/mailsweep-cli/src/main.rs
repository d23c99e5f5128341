use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mailsweep_client::{ChromiumSessionFactory, LookupOutcome, Person, PersonLookup};
use mailsweep_core::pool::{PoolConfig, ProbePool};
use mailsweep_core::probe::ProbeConfig;
use mailsweep_core::task::{ProbeResult, Summary, Task};
use mailsweep_core::worker::{PoolEvent, Reporter, TracingReporter};

#[derive(Parser)]
#[command(name = "mailsweep", version, about = "Resilient portal email sweeper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe a list of email addresses against the portal
    Run {
        /// File with one email address per line
        #[arg(short, long)]
        list: PathBuf,

        /// Portal entry URL
        #[arg(short, long, env = "MAILSWEEP_PORTAL_URL")]
        portal_url: String,

        /// Number of concurrent browser sessions
        #[arg(short, long, default_value_t = 2)]
        concurrency: usize,

        /// Run browsers with a visible window
        #[arg(long, default_value_t = false)]
        headed: bool,

        /// File receiving confirmed addresses
        #[arg(long, default_value = "valid.txt")]
        valid_file: PathBuf,

        /// File receiving everything else
        #[arg(long, default_value = "invalid.txt")]
        invalid_file: PathBuf,
    },

    /// Enrich confirmed addresses through the person-lookup API
    Lookup {
        /// File of confirmed addresses (output of `run`)
        #[arg(short, long, default_value = "valid.txt")]
        input: PathBuf,

        /// Lookup API endpoint
        #[arg(short, long, env = "MAILSWEEP_LOOKUP_URL")]
        endpoint: String,

        /// Lookup API key
        #[arg(short, long, env = "MAILSWEEP_API_KEY")]
        api_key: String,

        /// Output file for enrichment blocks
        #[arg(short, long, default_value = "lookup.txt")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mailsweep=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            list,
            portal_url,
            concurrency,
            headed,
            valid_file,
            invalid_file,
        } => {
            cmd_run(
                &list,
                &portal_url,
                concurrency,
                !headed,
                valid_file,
                invalid_file,
            )
            .await
        }
        Commands::Lookup {
            input,
            endpoint,
            api_key,
            output,
        } => cmd_lookup(&input, &endpoint, &api_key, &output).await,
    }
}

/// Reporter that mirrors events to tracing and appends each result to the
/// valid/invalid partition files as it lands, so a crash loses nothing.
struct FileSinkReporter {
    inner: TracingReporter,
    valid: Mutex<std::fs::File>,
    invalid: Mutex<std::fs::File>,
}

impl FileSinkReporter {
    fn open(valid_path: &Path, invalid_path: &Path) -> Result<Self> {
        let open = |p: &Path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("could not open {}", p.display()))
        };
        Ok(Self {
            inner: TracingReporter,
            valid: Mutex::new(open(valid_path)?),
            invalid: Mutex::new(open(invalid_path)?),
        })
    }

    fn append(&self, result: &ProbeResult) {
        let file = if result.outcome.is_valid() {
            &self.valid
        } else {
            &self.invalid
        };
        let mut file = file.lock().expect("result file lock poisoned");
        if let Err(e) = writeln!(file, "{}", result.display) {
            tracing::error!(email = %result.email, error = %e, "could not append result");
        }
    }
}

impl Reporter for FileSinkReporter {
    fn report(&self, event: PoolEvent<'_>) {
        if let PoolEvent::TaskResult(result) = &event {
            self.append(*result);
        }
        self.inner.report(event);
    }
}

async fn cmd_run(
    list: &Path,
    portal_url: &str,
    concurrency: usize,
    headless: bool,
    valid_file: PathBuf,
    invalid_file: PathBuf,
) -> Result<()> {
    let emails = load_emails(list)?;
    if emails.is_empty() {
        anyhow::bail!("no email addresses found in {}", list.display());
    }
    tracing::info!(count = emails.len(), "loaded email list");

    let probe = ProbeConfig::new(portal_url);
    let config = PoolConfig::new(probe).with_concurrency(concurrency);
    let factory = ChromiumSessionFactory::new(headless);
    let reporter = FileSinkReporter::open(&valid_file, &invalid_file)?;

    let pool = ProbePool::new(config, factory, reporter);
    let handle = pool.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping pool");
            handle.stop().await;
        }
    });

    let tasks: Vec<Task> = emails.into_iter().map(Task::new).collect();
    let summary = pool.run(tasks).await;
    print_summary(&summary);
    Ok(())
}

/// Lines containing `@` count as addresses; everything else is noise.
fn load_emails(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("could not read list {}", path.display()))?;
    let mut emails = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.contains('@') && !emails.iter().any(|e| e == line) {
            emails.push(line.to_string());
        }
    }
    Ok(emails)
}

fn print_summary(summary: &Summary) {
    println!("==============================");
    println!("RUN COMPLETE");
    println!("  total:      {}", summary.total_tasks);
    println!("  valid:      {}", summary.valid_count);
    println!("  invalid:    {}", summary.invalid_count);
    println!("  elapsed:    {:.1}s", summary.total_time.as_secs_f64());
    println!("  throughput: {:.1}/min", summary.throughput_per_minute);
    println!("==============================");
}

async fn cmd_lookup(input: &Path, endpoint: &str, api_key: &str, output: &Path) -> Result<()> {
    let emails = load_result_emails(input)?;
    if emails.is_empty() {
        anyhow::bail!("no addresses found in {}", input.display());
    }
    tracing::info!(count = emails.len(), "starting lookups");

    let lookup = PersonLookup::new(endpoint, api_key).map_err(anyhow::Error::from)?;
    let mut out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)
        .with_context(|| format!("could not open {}", output.display()))?;

    for email in emails {
        // A second attempt rides the gate's spacing, so an upstream 429
        // usually clears by the time it fires.
        let mut outcome = lookup.lookup(&email).await;
        if matches!(outcome, Ok(LookupOutcome::RateLimited)) {
            outcome = lookup.lookup(&email).await;
        }
        match outcome {
            Ok(LookupOutcome::Found(person)) => {
                writeln!(out, "{}", format_person_block(&email, &person))?;
                tracing::info!(email, "lookup hit");
            }
            Ok(LookupOutcome::NotFound) => {
                tracing::info!(email, "lookup miss");
            }
            Ok(LookupOutcome::RateLimited) => {
                tracing::warn!(email, "still rate limited, skipping");
            }
            Err(e) => {
                tracing::error!(email, error = %e, "lookup failed");
            }
        }
    }
    Ok(())
}

/// Accepts both raw address lists and `run` partition files
/// (`VALID - a@b.com | ***12`).
fn load_result_emails(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    let mut emails = Vec::new();
    for line in content.lines() {
        if let Some(email) = line.split_whitespace().find(|token| token.contains('@')) {
            if !emails.iter().any(|e| e == email) {
                emails.push(email.to_string());
            }
        }
    }
    Ok(emails)
}

fn format_person_block(email: &str, person: &Person) -> String {
    let field = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    format!(
        "==============================\n\
         VALID AP / DB\n\
         email:   {email}\n\
         name:    {}\n\
         phone:   {}\n\
         address: {}\n\
         ==============================",
        field(&person.name),
        field(&person.phone),
        field(&person.address),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_loading_filters_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.txt");
        std::fs::write(&path, "a@b.com\nnot an email\n\n a@b.com \nc@d.com\n").unwrap();
        assert_eq!(load_emails(&path).unwrap(), vec!["a@b.com", "c@d.com"]);
    }

    #[test]
    fn result_file_emails_are_extracted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("valid.txt");
        std::fs::write(&path, "VALID - a@b.com | ***12\nVALID - c@d.com\n").unwrap();
        assert_eq!(
            load_result_emails(&path).unwrap(),
            vec!["a@b.com", "c@d.com"]
        );
    }

    #[test]
    fn person_block_renders_missing_fields_as_dashes() {
        let person = Person {
            name: Some("Sam".into()),
            phone: None,
            address: None,
            raw: serde_json::Value::Null,
        };
        let block = format_person_block("a@b.com", &person);
        assert!(block.contains("email:   a@b.com"));
        assert!(block.contains("name:    Sam"));
        assert!(block.contains("phone:   -"));
    }
}
