use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use geoguard_core::export::write_csv;
use geoguard_core::{
    parse_labeled_jsonl, record_correction, AuditRecord, AuditStore, Decision, EvaluationReport,
    FeatureArtifact, JsonlAuditLog, LabeledFeature, ReferenceData, ReferenceHandle,
};
use geoguard_runtime::{
    LlmOracle, LlmProvider, Oracle, Pipeline, RuntimeConfig, ScriptedOracle,
    UnconfiguredProvider,
};

#[derive(Parser)]
#[command(
    name = "geoguard",
    version,
    about = "Flag features that need geo-specific legal-compliance logic"
)]
struct Cli {
    /// Runtime configuration (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Replay oracle replies from a script instead of calling a model
    #[arg(long, global = true)]
    script: Option<PathBuf>,

    /// Audit log location, overriding the configured path
    #[arg(long, global = true)]
    audit: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Classify one feature and print the decision as JSON
    Classify {
        /// Feature artifact file (JSON or YAML)
        #[arg(long, conflicts_with_all = ["id", "name", "description"])]
        file: Option<PathBuf>,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        prd: Option<String>,
        #[arg(long)]
        trd: Option<String>,
    },
    /// Classify a list of features and export decisions as CSV
    Batch {
        /// Feature list (JSON or YAML array)
        #[arg(long)]
        input: PathBuf,
        /// CSV destination; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
        /// Also write the full decisions as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Score decisions against labeled features
    Evaluate {
        /// Labeled features: JSON lines, or a JSON/YAML array, each with `ground_truth`
        #[arg(long)]
        input: PathBuf,
        /// Write the full report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
        /// Exit with an error when accuracy falls below this value
        #[arg(long)]
        min_accuracy: Option<f64>,
    },
    /// Query, verify or correct the audit log
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },
}

#[derive(Subcommand)]
enum AuditCmd {
    /// Print records as JSON lines
    Show {
        #[arg(long)]
        feature: Option<String>,
        /// Inclusive lower bound (RFC 3339)
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Exclusive upper bound (RFC 3339)
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
    /// Walk the hash chain and report the first broken link
    Verify,
    /// Append a corrected decision superseding an earlier record
    Correct {
        #[arg(long)]
        record: Uuid,
        /// Corrected decision (JSON)
        #[arg(long)]
        decision: PathBuf,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        author: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("geoguard=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if let Some(path) = &cli.audit {
        config.pipeline.audit.path = path.clone();
    }

    match cli.cmd {
        Cmd::Classify {
            ref file,
            ref id,
            ref name,
            ref description,
            ref prd,
            ref trd,
        } => {
            let feature = match file {
                Some(path) => read_document::<FeatureArtifact>(path)?,
                None => {
                    let id = id.clone().context("--id is required without --file")?;
                    let mut feature = FeatureArtifact::new(
                        id,
                        name.clone().unwrap_or_default(),
                        description.clone().unwrap_or_default(),
                    );
                    feature.prd = prd.clone();
                    feature.trd = trd.clone();
                    feature
                }
            };
            classify(&cli, config, feature).await
        }
        Cmd::Batch {
            ref input,
            ref output,
            ref json,
        } => {
            let features = read_document::<Vec<FeatureArtifact>>(input)?;
            batch(&cli, config, features, output.as_deref(), json.as_deref()).await
        }
        Cmd::Evaluate {
            ref input,
            ref report,
            min_accuracy,
        } => {
            let labeled = read_labeled(input)?;
            evaluate(&cli, config, labeled, report.as_deref(), min_accuracy).await
        }
        Cmd::Audit { ref cmd } => {
            let store = JsonlAuditLog::open(&config.pipeline.audit.path).with_context(|| {
                format!("open audit log {}", config.pipeline.audit.path.display())
            })?;
            audit(&store, cmd)
        }
    }
}

fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&content).with_context(|| format!("parse {}", path.display()))
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("parse {}", path.display()))
    }
}

fn read_labeled(path: &Path) -> Result<Vec<LabeledFeature>> {
    let is_jsonl = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jsonl"));
    if !is_jsonl {
        return read_document(path);
    }
    let content = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_labeled_jsonl(&content).with_context(|| format!("parse {}", path.display()))
}

#[cfg(feature = "gemini")]
fn live_provider() -> Arc<dyn LlmProvider> {
    match geoguard_runtime::GeminiProvider::from_env() {
        Ok(provider) => Arc::new(provider),
        Err(e) => {
            tracing::warn!(error = %e, "Gemini provider not configured");
            Arc::new(UnconfiguredProvider::new(e.to_string()))
        }
    }
}

#[cfg(not(feature = "gemini"))]
fn live_provider() -> Arc<dyn LlmProvider> {
    Arc::new(UnconfiguredProvider::new(
        "built without the `gemini` feature; pass --script for offline runs",
    ))
}

fn build_pipeline(cli: &Cli, config: RuntimeConfig) -> Result<Pipeline> {
    let oracle: Arc<dyn Oracle> = match &cli.script {
        Some(path) => Arc::new(
            ScriptedOracle::from_yaml_file(path)
                .with_context(|| format!("load oracle script {}", path.display()))?,
        ),
        None => Arc::new(LlmOracle::new(
            live_provider(),
            config.oracle.to_completion_config(),
        )),
    };

    let reference = ReferenceData::load(&config.pipeline.reference, config.pipeline.router.threshold)
        .context("load reference data")?;
    let audit = JsonlAuditLog::open(&config.pipeline.audit.path)
        .with_context(|| format!("open audit log {}", config.pipeline.audit.path.display()))?;

    tracing::info!(
        oracle = oracle.name(),
        audit = %config.pipeline.audit.path.display(),
        "Pipeline ready"
    );
    Ok(Pipeline::new(
        oracle,
        Arc::new(ReferenceHandle::new(reference)),
        Arc::new(audit),
        config,
    ))
}

async fn classify(cli: &Cli, config: RuntimeConfig, feature: FeatureArtifact) -> Result<()> {
    let pipeline = build_pipeline(cli, config)?;
    let decision = pipeline
        .classify(&feature)
        .await
        .with_context(|| format!("classify {}", feature.id))?;
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

async fn batch(
    cli: &Cli,
    config: RuntimeConfig,
    features: Vec<FeatureArtifact>,
    output: Option<&Path>,
    json: Option<&Path>,
) -> Result<()> {
    let pipeline = build_pipeline(cli, config)?;
    let total = features.len();
    let ids: Vec<String> = features.iter().map(|f| f.id.clone()).collect();
    let results = pipeline.classify_batch(features).await;

    let mut decisions: Vec<Decision> = Vec::with_capacity(total);
    let mut failed = 0;
    for (id, result) in ids.iter().zip(results) {
        match result {
            Ok(decision) => decisions.push(decision),
            Err(e) => {
                failed += 1;
                eprintln!("{id}: {e}");
            }
        }
    }

    match output {
        Some(path) => {
            let mut file =
                fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
            write_csv(&mut file, &decisions)?;
        }
        None => write_csv(&mut std::io::stdout().lock(), &decisions)?,
    }
    if let Some(path) = json {
        fs::write(path, serde_json::to_string_pretty(&decisions)?)
            .with_context(|| format!("write {}", path.display()))?;
    }

    anyhow::ensure!(failed == 0, "{failed} of {total} features failed");
    Ok(())
}

async fn evaluate(
    cli: &Cli,
    config: RuntimeConfig,
    labeled: Vec<LabeledFeature>,
    report_path: Option<&Path>,
    min_accuracy: Option<f64>,
) -> Result<()> {
    anyhow::ensure!(!labeled.is_empty(), "no labeled features to evaluate");
    let pipeline = build_pipeline(cli, config)?;
    let report = pipeline.evaluate(labeled).await;

    print_report(&report);
    if let Some(path) = report_path {
        fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("write {}", path.display()))?;
    }

    if let Some(min) = min_accuracy {
        anyhow::ensure!(
            report.accuracy >= min,
            "accuracy {:.2} is below the required {:.2}",
            report.accuracy,
            min
        );
    }
    Ok(())
}

fn print_report(report: &EvaluationReport) {
    for case in &report.cases {
        let predicted = case.predicted.map_or("FAILED", |label| label.as_str());
        let mark = if case.is_correct() { "ok" } else { "MISS" };
        println!(
            "{:<16} expected {:<7} predicted {:<7} {}",
            case.feature_id,
            case.expected.as_str(),
            predicted,
            mark
        );
    }
    println!();
    println!(
        "accuracy   {:.2} ({}/{}, {} failed)",
        report.accuracy, report.correct, report.total, report.failed
    );
    println!(
        "YES class  precision {:.2}  recall {:.2}  f1 {:.2}",
        report.yes.precision, report.yes.recall, report.yes.f1
    );
}

fn audit(store: &JsonlAuditLog, cmd: &AuditCmd) -> Result<()> {
    match cmd {
        AuditCmd::Show { feature, from, to } => {
            let records: Vec<AuditRecord> = match (from, to) {
                (None, None) => store.records()?,
                (from, to) => store.in_range(
                    from.unwrap_or(DateTime::<Utc>::MIN_UTC),
                    to.unwrap_or(DateTime::<Utc>::MAX_UTC),
                )?,
            };
            let mut out = std::io::stdout().lock();
            for record in records
                .iter()
                .filter(|r| feature.as_deref().map_or(true, |f| r.feature_id == f))
            {
                writeln!(out, "{}", serde_json::to_string(record)?)?;
            }
            Ok(())
        }
        AuditCmd::Verify => {
            let report = store.verify()?;
            match &report.first_break {
                None => {
                    println!("ok: {} records, head {}", report.records, report.head);
                    Ok(())
                }
                Some(broken) => anyhow::bail!("chain broken: {broken}"),
            }
        }
        AuditCmd::Correct {
            record,
            decision,
            reason,
            author,
        } => {
            let corrected: Decision = read_document(decision)?;
            let appended =
                record_correction(store, *record, corrected, reason.as_str(), author.as_str())
                    .with_context(|| format!("correct record {record}"))?;
            println!(
                "recorded correction {} (sequence {}) superseding {}",
                appended.record_id, appended.sequence, record
            );
            Ok(())
        }
    }
}
