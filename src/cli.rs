//! `stage-driver` command line.
//!
//! A stage driver is launched once per experiment with its invocation in the
//! environment (`EXP_ID`, `PARENT`, `PARAMS`, `OUTPUT_DIR`, `STAGE`), runs the
//! envelope around an external program, and exits with the outcome's status.
//! The remaining subcommands inspect a ledger and print JSON.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::allocator::OutputAllocator;
use crate::envelope::{
    CommandComputation, StageEnvelope, StageRequest, EXIT_FAILED, EXIT_FATAL, EXIT_REJECTED,
    EXIT_SUCCESS,
};
use crate::error::ErrorKind;
use crate::ledger::{FileLedger, Ledger, NodeFilter, StageParams};
use crate::observability::LogFormat;
use crate::registry::{Registry, StageType};
use crate::resolver::LineageResolver;
use crate::Error;

/// Stage driver for lineage-tracked pipeline stages.
#[derive(Debug, Parser)]
#[command(name = "stage-driver")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory of the shared file ledger.
    #[arg(long, env = "LEDGER_DIR")]
    pub ledger_dir: PathBuf,

    /// Registry file; defaults to the copy published in the ledger root.
    #[arg(long, env = "REGISTRY_PATH")]
    pub registry: Option<PathBuf>,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Driver subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute one stage around an external program.
    Run(RunArgs),
    /// Print a committed node.
    Show {
        /// Node id.
        id: String,
    },
    /// Print the direct children of a node.
    Children {
        /// Parent node id.
        id: String,
    },
    /// Print the parent chain of a node, node first.
    Lineage {
        /// Node id.
        id: String,
    },
    /// Print the nearest ancestor of a stage type, the node itself included.
    Resolve {
        /// Node id to start from.
        id: String,
        /// Stage type to look for.
        stage: String,
    },
    /// Print (and create) the output locations of a stage under a root.
    Allocate {
        /// Stage type.
        stage: String,
        /// Absolute output root.
        root: PathBuf,
        /// Only compute the paths; do not create directories.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the nodes matching a filter.
    Query(QueryArgs),
    /// Copy the registry file into the ledger root.
    PublishRegistry,
}

/// Arguments for `run`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Id to commit the node under.
    #[arg(long = "id", env = "EXP_ID")]
    pub exp_id: String,

    /// Parent node id; empty means none.
    #[arg(long, env = "PARENT")]
    pub parent: Option<String>,

    /// Stage type to execute.
    #[arg(long, env = "STAGE")]
    pub stage: String,

    /// Parameter payload (JSON object).
    #[arg(long, env = "PARAMS", default_value = "{}", value_parser = parse_params)]
    pub params: StageParams,

    /// Absolute output root for this execution.
    #[arg(long, env = "OUTPUT_DIR")]
    pub output_dir: PathBuf,

    /// Non-immediate ancestor stage to resolve for the program (repeatable).
    #[arg(long = "ancestor", value_name = "STAGE")]
    pub ancestors: Vec<String>,

    /// Program and arguments performing the computation.
    #[arg(last = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

/// Arguments for `query`.
#[derive(Debug, Args)]
pub struct QueryArgs {
    /// Only nodes of this stage type.
    #[arg(long)]
    pub stage: Option<String>,

    /// Only children of this node.
    #[arg(long, conflicts_with = "roots")]
    pub parent: Option<String>,

    /// Only root nodes.
    #[arg(long)]
    pub roots: bool,

    /// Only nodes with parameter KEY equal to VALUE (JSON, or a bare string).
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param_clause)]
    pub params: Vec<(String, serde_json::Value)>,
}

impl QueryArgs {
    fn filter(self) -> NodeFilter {
        let mut filter = NodeFilter::new();
        if let Some(stage) = self.stage {
            filter = filter.stage(stage);
        }
        if let Some(parent) = self.parent {
            filter = filter.parent(parent);
        }
        if self.roots {
            filter = filter.roots();
        }
        for (key, value) in self.params {
            filter = filter.param(key, value);
        }
        filter
    }
}

fn parse_params(raw: &str) -> Result<StageParams, String> {
    match serde_json::from_str(raw) {
        Ok(serde_json::Value::Object(params)) => Ok(params),
        Ok(other) => Err(format!("expected a JSON object, got {other}")),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_param_clause(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Execute a parsed command line and return the process exit status.
///
/// # Errors
///
/// Returns an error when the command cannot complete; map it with
/// [`exit_code_for`].
pub async fn execute(cli: Cli) -> anyhow::Result<u8> {
    let ledger = FileLedger::open(&cli.ledger_dir).await?;

    match cli.command {
        Command::Run(args) => {
            let registry = load_registry(cli.registry.as_deref(), &ledger).await?;
            run(args, &registry, &ledger).await
        }
        Command::Show { id } => print_json(&ledger.get_node(&id).await?),
        Command::Children { id } => print_json(&ledger.children(&id).await?),
        Command::Lineage { id } => {
            let start = ledger.get_node(&id).await?;
            print_json(&LineageResolver::new(&ledger).lineage(&start).await?)
        }
        Command::Resolve { id, stage } => {
            let node = LineageResolver::new(&ledger)
                .resolve_id(&id, &StageType::from(stage))
                .await?;
            print_json(&node)
        }
        Command::Allocate {
            stage,
            root,
            dry_run,
        } => {
            let registry = load_registry(cli.registry.as_deref(), &ledger).await?;
            let allocator = OutputAllocator::new(&registry);
            let outputs = if dry_run {
                allocator.plan(&stage, &root)?
            } else {
                allocator.allocate(&stage, &root).await?
            };
            print_json(&outputs.to_node_outputs())
        }
        Command::Query(args) => {
            let mut cursor = ledger.query(args.filter()).await?;
            while let Some(node) = cursor.next().await? {
                println!("{}", serde_json::to_string(&node)?);
            }
            Ok(EXIT_SUCCESS)
        }
        Command::PublishRegistry => {
            let path = cli
                .registry
                .context("publish-registry needs --registry or REGISTRY_PATH")?;
            let registry = Registry::from_path(&path)?;
            ledger.publish_registry(&registry).await?;
            tracing::info!(
                stages = registry.len(),
                path = %ledger.registry_path().display(),
                "registry published"
            );
            Ok(EXIT_SUCCESS)
        }
    }
}

async fn run(args: RunArgs, registry: &Registry, ledger: &FileLedger) -> anyhow::Result<u8> {
    let (program, program_args) = args
        .command
        .split_first()
        .context("missing stage program")?;
    let computation = CommandComputation::new(program, program_args.to_vec())
        .with_ancestors(args.ancestors.into_iter().map(StageType::from).collect());

    let request = StageRequest::new(args.exp_id, args.stage, args.output_dir)
        .parent_opt(args.parent)
        .params(args.params);

    let outcome = StageEnvelope::new(registry, ledger)
        .execute(request, &computation)
        .await?;
    if let Some(node) = outcome.node() {
        print_json(node)?;
    }
    Ok(outcome.exit_code())
}

async fn load_registry(path: Option<&Path>, ledger: &FileLedger) -> crate::Result<Registry> {
    match path {
        Some(path) => Registry::from_path(path),
        None => ledger.load_registry().await,
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<u8> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(EXIT_SUCCESS)
}

/// Exit status for an error that escaped [`execute`].
#[must_use]
pub fn exit_code_for(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<Error>().map(Error::kind) {
        Some(ErrorKind::Rejected) => EXIT_REJECTED,
        Some(ErrorKind::Failed) => EXIT_FAILED,
        Some(ErrorKind::Fatal) | None => EXIT_FATAL,
    }
}

/// Exit status for a command line clap refused to parse.
///
/// `--help` and `--version` succeed; every other launch error is a
/// misconfigured driver and therefore fatal, never a rejection.
#[must_use]
pub fn exit_code_for_usage(error: &clap::Error) -> u8 {
    if error.use_stderr() {
        EXIT_FATAL
    } else {
        EXIT_SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_args_from_flags() {
        let cli = Cli::parse_from([
            "stage-driver",
            "--ledger-dir",
            "/var/ledger",
            "run",
            "--id",
            "e2",
            "--parent",
            "e1",
            "--stage",
            "QC",
            "--params",
            r#"{"threshold": 20}"#,
            "--output-dir",
            "/out/e2",
            "--ancestor",
            "Import",
            "--",
            "qc.sh",
            "--fast",
        ]);

        assert_eq!(cli.ledger_dir, PathBuf::from("/var/ledger"));
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.exp_id, "e2");
        assert_eq!(args.parent.as_deref(), Some("e1"));
        assert_eq!(args.params.get("threshold"), Some(&json!(20)));
        assert_eq!(args.ancestors, vec!["Import"]);
        assert_eq!(args.command, vec!["qc.sh", "--fast"]);
    }

    #[test]
    fn test_run_requires_program() {
        let result = Cli::try_parse_from([
            "stage-driver",
            "--ledger-dir",
            "/l",
            "run",
            "--id",
            "e1",
            "--stage",
            "Import",
            "--output-dir",
            "/o",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_params_must_be_object() {
        assert!(parse_params("[1]").is_err());
        assert!(parse_params("not json").is_err());
        assert!(parse_params("{}").unwrap().is_empty());
    }

    #[test]
    fn test_param_clause_parsing() {
        assert_eq!(parse_param_clause("k=5").unwrap(), ("k".to_string(), json!(5)));
        assert_eq!(
            parse_param_clause("site=UK").unwrap(),
            ("site".to_string(), json!("UK"))
        );
        assert!(parse_param_clause("novalue").is_err());
    }

    #[test]
    fn test_query_roots_conflicts_with_parent() {
        let result = Cli::try_parse_from([
            "stage-driver",
            "--ledger-dir",
            "/l",
            "query",
            "--roots",
            "--parent",
            "e1",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_exit_code_for_errors() {
        let rejected = anyhow::Error::from(Error::NotFound { id: "x".into() });
        assert_eq!(exit_code_for(&rejected), EXIT_REJECTED);

        let fatal = anyhow::Error::from(Error::Config("bad".into()));
        assert_eq!(exit_code_for(&fatal), EXIT_FATAL);

        let failed = anyhow::Error::from(Error::DuplicateId { id: "x".into() })
            .context("while committing");
        assert_eq!(exit_code_for(&failed), EXIT_FAILED);

        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), EXIT_FATAL);
    }

    #[test]
    fn test_usage_errors_are_fatal() {
        let bad_params = Cli::try_parse_from([
            "stage-driver",
            "--ledger-dir",
            "/l",
            "run",
            "--id",
            "e1",
            "--stage",
            "Import",
            "--output-dir",
            "/o",
            "--params",
            "[1]",
            "--",
            "true",
        ])
        .unwrap_err();
        assert_eq!(exit_code_for_usage(&bad_params), EXIT_FATAL);
        assert_ne!(exit_code_for_usage(&bad_params), EXIT_REJECTED);

        let unknown = Cli::try_parse_from(["stage-driver", "--ledger-dir", "/l", "frobnicate"])
            .unwrap_err();
        assert_eq!(exit_code_for_usage(&unknown), EXIT_FATAL);

        let help = Cli::try_parse_from(["stage-driver", "--help"]).unwrap_err();
        assert_eq!(exit_code_for_usage(&help), EXIT_SUCCESS);

        let version = Cli::try_parse_from(["stage-driver", "--version"]).unwrap_err();
        assert_eq!(exit_code_for_usage(&version), EXIT_SUCCESS);
    }

    #[tokio::test]
    async fn test_publish_then_allocate_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        let registry_path = dir.path().join("registry.json");
        std::fs::write(
            &registry_path,
            r#"[{"stageType": "Import", "parent": null, "output": {"data": ["reads.fq"]}}]"#,
        )
        .unwrap();
        let ledger_dir = dir.path().join("ledger");
        let out = dir.path().join("out");

        let publish = Cli::parse_from([
            "stage-driver",
            "--ledger-dir",
            ledger_dir.to_str().unwrap(),
            "--registry",
            registry_path.to_str().unwrap(),
            "publish-registry",
        ]);
        assert_eq!(execute(publish).await.unwrap(), EXIT_SUCCESS);
        assert!(ledger_dir.join("services.json").exists());

        // Registry now comes from the ledger root.
        let allocate = Cli::parse_from([
            "stage-driver",
            "--ledger-dir",
            ledger_dir.to_str().unwrap(),
            "allocate",
            "Import",
            out.to_str().unwrap(),
            "--dry-run",
        ]);
        assert_eq!(execute(allocate).await.unwrap(), EXIT_SUCCESS);
        assert!(!out.exists());
    }
}
