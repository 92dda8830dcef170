use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use apkg_builder::archive::container::{self, TarEntryInfo};
use apkg_builder::config::PackageConfig;
use apkg_builder::executor::{ExecCtx, StdoutSink};
use apkg_builder::fetch::HttpFetcher;
use apkg_builder::{Result, fetch, pipeline};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Emit tracing output as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load config and print the computed task plan
    Plan {
        /// Path to a package definition TOML
        build: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Fetch the payload, stage the package tree and write the artifact
    Build {
        /// Path to a package definition TOML
        build: PathBuf,
        /// Print what would run without executing task bodies
        #[arg(long)]
        dry_run: bool,
    },
    /// Load config and print the fully-resolved TOML (after imports/extends)
    Resolve {
        /// Path to a package definition TOML
        build: PathBuf,
    },
    /// List the members and tar entries of a built package
    Inspect {
        /// Path to an .apk container
        artifact: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    let res = match args.cmd {
        Command::Plan { build, dot } => cmd_plan(&build, dot),
        Command::Build { build, dry_run } => cmd_build(&build, dry_run),
        Command::Resolve { build } => cmd_resolve(&build),
        Command::Inspect { artifact, json } => cmd_inspect(&artifact, json),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error[{}]: {e}", e.kind().as_str());
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = std::env::var("APKG_LOG")
        .ok()
        .and_then(|v| tracing_subscriber::EnvFilter::try_new(v).ok())
        .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn cmd_plan(path: &Path, dot: bool) -> Result<()> {
    let doc = apkg_builder::config::load(path)?;
    let plan = pipeline::plan_for(&doc)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    let ordered = plan.ordered()?;
    for (i, task) in ordered.iter().enumerate() {
        println!(
            "{:>2}. {:<22}  {:<8} {:<10}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = apkg_builder::config::load(path)?;
    // Best-effort pretty print of resolved config.
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}

fn cmd_build(path: &Path, dry_run: bool) -> Result<()> {
    let doc = apkg_builder::config::load(path)?;
    let pkg = PackageConfig::load(&doc)?;
    let sink = Arc::new(StdoutSink::default());
    let mut ctx =
        ExecCtx::new(dry_run, sink).with_fetcher(Arc::new(HttpFetcher::new(&pkg.fetch)));

    let artifact = pipeline::build(&doc, &mut ctx)?;
    if dry_run {
        println!("would write {}", artifact.display());
        return Ok(());
    }
    println!("{}", artifact.display());
    println!("sha256 {}", fetch::sha256_file(&artifact)?);
    Ok(())
}

fn cmd_inspect(path: &Path, json: bool) -> Result<()> {
    let contents = container::read_container(path)?;
    if json {
        let s = serde_json::to_string_pretty(&contents)
            .map_err(|e| apkg_builder::Error::msg(format!("json encode: {e}")))?;
        println!("{s}");
        return Ok(());
    }

    println!("{}", path.display());
    println!("  members: {}", contents.members.join(", "));
    println!("  format version: {}", contents.format_version);
    print_entries("control.tar.gz", &contents.control);
    print_entries("data.tar.gz", &contents.data);
    Ok(())
}

fn print_entries(member: &str, entries: &[TarEntryInfo]) {
    println!("  {member}:");
    for e in entries {
        println!(
            "    {:04o} {}/{} {:>10}  {}",
            e.mode, e.owner, e.group, e.size, e.path
        );
    }
}
