//! jsonbuilder CLI - Build JSON documents from tabular data
//!
//! # Main Commands
//!
//! ```bash
//! jsonbuilder build -f format.json -t rates.csv     # Build the document
//! jsonbuilder build -f format.json -t rates.csv -v  # Also print table snapshots
//! ```
//!
//! # Helper Commands
//!
//! ```bash
//! jsonbuilder table rates.csv        # Dump a loaded table as JSON records
//! jsonbuilder infer example.json     # Derive a mapping skeleton from a document
//! jsonbuilder delta 1y6m --from 2024-01-31
//! ```

use clap::{Args, Parser, Subcommand};
use jsonbuilder::expr::parse_date;
use jsonbuilder::{
    infer_format, load_schema, load_table, validate_document, BuildOptions, Delta, Document,
    Format, TableOptions, Tree, Value,
};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Documents longer than this are not echoed by `build --verbose`.
const MAX_PRINTED_OUTPUT: usize = 100_000;

#[derive(Parser)]
#[command(name = "jsonbuilder")]
#[command(about = "Build structured JSON documents from tabular data", long_about = None)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Logging options shared by every command
#[derive(Args)]
struct LoggingArgs {
    /// Log filter (overrides JSONBUILDER_LOG), e.g. `debug` or `jsonbuilder=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

impl LoggingArgs {
    /// Default `info`, then `JSONBUILDER_LOG`, then the command line.
    fn initialize_logging(&self) {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(log::LevelFilter::Info);
        builder.parse_env("JSONBUILDER_LOG");
        if let Some(ref level) = self.log_level {
            builder.parse_filters(level);
        } else if self.quiet {
            builder.filter_level(log::LevelFilter::Error);
        }
        builder.init();
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build a JSON document from a format file and a table
    Build {
        /// Format file (mapping, functions, df_transforms, table options)
        #[arg(short, long)]
        format: PathBuf,

        /// Input table (CSV or other delimited text; workbooks with the `excel` feature)
        #[arg(short, long)]
        table: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Reference date bound to `today` (default: current date)
        #[arg(short, long)]
        date: Option<String>,

        /// Row to centre the table snapshots on (1-based)
        #[arg(short, long)]
        inspect_row: Option<usize>,

        /// Validate the document against this JSON Schema
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Write compact JSON instead of indented
        #[arg(long)]
        compact: bool,

        /// Print table snapshots, and the document when writing to a file
        #[arg(short, long)]
        verbose: bool,
    },

    /// Load a table and output it as JSON records
    Table {
        /// Input table
        input: PathBuf,

        /// Field separator (sniffed if not specified)
        #[arg(short, long)]
        sep: Option<String>,

        /// Keep every cell as text
        #[arg(long)]
        strings: bool,

        /// Keep headers exactly as written
        #[arg(long)]
        raw_header: bool,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Derive a format file skeleton from an example JSON document
    Infer {
        /// Example JSON document
        input: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Parse a delta token (`3m`, `1y6m`, `o/n`)
    Delta {
        /// Token to parse
        token: String,

        /// Apply the delta to this date
        #[arg(long)]
        from: Option<String>,
    },
}

fn main() {
    // Load .env file (if present)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    cli.logging.initialize_logging();

    let result = match cli.command {
        Commands::Build {
            format,
            table,
            output,
            date,
            inspect_row,
            schema,
            compact,
            verbose,
        } => cmd_build(
            &format,
            &table,
            output.as_deref(),
            date.as_deref(),
            inspect_row,
            schema.as_deref(),
            compact,
            verbose,
        ),

        Commands::Table {
            input,
            sep,
            strings,
            raw_header,
            output,
        } => cmd_table(&input, sep, strings, raw_header, output.as_deref()),

        Commands::Infer { input, output } => cmd_infer(&input, output.as_deref()),

        Commands::Delta { token, from } => cmd_delta(&token, from.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("❌ Error: {}", e);
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_build(
    format_path: &Path,
    table_path: &Path,
    output: Option<&Path>,
    date: Option<&str>,
    inspect_row: Option<usize>,
    schema_path: Option<&Path>,
    compact: bool,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    info!("Process started");

    let mut options = BuildOptions::default();
    if let Some(date) = date {
        options = options.with_date(parse_date(date, None)?);
    }
    if let Some(row) = inspect_row {
        options = options.with_inspect_row(row);
    }

    let format = Format::from_path(format_path)?;
    let tree = Tree::new(&format, table_path, &options)?;

    if verbose {
        for (step, snapshot) in tree.snapshots().iter().enumerate() {
            eprintln!("\n📋 Table snapshot {}:\n{}", step, snapshot);
        }
    }

    let document = tree.build()?;
    let json = document.to_json_string(!compact)?;

    if verbose {
        if let Some(echo) = verbose_echo(&json, output) {
            eprintln!("\n{}", echo);
        }
    }

    if let Some(schema_path) = schema_path {
        let schema = load_schema(schema_path)?;
        if let Err(errors) = validate_document(&schema, &document) {
            eprintln!("\n❌ Schema validation failed ({} error(s)):", errors.len());
            for err in errors.iter().take(10) {
                eprintln!("   - {}", err);
            }
            return Err(format!("{} schema violation(s)", errors.len()).into());
        }
        eprintln!("✅ Document matches {}", schema_path.display());
    }

    write_output(&json, output)?;

    info!("Process completed");
    info!("Elapsed time: {:.3}s", started.elapsed().as_secs_f64());
    Ok(())
}

fn cmd_table(
    input: &Path,
    sep: Option<String>,
    strings: bool,
    raw_header: bool,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("📄 Loading table: {}", input.display());

    let options = TableOptions {
        sep,
        dtype: strings.then(|| "str".to_string()),
        ..TableOptions::default()
    };
    let table = load_table(input, &options, raw_header)?;

    eprintln!("   Columns: {}", table.columns().join(", "));
    eprintln!("✅ Loaded {} rows", table.len());

    let records = Value::List(table.to_records().into_iter().map(Value::Map).collect());
    let json = Document::new(records).to_json_string(true)?;
    write_output(&json, output)?;

    Ok(())
}

fn cmd_infer(input: &Path, output: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("🔎 Inferring mapping from: {}", input.display());

    let content = fs::read_to_string(input)?;
    let example: serde_json::Value = serde_json::from_str(&content)?;

    let json = serde_json::to_string_pretty(&infer_format(&example))?;
    write_output(&json, output)?;

    Ok(())
}

fn cmd_delta(token: &str, from: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let delta = Delta::parse(token)?;
    match from {
        Some(date) => {
            let date = parse_date(date, None)?;
            println!("{} + {} = {}", date, delta, delta.apply(date)?);
        }
        None => {
            println!(
                "{} (years: {}, months: {}, weeks: {}, days: {})",
                delta, delta.years, delta.months, delta.weeks, delta.days
            );
        }
    }
    Ok(())
}

/// What `build --verbose` echoes to stderr. Nothing when the document already
/// goes to stdout.
fn verbose_echo<'a>(json: &'a str, output: Option<&Path>) -> Option<&'a str> {
    match output {
        None => None,
        Some(_) if json.len() > MAX_PRINTED_OUTPUT => Some("Output JSON is too large to print..."),
        Some(_) => Some(json),
    }
}

fn write_output(content: &str, path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    match path {
        Some(p) => {
            fs::write(p, content)?;
            eprintln!("💾 Output written to: {}", p.display());
        }
        None => {
            println!("{}", content);
        }
    }
    Ok(())
}
