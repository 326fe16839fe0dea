//! `FieldSeal` CLI for key generation, legacy migration and lookups.

#![warn(clippy::pedantic, clippy::nursery)]

mod config;
mod telemetry;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fieldseal::codec::{AmbiguityPolicy, FieldCodec, FieldKind};
use fieldseal::context::FieldScope;
use fieldseal::lookup::LookupService;
use fieldseal::migrate::{MigrationReport, Migrator, VerifyReport, DEFAULT_BATCH_SIZE};
use fieldseal_key_file::FileKeyProvider;
use fieldseal_sqlite::SqliteStore;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "fieldseal")]
#[command(about = "FieldSeal encrypted field CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct FieldArgs {
    /// SQLite database (defaults to FIELDSEAL_DATABASE)
    #[arg(short, long)]
    database: Option<PathBuf>,
    /// Table owning the protected column
    #[arg(long)]
    table: String,
    /// Protected column
    #[arg(long)]
    column: String,
    /// Kind of data held by the column
    #[arg(long, default_value = "email", value_parser = parse_kind)]
    kind: FieldKind,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new encryption key and blind-index salt
    Keygen {
        /// Output directory for keys
        #[arg(short, long, default_value = "./keys")]
        output: PathBuf,
    },
    /// Backfill blind indexes and encrypt legacy plaintext rows
    Migrate {
        #[command(flatten)]
        field: FieldArgs,
        /// Rows fetched per batch
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
        /// Fail rows whose legacy value is ambiguous instead of assuming plaintext
        #[arg(long)]
        reject_ambiguous: bool,
    },
    /// Check that every row is indexed and decrypts to its index
    Verify {
        #[command(flatten)]
        field: FieldArgs,
    },
    /// Look up the row holding a value
    Lookup {
        #[command(flatten)]
        field: FieldArgs,
        /// Value to look up
        #[arg(long)]
        value: String,
        /// Scan at most this many legacy rows on an index miss
        #[arg(long)]
        legacy_fallback: Option<usize>,
    },
}

fn parse_kind(s: &str) -> Result<FieldKind, String> {
    s.parse()
}

struct Field {
    codec: FieldCodec,
    store: Arc<SqliteStore>,
    scope: FieldScope,
}

fn open_field(settings: &config::Settings, args: FieldArgs) -> Result<Field> {
    let keyring = settings.keyring()?;
    let codec = FieldCodec::new(&keyring, args.kind).context("cannot build field codec")?;

    let path = settings.database_path(args.database)?;
    let store = SqliteStore::open(&path)
        .with_context(|| format!("cannot open database {}", path.display()))?;

    let scope = FieldScope::new(args.table, args.column);
    store.init_schema(&scope).with_context(|| format!("cannot prepare {scope}"))?;

    Ok(Field { codec, store: Arc::new(store), scope })
}

fn print_migration(report: &MigrationReport) {
    println!("scanned:            {}", report.scanned);
    println!("migrated:           {}", report.migrated);
    println!("already conformant: {}", report.already_conformant);
    println!("encrypted legacy:   {}", report.encrypted_legacy);
    println!("ambiguous:          {}", report.ambiguous.len());
    println!("skipped duplicates: {}", report.skipped_duplicates.len());
    println!("failed:             {}", report.failed.len());
    println!("unique index:       {}", if report.unique_index_applied { "applied" } else { "not applied" });

    for dup in &report.skipped_duplicates {
        match dup.existing {
            Some(existing) => println!("  duplicate: row {} conflicts with row {existing}", dup.row),
            None => println!("  duplicate: row {}", dup.row),
        }
    }
    for failed in &report.failed {
        println!("  failed: row {}: {}", failed.row, failed.reason);
    }
    for row in &report.ambiguous {
        println!("  review: row {row} was ambiguous and assumed plaintext");
    }
}

fn print_verification(report: &VerifyReport) {
    println!("total:          {}", report.total);
    println!("legacy:         {}", report.legacy);
    println!("undecryptable:  {}", report.undecryptable.len());
    println!("index mismatch: {}", report.index_mismatch.len());
    println!("migrated seals: {}", report.sealed_by_migration);
    for row in &report.undecryptable {
        println!("  undecryptable: row {row}");
    }
    for row in &report.index_mismatch {
        println!("  mismatch: row {row}");
    }
}

fn run(cli: Cli, settings: &config::Settings) -> Result<ExitCode> {
    match cli.command {
        Commands::Keygen { output } => {
            FileKeyProvider::init(&output)
                .with_context(|| format!("cannot initialize keys in {}", output.display()))?;
            println!("Generated keys in: {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Migrate { field, batch_size, reject_ambiguous } => {
            let Field { mut codec, store, scope } = open_field(settings, field)?;
            if reject_ambiguous {
                codec = codec.with_ambiguity_policy(AmbiguityPolicy::Reject);
            }
            let report =
                Migrator::new(codec, store, scope).with_batch_size(batch_size).run()?;
            print_migration(&report);
            Ok(if report.is_complete() { ExitCode::SUCCESS } else { ExitCode::from(2) })
        }
        Commands::Verify { field } => {
            let Field { codec, store, scope } = open_field(settings, field)?;
            let report = Migrator::new(codec, store, scope).verify()?;
            print_verification(&report);
            Ok(if report.is_clean() { ExitCode::SUCCESS } else { ExitCode::from(2) })
        }
        Commands::Lookup { field, value, legacy_fallback } => {
            let Field { codec, store, scope } = open_field(settings, field)?;
            let mut service = LookupService::new(codec, store, scope);
            if let Some(limit) = legacy_fallback {
                service = service.with_legacy_fallback(limit);
            }
            match service.find_with_legacy_fallback(&value)? {
                Some(id) => {
                    println!("{id}");
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    println!("not found");
                    Ok(ExitCode::from(1))
                }
            }
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = config::Settings::from_env()?;
    telemetry::init_tracing(&settings.log_level, settings.log_json)?;

    run(cli, &settings)
}
