use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use ibge_importer::app::{
    App, DeleteReport, DeleteRequest, GeographyReport, ProgressSinkKind,
};
use ibge_importer::cache::FileCache;
use ibge_importer::companies::CompanyReport;
use ibge_importer::config::{ConfigLoader, ResolvedConfig};
use ibge_importer::domain::{ImportTarget, Table, TableGroup};
use ibge_importer::error::ImportError;
use ibge_importer::fetch::{HttpDownloader, bytes_to_human};
use ibge_importer::ibge::IbgeHttpClient;
use ibge_importer::output::{JsonOutput, OutputMode};
use ibge_importer::store::Database;
use ibge_importer::tui::Tui;

#[derive(Parser)]
#[command(name = "ibge-import")]
#[command(about = "Imports the IBGE geographic hierarchy and the Receita Federal company ledger")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Config file (default: ./ibge-import.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// SQLite database path, overrides the config file
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Import states, municipalities and/or districts from the IBGE API")]
    ImportGeography(ImportGeographyArgs),
    #[command(about = "Delete every row of one table, cascading to dependents")]
    DeleteTable(DeleteTableArgs),
    #[command(about = "Download and import the company ledger archive")]
    ImportCompanies(ImportCompaniesArgs),
}

#[derive(Args)]
struct ImportGeographyArgs {
    #[arg(value_enum)]
    target: ImportTarget,

    /// Ignore cached API responses
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct DeleteTableArgs {
    /// Model or table name, e.g. Uf, Municipio, Distrito, Regiao
    name: String,

    #[arg(long)]
    confirm: bool,

    #[arg(long, value_enum, default_value_t = TableGroup::Ibge)]
    app: TableGroup,
}

#[derive(Args)]
struct ImportCompaniesArgs {
    /// Archive URL, overrides the config file
    #[arg(long)]
    url: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<ImportError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ImportError) -> u8 {
    match error {
        ImportError::UnknownTable { .. } | ImportError::ConfirmationRequired(_) => 2,
        ImportError::Transport { .. } | ImportError::Download { .. } => 3,
        ImportError::CorruptArchive { .. } => 4,
        _ => 1,
    }
}

type HttpApp = App<IbgeHttpClient, HttpDownloader>;

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref()).map_err(miette::Report::new)?;
    if let Some(database) = cli.database {
        config.database_path = Utf8PathBuf::from(database);
    }

    match cli.command {
        Commands::ImportGeography(args) => {
            let app = build_app(config, args.force)?;
            run_geography(app, args.target, output_mode)
        }
        Commands::DeleteTable(args) => {
            let app = build_app(config, false)?;
            run_delete(app, args, output_mode)
        }
        Commands::ImportCompanies(args) => {
            if let Some(url) = args.url {
                config.archive_url = url;
            }
            let app = build_app(config, false)?;
            run_companies(app, output_mode)
        }
    }
}

fn build_app(config: ResolvedConfig, force: bool) -> miette::Result<HttpApp> {
    let db = Database::open(&config.database_path).map_err(miette::Report::new)?;
    let cache = Arc::new(FileCache::new(config.cache_dir.clone()));
    let api = IbgeHttpClient::new(&config.api_base_url, config.timeout, cache, config.cache_ttl)
        .map_err(miette::Report::new)?
        .with_cache_bypass(force);
    let downloader =
        HttpDownloader::new(config.timeout, config.chunk_size).map_err(miette::Report::new)?;
    Ok(App::new(db, api, downloader, config))
}

fn run_geography(
    mut app: HttpApp,
    target: ImportTarget,
    output_mode: OutputMode,
) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => {
            let report = app
                .import_geography(target, &JsonOutput)
                .map_err(miette::Report::new)?;
            JsonOutput::print_geography(&report).into_diagnostic()?;
            Ok(())
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Geography, app.config().database_path.as_str());
            let cancel = app.cancel_token();
            let report = tui.run(cancel, move |sink| app.import_geography(target, sink))?;
            print_geography_summary(&report);
            Ok(())
        }
    }
}

fn run_companies(mut app: HttpApp, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => {
            let report = app
                .import_companies(&JsonOutput)
                .map_err(miette::Report::new)?;
            JsonOutput::print_companies(&report).into_diagnostic()?;
            Ok(())
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Companies, app.config().database_path.as_str());
            let cancel = app.cancel_token();
            let report = tui.run(cancel, move |sink| app.import_companies(sink))?;
            print_company_summary(&report);
            Ok(())
        }
    }
}

fn run_delete(
    mut app: HttpApp,
    args: DeleteTableArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let mut request = DeleteRequest {
        model: args.name,
        app: args.app,
        confirm: args.confirm,
    };
    match output_mode {
        OutputMode::NonInteractive => {
            let report = app
                .delete_table(&request, &JsonOutput)
                .map_err(miette::Report::new)?;
            JsonOutput::print_delete(&report).into_diagnostic()?;
            Ok(())
        }
        OutputMode::Interactive => {
            let table = Table::resolve(request.app, &request.model).map_err(miette::Report::new)?;
            let mut tui = Tui::new(ProgressSinkKind::Delete, app.config().database_path.as_str());
            if !request.confirm && tui.confirm_delete(table.name())? {
                request.confirm = true;
            }
            let cancel = app.cancel_token();
            let report = tui.run(cancel, move |sink| app.delete_table(&request, sink))?;
            print_delete_summary(&report);
            Ok(())
        }
    }
}

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

fn print_geography_summary(report: &GeographyReport) {
    println!("{CYAN}IBGE import summary ({}){RESET}", report.target);
    println!(
        "{GREEN}created: {}   skipped: {}{RESET}",
        report.totals.created, report.totals.skipped
    );
    if report.totals.errored > 0 {
        println!("{YELLOW}errored: {}{RESET}", report.totals.errored);
    }
    if let Some(states) = &report.states {
        println!(
            "  estados: {} processed, {} created ({} regions)",
            states.processed, states.states_created, states.regions_created
        );
    }
    if let Some(municipalities) = &report.municipalities {
        println!(
            "  municipios: {} processed, {} created, {} invalid",
            municipalities.processed,
            municipalities.municipalities_created(),
            municipalities.invalid
        );
        for (table, created) in &municipalities.created {
            if *created > 0 && *table != Table::Municipalities {
                println!("    {table}: {created}");
            }
        }
    }
    if let Some(districts) = &report.districts {
        println!(
            "  distritos: {} processed, {} created, {} existing",
            districts.processed, districts.created, districts.existing
        );
        for (reason, count) in &districts.gaps {
            println!("{YELLOW}    skipped ({reason}): {count}{RESET}");
        }
        if districts.failed > 0 {
            println!("{RED}    failed: {}{RESET}", districts.failed);
        }
    }
    println!("  elapsed: {:.2}s", report.elapsed_ms as f64 / 1000.0);
}

fn print_company_summary(report: &CompanyReport) {
    println!("{CYAN}Company ledger summary{RESET}");
    if let Some(archive) = &report.archive {
        let source = if archive.reused { "reused" } else { "downloaded" };
        println!(
            "  archive: {} ({source}, {})",
            archive.path.display(),
            bytes_to_human(archive.bytes)
        );
    }
    println!("  entries: {}", report.entries.join(", "));
    println!(
        "{GREEN}created: {}   already present: {}{RESET}",
        report.created, report.skipped_existing
    );
    if report.discarded() > 0 {
        println!(
            "{YELLOW}discarded rows: {} ({} short, {} without id){RESET}",
            report.discarded(),
            report.short_rows,
            report.rows_without_id
        );
    }
    if report.failed > 0 {
        println!("{RED}failed rows: {}{RESET}", report.failed);
    }
    println!("  elapsed: {:.2}s", report.elapsed_ms as f64 / 1000.0);
}

fn print_delete_summary(report: &DeleteReport) {
    if report.deleted == 0 {
        println!("{YELLOW}{} is already empty{RESET}", report.table);
        return;
    }
    println!(
        "{GREEN}{} rows deleted from {} in {:.2}s{RESET}",
        report.deleted,
        report.table,
        report.elapsed_ms as f64 / 1000.0
    );
    if report.details.len() > 1 {
        println!("Deletion details:");
        for (table, count) in &report.details {
            println!("  - {table}: {count}");
        }
    }
}
