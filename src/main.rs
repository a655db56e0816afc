use anyhow::{Context, Result};
use clap::Parser;
use kiln_core::cli::{Commands, HistoryCommands};
use kiln_core::config::CONFIG_FILE_NAME;
use kiln_core::logger::{status_level, Logger};
use kiln_core::parser::LogLevel;
use kiln_core::{
    Backend, Budget, Buffer, Cli, CommandBackend, Config, KilnError, OutcomeStatus, PackageRegistry,
    Pipeline, PipelineOptions, RunHistory, RunHistoryEntry, Workspace,
};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let default = if verbose { "kiln_core=debug,kiln=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn registry(config: &Config) -> Arc<PackageRegistry> {
    let backend = Arc::new(CommandBackend::from_config(config));
    Arc::new(
        PackageRegistry::new(config.packages_root(), backend)
            .with_build_timeout(config.budget.build_timeout()),
    )
}

fn request_budget(config: &Config) -> Budget {
    Budget::new("request", Some(config.budget.request_timeout()))
}

/// Buffer path for a submitted file: kept as given when it is relative and
/// stays inside the project, otherwise just its file name.
fn buffer_path(file: &Path) -> PathBuf {
    let inside = file
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));

    if inside {
        file.to_path_buf()
    } else {
        file.file_name().map(PathBuf::from).unwrap_or_else(|| file.to_path_buf())
    }
}

async fn read_buffers(files: &[PathBuf]) -> Result<Vec<Buffer>> {
    let mut buffers = Vec::with_capacity(files.len());

    for file in files {
        let content = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("Failed to read source file: {}", file.display()))?;
        buffers.push(Buffer::new(buffer_path(file), content));
    }

    Ok(buffers)
}

fn record_history(config: &Config, entry: RunHistoryEntry) {
    let recorded = RunHistory::new(config.storage_path(), config.history.max_runs)
        .and_then(|mut history| history.add_entry(entry));

    if let Err(e) = recorded {
        tracing::warn!(error = %format!("{e:#}"), "failed to record run history");
    }
}

async fn run(
    config: &Config,
    project: Option<String>,
    script: bool,
    files: &[PathBuf],
    timeout_ms: Option<u64>,
) -> Result<i32> {
    let logger = Logger::new();
    let buffers = read_buffers(files).await?;

    let workspace = if script {
        Workspace::script(buffers)
    } else {
        Workspace {
            project,
            mode: "project".to_string(),
            buffers,
        }
    };
    let label = workspace
        .project
        .clone()
        .unwrap_or_else(|| config.packages.script_package.clone());

    let mut options = PipelineOptions::from_config(config);
    if let Some(ms) = timeout_ms {
        options.run_timeout = Duration::from_millis(ms);
    }

    let pipeline = Pipeline::new(registry(config), options);
    let budget = request_budget(config);

    match pipeline.run_traced(workspace, &budget).await {
        Ok(report) => {
            logger.report(&report);
            let code = report.outcome.status().exit_code();
            record_history(config, RunHistoryEntry::from_report(&report));
            Ok(code)
        }
        Err(e) => {
            let status = OutcomeStatus::from_error(&e);
            logger.log(status_level(status), &format!("Run rejected: {}", e));
            record_history(config, RunHistoryEntry::rejected(label, status, e.to_string()));
            Ok(status.exit_code())
        }
    }
}

async fn build(config: &Config, project: &str) -> Result<i32> {
    let logger = Logger::new();
    let package = match registry(config).get(project) {
        Ok(package) => package,
        Err(e) => {
            logger.log(LogLevel::Error, &e.to_string());
            return Ok(OutcomeStatus::from_error(&e).exit_code());
        }
    };

    let budget = request_budget(config).child("build", config.budget.build_timeout());
    logger.log(LogLevel::Info, &format!("Building {}...", package.name()));

    match package.ensure_built(&budget).await {
        Ok(result) if result.succeeded => {
            for diagnostic in &result.diagnostics {
                logger.log(LogLevel::Warning, diagnostic);
            }
            let verb = if result.reused { "Up to date" } else { "Built" };
            logger.log(LogLevel::Info, &format!("{}: {}", verb, package.name()));
            Ok(OutcomeStatus::Success.exit_code())
        }
        Ok(result) => {
            for diagnostic in &result.diagnostics {
                logger.log(LogLevel::Error, diagnostic);
            }
            logger.log(LogLevel::Error, "Build failed!");
            Ok(OutcomeStatus::CompileFailure.exit_code())
        }
        Err(e @ KilnError::BudgetExceeded(_)) => {
            logger.log(LogLevel::Fatal, &e.to_string());
            Ok(OutcomeStatus::InfrastructureTimeout.exit_code())
        }
        Err(e) => Err(e.into()),
    }
}

async fn status(config: &Config, project: &str) -> Result<i32> {
    let logger = Logger::new();
    let package = registry(config).get(project)?;
    let budget = request_budget(config);

    let analysis = package.backend().analyze(package.directory()).await?;
    logger.log(
        LogLevel::Info,
        &format!("Package {} ({})", package.name(), package.directory().display()),
    );
    logger.log(
        LogLevel::Info,
        &format!("Descriptor: {}", analysis.project_descriptor_path.display()),
    );

    if !analysis.succeeded {
        for diagnostic in &analysis.diagnostics {
            logger.log(LogLevel::Error, diagnostic);
        }
        return Ok(OutcomeStatus::CompileFailure.exit_code());
    }

    logger.log(
        LogLevel::Info,
        &format!("Compile inputs ({}):", analysis.compile_inputs.len()),
    );
    for path in analysis.compile_inputs.iter() {
        logger.log(LogLevel::Info, &format!("  - {}", path.display()));
    }

    match package.rebuild_reason(&budget).await? {
        Some(reason) => logger.log(LogLevel::Warning, &format!("Needs build: {}", reason)),
        None => logger.log(LogLevel::Info, "Up to date"),
    }

    Ok(0)
}

fn show_history(config: &Config, count: Option<usize>) -> Result<()> {
    let logger = Logger::new();
    let history = RunHistory::new(config.storage_path(), config.history.max_runs)
        .context("Failed to load run history")?;

    let entries = history.entries();
    let count = count.unwrap_or(10).min(entries.len());

    if entries.is_empty() {
        logger.log(LogLevel::Info, "No run history found.");
        return Ok(());
    }

    logger.log(LogLevel::Info, &format!("Run History (last {} entries):", count));
    logger.log(LogLevel::Info, "");

    for entry in entries.iter().rev().take(count) {
        let marker = if entry.status == OutcomeStatus::Success { "✓" } else { "✗" };
        logger.log(
            status_level(entry.status),
            &format!(
                "{} {} | {} | {:?} | {:.2}s | {} diagnostics, {} output lines",
                marker,
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.package,
                entry.status,
                entry.duration,
                entry.diagnostic_count,
                entry.output_lines
            ),
        );
        if let Some(diagnostic) = &entry.first_diagnostic {
            logger.log(LogLevel::Debug, &format!("    {}", diagnostic));
        }
    }

    Ok(())
}

fn clear_history(config: &Config) -> Result<()> {
    let mut history = RunHistory::new(config.storage_path(), config.history.max_runs)
        .context("Failed to load run history")?;
    history.clear()?;
    println!("Run history cleared.");
    Ok(())
}

fn init_config(cli: &Cli, name: Option<String>) -> Result<()> {
    let target_dir = cli.source_directory();
    let config_path = target_dir.join(CONFIG_FILE_NAME);

    if config_path.exists() {
        anyhow::bail!(
            "{} already exists at {}. Remove it first if you want to reinitialize.",
            CONFIG_FILE_NAME,
            config_path.display()
        );
    }

    let config = Config::default();
    config
        .save_to_file(&config_path)
        .with_context(|| format!("Failed to save {}", CONFIG_FILE_NAME))?;

    println!("Created {} at {}", CONFIG_FILE_NAME, config_path.display());

    if let Some(name) = name {
        let package_dir = config.packages_root().join(&name);
        let descriptor = package_dir.join(&config.packages.descriptor);

        if descriptor.exists() {
            println!("Package {} already exists at {}", name, package_dir.display());
        } else {
            std::fs::create_dir_all(&package_dir).with_context(|| {
                format!("Failed to create package directory: {}", package_dir.display())
            })?;
            std::fs::write(&descriptor, format!("[project]\nname = \"{}\"\n", name))
                .with_context(|| format!("Failed to write {}", descriptor.display()))?;
            println!("Created package {} at {}", name, package_dir.display());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Init { name } = &cli.command {
        init_config(&cli, name.clone())?;
        return Ok(());
    }

    let config = Config::load_from_cli(&cli)?;

    let code = match &cli.command {
        Commands::Run {
            project,
            script,
            files,
            timeout_ms,
        } => run(&config, project.clone(), *script, files, *timeout_ms).await?,
        Commands::Build { project } => build(&config, project).await?,
        Commands::Status { project } => status(&config, project).await?,
        Commands::History { command } => {
            match command {
                HistoryCommands::Show { count } => show_history(&config, *count)?,
                HistoryCommands::Clear => clear_history(&config)?,
            }
            0
        }
        Commands::Init { .. } => 0,
    };

    if code != 0 {
        std::process::exit(code);
    }

    Ok(())
}
