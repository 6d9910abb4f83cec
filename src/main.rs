mod cli;
mod ui;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use aerorun::config::AeroConfig;
use aerorun::engine::EngineLauncher;
use aerorun::engine::scripted::{Script, ScriptedLauncher};
use aerorun::logging;
use aerorun::orchestrator::JobOrchestrator;
use aerorun::pipeline::{Dimensions, PipelineDefinition, Variant};
use aerorun::report;
use aerorun::state_machine::{JobSpec, JobStatus};
use aerorun::worker::WorkerEvent;
use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = match &cli.config {
        Some(path) => AeroConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AeroConfig::load()?,
    };

    match cli.command {
        Command::Simulate { jobs_file } => {
            let specs = JobSpec::load_batch(&jobs_file)
                .with_context(|| format!("reading jobs from {}", jobs_file.display()))?;
            if specs.is_empty() {
                bail!("{} contains no jobs", jobs_file.display());
            }
            run_batch(config, specs, ScriptedLauncher::default(), cli.verbose).await
        }
        Command::Plan { variant } => {
            let definition = PipelineDefinition::for_variant(variant.into(), &config)?;
            ui::print_plan(&definition);
            Ok(())
        }
        Command::Demo => run_batch(config, demo_specs(), demo_launcher(), cli.verbose).await,
        Command::Status => {
            let rows = report::read_summary(&config.output_root)?;
            ui::print_summary(&rows);
            Ok(())
        }
    }
}

/// Queues `specs`, renders worker events until the batch drains and
/// cancels everything on Ctrl-C.
async fn run_batch<L: EngineLauncher>(
    config: AeroConfig,
    specs: Vec<JobSpec>,
    launcher: L,
    verbose: bool,
) -> Result<()> {
    let (orchestrator, mut events) = JobOrchestrator::start(config, launcher)?;

    let mut queued = 0;
    for spec in specs {
        let name = spec.name.clone();
        match orchestrator.enqueue(spec) {
            Ok(_) => queued += 1,
            Err(e) => eprintln!("skipping job `{name}`: {e}"),
        }
    }
    orchestrator.close();

    let mut progress = ui::BatchProgress::start(queued, verbose);
    let mut records = Vec::new();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let WorkerEvent::JobFinished(record) = &event {
                        records.push(record.clone());
                    }
                    progress.handle(&event);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                let dropped = orchestrator.cancel_all();
                progress.interrupted(dropped);
            }
        }
    }
    progress.finish(&records);

    tokio::task::spawn_blocking(move || orchestrator.join()).await??;

    let failed = records
        .iter()
        .filter(|r| r.status == JobStatus::Failed)
        .count();
    if failed > 0 {
        bail!("{failed} job(s) failed");
    }
    Ok(())
}

fn demo_specs() -> Vec<JobSpec> {
    let spec = |name: &str, variant: Variant, dims: Dimensions| JobSpec {
        name: name.to_string(),
        geometry: PathBuf::from(format!("geometry/{name}.pmdb")),
        variant,
        dimensions: dims,
        output_dir: None,
    };
    vec![
        spec("demo-fw", Variant::FrontWing, Dimensions::new(0.6, 1.4, 0.3)),
        spec("demo-hc", Variant::HalfCar, Dimensions::new(2.9, 1.45, 1.2)),
        spec("demo-ut", Variant::Undertray, Dimensions::new(2.0, 1.2, 0.3)),
    ]
}

/// Paced scripted engine; the undertray diverges once and recovers.
fn demo_launcher() -> ScriptedLauncher {
    let pace = Duration::from_millis(120);
    ScriptedLauncher::new(Script::converging().with_pace(pace))
        .with_job_script(
            "demo-hc",
            Script::converging()
                .with_pace(pace)
                .with_coefficients(1.12, -3.05)
                .with_zone_area(0.61),
        )
        .with_job_script(
            "demo-ut",
            Script::converging()
                .with_pace(pace)
                .with_coefficients(0.41, -1.87)
                .diverge_on_iterate(2),
        )
}
