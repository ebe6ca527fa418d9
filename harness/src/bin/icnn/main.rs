use std::{
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context as _, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use icnn::{
    EngineError, FileNvm, FootprintTracker, JapariTracker, LayoutConfig, MemNvm, Nvm, PowerCut,
    ProgressTracker, StateBitTracker, Strategy, counters,
    layout::{DEFAULT_NUM_SLOTS, DEFAULT_SLOT_SIZE},
    model::loader::ModelDescription,
    provision::{is_provisioned, provision, required_len},
    storage::Storage,
    testing::toy_description,
};
use icnn_harness::{CutPlan, DEFAULT_MAX_REBOOTS, run_samples, setup_logging};
use tracing::{error, info, warn};
use utils::CsvReport;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Should the logs be printed in json format or not
    #[arg(long, env, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Clone, Copy)]
struct LayoutArgs {
    /// Number of intermediate buffers.
    #[arg(long, env = "ICNN_NUM_SLOTS", default_value_t = DEFAULT_NUM_SLOTS)]
    num_slots: u8,

    /// Size of each intermediate buffer in bytes.
    #[arg(long, env = "ICNN_SLOT_SIZE", default_value_t = DEFAULT_SLOT_SIZE)]
    slot_size: u32,

    /// Values computed and written per job.
    #[arg(long, env = "ICNN_BATCH_SIZE", default_value_t = *icnn::layout::BATCH_SIZE)]
    batch_size: u16,

    /// How progress is recovered after a power failure.
    #[arg(long, env = "ICNN_STRATEGY", default_value = "state-bit")]
    strategy: Strategy,
}

impl LayoutArgs {
    fn config(&self) -> LayoutConfig {
        LayoutConfig {
            num_slots: self.num_slots,
            slot_size: self.slot_size,
            batch_size: self.batch_size,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Write a model and its samples to an NVM image file.
    Provision {
        /// JSON model description.
        #[arg(short, long)]
        model: PathBuf,

        /// NVM image, created if missing.
        #[arg(short, long, env = "ICNN_NVM")]
        nvm: PathBuf,

        #[command(flatten)]
        layout: LayoutArgs,
    },
    /// Run every sample of an NVM image, resuming wherever a previous invocation stopped.
    Run {
        #[arg(short, long, env = "ICNN_NVM")]
        nvm: PathBuf,

        /// Cut the power after this many bytes, leaving the image mid-run.
        #[arg(long)]
        cut_after: Option<u64>,
    },
    /// Provision a model in memory and run it under simulated power failures.
    Simulate {
        #[arg(short, long)]
        model: PathBuf,

        #[command(flatten)]
        layout: LayoutArgs,

        /// Power budget of every boot in bytes.
        #[arg(long, conflicts_with = "cuts")]
        cut_every: Option<u64>,

        /// Power budgets of the first boots, in order.
        #[arg(long, value_delimiter = ',')]
        cuts: Vec<u64>,

        #[arg(long, default_value_t = DEFAULT_MAX_REBOOTS)]
        max_reboots: u32,
    },
    /// Dump the per-layer counters of an NVM image as CSV.
    Counters {
        #[arg(short, long, env = "ICNN_NVM")]
        nvm: PathBuf,

        /// Append to this file instead of printing.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write a small random model description.
    Toy {
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, default_value_t = 2)]
        samples: usize,

        #[arg(long, default_value_t = 7)]
        seed: u64,
    },
}

/// Exit status of a run interrupted by an injected power failure.
const POWER_FAILURE_EXIT: u8 = 2;

fn open_image(path: &Path) -> anyhow::Result<FileNvm> {
    let len = fs::metadata(path)
        .with_context(|| format!("reading the size of {}", path.display()))?
        .len();
    Ok(FileNvm::open(path, len as usize)?)
}

fn provision_image(model: &Path, nvm: &Path, layout: LayoutArgs) -> anyhow::Result<()> {
    let graph = ModelDescription::from_path(model)
        .with_context(|| format!("loading {}", model.display()))?
        .build()?;
    let len = required_len(&graph, layout.config(), layout.strategy)?;
    let mut image = FileNvm::open(nvm, len)?;
    let layout = provision(&mut image, &graph, layout.config(), layout.strategy)?;
    info!(
        path = %nvm.display(),
        size = %utils::format_bytes(layout.total_len() as u64),
        "image ready"
    );
    Ok(())
}

fn run_image<P: ProgressTracker>(nvm: FileNvm, cut_after: Option<u64>) -> anyhow::Result<ExitCode> {
    let mut nvm = PowerCut::new(nvm);
    // a single boot: a real device would be restarted by its power supply
    let plan = CutPlan::Once(cut_after.into_iter().collect());
    match run_samples::<_, P>(&mut nvm, None, &plan, 0) {
        Ok(outcome) => {
            info!(
                samples = outcome.samples_done,
                correct = outcome.correct,
                "accuracy {}/{}",
                outcome.correct,
                outcome.samples_done
            );
            nvm.flush()?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err)
            if err
                .downcast_ref::<EngineError>()
                .is_some_and(EngineError::is_power_failure) =>
        {
            warn!("{err:#}");
            nvm.flush()?;
            Ok(ExitCode::from(POWER_FAILURE_EXIT))
        }
        Err(err) => Err(err),
    }
}

fn simulate<P: ProgressTracker>(
    model: &Path,
    layout: LayoutArgs,
    plan: CutPlan,
    max_reboots: u32,
) -> anyhow::Result<()> {
    let graph = ModelDescription::from_path(model)?.build()?;
    let config = layout.config();
    let mut nvm = PowerCut::new(MemNvm::new(required_len(&graph, config, P::STRATEGY)?));
    provision(&mut nvm, &graph, config, P::STRATEGY)?;
    let outcome = run_samples::<_, P>(&mut nvm, Some(&config), &plan, max_reboots)?;
    let report = serde_json::to_string_pretty(&outcome)?;
    io::stdout().write_all(report.as_bytes())?;
    io::stdout().write_all(b"\n")?;
    utils::log_memory("simulation");
    Ok(())
}

fn dump_counters(nvm: FileNvm, output: Option<PathBuf>) -> anyhow::Result<()> {
    let Some(header) = is_provisioned(&nvm)? else {
        bail!("the image is not provisioned");
    };
    let layout = icnn::NvmLayout::new(header)?;
    let storage = Storage::new(nvm, layout)?;
    let mut report = CsvReport::from_headers(["layer", "power_cycles", "jobs", "probes", "bytes", "micros"]);
    for (layer, c) in counters::load_all(&storage)?.into_iter().enumerate() {
        report.push([
            layer as u64,
            c.power_cycles as u64,
            c.jobs as u64,
            c.probes as u64,
            c.bytes as u64,
            c.micros as u64,
        ])?;
    }
    match output {
        Some(path) => report.flush(path),
        None => report.write_to(io::stdout(), true),
    }
}

fn execute(args: Args) -> anyhow::Result<ExitCode> {
    match args.command {
        Command::Provision { model, nvm, layout } => provision_image(&model, &nvm, layout)?,
        Command::Run { nvm, cut_after } => {
            let image = open_image(&nvm)?;
            let Some(header) = is_provisioned(&image)? else {
                bail!("{} is not provisioned, run `icnn provision` first", nvm.display());
            };
            return match header.strategy {
                Strategy::StateBit => run_image::<StateBitTracker>(image, cut_after),
                Strategy::Footprint => run_image::<FootprintTracker>(image, cut_after),
                Strategy::Japari => run_image::<JapariTracker>(image, cut_after),
            };
        }
        Command::Simulate {
            model,
            layout,
            cut_every,
            cuts,
            max_reboots,
        } => {
            let plan = match cut_every {
                Some(every) => CutPlan::Periodic(every),
                None if cuts.is_empty() => CutPlan::Never,
                None => CutPlan::Once(cuts),
            };
            match layout.strategy {
                Strategy::StateBit => simulate::<StateBitTracker>(&model, layout, plan, max_reboots)?,
                Strategy::Footprint => simulate::<FootprintTracker>(&model, layout, plan, max_reboots)?,
                Strategy::Japari => simulate::<JapariTracker>(&model, layout, plan, max_reboots)?,
            }
        }
        Command::Counters { nvm, output } => dump_counters(open_image(&nvm)?, output)?,
        Command::Toy {
            output,
            samples,
            seed,
        } => {
            fs::write(&output, toy_description(seed, samples).to_json()?)?;
            info!(path = %output.display(), "wrote toy model");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(args.json);
    match execute(args) {
        Ok(code) => code,
        Err(err) => {
            if err
                .downcast_ref::<EngineError>()
                .is_some_and(|e| matches!(e, EngineError::Unprovisioned(_)))
            {
                error!("{err:#}; provision the image first");
            } else {
                error!("{err:#}");
            }
            ExitCode::FAILURE
        }
    }
}
