//! Drives an [`Engine`] through simulated power failures.
//!
//! Every boot is a fresh [`Engine`] built from whatever the medium holds, exactly like a device
//! restarting: no state survives a power failure except through the medium.

use anyhow::Context as _;
use icnn::{
    Engine, EngineError, LayoutConfig, Nvm, PowerCut, ProgressTracker, RunState, Tensor,
    store::Tally,
};
use serde::Serialize;
use tracing::{debug, info, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

pub const DEFAULT_MAX_REBOOTS: u32 = 100_000;

pub fn setup_logging(json: bool) {
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Setting up logging failed");
    } else {
        let subscriber = tracing_subscriber::fmt()
            .compact()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Setting up logging failed");
    };
}

/// When to cut the power, in durable bytes written since the last boot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum CutPlan {
    #[default]
    Never,
    /// One cut per boot, in order, then uninterrupted.
    Once(Vec<u64>),
    /// Every boot gets the same budget.
    Periodic(u64),
}

impl CutPlan {
    fn budget(&self, boot: usize) -> Option<u64> {
        match self {
            CutPlan::Never => None,
            CutPlan::Once(cuts) => cuts.get(boot).copied(),
            CutPlan::Periodic(every) => Some(*every),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunOutcome {
    pub reboots: u32,
    pub bytes_written: u64,
    pub run_counter: u32,
    pub predicted: usize,
    #[serde(skip)]
    pub output: Tensor,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct SamplesOutcome {
    pub reboots: u32,
    pub bytes_written: u64,
    pub samples_done: u32,
    pub correct: u32,
}

/// Repeats `attempt` on fresh boots until it completes without a power failure.
fn with_reboots<N, T>(
    nvm: &mut PowerCut<N>,
    plan: &CutPlan,
    max_reboots: u32,
    mut attempt: impl FnMut(&mut PowerCut<N>) -> icnn::Result<T>,
) -> anyhow::Result<(T, u32, u64)>
where
    N: Nvm,
{
    let start = nvm.total_written();
    let mut reboots = 0u32;
    loop {
        nvm.arm(plan.budget(reboots as usize));
        match attempt(nvm) {
            Ok(value) => {
                nvm.disarm();
                return Ok((value, reboots, nvm.total_written() - start));
            }
            Err(EngineError::PowerFailure(written)) => {
                reboots += 1;
                debug!(reboots, written, "rebooting");
                if reboots > max_reboots {
                    nvm.disarm();
                    return Err(anyhow::Error::new(EngineError::PowerFailure(written))
                        .context(format!("no completion within {max_reboots} reboots")));
                }
            }
            Err(err) => {
                nvm.disarm();
                return Err(err).context("engine failed");
            }
        }
    }
}

/// Runs the sample selected on the medium to completion under `plan`.
pub fn run_to_completion<N: Nvm, P: ProgressTracker>(
    nvm: &mut PowerCut<N>,
    config: Option<&LayoutConfig>,
    plan: &CutPlan,
    max_reboots: u32,
) -> anyhow::Result<RunOutcome> {
    let ((output, predicted, run_counter), reboots, bytes_written) =
        with_reboots(nvm, plan, max_reboots, |nvm| {
            let mut engine = Engine::<_, P>::boot(nvm, config)?;
            engine.run()?;
            Ok((
                engine.output()?,
                engine.predicted_label()?,
                engine.model().run_counter,
            ))
        })?;
    info!(reboots, bytes_written, predicted, "run complete");
    Ok(RunOutcome {
        reboots,
        bytes_written,
        run_counter,
        predicted,
        output,
    })
}

/// Runs every provisioned sample, counting each one exactly once in the durable tally.
///
/// Which step comes next is derived from the committed model and tally alone, so the loop can
/// be cut anywhere and resumed from a later boot.
fn drive_samples<N: Nvm, P: ProgressTracker>(
    nvm: N,
    config: Option<&LayoutConfig>,
) -> icnn::Result<Tally> {
    let mut engine = Engine::<_, P>::boot(nvm, config)?;
    let n_samples = engine.context().storage().header().n_samples as u32;
    loop {
        let tally = engine.load_tally()?;
        if tally.samples_done >= n_samples {
            return Ok(tally);
        }
        let (state, sample) = (engine.model().state, engine.model().sample_idx);
        let current = sample as u32 == tally.samples_done;
        match state {
            RunState::Finished if current => {
                let predicted = engine.predicted_label()?;
                let expected = engine.expected_label(sample)?;
                let correct = expected.is_some_and(|label| label as usize == predicted);
                info!(sample, predicted, ?expected, correct, "sample done");
                engine.commit_tally(&Tally {
                    samples_done: tally.samples_done + 1,
                    correct: tally.correct + correct as u32,
                })?;
            }
            RunState::Running => engine.run()?,
            RunState::Idle if current => engine.run()?,
            _ => engine.prepare_sample(tally.samples_done as u16)?,
        }
    }
}

pub fn run_samples<N: Nvm, P: ProgressTracker>(
    nvm: &mut PowerCut<N>,
    config: Option<&LayoutConfig>,
    plan: &CutPlan,
    max_reboots: u32,
) -> anyhow::Result<SamplesOutcome> {
    let (tally, reboots, bytes_written) = with_reboots(nvm, plan, max_reboots, |nvm| {
        drive_samples::<_, P>(nvm, config)
    })?;
    info!(
        samples = tally.samples_done,
        correct = tally.correct,
        reboots,
        bytes = %utils::format_bytes(bytes_written),
        "all samples done"
    );
    Ok(SamplesOutcome {
        reboots,
        bytes_written,
        samples_done: tally.samples_done,
        correct: tally.correct,
    })
}
