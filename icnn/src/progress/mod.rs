//! Finding, after a reboot, how much of the interrupted layer is already durable.
//!
//! Three interchangeable strategies implement [`ProgressTracker`]:
//! - [`StateBitTracker`] reserves one bit of every stored value to tell whether it was written by
//!   the current layer, and binary searches the job space for the first pending job;
//! - [`FootprintTracker`] commits an explicit per-layer counter after every job;
//! - [`JapariTracker`] follows every batch of values with a one-value footprint carrying the
//!   state bit, and binary searches the footprints.
//!
//! A deployment uses exactly one of them, recorded in the NVM header at provisioning time.

mod footprint;
mod japari;
mod state_bit;

pub use footprint::{FOOTPRINT_LEN, Footprint, FootprintTracker};
pub use japari::{BatchFootprint, JapariTracker};
pub use state_bit::{StateBitTracker, TURNING_POINTS_LEN, TaggedValue, TurningPoints};

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{
    Element, EngineError, Result, fatal, jobs::JobGeometry, model::SlotInfo, nvm::Nvm,
    storage::Storage,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum Strategy {
    #[display("state-bit")]
    StateBit = 0,
    #[display("footprint")]
    Footprint = 1,
    #[display("japari")]
    Japari = 2,
}

impl Strategy {
    /// Slot positions taken by an output of `values` values written in jobs of `batch`.
    pub fn stored_len(self, values: usize, batch: usize) -> usize {
        match self {
            Strategy::StateBit | Strategy::Footprint => values,
            // a short last job is padded so that footprints stay on a fixed grid
            Strategy::Japari => values.div_ceil(batch) * (batch + 1),
        }
    }

    /// Slot position of value `value` of an output.
    pub fn stored_position(self, value: usize, batch: usize) -> usize {
        match self {
            Strategy::StateBit | Strategy::Footprint => value,
            Strategy::Japari => value + value / batch,
        }
    }
}

impl TryFrom<u8> for Strategy {
    type Error = EngineError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Strategy::StateBit),
            1 => Ok(Strategy::Footprint),
            2 => Ok(Strategy::Japari),
            other => Err(fatal!("unknown progress strategy {other}")),
        }
    }
}

impl FromStr for Strategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "state-bit" => Ok(Strategy::StateBit),
            "footprint" => Ok(Strategy::Footprint),
            "japari" => Ok(Strategy::Japari),
            other => Err(EngineError::Description(format!(
                "unknown progress strategy {other:?}, expected state-bit, footprint or japari"
            ))),
        }
    }
}

/// The layer whose progress is being recovered.
#[derive(Clone, Copy, Debug)]
pub struct LayerProgress<'a> {
    pub node: usize,
    pub slot: u8,
    pub slot_info: &'a SlotInfo,
    pub geometry: &'a JobGeometry,
}

/// Outcome of a recovery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Recovery {
    pub first_unfinished: usize,
    /// Durable reads spent finding it.
    pub probes: u32,
}

pub trait ProgressTracker: Default {
    const STRATEGY: Strategy;

    /// Raw values the strategy can store, kernel outputs saturate to it.
    const RANGE: (Element, Element);

    /// Durable part of the fresh-run reset.
    fn reset<N: Nvm>(&mut self, storage: &mut Storage<N>) -> Result<()>;

    /// First job of the layer whose output is not durable yet. Never called after the layer's
    /// `finalize` was committed.
    fn recover<N: Nvm>(&mut self, storage: &Storage<N>, layer: &LayerProgress<'_>)
    -> Result<Recovery>;

    /// Checks the whole output of the layer against a recovered index.
    fn verify<N: Nvm>(
        &self,
        _storage: &Storage<N>,
        _layer: &LayerProgress<'_>,
        _recovery: &Recovery,
    ) -> Result<()> {
        Ok(())
    }

    /// Stored form of `raw` written at `offset` of a slot in state `slot`.
    fn encode(&self, slot: &SlotInfo, offset: usize, raw: Element) -> Element;

    /// Raw value of a stored one.
    fn decode(&self, stored: Element) -> Element;

    /// Value closing `job` and the slot position it goes to, written after the job's values.
    /// Only strategies keeping their progress next to the output have one.
    fn job_marker(
        &self,
        _slot: &SlotInfo,
        _geometry: &JobGeometry,
        _job: usize,
    ) -> Result<Option<(usize, Element)>> {
        Ok(None)
    }

    /// Called once a job is durable, with the number of values of the layer now written.
    fn record_progress<N: Nvm>(
        &mut self,
        storage: &mut Storage<N>,
        node: usize,
        values_done: usize,
    ) -> Result<()>;

    /// Called once every job of the layer is durable, before the layer transition is committed.
    fn finalize(&mut self, slot: &mut SlotInfo, boundary: usize, capacity: usize) -> Result<()>;
}

/// Binary search for the first job that is not done, assuming done jobs form a prefix.
pub fn first_unfinished(
    n_jobs: usize,
    mut is_done: impl FnMut(usize) -> Result<bool>,
) -> Result<usize> {
    let (mut low, mut high) = (0, n_jobs);
    while low < high {
        let mid = low + (high - low) / 2;
        if is_done(mid)? {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    Ok(low)
}

/// Exhaustive counterpart of [`first_unfinished`], probing every job in order.
pub fn first_unfinished_linear(
    n_jobs: usize,
    mut is_done: impl FnMut(usize) -> Result<bool>,
) -> Result<usize> {
    for job in 0..n_jobs {
        if !is_done(job)? {
            return Ok(job);
        }
    }
    Ok(n_jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    #[test]
    fn binary_and_linear_search_agree() {
        let mut rng = StdRng::seed_from_u64(0x1c44);
        for n in 0..70 {
            for done in 0..=n {
                let pattern = (0..n).map(|j| j < done).collect::<Vec<_>>();
                let probe = |j: usize| Ok(pattern[j]);
                assert_eq!(first_unfinished(n, probe).unwrap(), done);
                assert_eq!(first_unfinished_linear(n, probe).unwrap(), done);
            }
        }
        for _ in 0..1000 {
            let n = rng.gen_range(0..5000);
            let done = rng.gen_range(0..=n);
            let mut probes = 0;
            let found = first_unfinished(n, |j| {
                probes += 1;
                Ok(j < done)
            })
            .unwrap();
            assert_eq!(found, done);
            assert!(probes <= usize::BITS - n.leading_zeros() + 1);
        }
    }

    #[test]
    fn probe_errors_propagate() {
        let result = first_unfinished(10, |_| Err(fatal!("boom")));
        assert!(result.is_err());
    }

    #[test]
    fn strategy_names() {
        for strategy in [Strategy::StateBit, Strategy::Footprint, Strategy::Japari] {
            assert_eq!(strategy.to_string().parse::<Strategy>().unwrap(), strategy);
            assert_eq!(Strategy::try_from(strategy as u8).unwrap(), strategy);
        }
        assert!("bogus".parse::<Strategy>().is_err());
    }

    #[test]
    fn japari_outputs_leave_room_for_footprints() {
        // 10 values in jobs of 4: [v v v v f][v v v v f][v v _ _ f]
        assert_eq!(Strategy::Japari.stored_len(10, 4), 15);
        let positions = (0..10)
            .map(|v| Strategy::Japari.stored_position(v, 4))
            .collect::<Vec<_>>();
        assert_eq!(positions, [0, 1, 2, 3, 5, 6, 7, 8, 10, 11]);
        assert_eq!(Strategy::StateBit.stored_len(10, 4), 10);
        assert_eq!(Strategy::Footprint.stored_position(7, 4), 7);
    }
}
