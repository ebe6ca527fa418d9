//! The layer loop: boots from NVM, resumes the interrupted layer and runs the rest.
//!
//! Only three facts are trusted after a power failure: the committed [`Model`], the static
//! records written at provisioning time, and what the progress tracker can recover. Everything
//! else (slot assignment, output descriptions, tensors) is derived again from them.

use std::time::Instant;

use tracing::{debug, info, instrument};

use crate::{
    ELEMENT_BYTES, EngineError, Result,
    codec::{decode_elements, encode_elements},
    counters::{self, LayerCounters},
    fatal, invariant,
    jobs::{JobGeometry, TileLayout},
    layers::{Layer, Operand},
    layout::{LayoutConfig, NvmLayout, RegionKind},
    model::{Model, Node, ParameterInfo, RunState, SlotId},
    nvm::Nvm,
    progress::{LayerProgress, ProgressTracker, Recovery, Strategy},
    quantization::saturate,
    slots::acquire_slot,
    storage::Storage,
    store::{Tally, VersionedRecord},
    tensor::Tensor,
};

/// Durable state of a booted engine, independent of the progress strategy.
pub struct EngineContext<N> {
    storage: Storage<N>,
    nodes: Vec<Node>,
    model_record: VersionedRecord<Model>,
    model: Model,
    /// Set until the first layer handled since boot recovered its progress.
    after_boot: bool,
}

impl<N: Nvm> EngineContext<N> {
    fn boot(nvm: N, strategy: Strategy, expected: Option<&LayoutConfig>) -> Result<Self> {
        let header = Storage::read_header(&nvm)?
            .ok_or_else(|| EngineError::Unprovisioned("no header found".to_string()))?;
        invariant!(
            header.strategy == strategy,
            "NVM was provisioned for the {} strategy, the engine runs {strategy}",
            header.strategy
        );
        if let Some(expected) = expected {
            invariant!(
                header.config == *expected,
                "NVM was provisioned with {:?}, expected {expected:?}",
                header.config
            );
        }
        let storage = Storage::new(nvm, NvmLayout::new(header)?)?;
        let nodes = (0..header.nodes_len as usize)
            .map(|i| Node::decode(&storage.read_record(RegionKind::Nodes, i)?))
            .collect::<Result<Vec<_>>>()?;
        let model_record = Model::record(storage.layout());
        let model = model_record
            .load(&storage)?
            .ok_or_else(|| EngineError::Unprovisioned("no committed model".to_string()))?;
        invariant!(
            model.nodes_len == header.nodes_len,
            "model describes {} nodes, header {}",
            model.nodes_len,
            header.nodes_len
        );
        invariant!(
            model.slots.len() == header.config.num_slots as usize,
            "model tracks {} slots, header {}",
            model.slots.len(),
            header.config.num_slots
        );
        invariant!(
            model.state != RunState::Running || model.layer_idx < model.nodes_len,
            "running model points past the last layer: {}",
            model.layer_idx
        );
        invariant!(
            model.sample_idx < header.n_samples,
            "model selects sample {} of {}",
            model.sample_idx,
            header.n_samples
        );
        Ok(Self {
            storage,
            nodes,
            model_record,
            model,
            after_boot: true,
        })
    }

    pub fn storage(&self) -> &Storage<N> {
        &self.storage
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn into_inner(self) -> N {
        self.storage.into_inner()
    }

    fn commit_model(&mut self, model: Model) -> Result<()> {
        let version = self.model_record.commit(&mut self.storage, &model)?;
        debug!(
            version,
            state = %model.state,
            layer = model.layer_idx,
            "committed model"
        );
        self.model = model;
        Ok(())
    }

    pub fn param_info(&self, index: u16) -> Result<ParameterInfo> {
        let info = ParameterInfo::decode(
            &self
                .storage
                .read_record(RegionKind::ParamInfos, index as usize)?,
        )?;
        info.validate(index)?;
        Ok(info)
    }

    /// Rewrites the description of a layer output, skipping the write when unchanged.
    fn write_param_info(&mut self, info: &ParameterInfo) -> Result<()> {
        let bytes = info.encode();
        let index = info.index as usize;
        if self.storage.read_record(RegionKind::ParamInfos, index)? != bytes {
            self.storage
                .write_record(RegionKind::ParamInfos, index, &bytes)?;
        }
        Ok(())
    }

    /// Reads a whole tensor back in `[region][channel][row][col]` order.
    pub fn load_tensor<P: ProgressTracker>(&self, info: &ParameterInfo, tracker: &P) -> Result<Tensor> {
        let (offset, len) = (info.offset as usize, info.len as usize);
        let data = match info.slot {
            SlotId::Parameters => {
                decode_elements(&self.storage.read_blob(RegionKind::Parameters, offset, len)?)
            }
            SlotId::Samples => {
                let sample = self.model.sample_idx as usize * self.storage.header().sample_len as usize;
                decode_elements(&self.storage.read_blob(
                    RegionKind::Samples,
                    sample + offset,
                    len,
                )?)
            }
            SlotId::Intermediate(slot) => {
                let batch = self.storage.header().config.batch_size as usize;
                let n_values = len / ELEMENT_BYTES;
                let stored_len = P::STRATEGY.stored_len(n_values, batch) * ELEMENT_BYTES;
                let stored = decode_elements(&self.storage.read_slot(slot, offset, stored_len)?);
                let layout = TileLayout::new(info.dims(), info.tile_c as usize)?;
                let mut tensor = Tensor::zeros(info.dims())?;
                for i in 0..n_values {
                    let value = stored[P::STRATEGY.stored_position(i, batch)];
                    tensor.set(layout.offset_to_coords(i)?, tracker.decode(value))?;
                }
                return Ok(tensor);
            }
            SlotId::Unassigned => {
                return Err(fatal!(
                    "tensor {} is read before the layer producing it ran",
                    info.index
                ));
            }
        };
        Ok(Tensor::new(info.dims(), data)?)
    }
}

/// Intermittent inference engine over a medium `N`, tracking progress with `P`.
pub struct Engine<N, P> {
    ctx: EngineContext<N>,
    tracker: P,
}

impl<N: Nvm, P: ProgressTracker> Engine<N, P> {
    /// Loads the committed state of a provisioned medium. `expected` rejects media provisioned
    /// with another layout.
    pub fn boot(nvm: N, expected: Option<&LayoutConfig>) -> Result<Self> {
        let mut ctx = EngineContext::boot(nvm, P::STRATEGY, expected)?;
        info!(
            strategy = %P::STRATEGY,
            state = %ctx.model.state,
            layer = ctx.model.layer_idx,
            sample = ctx.model.sample_idx,
            runs = ctx.model.run_counter,
            "booted"
        );
        if ctx.model.running() {
            let layer = ctx.model.layer_idx as usize;
            counters::add(
                &mut ctx.storage,
                layer,
                &LayerCounters {
                    power_cycles: 1,
                    ..Default::default()
                },
            )?;
        }
        Ok(Self {
            ctx,
            tracker: P::default(),
        })
    }

    pub fn context(&self) -> &EngineContext<N> {
        &self.ctx
    }

    pub fn model(&self) -> &Model {
        &self.ctx.model
    }

    pub fn into_inner(self) -> N {
        self.ctx.into_inner()
    }

    /// Runs the current sample to completion. Returns immediately if it already finished.
    pub fn run(&mut self) -> Result<()> {
        loop {
            match self.ctx.model.state {
                RunState::Idle => self.start_run()?,
                RunState::Running => self.handle_node(self.ctx.model.layer_idx as usize)?,
                RunState::Finished => return Ok(()),
            }
        }
    }

    fn start_run(&mut self) -> Result<()> {
        info!(
            sample = self.ctx.model.sample_idx,
            run = self.ctx.model.run_counter,
            "starting inference"
        );
        self.tracker.reset(&mut self.ctx.storage)?;
        counters::reset(&mut self.ctx.storage)?;
        let mut model = self.ctx.model.clone();
        model.slots.iter_mut().for_each(|slot| slot.reset());
        model.layer_idx = 0;
        model.state = RunState::Running;
        self.ctx.commit_model(model)?;
        // nothing to recover in a fresh run
        self.ctx.after_boot = false;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn handle_node(&mut self, layer: usize) -> Result<()> {
        let started = Instant::now();
        let bytes_before = self.ctx.storage.bytes_written();
        let node = self
            .ctx
            .nodes
            .get(layer)
            .cloned()
            .ok_or_else(|| fatal!("layer {layer} does not exist"))?;
        let header = *self.ctx.storage.header();

        let inputs = node
            .inputs
            .iter()
            .map(|&index| self.ctx.param_info(index))
            .collect::<Result<Vec<_>>>()?;
        let kernel = Layer::from_node(&node);
        let shape = kernel.output_shape(&inputs)?;

        let producer = match inputs.first().map(|info| info.slot) {
            Some(SlotId::Intermediate(slot)) => Some(slot),
            _ => None,
        };
        let mut model = self.ctx.model.clone();
        let slot = acquire_slot(&mut model, &self.ctx.nodes, layer, producer)?;
        let mut output = ParameterInfo::planned(header.n_constants + layer as u16, &shape)?;
        output.slot = SlotId::Intermediate(slot);
        let batch = header.config.batch_size as usize;
        let stored_bytes = P::STRATEGY.stored_len(output.n_values(), batch) * ELEMENT_BYTES;
        invariant!(
            stored_bytes <= header.config.slot_size as usize,
            "output of {} needs {} bytes, slots hold {}",
            node.name,
            stored_bytes,
            header.config.slot_size
        );
        self.ctx.write_param_info(&output)?;

        let geometry = JobGeometry::new(
            TileLayout::new(output.dims(), output.tile_c as usize)?,
            batch,
        )?;
        let n_jobs = geometry.n_jobs();
        let mut recovery = Recovery::default();
        if self.ctx.after_boot {
            let progress = LayerProgress {
                node: layer,
                slot,
                slot_info: &model.slots[slot as usize],
                geometry: &geometry,
            };
            recovery = self.tracker.recover(&self.ctx.storage, &progress)?;
            if cfg!(debug_assertions) {
                self.tracker
                    .verify(&self.ctx.storage, &progress, &recovery)?;
            }
            info!(
                layer,
                name = %node.name,
                first_unfinished = recovery.first_unfinished,
                n_jobs,
                probes = recovery.probes,
                "resuming layer"
            );
            self.ctx.after_boot = false;
        }

        let operands = inputs
            .iter()
            .map(|info| {
                Ok(Operand {
                    info: *info,
                    tensor: self.ctx.load_tensor(info, &self.tracker)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            layer,
            name = %node.name,
            kernel = %kernel,
            slot,
            dims = ?output.dims,
            n_jobs,
            "running layer"
        );
        let slot_info = model.slots[slot as usize].clone();
        for job in recovery.first_unfinished..n_jobs {
            let range = geometry.job_range(job)?;
            let start = P::STRATEGY.stored_position(range.start, batch);
            let values = range
                .clone()
                .map(|offset| {
                    let at = geometry.layout().offset_to_coords(offset)?;
                    let raw = saturate(kernel.compute(&operands, at), P::RANGE);
                    let position = P::STRATEGY.stored_position(offset, batch);
                    Ok(self.tracker.encode(&slot_info, position, raw))
                })
                .collect::<Result<Vec<_>>>()?;
            self.ctx.storage.write_slot(
                slot,
                start * ELEMENT_BYTES,
                &encode_elements(&values),
            )?;
            if let Some((position, marker)) = self.tracker.job_marker(&slot_info, &geometry, job)? {
                self.ctx.storage.write_slot(
                    slot,
                    position * ELEMENT_BYTES,
                    &encode_elements(&[marker]),
                )?;
            }
            self.tracker
                .record_progress(&mut self.ctx.storage, layer, range.end)?;
        }

        self.tracker.finalize(
            &mut model.slots[slot as usize],
            P::STRATEGY.stored_len(geometry.flip_boundary(), batch),
            header.config.slot_capacity(),
        )?;
        model.layer_idx += 1;
        if model.layer_idx == model.nodes_len {
            model.state = RunState::Finished;
            model.run_counter = model.run_counter.wrapping_add(1);
            info!(
                sample = model.sample_idx,
                runs = model.run_counter,
                "inference finished"
            );
        }
        self.ctx.commit_model(model)?;

        let delta = LayerCounters {
            power_cycles: 0,
            jobs: (n_jobs - recovery.first_unfinished) as u32,
            probes: recovery.probes,
            bytes: u32::try_from(self.ctx.storage.bytes_written() - bytes_before).unwrap_or(u32::MAX),
            micros: u32::try_from(started.elapsed().as_micros()).unwrap_or(u32::MAX),
        };
        counters::add(&mut self.ctx.storage, layer, &delta)
    }

    /// Output of the last layer of a finished run.
    pub fn output(&self) -> Result<Tensor> {
        invariant!(
            self.ctx.model.state == RunState::Finished,
            "no finished run, model is {}",
            self.ctx.model.state
        );
        let last = self.ctx.storage.header().n_params() - 1;
        let info = self.ctx.param_info(last as u16)?;
        self.ctx.load_tensor(&info, &self.tracker)
    }

    pub fn output_info(&self) -> Result<ParameterInfo> {
        self.ctx.param_info(self.ctx.storage.header().n_params() as u16 - 1)
    }

    pub fn predicted_label(&self) -> Result<usize> {
        self.output()?
            .argmax()
            .ok_or_else(|| fatal!("empty network output"))
    }

    /// Label of `sample`, `None` when the medium carries no labels.
    pub fn expected_label(&self, sample: u16) -> Result<Option<u8>> {
        if self.ctx.storage.header().labels_len == 0 {
            return Ok(None);
        }
        let label = self
            .ctx
            .storage
            .read_blob(RegionKind::Labels, sample as usize, 1)?;
        Ok(Some(label[0]))
    }

    /// Selects the sample of the next run, making the model idle.
    pub fn prepare_sample(&mut self, sample: u16) -> Result<()> {
        let n_samples = self.ctx.storage.header().n_samples;
        invariant!(
            sample < n_samples,
            "sample {sample} out of range, {n_samples} provisioned"
        );
        let mut model = self.ctx.model.clone();
        model.state = RunState::Idle;
        model.sample_idx = sample;
        self.ctx.commit_model(model)
    }

    pub fn load_tally(&self) -> Result<Tally> {
        Tally::record(self.ctx.storage.layout()).load_committed(&self.ctx.storage)
    }

    pub fn commit_tally(&mut self, tally: &Tally) -> Result<()> {
        let record = Tally::record(self.ctx.storage.layout());
        record.commit(&mut self.ctx.storage, tally)?;
        Ok(())
    }

    pub fn counters(&self) -> Result<Vec<LayerCounters>> {
        counters::load_all(&self.ctx.storage)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        nvm::{MemNvm, PowerCut},
        model::{GraphBuilder, NodeFlags, OpType},
        progress::{FootprintTracker, JapariTracker, StateBitTracker},
        provision::{provision, required_len},
        testing::{
            random_chain, random_vector, reference_outputs, tiny_config, tiny_config_for, toy_graph,
        },
    };
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn provisioned<P: ProgressTracker>() -> MemNvm {
        let graph = toy_graph();
        let config = tiny_config_for(P::STRATEGY);
        let mut nvm = MemNvm::new(required_len(&graph, config, P::STRATEGY).unwrap());
        provision(&mut nvm, &graph, config, P::STRATEGY).unwrap();
        nvm
    }

    fn uninterrupted<P: ProgressTracker>() {
        let mut nvm = provisioned::<P>();
        let config = tiny_config_for(P::STRATEGY);
        let mut engine = Engine::<_, P>::boot(&mut nvm, Some(&config)).unwrap();
        engine.run().unwrap();
        let expected = reference_outputs(&toy_graph(), 0, P::RANGE).unwrap();
        assert_eq!(&engine.output().unwrap(), expected.last().unwrap());
        assert_eq!(engine.model().run_counter, 1);
        let counters = engine.counters().unwrap();
        assert_eq!(counters[0].jobs, 8);
        assert_eq!(counters[1].jobs, 2);
        assert!(counters.iter().all(|c| c.power_cycles == 0));
    }

    #[test]
    fn uninterrupted_run_matches_reference() {
        uninterrupted::<StateBitTracker>();
        uninterrupted::<FootprintTracker>();
        uninterrupted::<JapariTracker>();
    }

    #[test]
    fn unprovisioned_medium_is_reported() {
        let mut nvm = MemNvm::new(4096);
        let err = Engine::<_, StateBitTracker>::boot(&mut nvm, None)
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Unprovisioned(_)));
    }

    #[test]
    fn strategy_mismatch_is_fatal() {
        let mut nvm = provisioned::<FootprintTracker>();
        assert!(matches!(
            Engine::<_, StateBitTracker>::boot(&mut nvm, None),
            Err(EngineError::Invariant(_))
        ));
        let other = LayoutConfig {
            batch_size: 2,
            ..tiny_config()
        };
        assert!(Engine::<_, FootprintTracker>::boot(&mut nvm, Some(&other)).is_err());
    }

    #[rstest]
    #[case::state_bit(StateBitTracker)]
    #[case::footprint(FootprintTracker)]
    #[case::japari(JapariTracker)]
    fn resumes_after_every_layer_boundary<P: ProgressTracker>(#[case] _tracker: P) {
        let expected = reference_outputs(&toy_graph(), 1, P::RANGE).unwrap();
        let mut nvm = PowerCut::new(provisioned::<P>());
        let mut engine = Engine::<_, P>::boot(&mut nvm, None).unwrap();
        engine.prepare_sample(1).unwrap();
        drop(engine);
        // cut somewhere in each layer, then finish
        let mut reboots = 0;
        for budget in [40u64, 300, 700] {
            nvm.arm(Some(budget));
            let mut engine = Engine::<_, P>::boot(&mut nvm, None).unwrap();
            match engine.run() {
                Err(EngineError::PowerFailure(_)) => reboots += 1,
                other => other.unwrap(),
            }
        }
        nvm.disarm();
        let mut engine = Engine::<_, P>::boot(&mut nvm, None).unwrap();
        engine.run().unwrap();
        assert!(reboots > 0);
        assert_eq!(&engine.output().unwrap(), expected.last().unwrap());
        assert_eq!(engine.model().run_counter, 1);
        assert_eq!(engine.model().sample_idx, 1);
    }

    #[test]
    fn finished_runs_are_not_repeated() {
        let mut nvm = provisioned::<StateBitTracker>();
        let mut engine = Engine::<_, StateBitTracker>::boot(&mut nvm, None).unwrap();
        engine.run().unwrap();
        let label = engine.predicted_label().unwrap();
        drop(engine);
        let mut engine = Engine::<_, StateBitTracker>::boot(&mut nvm, None).unwrap();
        engine.run().unwrap();
        assert_eq!(engine.model().run_counter, 1);
        assert_eq!(engine.predicted_label().unwrap(), label);
        assert_eq!(engine.expected_label(1).unwrap(), Some(2));
    }

    #[test]
    fn tally_survives_reboots() {
        let mut nvm = provisioned::<FootprintTracker>();
        let mut engine = Engine::<_, FootprintTracker>::boot(&mut nvm, None).unwrap();
        engine
            .commit_tally(&Tally {
                samples_done: 1,
                correct: 1,
            })
            .unwrap();
        drop(engine);
        let engine = Engine::<_, FootprintTracker>::boot(&mut nvm, None).unwrap();
        assert_eq!(engine.load_tally().unwrap().samples_done, 1);
        assert!(engine.output().is_err());
    }

    #[rstest]
    #[case::state_bit(StateBitTracker)]
    #[case::footprint(FootprintTracker)]
    #[case::japari(JapariTracker)]
    fn random_chains_survive_random_cuts<P: ProgressTracker>(#[case] _tracker: P) {
        let mut rng = StdRng::seed_from_u64(11);
        let config = LayoutConfig {
            num_slots: 2,
            slot_size: 512,
            batch_size: 3,
        };
        for _ in 0..40 {
            let Ok(graph) = random_chain(&mut rng, config.slot_size) else {
                continue;
            };
            // footprints take room of their own
            let Ok(len) = required_len(&graph, config, P::STRATEGY) else {
                continue;
            };
            let expected = reference_outputs(&graph, 0, P::RANGE).unwrap();
            let mut nvm = PowerCut::new(MemNvm::new(len));
            provision(&mut nvm, &graph, config, P::STRATEGY).unwrap();
            let mut reboots = 0;
            loop {
                // enough for the fresh-run reset of both slots
                nvm.arm(Some(rng.gen_range(1600..3200)));
                let attempt = Engine::<_, P>::boot(&mut nvm, Some(&config)).and_then(|mut engine| {
                    engine.run()?;
                    engine.output()
                });
                match attempt {
                    Ok(output) => {
                        assert_eq!(&output, expected.last().unwrap());
                        break;
                    }
                    Err(EngineError::PowerFailure(_)) => {
                        reboots += 1;
                        assert!(reboots < 1000, "no progress on {:?}", graph.nodes());
                    }
                    Err(err) => panic!("{err}"),
                }
            }
        }
    }

    #[rstest]
    #[case::state_bit(StateBitTracker)]
    #[case::japari(JapariTracker)]
    fn turning_point_overflow_is_fatal<P: ProgressTracker>(#[case] _tracker: P) {
        // 18 shrinking pools alternate between two slots, nine distinct boundaries each
        let mut b = GraphBuilder::new();
        let mut current = b.input("input", [1, 1, 19, 19], 1.0).unwrap();
        for i in 0..18 {
            let flags = NodeFlags {
                kernel_size: 2,
                stride: 1,
                ..Default::default()
            };
            current = b
                .node(&format!("pool{i}"), OpType::MaxPool, &[current], flags)
                .unwrap();
        }
        let graph = b.build(vec![random_vector(19 * 19)], vec![]).unwrap();
        let config = LayoutConfig {
            num_slots: 2,
            slot_size: 1024,
            batch_size: 4,
        };
        let mut nvm = MemNvm::new(required_len(&graph, config, P::STRATEGY).unwrap());
        provision(&mut nvm, &graph, config, P::STRATEGY).unwrap();
        let mut engine = Engine::<_, P>::boot(&mut nvm, Some(&config)).unwrap();
        let err = engine.run().unwrap_err();
        assert!(
            matches!(&err, EngineError::Invariant(msg) if msg.contains("turning point list overflow")),
            "{err}"
        );
        assert_eq!(engine.model().layer_idx, 16);
    }
}
