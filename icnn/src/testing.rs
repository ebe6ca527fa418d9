//! Small networks and helpers shared by unit tests, integration tests and benches.

use itertools::Itertools;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    ELEMENT_BYTES, Element, Result,
    layers::{Layer, Operand},
    layout::LayoutConfig,
    model::{
        Graph, GraphBuilder, NodeFlags, OpType, SlotId,
        loader::{ConstantDescription, InputDescription, ModelDescription, NodeDescription},
    },
    progress::Strategy,
    quantization::saturate,
    tensor::{Coords, Tensor},
};

pub fn random_vector(n: usize) -> Vec<Element> {
    random_vector_seed(n, None)
}

pub fn random_vector_seed(n: usize, seed: Option<u64>) -> Vec<Element> {
    let seed = seed.unwrap_or_else(rand::random::<u64>);
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(-0x2000..=0x2000)).collect_vec()
}

/// Two slots of 32 values, four values per job.
pub fn tiny_config() -> LayoutConfig {
    LayoutConfig {
        num_slots: 2,
        slot_size: 64,
        batch_size: 4,
    }
}

/// [`tiny_config`] with slots large enough for the outputs of `strategy`.
pub fn tiny_config_for(strategy: Strategy) -> LayoutConfig {
    let config = tiny_config();
    LayoutConfig {
        slot_size: strategy.stored_len(config.slot_capacity(), config.batch_size as usize) as u32
            * ELEMENT_BYTES as u32,
        ..config
    }
}

/// Conv 3x3 (1 -> 2 channels, 6x6 -> 4x4) with bias, MaxPool 2x2, then a dense layer to 3
/// classes. The conv output fills a whole slot of [`tiny_config`].
pub fn toy_graph() -> Graph {
    toy_graph_seed(7).expect("toy graph is well formed")
}

pub fn toy_graph_seed(seed: u64) -> Result<Graph> {
    let mut b = GraphBuilder::new();
    let x = b.input("input", [1, 1, 6, 6], 1.0)?;
    let w = b.constant("conv_w", [2, 1, 3, 3], random_vector_seed(18, Some(seed)), 1.0, false)?;
    let bias = b.constant("conv_b", [1, 2, 1, 1], random_vector_seed(2, Some(seed + 1)), 1.0, false)?;
    let fc = b.constant("fc_w", [8, 3, 1, 1], random_vector_seed(24, Some(seed + 2)), 1.0, false)?;
    let conv = b.node("conv", OpType::Conv, &[x, w, bias], NodeFlags::default())?;
    let pool = b.node(
        "pool",
        OpType::MaxPool,
        &[conv],
        NodeFlags {
            kernel_size: 2,
            ..Default::default()
        },
    )?;
    b.node("fc", OpType::Gemm, &[pool, fc], NodeFlags::default())?;
    let samples = (0..2)
        .map(|i| random_vector_seed(36, Some(seed + 10 + i)))
        .collect();
    b.build(samples, vec![0, 2])
}

/// Floating point counterpart of [`toy_graph`], with `n_samples` random samples and labels.
pub fn toy_description(seed: u64, n_samples: usize) -> ModelDescription {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut floats = |n: usize, low: f32, high: f32| (0..n).map(|_| rng.gen_range(low..high)).collect_vec();
    let constant = |name: &str, dims: [u16; 4], data: Vec<f32>| ConstantDescription {
        name: name.to_string(),
        dims,
        data,
        transposed: false,
    };
    let node = |name: &str, op: OpType, inputs: &[&str], flags: NodeFlags| NodeDescription {
        name: name.to_string(),
        op,
        inputs: inputs.iter().map(|i| i.to_string()).collect(),
        flags,
    };
    let constants = vec![
        constant("conv_w", [2, 1, 3, 3], floats(18, -1.0, 1.0)),
        constant("conv_b", [1, 2, 1, 1], floats(2, -0.5, 0.5)),
        constant("fc_w", [8, 3, 1, 1], floats(24, -1.0, 1.0)),
    ];
    let samples = (0..n_samples).map(|_| floats(36, 0.0, 1.0)).collect_vec();
    let nodes = vec![
        node("conv", OpType::Conv, &["input", "conv_w", "conv_b"], NodeFlags::default()),
        node("relu", OpType::Relu, &["conv"], NodeFlags::default()),
        node(
            "pool",
            OpType::MaxPool,
            &["relu"],
            NodeFlags {
                kernel_size: 2,
                ..Default::default()
            },
        ),
        node("fc", OpType::Gemm, &["pool", "fc_w"], NodeFlags::default()),
    ];
    let labels = (0..n_samples).map(|i| (i % 3) as u8).collect_vec();
    ModelDescription {
        input: InputDescription {
            name: "input".to_string(),
            dims: [1, 1, 6, 6],
        },
        constants,
        nodes,
        samples,
        labels,
    }
}

/// Plain in-memory forward pass of `graph` on `sample`, saturating every output to `range`.
/// Returns the output of every node.
pub fn reference_outputs(graph: &Graph, sample: usize, range: (Element, Element)) -> Result<Vec<Tensor>> {
    let n_constants = graph.n_constants();
    let mut outputs: Vec<Operand> = Vec::with_capacity(graph.nodes().len());
    for (node, planned) in graph.nodes().iter().zip(graph.planned_outputs()) {
        let operands = node
            .inputs
            .iter()
            .map(|&index| {
                let index = index as usize;
                if index >= n_constants {
                    return Ok(outputs[index - n_constants].clone());
                }
                let constant = &graph.constants()[index];
                let data = match constant.info.slot {
                    SlotId::Samples => graph.samples()[sample].clone(),
                    _ => constant.data.clone(),
                };
                Ok(Operand {
                    info: constant.info,
                    tensor: Tensor::new(constant.info.dims(), data)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let layer = Layer::from_node(node);
        let mut out = Tensor::zeros(planned.dims())?;
        let [regions, channels, rows, cols] = planned.dims();
        for coords in (0..regions)
            .cartesian_product(0..channels)
            .cartesian_product(0..rows)
            .cartesian_product(0..cols)
            .map(|(((r, c), h), w)| Coords::new(r, c, h, w))
        {
            out.set(coords, saturate(layer.compute(&operands, coords), range))?;
        }
        outputs.push(Operand {
            info: *planned,
            tensor: out,
        });
    }
    Ok(outputs.into_iter().map(|o| o.tensor).collect())
}

/// A random chain of conv, relu and pooling layers, with tiles, small enough for [`tiny_config`]
/// slots of `slot_size` bytes.
pub fn random_chain(rng: &mut impl Rng, slot_size: u32) -> Result<Graph> {
    let mut b = GraphBuilder::new();
    let channels = rng.gen_range(1..=3u16);
    let side = rng.gen_range(4..=7u16);
    let mut current = b.input("input", [1, channels, side, side], 1.0)?;
    let (mut c, mut h) = (channels as usize, side as usize);
    let depth = rng.gen_range(1..=4);
    for i in 0..depth {
        let op = [OpType::Conv, OpType::Relu, OpType::MaxPool][rng.gen_range(0..3)];
        match op {
            OpType::Conv if h >= 2 => {
                let cout = rng.gen_range(1..=3u16);
                let w = b.constant(
                    &format!("w{i}"),
                    [cout, c as u16, 2, 2],
                    random_vector_seed(cout as usize * c * 4, Some(rng.gen())),
                    1.0,
                    false,
                )?;
                let flags = NodeFlags {
                    input_tile_c: rng.gen_range(0..=c as u16),
                    output_tile_c: rng.gen_range(0..=cout),
                    ..Default::default()
                };
                let conv = b.node(&format!("conv{i}"), OpType::Conv, &[current, w], flags)?;
                // split input channels leave partial sums to merge
                current = if (1..c).contains(&(flags.input_tile_c as usize)) {
                    b.node(&format!("merge{i}"), OpType::ConvMerge, &[conv], NodeFlags::default())?
                } else {
                    conv
                };
                c = cout as usize;
                h -= 1;
            }
            OpType::MaxPool if h >= 2 => {
                current = b.node(
                    &format!("pool{i}"),
                    OpType::MaxPool,
                    &[current],
                    NodeFlags {
                        kernel_size: 2,
                        stride: 1,
                        ..Default::default()
                    },
                )?;
                h -= 1;
            }
            _ => {
                current = b.node(&format!("relu{i}"), OpType::Relu, &[current], NodeFlags::default())?;
            }
        }
    }
    let values = channels as usize * side as usize * side as usize;
    let graph = b.build(vec![random_vector_seed(values, Some(rng.gen()))], vec![])?;
    let fits = graph
        .planned_outputs()
        .iter()
        .all(|info| info.len <= slot_size);
    if fits {
        Ok(graph)
    } else {
        Err(crate::EngineError::Description("random chain does not fit the slots".into()))
    }
}
