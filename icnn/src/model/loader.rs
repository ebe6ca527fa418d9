//! JSON description of a floating point network, quantized into a [`Graph`].
//!
//! ```json
//! {
//!   "input": { "name": "x", "dims": [1, 1, 6, 6] },
//!   "constants": [{ "name": "w", "dims": [2, 1, 3, 3], "data": [0.1, ...] }],
//!   "nodes": [{ "name": "conv", "op": "Conv", "inputs": ["x", "w"], "flags": { "stride": 1 } }],
//!   "samples": [[0.0, ...]],
//!   "labels": [3]
//! }
//! ```
//!
//! Every tensor gets a power of two [`ScalingFactor`] from its absolute maximum, except biases:
//! they are added to products and share the scale of the product instead.

use std::{collections::HashMap, fs::File, io::BufReader, path::Path};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Graph, GraphBuilder, NodeFlags, OpType, ParamRef};
use crate::{EngineError, Result, quantization::ScalingFactor};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputDescription {
    pub name: String,
    pub dims: [u16; 4],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstantDescription {
    pub name: String,
    pub dims: [u16; 4],
    pub data: Vec<f32>,
    /// Dense weights stored `[N, K]` rather than `[K, N]`.
    #[serde(default)]
    pub transposed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub name: String,
    pub op: OpType,
    pub inputs: Vec<String>,
    #[serde(default)]
    pub flags: NodeFlags,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub input: InputDescription,
    #[serde(default)]
    pub constants: Vec<ConstantDescription>,
    pub nodes: Vec<NodeDescription>,
    pub samples: Vec<Vec<f32>>,
    #[serde(default)]
    pub labels: Vec<u8>,
}

fn description(msg: impl Into<String>) -> EngineError {
    EngineError::Description(msg.into())
}

impl ModelDescription {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Scale of every tensor name: data tensors from their values, biases from the product they
    /// are added to.
    fn scales(&self) -> Result<HashMap<&str, ScalingFactor>> {
        let mut biases: HashMap<&str, ScalingFactor> = HashMap::new();
        let mut scales: HashMap<&str, ScalingFactor> = HashMap::new();
        scales.insert(
            &self.input.name,
            ScalingFactor::from_values(self.samples.iter().flatten()),
        );
        let bias_names = self
            .nodes
            .iter()
            .filter(|n| matches!(n.op, OpType::Conv | OpType::Gemm))
            .filter_map(|n| n.inputs.get(2).map(String::as_str))
            .collect::<Vec<_>>();
        for constant in &self.constants {
            if !bias_names.contains(&constant.name.as_str()) {
                scales.insert(&constant.name, ScalingFactor::from_values(&constant.data));
            }
        }
        for node in &self.nodes {
            let scale_of = |name: &str| {
                scales
                    .get(name)
                    .copied()
                    .ok_or_else(|| description(format!("node {} reads unknown tensor {name}", node.name)))
            };
            let first = node
                .inputs
                .first()
                .ok_or_else(|| description(format!("node {} has no inputs", node.name)))?;
            let input = scale_of(first)?;
            let output = match node.op {
                OpType::Conv | OpType::Gemm => {
                    let weights = node.inputs.get(1).ok_or_else(|| {
                        description(format!("node {} has no weights", node.name))
                    })?;
                    let product = input.product(&scale_of(weights)?);
                    if let Some(bias) = node.inputs.get(2) {
                        match biases.get(bias.as_str()) {
                            Some(existing) if *existing != product => {
                                return Err(description(format!(
                                    "bias {bias} is shared by products of different scales"
                                )));
                            }
                            _ => {
                                biases.insert(bias, product);
                            }
                        }
                    }
                    product
                }
                OpType::ConvMerge | OpType::MaxPool | OpType::Relu => input,
            };
            scales.insert(&node.name, output);
        }
        scales.extend(biases);
        Ok(scales)
    }

    /// Quantizes the description and validates the resulting graph.
    pub fn build(&self) -> Result<Graph> {
        let scales = self.scales()?;
        let scale_of = |name: &str| {
            scales
                .get(name)
                .copied()
                .ok_or_else(|| description(format!("tensor {name} is never read")))
        };
        let mut builder = GraphBuilder::new();
        let mut refs: HashMap<&str, ParamRef> = HashMap::new();

        let input_scale = scale_of(&self.input.name)?;
        refs.insert(
            &self.input.name,
            builder.input(&self.input.name, self.input.dims, input_scale.scale())?,
        );
        for constant in &self.constants {
            let Ok(scale) = scale_of(&constant.name) else {
                warn!(name = %constant.name, "skipping unused constant");
                continue;
            };
            let data = constant.data.iter().map(|v| scale.quantize(v)).collect();
            let r = builder.constant(
                &constant.name,
                constant.dims,
                data,
                scale.scale(),
                constant.transposed,
            )?;
            if refs.insert(&constant.name, r).is_some() {
                return Err(description(format!("tensor name {} is reused", constant.name)));
            }
        }
        for node in &self.nodes {
            let inputs = node
                .inputs
                .iter()
                .map(|name| {
                    refs.get(name.as_str()).copied().ok_or_else(|| {
                        description(format!("node {} reads unknown tensor {name}", node.name))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let r = builder.node(&node.name, node.op, &inputs, node.flags)?;
            if refs.insert(&node.name, r).is_some() {
                return Err(description(format!("tensor name {} is reused", node.name)));
            }
        }
        let samples = self
            .samples
            .iter()
            .map(|sample| sample.iter().map(|v| input_scale.quantize(v)).collect())
            .collect();
        debug!(
            input_scale = input_scale.scale(),
            nodes = self.nodes.len(),
            "quantized model description"
        );
        builder.build(samples, self.labels.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SlotId;

    fn description() -> ModelDescription {
        ModelDescription {
            input: InputDescription {
                name: "x".into(),
                dims: [1, 2, 1, 1],
            },
            constants: vec![
                ConstantDescription {
                    name: "w".into(),
                    dims: [2, 2, 1, 1],
                    data: vec![0.5, -0.25, 0.0, 1.5],
                    transposed: false,
                },
                ConstantDescription {
                    name: "b".into(),
                    dims: [1, 2, 1, 1],
                    data: vec![0.1, -0.1],
                    transposed: false,
                },
            ],
            nodes: vec![
                NodeDescription {
                    name: "fc".into(),
                    op: OpType::Gemm,
                    inputs: vec!["x".into(), "w".into(), "b".into()],
                    flags: NodeFlags::default(),
                },
                NodeDescription {
                    name: "relu".into(),
                    op: OpType::Relu,
                    inputs: vec!["fc".into()],
                    flags: NodeFlags::default(),
                },
            ],
            samples: vec![vec![3.0, -1.0], vec![0.5, 0.5]],
            labels: vec![1, 0],
        }
    }

    #[test]
    fn biases_take_the_product_scale() {
        let graph = description().build().unwrap();
        let constants = graph.constants();
        assert_eq!(constants[0].info.slot, SlotId::Samples);
        assert_eq!(constants[0].info.scale, 4.0);
        assert_eq!(constants[1].info.scale, 2.0);
        assert_eq!(constants[2].info.scale, 8.0);
        assert_eq!(graph.planned_outputs()[0].scale, 8.0);
        // 0.1 / 8 in Q15
        assert_eq!(constants[2].data[0], 410);
        assert_eq!(graph.samples()[0], vec![24576, -8192]);
    }

    #[test]
    fn json_round_trips_through_the_builder() {
        let json = description().to_json().unwrap();
        let parsed = ModelDescription::from_json(&json).unwrap();
        assert_eq!(parsed, description());
        assert_eq!(parsed.build().unwrap().nodes().len(), 2);
    }

    #[test]
    fn unknown_inputs_are_rejected() {
        let mut desc = description();
        desc.nodes[1].inputs[0] = "nope".into();
        assert!(matches!(desc.build(), Err(EngineError::Description(_))));
    }

    #[test]
    fn flags_default_when_missing() {
        let json = r#"{
            "input": { "name": "x", "dims": [1, 1, 2, 2] },
            "nodes": [{ "name": "pool", "op": "MaxPool", "inputs": ["x"] }],
            "samples": [[1.0, 2.0, 3.0, 4.0]]
        }"#;
        let graph = ModelDescription::from_json(json).unwrap().build().unwrap();
        assert_eq!(graph.planned_outputs()[0].dims, [1, 1, 1, 1]);
        assert!(graph.labels().is_empty());
    }
}
