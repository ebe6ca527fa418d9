use tracing::debug;

use super::{MAX_INPUTS, Node, NodeFlags, OpType, ParameterInfo, SlotId};
use crate::{
    ELEMENT_BITS, ELEMENT_BYTES, Element, EngineError, Result,
    codec::encode_elements,
    layers::Layer,
    layout::{Header, LayoutConfig},
    progress::Strategy,
};

/// Reference to a tensor while building a [`Graph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamRef {
    Constant(usize),
    Node(usize),
}

/// A weight, bias or the network input (whose data come from the samples).
#[derive(Clone, Debug)]
pub struct Constant {
    pub name: String,
    pub info: ParameterInfo,
    pub data: Vec<Element>,
}

/// A validated network: constants, topologically ordered nodes, samples and labels.
///
/// Parameter index `i < n_constants` is constant `i`; index `n_constants + j` is the output of
/// node `j`.
#[derive(Clone, Debug)]
pub struct Graph {
    constants: Vec<Constant>,
    nodes: Vec<Node>,
    planned: Vec<ParameterInfo>,
    samples: Vec<Vec<Element>>,
    labels: Vec<u8>,
}

fn description(msg: impl Into<String>) -> EngineError {
    EngineError::Description(msg.into())
}

impl Graph {
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Output tensors of every node as derived by the layer allocators, before slot assignment.
    pub fn planned_outputs(&self) -> &[ParameterInfo] {
        &self.planned
    }

    pub fn samples(&self) -> &[Vec<Element>] {
        &self.samples
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    pub fn n_constants(&self) -> usize {
        self.constants.len()
    }

    pub fn input(&self) -> Result<&Constant> {
        self.constants
            .iter()
            .find(|c| c.info.slot == SlotId::Samples)
            .ok_or_else(|| description("graph has no input"))
    }

    pub fn output(&self) -> Option<&ParameterInfo> {
        self.planned.last()
    }

    /// Weights and biases, concatenated in constant order.
    pub fn params_blob(&self) -> Vec<u8> {
        self.constants
            .iter()
            .flat_map(|c| encode_elements(&c.data))
            .collect()
    }

    pub fn samples_blob(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| encode_elements(s)).collect()
    }

    /// Header of an NVM provisioned with this graph; fails if a layer output exceeds a slot.
    pub fn header(&self, strategy: Strategy, config: LayoutConfig) -> Result<Header> {
        config.validate()?;
        for (node, out) in self.nodes.iter().zip(&self.planned) {
            let stored =
                strategy.stored_len(out.n_values(), config.batch_size as usize) * ELEMENT_BYTES;
            if stored > config.slot_size as usize {
                return Err(description(format!(
                    "output of {} needs {} bytes but slots hold {}",
                    node.name, stored, config.slot_size
                )));
            }
        }
        let sample_len = self.input()?.info.len;
        let too_large = |what: &str| description(format!("too many {what}"));
        Ok(Header {
            strategy,
            config,
            nodes_len: u16::try_from(self.nodes.len()).map_err(|_| too_large("nodes"))?,
            n_constants: u16::try_from(self.constants.len())
                .map_err(|_| too_large("constants"))?,
            params_len: u32::try_from(self.params_blob().len())
                .map_err(|_| too_large("parameters"))?,
            sample_len,
            n_samples: u16::try_from(self.samples.len()).map_err(|_| too_large("samples"))?,
            labels_len: u16::try_from(self.labels.len()).map_err(|_| too_large("labels"))?,
        })
    }
}

/// Incremental construction of a [`Graph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    constants: Vec<Constant>,
    nodes: Vec<(String, OpType, Vec<ParamRef>, NodeFlags)>,
    params_len: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_constant(&mut self, name: &str, info: ParameterInfo, data: Vec<Element>) -> Result<ParamRef> {
        if self.constants.iter().any(|c| c.name == name) {
            return Err(description(format!("duplicate constant {name}")));
        }
        self.constants.push(Constant {
            name: name.to_string(),
            info,
            data,
        });
        Ok(ParamRef::Constant(self.constants.len() - 1))
    }

    fn info(&self, dims: [u16; 4], scale: f32, slot: SlotId, offset: usize) -> Result<ParameterInfo> {
        if dims.contains(&0) {
            return Err(description(format!("degenerate shape {dims:?}")));
        }
        let values: usize = dims.iter().map(|&d| d as usize).product();
        Ok(ParameterInfo {
            index: self.constants.len() as u16,
            slot,
            offset: u32::try_from(offset).map_err(|_| description("parameter blob too large"))?,
            len: u32::try_from(values * ELEMENT_BYTES)
                .map_err(|_| description("tensor too large"))?,
            bitwidth: ELEMENT_BITS,
            dims,
            tile_c: 0,
            transposed: false,
            scale,
        })
    }

    /// Declares the network input, read from the current sample.
    pub fn input(&mut self, name: &str, dims: [u16; 4], scale: f32) -> Result<ParamRef> {
        if self.constants.iter().any(|c| c.info.slot == SlotId::Samples) {
            return Err(description("only one network input is supported"));
        }
        let info = self.info(dims, scale, SlotId::Samples, 0)?;
        self.push_constant(name, info, Vec::new())
    }

    pub fn constant(
        &mut self,
        name: &str,
        dims: [u16; 4],
        data: Vec<Element>,
        scale: f32,
        transposed: bool,
    ) -> Result<ParamRef> {
        let mut info = self.info(dims, scale, SlotId::Parameters, self.params_len)?;
        info.transposed = transposed;
        if info.n_values() != data.len() {
            return Err(description(format!(
                "constant {name} of shape {dims:?} has {} values",
                data.len()
            )));
        }
        self.params_len += info.len as usize;
        self.push_constant(name, info, data)
    }

    pub fn node(
        &mut self,
        name: &str,
        op: OpType,
        inputs: &[ParamRef],
        flags: NodeFlags,
    ) -> Result<ParamRef> {
        let index = self.nodes.len();
        for input in inputs {
            match *input {
                ParamRef::Node(j) if j >= index => {
                    return Err(description(format!(
                        "node {name} reads node {j}, which does not run before it"
                    )));
                }
                ParamRef::Constant(i) if i >= self.constants.len() => {
                    return Err(description(format!("node {name} reads unknown constant {i}")));
                }
                _ => {}
            }
        }
        if self.nodes.iter().any(|(n, ..)| n == name) {
            return Err(description(format!("duplicate node {name}")));
        }
        self.nodes.push((name.to_string(), op, inputs.to_vec(), flags));
        Ok(ParamRef::Node(index))
    }

    pub fn build(self, samples: Vec<Vec<Element>>, labels: Vec<u8>) -> Result<Graph> {
        let n_constants = self.constants.len();
        let input = self
            .constants
            .iter()
            .find(|c| c.info.slot == SlotId::Samples)
            .ok_or_else(|| description("graph has no input"))?;
        if self.nodes.is_empty() {
            return Err(description("graph has no nodes"));
        }
        if samples.is_empty() {
            return Err(description("at least one sample is required"));
        }
        if let Some(bad) = samples.iter().position(|s| s.len() != input.info.n_values()) {
            return Err(description(format!(
                "sample {bad} has {} values, input {} takes {}",
                samples[bad].len(),
                input.name,
                input.info.n_values()
            )));
        }
        if !labels.is_empty() && labels.len() != samples.len() {
            return Err(description(format!(
                "{} labels for {} samples",
                labels.len(),
                samples.len()
            )));
        }

        let index_of = |r: ParamRef| -> Result<u16> {
            let index = match r {
                ParamRef::Constant(i) => i,
                ParamRef::Node(j) => n_constants + j,
            };
            u16::try_from(index).map_err(|_| description("too many tensors"))
        };
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (i, (name, op, inputs, flags)) in self.nodes.iter().enumerate() {
            if inputs.is_empty() || inputs.len() > MAX_INPUTS {
                return Err(description(format!("node {name} has {} inputs", inputs.len())));
            }
            if let ParamRef::Constant(c) = inputs[0] {
                if self.constants[c].info.slot != SlotId::Samples {
                    return Err(description(format!(
                        "node {name} takes constant {} as its data input",
                        self.constants[c].name
                    )));
                }
            }
            let max_output_id = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, (_, _, consumer_inputs, _))| consumer_inputs.contains(&ParamRef::Node(i)))
                .map(|(j, _)| j)
                .max()
                .unwrap_or(i);
            nodes.push(Node {
                name: name.clone(),
                op: *op,
                inputs: inputs.iter().map(|&r| index_of(r)).collect::<Result<_>>()?,
                flags: *flags,
                max_output_id: max_output_id as u16,
            });
            // node names are persisted in fixed size records
            nodes[i].encode()?;
        }

        // shape inference, exactly what the engine's allocators will do at run time
        let mut planned: Vec<ParameterInfo> = Vec::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            let inputs = node
                .inputs
                .iter()
                .map(|&index| {
                    let index = index as usize;
                    if index < n_constants {
                        self.constants[index].info
                    } else {
                        planned[index - n_constants]
                    }
                })
                .collect::<Vec<_>>();
            let shape = Layer::from_node(node).output_shape(&inputs).map_err(|e| {
                description(format!("node {} ({}): {e}", node.name, node.op))
            })?;
            planned.push(ParameterInfo::planned(index_of(ParamRef::Node(i))?, &shape)?);
        }
        debug!(
            constants = n_constants,
            nodes = nodes.len(),
            samples = samples.len(),
            "built graph"
        );
        Ok(Graph {
            constants: self.constants,
            nodes,
            planned,
            samples,
            labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> (GraphBuilder, ParamRef, ParamRef) {
        let mut b = GraphBuilder::new();
        let x = b.input("x", [1, 1, 4, 4], 1.0).unwrap();
        let w = b
            .constant("w", [2, 1, 3, 3], vec![1; 18], 1.0, false)
            .unwrap();
        (b, x, w)
    }

    #[test]
    fn max_output_id_is_last_consumer() {
        let (mut b, x, w) = builder();
        let conv = b.node("conv", OpType::Conv, &[x, w], NodeFlags::default()).unwrap();
        let relu = b.node("relu", OpType::Relu, &[conv], NodeFlags::default()).unwrap();
        b.node("relu2", OpType::Relu, &[relu], NodeFlags::default()).unwrap();
        b.node("merge", OpType::ConvMerge, &[conv], NodeFlags::default()).unwrap();
        let graph = b.build(vec![vec![0; 16]], vec![0]).unwrap();
        let ids = graph.nodes().iter().map(|n| n.max_output_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 2, 2, 3]);
        assert_eq!(graph.nodes()[1].inputs, vec![2]);
        assert_eq!(graph.planned_outputs()[0].dims, [1, 2, 2, 2]);
        assert_eq!(graph.planned_outputs()[0].index, 2);
        assert_eq!(graph.params_blob().len(), 36);
    }

    #[test]
    fn forward_references_are_rejected() {
        let (mut b, x, _) = builder();
        assert!(b.node("bad", OpType::Relu, &[ParamRef::Node(0)], NodeFlags::default()).is_err());
        assert!(b.node("ok", OpType::Relu, &[x], NodeFlags::default()).is_ok());
    }

    #[test]
    fn shape_errors_surface_at_build() {
        let (mut b, x, _) = builder();
        let w = b.constant("w5", [2, 1, 5, 5], vec![0; 50], 1.0, false).unwrap();
        b.node("conv", OpType::Conv, &[x, w], NodeFlags::default()).unwrap();
        assert!(matches!(
            b.build(vec![vec![0; 16]], vec![]),
            Err(EngineError::Description(_))
        ));
    }

    #[test]
    fn samples_must_match_input() {
        let (mut b, x, _) = builder();
        b.node("relu", OpType::Relu, &[x], NodeFlags::default()).unwrap();
        assert!(b.build(vec![vec![0; 15]], vec![]).is_err());
    }

    #[test]
    fn oversized_outputs_do_not_fit_slots() {
        let (mut b, x, _) = builder();
        b.node("relu", OpType::Relu, &[x], NodeFlags::default()).unwrap();
        let graph = b.build(vec![vec![0; 16]], vec![]).unwrap();
        let config = LayoutConfig {
            num_slots: 2,
            slot_size: 16,
            batch_size: 1,
        };
        assert!(graph.header(Strategy::StateBit, config).is_err());
        let config = LayoutConfig {
            slot_size: 32,
            ..config
        };
        let header = graph.header(Strategy::StateBit, config).unwrap();
        // a footprint after every value doubles the output
        assert!(graph.header(Strategy::Japari, config).is_err());
        assert_eq!(header.sample_len, 32);
        assert_eq!(header.n_constants, 2);
    }
}
