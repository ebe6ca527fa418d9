//! One-shot initialization of a medium with a network.
//!
//! The header is what makes a medium bootable, so it is cleared first and written last: a
//! provisioning interrupted by a power failure leaves a medium that boots as unprovisioned.

use tracing::{debug, info};

use crate::{
    Result,
    layout::{Header, LayoutConfig, NvmLayout, RegionKind},
    model::{Graph, Model},
    nvm::Nvm,
    progress::{Footprint, Strategy},
    storage::Storage,
    store::Tally,
};

/// Header of `nvm` if it holds a provisioned network.
pub fn is_provisioned<N: Nvm>(nvm: &N) -> Result<Option<Header>> {
    Storage::read_header(nvm)
}

/// Bytes of NVM needed to provision `graph`.
pub fn required_len(graph: &Graph, config: LayoutConfig, strategy: Strategy) -> Result<usize> {
    Ok(NvmLayout::new(graph.header(strategy, config)?)?.total_len())
}

/// Writes `graph` to `nvm` and leaves an idle model ready to run the first sample.
pub fn provision<N: Nvm>(
    nvm: N,
    graph: &Graph,
    config: LayoutConfig,
    strategy: Strategy,
) -> Result<NvmLayout> {
    let header = graph.header(strategy, config)?;
    let layout = NvmLayout::new(header)?;
    let mut storage = Storage::new(nvm, layout.clone())?;

    storage.erase(RegionKind::Header)?;
    for region in layout.regions().iter().skip(1) {
        storage.erase(region.kind)?;
    }

    for (i, node) in graph.nodes().iter().enumerate() {
        storage.write_record(RegionKind::Nodes, i, &node.encode()?)?;
    }
    let infos = graph
        .constants()
        .iter()
        .map(|c| c.info)
        .chain(graph.planned_outputs().iter().copied());
    for (i, info) in infos.enumerate() {
        storage.write_record(RegionKind::ParamInfos, i, &info.encode())?;
    }
    for (kind, blob) in [
        (RegionKind::Parameters, graph.params_blob()),
        (RegionKind::Samples, graph.samples_blob()),
        (RegionKind::Labels, graph.labels().to_vec()),
    ] {
        storage.write(layout.region(kind).start, &blob)?;
    }

    // two-copy records read as uncommitted after the erase
    for node in 0..graph.nodes().len() {
        Footprint::record(&layout, node).commit(&mut storage, &Footprint::default())?;
    }
    Tally::record(&layout).commit(&mut storage, &Tally::default())?;
    let n_input = graph.input()?.info.index;
    Model::record(&layout).commit(
        &mut storage,
        &Model::new(header.nodes_len, n_input, config.num_slots),
    )?;
    debug!(bytes = storage.bytes_written(), "provisioned regions");

    storage.write(0, &header.encode())?;
    storage.flush()?;
    info!(
        %strategy,
        nodes = header.nodes_len,
        samples = header.n_samples,
        total = layout.total_len(),
        "provisioned NVM"
    );
    Ok(layout)
}
