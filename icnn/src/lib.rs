//! Intermittent execution engine for tiled neural network inference.
//!
//! The engine runs a quantized network layer by layer out of non-volatile memory (NVM) and
//! survives a power failure at any byte boundary: after a reboot it finds the first unfinished
//! job of the interrupted layer and resumes from there without redoing completed work.

pub mod codec;
pub mod counters;
pub mod error;
pub mod jobs;
pub mod layers;
pub mod layout;
pub mod model;
pub mod nvm;
pub mod progress;
pub mod provision;
pub mod quantization;
pub mod scheduler;
pub mod slots;
pub mod storage;
pub mod store;
pub mod tensor;
pub mod testing;

pub use error::{EngineError, Result};
pub use layout::{LayoutConfig, NvmLayout};
pub use model::{Graph, GraphBuilder, Model, RunState};
pub use nvm::{FileNvm, MemNvm, Nvm, PowerCut};
pub use progress::{FootprintTracker, JapariTracker, ProgressTracker, StateBitTracker, Strategy};
pub use provision::provision;
pub use scheduler::{Engine, EngineContext};
pub use tensor::Tensor;

/// Q15 fixed point value, the only numeric type stored in NVM.
pub type Element = i16;

/// Width in bits of every stored value.
pub const ELEMENT_BITS: u8 = 16;

/// Size in bytes of a stored value.
pub const ELEMENT_BYTES: usize = std::mem::size_of::<Element>();
