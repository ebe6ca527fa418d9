use tracing::{debug, warn};

use super::Nvm;
use crate::{EngineError, Result};

/// Fault injecting wrapper: counts every durable byte and cuts the power once a budget is spent.
///
/// The cut happens in the middle of a `write` if needed, leaving exactly `budget` bytes written
/// since the last [`PowerCut::arm`]. Reads never fail.
pub struct PowerCut<N> {
    inner: N,
    budget: Option<u64>,
    written: u64,
    total_written: u64,
}

impl<N: Nvm> PowerCut<N> {
    pub fn new(inner: N) -> Self {
        Self {
            inner,
            budget: None,
            written: 0,
            total_written: 0,
        }
    }

    /// Schedules a power failure after `cut_after` more bytes, or none.
    pub fn arm(&mut self, cut_after: Option<u64>) {
        self.budget = cut_after;
        self.written = 0;
    }

    pub fn disarm(&mut self) {
        self.arm(None);
    }

    /// Bytes written since the last [`PowerCut::arm`].
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Bytes written over the whole lifetime of the wrapper.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn inner(&self) -> &N {
        &self.inner
    }

    pub fn into_inner(self) -> N {
        self.inner
    }
}

impl<N: Nvm> Nvm for PowerCut<N> {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.inner.read(offset, buf)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let allowed = match self.budget {
            Some(budget) => budget.saturating_sub(self.written).min(data.len() as u64) as usize,
            None => data.len(),
        };
        if allowed > 0 {
            self.inner.write(offset, &data[..allowed])?;
            self.written += allowed as u64;
            self.total_written += allowed as u64;
        }
        if allowed < data.len() {
            warn!(offset = offset + allowed, written = self.written, "simulated power failure");
            return Err(EngineError::PowerFailure(self.written));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        debug!(written = self.written, "flush");
        self.inner.flush()
    }
}
