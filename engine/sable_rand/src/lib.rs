//! Deterministic random streams for the Sable engine.
//!
//! Every entity carries its own [`RandomStream`] so that stochastic queries
//! (`sample`, `weighted-sample`, `select`) are reproducible from a seed and
//! independent across entities. The generator is PCG with the DXSM output
//! permutation; its whole state serialises to 17 bytes.

mod stream;
mod weighted;

pub use stream::{RandomStream, STATE_LEN};
pub use weighted::{weighted_sample_index, AliasTable};
