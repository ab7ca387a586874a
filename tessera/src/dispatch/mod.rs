//! Splits an N-dimensional iteration space into tiles and groups the tiles
//! into SLICE tasks or lazily claimed SHARD reservations.

mod grid;
pub use grid::{Dispatch, DispatchGrid, SplitMode};

mod shard;
pub(crate) use shard::DispatchState;
pub use shard::{ShardPayload, SlicePayload, TileContext, TileFn, TileRange};

#[cfg(test)]
mod tests;
