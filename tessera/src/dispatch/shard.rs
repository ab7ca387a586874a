use anyhow::Context;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-tile work function shared by every task of a dispatch.
pub type TileFn = Arc<dyn Fn(&TileContext) -> anyhow::Result<()> + Send + Sync + 'static>;

/// What a tile function sees about the tile it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileContext {
    pub(crate) tile_id: [u32; 3],
    pub(crate) tile_count: [u32; 3],
    pub(crate) tile_size: [u32; 3],
    pub(crate) element_origin: [u32; 3],
    pub(crate) worker_id: usize,
}

impl TileContext {
    /// Tile coordinates within the grid.
    pub fn tile_id(&self) -> [u32; 3] {
        self.tile_id
    }

    /// Tiles per dimension of the whole grid.
    pub fn tile_count(&self) -> [u32; 3] {
        self.tile_count
    }

    /// Shape of this tile, clipped at the grid edge. Never reaches past the
    /// extents.
    pub fn tile_size(&self) -> [u32; 3] {
        self.tile_size
    }

    /// First element of this tile.
    pub fn element_origin(&self) -> [u32; 3] {
        self.element_origin
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }
}

/// Number of cells in a `counts[0] x counts[1] x counts[2]` box, or `None`
/// when it does not fit a `u64`.
pub(crate) fn volume(counts: [u32; 3]) -> Option<u64> {
    counts
        .iter()
        .try_fold(1u64, |acc, &n| acc.checked_mul(n as u64))
}

/// Box of tiles, `tile_count` tiles per dimension starting at `tile_origin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub tile_origin: [u32; 3],
    pub tile_count: [u32; 3],
}

impl TileRange {
    /// Saturates at `u64::MAX`.
    pub fn len(&self) -> u64 {
        volume(self.tile_count).unwrap_or(u64::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tile coordinates in the range, x fastest.
    pub fn iter(&self) -> impl Iterator<Item = [u32; 3]> + '_ {
        let [ox, oy, oz] = self.tile_origin;
        let [nx, ny, nz] = self.tile_count;

        (oz..oz + nz).flat_map(move |z| {
            (oy..oy + ny).flat_map(move |y| (ox..ox + nx).map(move |x| [x, y, z]))
        })
    }
}

/// Geometry and claim cursor shared by the tasks of one dispatch.
pub(crate) struct DispatchState {
    extents: [u32; 3],
    tile_shape: [u32; 3],
    tile_counts: [u32; 3],
    tile_fn: TileFn,

    /// Next unclaimed linear tile index. May run past `total`.
    cursor: AtomicU64,
    total: u64,
    reservation: u64,
}

impl DispatchState {
    pub(crate) fn new(
        extents: [u32; 3],
        tile_shape: [u32; 3],
        tile_counts: [u32; 3],
        reservation: u32,
        tile_fn: TileFn,
    ) -> Self {
        Self {
            extents,
            tile_shape,
            tile_counts,
            tile_fn,
            cursor: AtomicU64::new(0),
            // Grids are validated by `split`, saturation only guards direct use.
            total: volume(tile_counts).unwrap_or(u64::MAX),
            reservation: reservation.max(1) as u64,
        }
    }

    /// Claims the next reservation of linear tile indices.
    pub(crate) fn claim(&self) -> Option<Range<u64>> {
        let start = self.cursor.fetch_add(self.reservation, Ordering::AcqRel);
        (start < self.total).then(|| start..(start + self.reservation).min(self.total))
    }

    pub(crate) fn has_unclaimed(&self) -> bool {
        self.cursor.load(Ordering::Acquire) < self.total
    }

    pub(crate) fn run_range(&self, range: &TileRange, worker_id: usize) -> anyhow::Result<()> {
        range
            .iter()
            .try_for_each(|tile| self.run_tile(tile, worker_id))
    }

    pub(crate) fn run_linear(&self, range: Range<u64>, worker_id: usize) -> anyhow::Result<()> {
        range
            .map(|i| self.tile_at(i))
            .try_for_each(|tile| self.run_tile(tile, worker_id))
    }

    fn tile_at(&self, linear: u64) -> [u32; 3] {
        let [nx, ny, _] = self.tile_counts.map(|n| n as u64);
        let x = linear % nx;
        let y = (linear / nx) % ny;
        let z = linear / (nx * ny);
        [x as u32, y as u32, z as u32]
    }

    fn run_tile(&self, tile: [u32; 3], worker_id: usize) -> anyhow::Result<()> {
        let mut element_origin = [0; 3];
        let mut tile_size = [0; 3];

        for d in 0..3 {
            element_origin[d] = tile[d] * self.tile_shape[d];
            tile_size[d] = self.tile_shape[d].min(self.extents[d] - element_origin[d]);
        }

        let ctx = TileContext {
            tile_id: tile,
            tile_count: self.tile_counts,
            tile_size,
            element_origin,
            worker_id,
        };

        (self.tile_fn)(&ctx).with_context(|| format!("tile {:?} failed", tile))
    }
}

impl fmt::Debug for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchState")
            .field("extents", &self.extents)
            .field("tile_shape", &self.tile_shape)
            .field("tile_counts", &self.tile_counts)
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .field("total", &self.total)
            .finish()
    }
}

/// Payload of a SLICE task: a fixed box of tiles run sequentially.
#[derive(Debug)]
pub struct SlicePayload {
    pub(crate) state: Arc<DispatchState>,
    pub(crate) range: TileRange,
}

impl SlicePayload {
    pub fn range(&self) -> TileRange {
        self.range
    }
}

/// Payload of a SHARD task: claims tiles from the shared cursor when it runs.
#[derive(Debug, Clone)]
pub struct ShardPayload {
    pub(crate) state: Arc<DispatchState>,
}
