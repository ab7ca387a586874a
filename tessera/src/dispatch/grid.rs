use crate::dispatch::shard::{
    DispatchState, ShardPayload, SlicePayload, TileContext, TileRange, volume,
};
use crate::error::SchedError;
use crate::runtime::Handle;
use crate::scope::Scope;
use crate::task::{AffinityMask, Task, TaskData};
use std::sync::Arc;

const MAX_PREALLOCATED_SLICES: usize = 1 << 16;

/// How a dispatch is materialized into tasks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// Slices while they fit the resident budget, shards beyond.
    #[default]
    Auto,
    Slices,
    Shards,
}

/// Tiled iteration space to split into tasks.
///
/// Unset grouping parameters fall back to the executor configuration.
#[derive(Debug, Clone)]
pub struct DispatchGrid {
    extents: [u32; 3],
    tile_shape: [u32; 3],
    tiles_per_slice: Option<[u32; 3]>,
    max_tiles_per_shard_reservation: Option<u32>,
    affinity: AffinityMask,
    mode: SplitMode,
}

/// Tasks produced by a split. `entry` fans out to `work`, which fans in to
/// `exit`. Submit `entry` as the root and hang follow-up work off `exit`.
#[derive(Debug)]
pub struct Dispatch {
    pub entry: Task,
    pub exit: Task,
    pub work: Vec<Task>,
}

impl DispatchGrid {
    pub fn new(extents: [u32; 3]) -> Self {
        Self {
            extents,
            tile_shape: [1, 1, 1],
            tiles_per_slice: None,
            max_tiles_per_shard_reservation: None,
            affinity: AffinityMask::ANY,
            mode: SplitMode::Auto,
        }
    }

    #[track_caller]
    pub fn tile_shape(mut self, shape: [u32; 3]) -> Self {
        assert!(
            shape.iter().all(|&n| n > 0),
            "tile_shape must be greater than 0 in every dimension"
        );
        self.tile_shape = shape;
        self
    }

    #[track_caller]
    pub fn tiles_per_slice(mut self, val: [u32; 3]) -> Self {
        assert!(
            val.iter().all(|&n| n > 0),
            "tiles_per_slice must be greater than 0 in every dimension"
        );
        self.tiles_per_slice = Some(val);
        self
    }

    #[track_caller]
    pub fn max_tiles_per_shard_reservation(mut self, val: u32) -> Self {
        assert!(
            val > 0,
            "max_tiles_per_shard_reservation must be greater than 0"
        );
        self.max_tiles_per_shard_reservation = Some(val);
        self
    }

    /// Workers allowed to run the tiles.
    pub fn affinity(mut self, affinity: AffinityMask) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn mode(mut self, mode: SplitMode) -> Self {
        self.mode = mode;
        self
    }

    /// `ceil(extent / tile_shape)` per dimension. Any zero extent empties
    /// the grid.
    pub fn tile_counts(&self) -> [u32; 3] {
        if self.extents.contains(&0) {
            return [0; 3];
        }

        std::array::from_fn(|d| self.extents[d].div_ceil(self.tile_shape[d]))
    }

    /// Total number of tiles, `None` when it does not fit a `u64`.
    pub fn tile_count(&self) -> Option<u64> {
        volume(self.tile_counts())
    }

    /// Materializes the dispatch as `entry -> work -> exit` in `scope`.
    ///
    /// Nothing is submitted. Fails with `ResourceExhausted` when the grid has
    /// more tiles than a `u64` counts. On other errors the tasks created so
    /// far stay unsubmitted in the scope.
    pub fn split<F>(&self, handle: &Handle, scope: &Scope, tile_fn: F) -> Result<Dispatch, SchedError>
    where
        F: Fn(&TileContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let cfg = &handle.cfg;
        let tile_counts = self.tile_counts();
        let tiles_per_slice = self.tiles_per_slice.unwrap_or(cfg.tiles_per_slice);
        let reservation = self
            .max_tiles_per_shard_reservation
            .unwrap_or(cfg.max_tiles_per_shard_reservation);

        let total = self.tile_count().ok_or_else(|| {
            SchedError::exhausted(format!(
                "dispatch grid {:?} has more tiles than fit in u64",
                tile_counts
            ))
        })?;

        let entry = handle.create_task(scope, TaskData::Nop, self.affinity)?;
        let exit = handle.create_task(scope, TaskData::Barrier, self.affinity)?;

        if total == 0 {
            entry.add_dependent(&exit)?;
            return Ok(Dispatch {
                entry,
                exit,
                work: Vec::new(),
            });
        }

        let slice_counts: [u32; 3] =
            std::array::from_fn(|d| tile_counts[d].div_ceil(tiles_per_slice[d]));
        // Never more slices than tiles, so this fits whenever `total` does.
        let slice_count = volume(slice_counts).unwrap_or(total);

        let eligible = self
            .affinity
            .eligible(handle.worker_bits)
            .count_ones()
            .max(1) as u64;
        let use_slices = match self.mode {
            SplitMode::Slices => true,
            SplitMode::Shards => false,
            SplitMode::Auto => {
                slice_count <= eligible.saturating_mul(cfg.max_resident_slices_per_worker as u64)
            }
        };

        let state = Arc::new(DispatchState::new(
            self.extents,
            self.tile_shape,
            tile_counts,
            reservation,
            Arc::new(tile_fn),
        ));

        let work = if use_slices {
            let capacity = usize::try_from(slice_count).map_err(|_| {
                SchedError::exhausted(format!("{} slices do not fit in memory", slice_count))
            })?;
            // Forced slicing of a huge grid grows the list as tasks are
            // created, so a bounded pool fails before memory does.
            let mut work = Vec::with_capacity(capacity.min(MAX_PREALLOCATED_SLICES));

            for sz in 0..slice_counts[2] {
                for sy in 0..slice_counts[1] {
                    for sx in 0..slice_counts[0] {
                        let slice = [sx, sy, sz];
                        let tile_origin: [u32; 3] =
                            std::array::from_fn(|d| slice[d] * tiles_per_slice[d]);
                        let range = TileRange {
                            tile_origin,
                            tile_count: std::array::from_fn(|d| {
                                tiles_per_slice[d].min(tile_counts[d] - tile_origin[d])
                            }),
                        };

                        let payload = SlicePayload {
                            state: Arc::clone(&state),
                            range,
                        };
                        work.push(handle.create_task(
                            scope,
                            TaskData::Slice(payload),
                            self.affinity,
                        )?);
                    }
                }
            }

            work
        } else {
            let shards = eligible.min(total.div_ceil(reservation as u64));

            (0..shards)
                .map(|_| {
                    let payload = ShardPayload {
                        state: Arc::clone(&state),
                    };
                    handle.create_task(scope, TaskData::Shard(payload), self.affinity)
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        for task in &work {
            entry.add_dependent(task)?;
            task.add_dependent(&exit)?;
        }

        tracing::debug!(
            scope = %scope.name(),
            tiles = total,
            tasks = work.len(),
            slices = use_slices,
            "dispatch split"
        );

        Ok(Dispatch { entry, exit, work })
    }
}
