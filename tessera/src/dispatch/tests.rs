use super::*;
use crate::error::SchedError;
use crate::runtime::Builder;
use crate::scope::Scope;
use crate::task::{AffinityMask, TaskData, TaskKind, TaskState};
use crate::test_utils::{Tracker, executor, init_tracing};
use anyhow::{Result, bail};
use parking_lot::Mutex;
use rstest::rstest;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn linear(ctx: &TileContext) -> u64 {
    let [x, y, z] = ctx.tile_id().map(|n| n as u64);
    let [nx, ny, _] = ctx.tile_count().map(|n| n as u64);
    x + y * nx + z * nx * ny
}

fn tile_fn<F>(f: F) -> TileFn
where
    F: Fn(&TileContext) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn recording(tracker: &Tracker) -> impl Fn(&TileContext) -> Result<()> + Send + Sync + 'static {
    let tracker = tracker.clone();
    move |ctx: &TileContext| {
        tracker.record(linear(ctx), ctx.worker_id());
        Ok(())
    }
}

#[rstest]
#[case::exact([64, 1, 1], [1, 1, 1], [64, 1, 1])]
#[case::rounded_up([10, 5, 3], [4, 4, 2], [3, 2, 2])]
#[case::shape_larger_than_grid([3, 3, 3], [8, 8, 8], [1, 1, 1])]
#[case::empty_dimension([16, 0, 4], [1, 1, 1], [0, 0, 0])]
fn test_tile_counts(#[case] extents: [u32; 3], #[case] shape: [u32; 3], #[case] expected: [u32; 3]) {
    let grid = DispatchGrid::new(extents).tile_shape(shape);
    assert_eq!(grid.tile_counts(), expected);
    assert_eq!(
        grid.tile_count(),
        Some(expected.iter().map(|&n| n as u64).product::<u64>())
    );
}

#[test]
fn test_unrepresentable_grid_is_rejected() -> Result<()> {
    let exec = executor(2);
    let scope = Scope::new("huge");

    let grid = DispatchGrid::new([u32::MAX; 3]);
    assert_eq!(grid.tile_counts(), [u32::MAX; 3]);
    assert_eq!(grid.tile_count(), None);

    let err = grid.split(exec.handle(), &scope, |_| Ok(())).unwrap_err();
    assert!(matches!(err, SchedError::ResourceExhausted(_)));
    // Rejected before any task was created.
    assert_eq!(scope.outstanding(), 0);

    // Still representable once tiles are coarse enough.
    let grid = DispatchGrid::new([u32::MAX; 3]).tile_shape([1 << 16, 1 << 16, 1 << 16]);
    assert_eq!(grid.tile_count(), Some(1 << 48));

    let range = TileRange {
        tile_origin: [0; 3],
        tile_count: [u32::MAX; 3],
    };
    assert_eq!(range.len(), u64::MAX);
    Ok(())
}

#[test]
#[should_panic(expected = "tile_shape must be greater than 0")]
fn test_zero_tile_shape_panics() {
    let _ = DispatchGrid::new([4, 4, 4]).tile_shape([1, 0, 1]);
}

#[test]
fn test_tile_range_iterates_x_fastest() {
    let range = TileRange {
        tile_origin: [2, 1, 0],
        tile_count: [2, 2, 1],
    };

    assert_eq!(range.len(), 4);
    assert_eq!(
        range.iter().collect::<Vec<_>>(),
        vec![[2, 1, 0], [3, 1, 0], [2, 2, 0], [3, 2, 0]]
    );

    let empty = TileRange {
        tile_origin: [0, 0, 0],
        tile_count: [4, 0, 1],
    };
    assert!(empty.is_empty());
    assert_eq!(empty.iter().count(), 0);
}

#[test]
fn test_claims_cover_grid_once() {
    let state = DispatchState::new([10, 3, 1], [1, 1, 1], [10, 3, 1], 4, tile_fn(|_| Ok(())));

    let claims = std::iter::from_fn(|| state.claim()).collect::<Vec<_>>();
    assert_eq!(claims, vec![0..4, 4..8, 8..12, 12..16, 16..20, 20..24, 24..28, 28..30]);
    assert!(!state.has_unclaimed());
    assert_eq!(state.claim(), None);
}

#[test]
fn test_run_linear_walks_tiles_in_order() -> Result<()> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let state = DispatchState::new([3, 2, 2], [1, 1, 1], [3, 2, 2], 1, {
        let seen = Arc::clone(&seen);
        tile_fn(move |ctx| {
            seen.lock().push(ctx.tile_id());
            Ok(())
        })
    });

    state.run_linear(2..8, 0)?;
    assert_eq!(
        *seen.lock(),
        vec![[2, 0, 0], [0, 1, 0], [1, 1, 0], [2, 1, 0], [0, 0, 1], [1, 0, 1]]
    );
    Ok(())
}

#[test]
fn test_tile_failure_carries_tile_id() {
    let state = DispatchState::new(
        [4, 1, 1],
        [1, 1, 1],
        [4, 1, 1],
        4,
        tile_fn(|ctx| {
            if ctx.tile_id() == [2, 0, 0] {
                bail!("bad tile");
            }
            Ok(())
        }),
    );

    let err = state.run_linear(0..4, 0).unwrap_err();
    assert_eq!(err.to_string(), "tile [2, 0, 0] failed");
    assert_eq!(err.root_cause().to_string(), "bad tile");
}

#[test]
fn test_split_into_slices() -> Result<()> {
    let exec = executor(4);
    let scope = Scope::new("slices");

    let dispatch = DispatchGrid::new([64, 1, 1])
        .tiles_per_slice([8, 1, 1])
        .split(exec.handle(), &scope, |_| Ok(()))?;

    assert_eq!(dispatch.work.len(), 8);
    assert_eq!(dispatch.entry.kind(), TaskKind::Nop);
    assert_eq!(dispatch.exit.kind(), TaskKind::Barrier);
    assert_eq!(dispatch.exit.pending_dependencies(), 8);

    let mut covered = HashSet::new();
    for task in &dispatch.work {
        assert_eq!(task.kind(), TaskKind::Slice);
        assert_eq!(task.pending_dependencies(), 1);

        let Some(TaskData::Slice(slice)) = task.take_payload() else {
            bail!("task {} is not a slice", task.id());
        };
        let range = slice.range();
        assert_eq!(range.tile_count, [8, 1, 1]);
        for tile in range.iter() {
            assert!(covered.insert(tile), "tile {:?} in two slices", tile);
        }
    }
    assert_eq!(covered.len(), 64);
    Ok(())
}

#[test]
fn test_slices_run_every_tile_once() -> Result<()> {
    let exec = executor(4);
    let scope = Scope::new("slices-run");
    let tracker = Tracker::new();

    let dispatch = DispatchGrid::new([64, 1, 1])
        .tiles_per_slice([8, 1, 1])
        .mode(SplitMode::Slices)
        .split(exec.handle(), &scope, recording(&tracker))?;

    exec.submit(&scope, [dispatch.entry])?;
    scope.wait_idle(TIMEOUT)?;

    tracker.assert_exactly_once(0..64);
    assert_eq!(dispatch.exit.state(), TaskState::Completed);
    Ok(())
}

#[test]
fn test_edge_tiles_are_clipped() -> Result<()> {
    let exec = executor(2);
    let scope = Scope::new("clipped");
    let tiles = Arc::new(Mutex::new(Vec::new()));

    let dispatch = DispatchGrid::new([10, 5, 1])
        .tile_shape([4, 4, 1])
        .tiles_per_slice([2, 1, 1])
        .split(exec.handle(), &scope, {
            let tiles = Arc::clone(&tiles);
            move |ctx| {
                tiles.lock().push(*ctx);
                Ok(())
            }
        })?;

    // 3x2 tiles, two per slice along x.
    assert_eq!(dispatch.work.len(), 4);

    exec.submit(&scope, [dispatch.entry])?;
    scope.wait_idle(TIMEOUT)?;

    let tiles = tiles.lock();
    assert_eq!(tiles.len(), 6);

    let mut elements = 0;
    for ctx in tiles.iter() {
        for d in 0..3 {
            assert!(ctx.element_origin()[d] + ctx.tile_size()[d] <= [10, 5, 1][d]);
        }
        if ctx.tile_id() == [2, 1, 0] {
            assert_eq!(ctx.element_origin(), [8, 4, 0]);
            assert_eq!(ctx.tile_size(), [2, 1, 1]);
        }
        elements += ctx.tile_size().iter().product::<u32>();
    }
    assert_eq!(elements, 50);
    Ok(())
}

#[test]
fn test_empty_grid_links_entry_to_exit() -> Result<()> {
    let exec = executor(2);
    let scope = Scope::new("empty");
    let tracker = Tracker::new();

    let dispatch = DispatchGrid::new([0, 4, 4]).split(exec.handle(), &scope, recording(&tracker))?;
    assert!(dispatch.work.is_empty());
    assert_eq!(dispatch.exit.pending_dependencies(), 1);

    exec.submit(&scope, [dispatch.entry])?;
    scope.wait_idle(TIMEOUT)?;

    assert_eq!(tracker.total(), 0);
    assert_eq!(dispatch.exit.state(), TaskState::Completed);
    Ok(())
}

#[rstest]
#[case::one_tile_per_claim(1)]
#[case::uneven_claims(7)]
#[case::claim_everything(4096)]
fn test_shards_run_every_tile_once(#[case] reservation: u32) -> Result<()> {
    let exec = executor(4);
    let scope = Scope::new("shards");
    let tracker = Tracker::new();

    let dispatch = DispatchGrid::new([50, 10, 2])
        .max_tiles_per_shard_reservation(reservation)
        .mode(SplitMode::Shards)
        .split(exec.handle(), &scope, {
            let tracker = tracker.clone();
            move |ctx| {
                tracker.record(linear(ctx), ctx.worker_id());
                Ok(())
            }
        })?;

    let expected = 4.min(1000u64.div_ceil(reservation as u64)) as usize;
    assert_eq!(dispatch.work.len(), expected);
    assert!(dispatch.work.iter().all(|t| t.kind() == TaskKind::Shard));

    exec.submit(&scope, [dispatch.entry])?;
    scope.wait_idle(TIMEOUT)?;

    assert_eq!(tracker.len(), 1000);
    tracker.assert_exactly_once(0..1000);
    Ok(())
}

#[test]
fn test_exit_follows_every_tile() -> Result<()> {
    let exec = executor(4);
    let scope = Scope::new("follow-up");
    let tracker = Tracker::new();

    let dispatch = DispatchGrid::new([256, 1, 1])
        .max_tiles_per_shard_reservation(3)
        .mode(SplitMode::Shards)
        .split(exec.handle(), &scope, recording(&tracker))?;

    let after = exec.call(&scope, {
        let tracker = tracker.clone();
        move |_| {
            if tracker.len() != 256 {
                bail!("follow-up saw {} of 256 tiles", tracker.len());
            }
            Ok(())
        }
    })?;
    dispatch.exit.add_dependent(&after)?;

    exec.submit(&scope, [dispatch.entry])?;
    scope.wait_idle(TIMEOUT)?;
    assert_eq!(after.state(), TaskState::Completed);
    Ok(())
}

#[rstest]
#[case::fits_resident_budget([64, 1, 1], TaskKind::Slice)]
#[case::exceeds_resident_budget([1024, 1, 1], TaskKind::Shard)]
fn test_auto_mode(#[case] extents: [u32; 3], #[case] kind: TaskKind) -> Result<()> {
    init_tracing();
    let exec = Builder::new()
        .worker_threads(2)
        .max_resident_slices_per_worker(4)
        .try_build()?;
    let scope = Scope::new("auto");
    let tracker = Tracker::new();

    // 2 workers x 4 resident slices of 8 tiles hold 64 tiles.
    let dispatch = DispatchGrid::new(extents)
        .tiles_per_slice([8, 1, 1])
        .split(exec.handle(), &scope, recording(&tracker))?;
    assert!(dispatch.work.iter().all(|t| t.kind() == kind));

    exec.submit(&scope, [dispatch.entry])?;
    scope.wait_idle(TIMEOUT)?;
    tracker.assert_exactly_once(0..extents[0] as u64);
    Ok(())
}

#[rstest]
#[case::slices(SplitMode::Slices)]
#[case::shards(SplitMode::Shards)]
fn test_dispatch_affinity(#[case] mode: SplitMode) -> Result<()> {
    let exec = executor(4);
    let scope = Scope::new("pinned-dispatch");
    let tracker = Tracker::new();

    let dispatch = DispatchGrid::new([32, 4, 1])
        .tiles_per_slice([4, 1, 1])
        .max_tiles_per_shard_reservation(2)
        .affinity(AffinityMask::worker(2))
        .mode(mode)
        .split(exec.handle(), &scope, recording(&tracker))?;

    // Only one eligible worker.
    if mode == SplitMode::Shards {
        assert_eq!(dispatch.work.len(), 1);
    }

    exec.submit(&scope, [dispatch.entry])?;
    scope.wait_idle(TIMEOUT)?;

    tracker.assert_exactly_once(0..128);
    for key in 0..128 {
        assert_eq!(tracker.runs(key)[0].worker_id, 2);
    }
    Ok(())
}

#[test]
fn test_failing_tile_fails_scope() -> Result<()> {
    let exec = executor(2);
    let scope = Scope::new("tile-failure");

    let dispatch = DispatchGrid::new([16, 1, 1])
        .tiles_per_slice([4, 1, 1])
        .mode(SplitMode::Slices)
        .split(exec.handle(), &scope, |ctx| {
            if ctx.tile_id() == [5, 0, 0] {
                bail!("tile exploded");
            }
            Ok(())
        })?;

    exec.submit(&scope, [dispatch.entry])?;
    let err = scope.wait_idle(TIMEOUT).unwrap_err();

    assert!(err.is_task_failure());
    assert!(err.to_string().contains("tile [5, 0, 0] failed"));
    assert_eq!(scope.failure_count(), 1);
    // The barrier still retires once its failed predecessor did.
    assert_eq!(dispatch.exit.state(), TaskState::Completed);
    assert_eq!(dispatch.exit.failed_predecessors(), 1);
    Ok(())
}
