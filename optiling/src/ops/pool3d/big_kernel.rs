//! Fallback regbase pooling for windows too large for the small-kernel templates.
//!
//! Every core owns a contiguous range of output points. For each point the kernel streams the
//! window through UB in chunks along D, then H, then W, and as a last resort splits channels.

use log::info;

use super::{PoolKind, PoolParams, D, H, MAX_INPUT_ELEMENTS, W, WORKSPACE};
use crate::error::TilingError;
use crate::ops::Prepared;
use crate::plan::TilingPlan;
use crate::platform::MemoryHierarchyDescriptor;
use crate::registry::{TilingContext, TilingTemplate};
use crate::utils::{binary_search_max, ceil_align, ceil_div, floor_align, split_evenly};

const UB_RESERVED: i64 = 1024;
const KEY_NO_PADDING: u64 = 400001;
const KEY_PADDING: u64 = 411110;
const KEY_AVG_REAL_DIVISOR: u64 = 411111;

/// The outermost window axis that is chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSplit {
    Depth = 0,
    Rows = 1,
    Cols = 2,
    Channels = 3,
}

crate::tiling_data! {
    pub struct Pool3dBigKernelTilingData {
        pub input: [i64; 3],
        pub output: [i64; 3],
        pub n_out: i64,
        pub channels: i64,
        pub kernel: [i64; 3],
        pub stride: [i64; 3],
        pub dilation: [i64; 3],
        pub pads: [i64; 6],
        pub divisor: i64,
        pub count_include_pad: i64,
        pub block_factor: i64,
        pub block_tail: i64,
        pub split_axis: i64,
        /// Kernel taps loaded per chunk along D/H/W.
        pub window_factor: [i64; 3],
        pub window_loops: [i64; 3],
        pub c_factor: i64,
        pub c_loop: i64,
        pub in_ub_size: i64,
        pub out_ub_size: i64,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pool3dBigKernel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WindowChunks {
    split: WindowSplit,
    factor: [i64; 3],
    loops: [i64; 3],
    c_factor: i64,
    c_loop: i64,
    in_elems: i64,
    out_elems: i64,
}

fn window_chunks(
    p: &PoolParams,
    platform: &MemoryHierarchyDescriptor,
) -> Result<WindowChunks, TilingError> {
    let k = p.window.kernel;
    let c = p.channels;
    let one_block = platform.ub_block_size / p.dtype.size();
    let ub = (platform.ub_size - UB_RESERVED) / p.dtype.size();
    let out_mult = if p.stages_in_fp32() { 2 } else { 1 };
    let out_elems = ceil_align(c, one_block) * out_mult;
    let fits = |in_elems: i64| 2 * in_elems + out_elems <= ub && in_elems <= MAX_INPUT_ELEMENTS;

    let row = ceil_align(k[W] * c, one_block);
    let plane = k[H] * row;
    let chunk = |split, factor: [i64; 3], in_elems| WindowChunks {
        split,
        factor,
        loops: [D, H, W].map(|a| ceil_div(k[a], factor[a])),
        c_factor: c,
        c_loop: 1,
        in_elems,
        out_elems,
    };
    if fits(plane) {
        let depth = binary_search_max(1, k[D], |d| fits(d * plane));
        return Ok(chunk(WindowSplit::Depth, [depth, k[H], k[W]], depth * plane));
    }
    if fits(row) {
        let rows = binary_search_max(1, k[H], |h| fits(h * row));
        return Ok(chunk(WindowSplit::Rows, [1, rows, k[W]], rows * row));
    }
    if fits(ceil_align(c, one_block)) {
        let cols = binary_search_max(1, k[W], |w| fits(ceil_align(w * c, one_block)));
        return Ok(chunk(WindowSplit::Cols, [1, 1, cols], ceil_align(cols * c, one_block)));
    }
    let c_factor = floor_align(ub / (2 + out_mult), one_block)
        .min(floor_align(MAX_INPUT_ELEMENTS, one_block));
    if c_factor < one_block {
        return Err(TilingError::ResourceExceeded(
            p.kind.op_type().to_string(),
            format!(
                "UB of {} bytes cannot hold one {}-element channel block",
                platform.ub_size, one_block
            ),
        ));
    }
    Ok(WindowChunks {
        split: WindowSplit::Channels,
        factor: [1; 3],
        loops: k,
        c_factor,
        c_loop: ceil_div(c, c_factor),
        in_elems: c_factor,
        out_elems: c_factor * out_mult,
    })
}

impl TilingTemplate for Pool3dBigKernel {
    fn name(&self) -> &'static str {
        "Pool3dBigKernel"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        matches!(ctx.prepared, Prepared::Pool3d(_)) && ctx.platform.is_regbase()
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let p = ctx.prepared.pool3d(ctx.op())?;
        let points = p.batches * p.output_points();
        let split = split_evenly(points, ctx.platform.core_num).ok_or_else(|| {
            TilingError::InvalidShape(ctx.op().to_string(), format!("{points} output points"))
        })?;
        let (used, block_factor, block_tail) =
            (split.used_cores, split.block_factor, split.block_tail);
        let chunks = window_chunks(p, ctx.platform)?;
        let divisor = p.divisor();
        let key = if !p.needs_padding() {
            KEY_NO_PADDING
        } else if p.kind == PoolKind::Avg && divisor == 0 {
            KEY_AVG_REAL_DIVISOR
        } else {
            KEY_PADDING
        };
        let data = Pool3dBigKernelTilingData {
            input: p.input,
            output: p.output,
            n_out: p.batches,
            channels: p.channels,
            kernel: p.window.kernel,
            stride: p.window.stride,
            dilation: p.window.dilation,
            pads: p.window.pads,
            divisor,
            count_include_pad: i64::from(p.count_include_pad),
            block_factor,
            block_tail,
            split_axis: chunks.split as i64,
            window_factor: chunks.factor,
            window_loops: chunks.loops,
            c_factor: chunks.c_factor,
            c_loop: chunks.c_loop,
            in_ub_size: chunks.in_elems,
            out_ub_size: chunks.out_elems,
        };
        info!(
            "{}: key {key}, {points} output points over {used} cores, split {:?} {:?}",
            ctx.op(),
            chunks.split,
            chunks.factor
        );
        TilingPlan::new(ctx.op(), ctx.platform, key, used, data.to_blob(), WORKSPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Dtype, Format};
    use crate::dispatcher::TilingDispatcher;
    use crate::ops::pool3d::tests::pool_workload;
    use crate::platform::tests::{platform_910_95, platform_910b};
    use crate::registry::default_registry;

    #[test]
    fn test_large_window_chunks_depth() {
        let w = pool_workload(
            "MaxPool3D",
            Format::NCDHW,
            Dtype::Float32,
            1,
            1,
            [64, 64, 64],
            [32, 32, 32],
            [32, 32, 32],
            [0; 6],
        );
        let plan = TilingDispatcher::new(default_registry(), platform_910_95())
            .tile(&w)
            .unwrap();
        assert_eq!(plan.tiling_key, KEY_NO_PADDING);
        assert_eq!(plan.block_dim, 8);
        let data = Pool3dBigKernelTilingData::from_blob(&plan.blob).unwrap();
        assert_eq!(data.split_axis, WindowSplit::Depth as i64);
        assert_eq!(data.window_factor, [29, 32, 32]);
        assert_eq!(data.window_loops, [2, 1, 1]);
        assert_eq!(data.block_factor, 1);
        assert_eq!(data.c_loop, 1);
    }

    #[test]
    fn test_huge_channel_splits_channels() {
        let w = pool_workload(
            "MaxPool3D",
            Format::NDHWC,
            Dtype::Float32,
            1,
            70000,
            [2, 2, 2],
            [2, 2, 2],
            [2, 2, 2],
            [0; 6],
        );
        let plan = TilingDispatcher::new(default_registry(), platform_910_95())
            .tile(&w)
            .unwrap();
        assert_eq!(plan.block_dim, 1);
        let data = Pool3dBigKernelTilingData::from_blob(&plan.blob).unwrap();
        assert_eq!(data.split_axis, WindowSplit::Channels as i64);
        assert_eq!(data.c_factor, 20392);
        assert_eq!(data.c_loop, 4);
        assert_eq!(data.window_loops, [2, 2, 2]);
    }

    #[test]
    fn test_tiny_ub_is_resource_exceeded() {
        let w = pool_workload(
            "MaxPool3D",
            Format::NDHWC,
            Dtype::Float16,
            1,
            16,
            [8, 8, 8],
            [2, 2, 2],
            [2, 2, 2],
            [0; 6],
        );
        let platform = MemoryHierarchyDescriptor::new(8, 512).with_soc_version("Ascend910_95");
        assert!(matches!(
            TilingDispatcher::new(default_registry(), platform).tile(&w),
            Err(TilingError::ResourceExceeded(..))
        ));
    }

    #[test]
    fn test_not_capable_before_regbase() {
        let w = pool_workload(
            "MaxPool3D",
            Format::NCDHW,
            Dtype::Float32,
            1,
            1,
            [8, 8, 8],
            [2, 2, 2],
            [2, 2, 2],
            [0; 6],
        );
        let platform = platform_910b();
        let prepared = crate::ops::prepare(&w, &platform).unwrap();
        let ctx = TilingContext {
            workload: &w,
            platform: &platform,
            prepared: &prepared,
        };
        assert!(!Pool3dBigKernel.is_capable(&ctx));
        assert!(matches!(
            TilingDispatcher::new(default_registry(), platform).tile(&w),
            Err(TilingError::NoCapableTemplate(_))
        ));
    }
}
