//! AvgPool3D for vector cores that predate the regbase architecture.
//!
//! Outputs are spread over cores first; the UB strategy then depends on layout and on how the
//! channel row and the W window fit. The tiling key is `mode * 10 + dtype`.

use log::{debug, info};

use super::{PoolKind, D, H, W, WORKSPACE};
use crate::common::{Dtype, Format};
use crate::error::TilingError;
use crate::ops::Prepared;
use crate::plan::TilingPlan;
use crate::registry::{TilingContext, TilingTemplate};
use crate::utils::{ceil_align, ceil_div};

const RESERVED_UB: i64 = 10 * 1024;
const INDEX_BUF_SIZE: i64 = 9 * 1024;
const INDEX_BUF_NUM: i64 = 9;
const CORE_SYNC_WORKSPACE: i64 = 2048;
const BLOCK_SIZE: i64 = 32;
const MAX_TILE_NUM: i64 = 4095;
const NORMAL_KERNEL_LIMIT: i64 = 128;
const NORMAL_KERNEL_W_LIMIT: i64 = 16;
const NORMAL_NC_FACTOR: i64 = 256 / 4;
const FP32_SIZE: i64 = 4;

/// UB strategies of the vector kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorMode {
    SplitC = 1,
    SplitW = 2,
    MultiW = 3,
    ReduceD = 4,
    Normal = 5,
}

crate::tiling_data! {
    pub struct AvgPool3dTilingData {
        pub in_n: i64,
        pub in_c: i64,
        pub tile_c: i64,
        pub input: [i64; 3],
        pub output: [i64; 3],
        pub kernel: [i64; 3],
        pub stride: [i64; 3],
        /// Front, top and left pads.
        pub pads: [i64; 3],
        pub divisor_override: i64,
        pub count_include_pad: i64,
        pub ceil_mode: i64,
        pub former_length: i64,
        pub former_num: i64,
        pub tail_length: i64,
        pub tail_num: i64,
        pub index_buf_len: i64,
        pub window_w_num: i64,
        pub tile_input: i64,
        pub tile_hw: i64,
        pub atomic_add_num: i64,
        pub use_core_num: i64,
        pub nc_factor: i64,
        pub out_factor: [i64; 3],
        pub nc_outer: i64,
        pub out_outer: [i64; 3],
        pub nc_tail: i64,
        pub out_tail: [i64; 3],
        pub block_factor: i64,
        pub block_tail: i64,
        pub total_idx: i64,
        pub used_core_num: i64,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AvgPool3dVector;

fn dtype_key(dtype: Dtype) -> Option<u64> {
    match dtype {
        Dtype::Float32 => Some(0),
        Dtype::Float16 => Some(1),
        Dtype::Bfloat16 => Some(2),
        _ => None,
    }
}

/// Largest divisor of `len` not exceeding `limit`, or 0 when `limit` is 0.
fn largest_divisor_within(len: i64, limit: i64) -> i64 {
    (1..=limit.min(len)).rev().find(|d| len % d == 0).unwrap_or(0)
}

/// Splits `outputs` units over `cores`: the first `former_num` cores take `former_length`
/// each and the remaining `tail_num` cores take `tail_length`. Returns the cores used.
fn spread_outputs(data: &mut AvgPool3dTilingData, outputs: i64, cores: i64) -> i64 {
    if outputs < cores {
        data.former_num = outputs;
        data.former_length = 1;
        outputs
    } else if outputs % cores == 0 {
        data.former_num = cores;
        data.former_length = outputs / cores;
        cores
    } else {
        data.former_num = outputs % cores;
        data.tail_num = cores - data.former_num;
        data.former_length = outputs / cores + 1;
        data.tail_length = outputs / cores;
        cores
    }
}

/// Cuts the NC, D, H and W output axes until there is at least one UB block per core.
fn normal_blocks(data: &mut AvgPool3dTilingData, nc: i64, cores: i64) {
    let out = data.output;
    data.nc_factor = NORMAL_NC_FACTOR;
    data.nc_outer = ceil_div(nc, data.nc_factor);
    data.nc_tail = nc - (data.nc_outer - 1) * data.nc_factor;
    let mut blocks = data.nc_outer;
    for axis in [D, H, W] {
        let mut factor = out[axis];
        if blocks < cores {
            let need = ceil_div(cores, blocks);
            factor = (out[axis] / need).max(1);
        }
        data.out_factor[axis] = factor;
        data.out_outer[axis] = ceil_div(out[axis], factor);
        data.out_tail[axis] = out[axis] - (data.out_outer[axis] - 1) * factor;
        blocks *= data.out_outer[axis];
    }
    data.total_idx = blocks;
    data.block_factor = ceil_div(blocks, cores);
    data.use_core_num = ceil_div(blocks, data.block_factor);
    data.block_tail = blocks - (data.use_core_num - 1) * data.block_factor;
}

impl TilingTemplate for AvgPool3dVector {
    fn name(&self) -> &'static str {
        "AvgPool3dVector"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        matches!(ctx.prepared, Prepared::Pool3d(p) if p.kind == PoolKind::Avg)
            && !ctx.platform.is_regbase()
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let op = ctx.op();
        let p = ctx.prepared.pool3d(op)?;
        let platform = ctx.platform;
        let dtype_key = dtype_key(p.dtype).ok_or_else(|| {
            TilingError::UnsupportedDtype(op.to_string(), format!("x is {}", p.dtype))
        })?;
        let w = &p.declared;
        let only_depth =
            w.kernel[H] == 1 && w.kernel[W] == 1 && w.stride[H] == 1 && w.stride[W] == 1;
        let ub = platform.ub_size - RESERVED_UB - INDEX_BUF_SIZE;
        let cores = platform.core_num;
        let (n, c) = (p.n, p.c);
        let (input, out) = (p.input, p.output);

        let mut data = AvgPool3dTilingData {
            in_n: n,
            in_c: c,
            input,
            output: out,
            kernel: w.kernel,
            stride: w.stride,
            pads: [w.pad_before(D), w.pad_before(H), w.pad_before(W)],
            divisor_override: p.divisor_override,
            count_include_pad: i64::from(p.count_include_pad),
            ceil_mode: i64::from(p.ceil_mode),
            index_buf_len: INDEX_BUF_SIZE / INDEX_BUF_NUM / 8,
            ..Default::default()
        };

        let outputs = match p.format {
            Format::NDHWC => n * out[D] * out[H] * out[W],
            _ if only_depth => n * c * out[D],
            _ => n * c * p.output_points(),
        };
        let used = spread_outputs(&mut data, outputs, cores).max(1);
        data.used_core_num = used;

        let dts = p.dtype.size();
        let align = BLOCK_SIZE * 2 / dts;
        let tile_len = ub / (dts + 2 * FP32_SIZE) / align * align;
        if tile_len < align {
            return Err(TilingError::ResourceExceeded(
                op.to_string(),
                format!(
                    "UB of {} bytes leaves no room for a {align}-element tile",
                    platform.ub_size
                ),
            ));
        }
        let normal = w.kernel[D] * w.kernel[H] * ceil_align(w.kernel[W], 8) <= NORMAL_KERNEL_LIMIT
            && w.kernel[W] <= NORMAL_KERNEL_W_LIMIT;

        let mode = if p.format == Format::NCDHW && only_depth {
            let hw = input[H] * input[W];
            data.tile_hw = ceil_align(hw, align).min(tile_len);
            let tail = if data.tile_hw > 0 { hw % data.tile_hw } else { 0 };
            data.atomic_add_num = i64::from(tail != 0 && tail < align);
            VectorMode::ReduceD
        } else if p.format == Format::NCDHW && normal {
            normal_blocks(&mut data, n * c, cores);
            VectorMode::Normal
        } else {
            channel_strategy(&mut data, platform.is_310p(), ub, dts, align, tile_len)
        };

        let key = mode as u64 * 10 + dtype_key;
        let workspace = if data.atomic_add_num == 0 {
            WORKSPACE
        } else {
            WORKSPACE + CORE_SYNC_WORKSPACE
        };
        debug!("{op}: {data:?}");
        info!("{op}: vector mode {mode:?}, key {key}, {outputs} outputs over {used} cores");
        TilingPlan::new(op, platform, key, used, data.to_blob(), workspace)
    }
}

/// Picks between channel splitting and W-window strategies for the channel-major modes.
fn channel_strategy(
    data: &mut AvgPool3dTilingData,
    is_310p: bool,
    ub: i64,
    dts: i64,
    align: i64,
    tile_len: i64,
) -> VectorMode {
    let c = data.in_c;
    let (kw, sw) = (data.kernel[W], data.stride[W]);
    let align_c = ceil_align(c, align);
    if 2 * align_c > tile_len {
        data.tile_c = align_c.min(tile_len);
        let tail = if data.tile_c > 0 { c % data.tile_c } else { 0 };
        data.atomic_add_num = i64::from(tail != 0 && tail < align);
        return VectorMode::SplitC;
    }

    let align_single = BLOCK_SIZE / dts;
    let align_c_single = ceil_align(c, align_single);
    if c < align_single {
        data.atomic_add_num = (align_c_single - 1) / c;
    }

    let tile_input = (ub / align_c - dts - FP32_SIZE) / FP32_SIZE;
    if tile_input < kw {
        data.tile_input = tile_input.min(MAX_TILE_NUM);
        return VectorMode::SplitW;
    }
    if sw > kw {
        data.tile_input = kw;
        return VectorMode::SplitW;
    }

    let mut window = ((ub / align_c - kw * FP32_SIZE) / ((sw + 1) * FP32_SIZE + dts)).max(0);
    let unbounded_copy = is_310p && kw > 1024 && align_c_single != c;
    if !unbounded_copy && window * kw > MAX_TILE_NUM {
        window = MAX_TILE_NUM / kw;
    }
    window = window.min(data.output[W]);
    data.window_w_num = largest_divisor_within(data.index_buf_len, window);
    if window == 0 {
        data.tile_c = align_c.min(tile_len);
        return VectorMode::SplitC;
    }
    VectorMode::MultiW
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::TilingDispatcher;
    use crate::ops::pool3d::tests::pool_workload;
    use crate::platform::tests::platform_910b;
    use crate::platform::MemoryHierarchyDescriptor;
    use crate::registry::default_registry;
    use crate::workload::OperatorWorkload;
    use proptest::prelude::*;

    fn tile(w: &OperatorWorkload) -> TilingPlan {
        TilingDispatcher::new(default_registry(), platform_910b())
            .tile(w)
            .unwrap()
    }

    fn avg(
        format: Format,
        dtype: Dtype,
        n: i64,
        c: i64,
        input: [i64; 3],
        k: [i64; 3],
        s: [i64; 3],
    ) -> OperatorWorkload {
        pool_workload("AvgPool3D", format, dtype, n, c, input, k, s, [0; 6])
    }

    #[test]
    fn test_small_ub_is_resource_exceeded() {
        let w = avg(Format::NDHWC, Dtype::Float16, 2, 16, [8, 8, 8], [2; 3], [2; 3]);
        for ub in [512, 19 * 1024, 19 * 1024 + 64] {
            let platform = MemoryHierarchyDescriptor::new(8, ub);
            assert!(matches!(
                TilingDispatcher::new(default_registry(), platform).tile(&w),
                Err(TilingError::ResourceExceeded(..))
            ));
        }
        let platform = MemoryHierarchyDescriptor::new(8, 19 * 1024 + 640);
        let plan = TilingDispatcher::new(default_registry(), platform)
            .tile(&w)
            .unwrap();
        let data = AvgPool3dTilingData::from_blob(&plan.blob).unwrap();
        assert!(data.tile_c >= 0);
    }

    #[test]
    fn test_largest_divisor_within() {
        assert_eq!(largest_divisor_within(128, 0), 0);
        assert_eq!(largest_divisor_within(128, 4), 4);
        assert_eq!(largest_divisor_within(128, 100), 64);
        assert_eq!(largest_divisor_within(128, 394), 128);
    }

    #[test]
    fn test_ndhwc_multi_window() {
        let plan = tile(&avg(Format::NDHWC, Dtype::Float16, 2, 16, [8, 8, 8], [2; 3], [2; 3]));
        assert_eq!(plan.tiling_key, 31);
        assert_eq!(plan.block_dim, 40);
        assert_eq!(plan.workspace_size, 16 * 1024 * 1024);
        let data = AvgPool3dTilingData::from_blob(&plan.blob).unwrap();
        assert_eq!(data.former_num, 8);
        assert_eq!(data.tail_num, 32);
        assert_eq!(data.former_length, 4);
        assert_eq!(data.tail_length, 3);
        assert_eq!(data.window_w_num, 4);
        assert_eq!(data.index_buf_len, 128);
    }

    #[test]
    fn test_ncdhw_normal_blocks() {
        let plan = tile(&avg(Format::NCDHW, Dtype::Float32, 1, 4, [8, 8, 8], [2; 3], [2; 3]));
        assert_eq!(plan.tiling_key, 50);
        assert_eq!(plan.block_dim, 40);
        let data = AvgPool3dTilingData::from_blob(&plan.blob).unwrap();
        assert_eq!(data.nc_factor, 64);
        assert_eq!(data.nc_outer, 1);
        assert_eq!(data.nc_tail, 4);
        assert_eq!(data.out_factor, [1, 1, 1]);
        assert_eq!(data.out_outer, [4, 4, 4]);
        assert_eq!(data.total_idx, 64);
        assert_eq!(data.block_factor, 2);
        assert_eq!(data.use_core_num, 32);
        assert_eq!(data.block_tail, 2);
    }

    #[test]
    fn test_depth_only_window_reduces_d() {
        let plan = tile(&avg(Format::NCDHW, Dtype::Float16, 1, 2, [8, 4, 5], [2, 1, 1], [2, 1, 1]));
        assert_eq!(plan.tiling_key, 41);
        assert_eq!(plan.block_dim, 8);
        assert_eq!(plan.workspace_size, 16 * 1024 * 1024 + 2048);
        let data = AvgPool3dTilingData::from_blob(&plan.blob).unwrap();
        assert_eq!(data.tile_hw, 32);
        assert_eq!(data.atomic_add_num, 1);
    }

    #[test]
    fn test_wide_channel_splits_c() {
        let plan = tile(&avg(Format::NDHWC, Dtype::Float32, 1, 8000, [2, 2, 2], [2; 3], [2; 3]));
        assert_eq!(plan.tiling_key, 10);
        assert_eq!(plan.block_dim, 1);
        let data = AvgPool3dTilingData::from_blob(&plan.blob).unwrap();
        assert_eq!(data.tile_c, 8000);
        assert_eq!(data.atomic_add_num, 0);
    }

    #[test]
    fn test_stride_beyond_kernel_splits_w() {
        let plan = tile(&avg(Format::NDHWC, Dtype::Float16, 1, 16, [4, 4, 9], [1, 1, 2], [1, 1, 3]));
        assert_eq!(plan.tiling_key, 21);
        let data = AvgPool3dTilingData::from_blob(&plan.blob).unwrap();
        assert_eq!(data.tile_input, 2);
    }

    #[test]
    fn test_uses_declared_window() {
        // D collapses to a single output; the regbase window would be refined, this one is not.
        let w = pool_workload(
            "AvgPool3D",
            Format::NDHWC,
            Dtype::Float32,
            1,
            16,
            [3, 8, 8],
            [4, 2, 2],
            [2, 2, 2],
            [1, 1, 0, 0, 0, 0],
        );
        let data = AvgPool3dTilingData::from_blob(&tile(&w).blob).unwrap();
        assert_eq!(data.kernel, [4, 2, 2]);
        assert_eq!(data.pads, [1, 0, 0]);
    }

    proptest! {
        #[test]
        fn test_any_small_window_tiles(
            format in prop::sample::select(vec![Format::NCDHW, Format::NDHWC]),
            dtype in prop::sample::select(vec![Dtype::Float32, Dtype::Float16, Dtype::Bfloat16]),
            n in 1i64..4,
            c in 1i64..70,
            kernel in prop::array::uniform3(1i64..4),
            stride in prop::array::uniform3(1i64..4),
            extra in prop::array::uniform3(0i64..12),
        ) {
            let input = [0, 1, 2].map(|a| kernel[a] + extra[a]);
            let w = avg(format, dtype, n, c, input, kernel, stride);
            let dispatcher = TilingDispatcher::new(default_registry(), platform_910b());
            let plan = dispatcher.tile(&w).unwrap();
            prop_assert!(plan.block_dim >= 1 && plan.block_dim <= 40);
            prop_assert_eq!(plan.tiling_key % 10, dtype_key(dtype).unwrap());
            prop_assert_eq!(dispatcher.tile(&w).unwrap(), plan);
        }
    }
}
