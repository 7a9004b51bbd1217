//! Small-kernel pooling on the regbase architecture for channel-last (NDHWC) tensors.
//!
//! Channels stay innermost in UB. When one channel row is at least [NOT_GATHER_BYTES] wide the
//! kernel aligns every row to a UB block and reduces whole rows instead of gathering by index.

use log::info;

use super::{
    divisor_buffer, divisor_mode, max_gather_elems, spread_loops, GatherMode, PoolKind,
    PoolParams, SplitMode, UbPlanner, UbSplit, D, H, MAX_INPUT_ELEMENTS, W, WORKSPACE,
};
use crate::common::Format;
use crate::error::TilingError;
use crate::ops::Prepared;
use crate::plan::TilingPlan;
use crate::platform::MemoryHierarchyDescriptor;
use crate::registry::{TilingContext, TilingTemplate};
use crate::utils::{binary_search_max, ceil_align, ceil_div, floor_align};

const UB_RESERVED: i64 = 512;
const NOT_GATHER_BYTES: i64 = 64;

const KEY_SMALL: u64 = 200001;
const KEY_SMALL_PADDING: u64 = 211110;
const KEY_SMALL_REAL_DIVISOR: u64 = 211111;
const KEY_BIG_CHANNEL: u64 = 222220;
const KEY_BIG_CHANNEL_PADDING: u64 = 222221;
const KEY_BIG_CHANNEL_REAL_DIVISOR: u64 = 222222;

crate::tiling_data! {
    pub struct Pool3dNdhwcTilingData {
        pub input: [i64; 3],
        pub output: [i64; 3],
        pub n_out: i64,
        pub kernel: [i64; 3],
        pub stride: [i64; 3],
        pub dilation: [i64; 3],
        pub pads: [i64; 6],
        pub block_factor: i64,
        pub block_tail: i64,
        pub ub_factor_n: i64,
        pub out_ub_factor: [i64; 3],
        pub loops: [i64; 4],
        pub channels: i64,
        pub in_ub_size: i64,
        pub out_ub_size: i64,
        pub gather_mode: i64,
        pub once_copy_row: i64,
        pub split_mode: i64,
        pub divisor: i64,
        pub divisor_mode: i64,
        pub real_calc_divisor: i64,
        pub use_trai_two: i64,
        pub divisor_ub_size: i64,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pool3dNdhwcSmallKernel;

struct Planner<'a> {
    p: &'a PoolParams,
    eff: [i64; 3],
    padded: bool,
    big_channel: bool,
    dtype_size: i64,
    one_block: i64,
    para: i64,
    max_gather: i64,
    ub_block: i64,
    vector_reg_size: i64,
    divisor_ub: i64,
    need_calc_divisor: bool,
    available: i64,
}

impl<'a> Planner<'a> {
    fn new(p: &'a PoolParams, platform: &MemoryHierarchyDescriptor) -> Self {
        let dtype_size = p.dtype.size();
        let (divisor_ub, need_calc_divisor) = divisor_buffer(p, platform.ub_block_size);
        Planner {
            p,
            eff: [D, H, W].map(|a| p.window.effective_kernel(a)),
            padded: p.needs_padding(),
            big_channel: p.channels * dtype_size >= NOT_GATHER_BYTES,
            dtype_size,
            one_block: platform.ub_block_size / dtype_size,
            para: platform.vector_reg_size / 4 / dtype_size,
            max_gather: max_gather_elems(p.dtype, platform.vector_reg_size),
            ub_block: platform.ub_block_size,
            vector_reg_size: platform.vector_reg_size,
            divisor_ub,
            need_calc_divisor,
            available: (platform.ub_size - divisor_ub - UB_RESERVED) / dtype_size,
        }
    }

    fn in_size(&self, out: i64, axis: usize) -> i64 {
        (out - 1) * self.p.window.stride[axis] + self.eff[axis]
    }

    fn out_size(&self, input: i64, axis: usize) -> i64 {
        ((input - self.eff[axis]) / self.p.window.stride[axis] + 1).min(self.p.output[axis])
    }

    fn max_in(&self, axis: usize) -> i64 {
        self.in_size(self.p.output[axis], axis)
            .max(self.p.padded_extent(axis))
    }

    /// Elements of one input tile of `depths x rows x cols` spatial points.
    fn input_elems(&self, depths: i64, rows: i64, cols: i64) -> i64 {
        let c = self.p.channels;
        if self.big_channel {
            depths * rows * cols * ceil_align(c, self.one_block)
        } else {
            depths * rows * ceil_align(cols * c, self.one_block)
        }
    }

    fn output_elems(&self, points: i64) -> i64 {
        let c = self.p.channels;
        if self.big_channel {
            points * ceil_align(c, self.one_block)
        } else {
            ceil_align(points * c, self.one_block)
        }
    }

    fn buffer_size(&self, input: [i64; 3], output: [i64; 3]) -> i64 {
        let in_buf = self.input_elems(input[D], input[H], input[W]);
        let out_points = output[D] * output[H] * output[W];
        let mut out_buf = self.output_elems(out_points);
        if self.p.stages_in_fp32() {
            out_buf *= 2;
        }
        let mut total = (in_buf + out_buf) * 2;
        if self.padded {
            total += in_buf;
        }
        if self.need_calc_divisor {
            total += ceil_align(out_points * 4, self.ub_block) / self.dtype_size;
        }
        total
    }

    fn buffer_capable(&self) -> bool {
        let out = self.p.output;
        let c = self.p.channels;
        // Windows of one channel row that fill a quarter vector register.
        let kernels = self.para / c;
        let (min_in, min_out) = if c > self.para {
            (self.eff, [1; 3])
        } else if out[W] > kernels {
            (
                [self.eff[D], self.eff[H], self.in_size(kernels, W)],
                [1, 1, kernels],
            )
        } else if out[W] * out[H] > kernels {
            let rows = kernels / out[W];
            (
                [self.eff[D], self.in_size(rows, H), self.in_size(out[W], W)],
                [1, rows, out[W]],
            )
        } else {
            let depths = kernels / (out[H] * out[W]);
            let min_out = [depths, out[H], out[W]];
            ([D, H, W].map(|a| self.in_size(min_out[a], a)), min_out)
        };
        self.buffer_size(min_in, min_out) <= self.available
    }

    fn split_depths(&self, rows: i64, cols: i64, available: i64) -> Result<UbSplit, TilingError> {
        let out = self.p.output;
        let mut depth = binary_search_max(1, out[D], |d| {
            self.buffer_size([self.in_size(d, D), rows, cols], [d, out[H], out[W]]) <= available
        });
        let plane = self.input_elems(1, rows, cols);
        if self.in_size(depth, D) * plane > MAX_INPUT_ELEMENTS {
            depth = self.out_size(MAX_INPUT_ELEMENTS / plane, D);
        }
        if depth <= 0 {
            return Err(self.too_small("depth", depth));
        }
        Ok(UbSplit {
            mode: SplitMode::Depths,
            n_factor: 1,
            factor: [depth, out[H], out[W]],
            loops: [self.p.batches, ceil_div(out[D], depth), 1, 1],
        })
    }

    fn split_rows(&self, depths: i64, cols: i64, available: i64) -> Result<UbSplit, TilingError> {
        let out = self.p.output;
        let mut rows = binary_search_max(1, out[H], |h| {
            self.buffer_size([depths, self.in_size(h, H), cols], [1, h, out[W]]) <= available
        });
        let row = self.input_elems(depths, 1, cols);
        if self.in_size(rows, H) * row > MAX_INPUT_ELEMENTS {
            rows = self.out_size(MAX_INPUT_ELEMENTS / row, H);
        }
        if rows <= 0 {
            return Err(self.too_small("row", rows));
        }
        Ok(UbSplit {
            mode: SplitMode::Rows,
            n_factor: 1,
            factor: [1, rows, out[W]],
            loops: [self.p.batches, out[D], ceil_div(out[H], rows), 1],
        })
    }

    fn split_cols(&self, depths: i64, rows: i64, available: i64) -> Result<UbSplit, TilingError> {
        let out = self.p.output;
        let fits = |w: i64| {
            self.buffer_size([depths, rows, self.in_size(w, W)], [1, 1, w]) <= available
        };
        if !fits(1) {
            return Err(self.too_small("column", 0));
        }
        let mut cols = binary_search_max(1, out[W], fits);
        if self.input_elems(depths, rows, self.in_size(cols, W)) > MAX_INPUT_ELEMENTS {
            let in_cols = floor_align(
                MAX_INPUT_ELEMENTS / (depths * rows * self.p.channels),
                self.one_block,
            );
            cols = self.out_size(in_cols, W);
        }
        if cols <= 0 {
            return Err(self.too_small("column", cols));
        }
        Ok(UbSplit {
            mode: SplitMode::Cols,
            n_factor: 1,
            factor: [1, 1, cols],
            loops: [self.p.batches, out[D], out[H], ceil_div(out[W], cols)],
        })
    }

    fn gather_mode(&self, split: &UbSplit) -> (GatherMode, i64) {
        if self.big_channel {
            return (GatherMode::NotGather, 0);
        }
        let mut max_gather = self.max_gather;
        let mut trai_two = 0;
        if split.outputs_per_loop() >= 2 * max_gather {
            max_gather *= 2;
            trai_two = 1;
        }
        let (out, c) = (self.p.output, self.p.channels);
        let mode = match split.mode {
            SplitMode::Batches if self.p.output_points() * c <= max_gather => {
                GatherMode::MultiBatch
            }
            SplitMode::Batches | SplitMode::Depths if out[H] * out[W] * c <= max_gather => {
                GatherMode::MultiDepth
            }
            m if out[W] * c <= max_gather && m != SplitMode::Cols => GatherMode::MultiRow,
            _ => GatherMode::SingleRow,
        };
        (mode, trai_two)
    }

    fn tile(&self, cores: i64) -> Result<(Pool3dNdhwcTilingData, i64), TilingError> {
        let p = self.p;
        let split = self.ub_split(cores)?;
        let (block_factor, block_tail, used) = spread_loops(split.total_loops(), cores);

        let mut in_ub = [D, H, W].map(|a| self.in_size(split.factor[a], a));
        let whole_axes: &[usize] = match split.mode {
            SplitMode::Batches => &[D, H, W],
            SplitMode::Depths => &[H, W],
            SplitMode::Rows => &[W],
            SplitMode::Cols => &[],
        };
        for &a in whole_axes {
            in_ub[a] = in_ub[a].max(p.padded_extent(a));
        }
        let in_ub_size = split.n_factor * self.input_elems(in_ub[D], in_ub[H], in_ub[W]);
        let out_points = split.factor.iter().product::<i64>();
        let out_ub_size = split.n_factor * self.output_elems(out_points);

        let row_elems = p.input[W] * p.channels;
        let once_copy_row = if split.loops[3] == 1 && row_elems > 0 && row_elems <= self.max_gather
        {
            (self.max_gather / row_elems).min(p.input[H])
        } else {
            0
        };

        let (gather_mode, use_trai_two) = self.gather_mode(&split);
        let divisor = p.divisor();
        let (divisor_mode, real_calc_divisor) = divisor_mode(
            p,
            divisor,
            &split,
            (block_factor, block_tail),
            self.need_calc_divisor,
            self.vector_reg_size,
            2,
        );
        let data = Pool3dNdhwcTilingData {
            input: p.input,
            output: p.output,
            n_out: p.batches,
            kernel: p.window.kernel,
            stride: p.window.stride,
            dilation: p.window.dilation,
            pads: p.window.pads,
            block_factor,
            block_tail,
            ub_factor_n: split.n_factor,
            out_ub_factor: split.factor,
            loops: split.loops,
            channels: p.channels,
            in_ub_size,
            out_ub_size,
            gather_mode: gather_mode as i64,
            once_copy_row,
            split_mode: split.mode as i64,
            divisor,
            divisor_mode,
            real_calc_divisor,
            use_trai_two,
            divisor_ub_size: self.divisor_ub,
        };
        Ok((data, used.max(1)))
    }

    fn tiling_key(&self, divisor: i64) -> u64 {
        let real_divisor = self.p.kind == PoolKind::Avg && divisor == 0;
        match (self.big_channel, real_divisor, self.padded) {
            (false, true, _) => KEY_SMALL_REAL_DIVISOR,
            (false, false, true) => KEY_SMALL_PADDING,
            (false, false, false) => KEY_SMALL,
            (true, true, _) => KEY_BIG_CHANNEL_REAL_DIVISOR,
            (true, false, true) => KEY_BIG_CHANNEL_PADDING,
            (true, false, false) => KEY_BIG_CHANNEL,
        }
    }
}

impl UbPlanner for Planner<'_> {
    fn params(&self) -> &PoolParams {
        self.p
    }

    fn dtype_size(&self) -> i64 {
        self.dtype_size
    }

    fn available(&self) -> i64 {
        self.available
    }

    fn split_once(&self, available: i64) -> Result<UbSplit, TilingError> {
        let out = self.p.output;
        let max_in = [D, H, W].map(|a| self.max_in(a));
        let (min_depths, min_rows) = (self.eff[D], self.eff[H]);

        let one_batch = self.buffer_size(max_in, out);
        let one_batch_input = self.input_elems(max_in[D], max_in[H], max_in[W]);
        if one_batch <= available && one_batch_input <= MAX_INPUT_ELEMENTS {
            return Ok(self.split_batches(one_batch, one_batch_input, available));
        }
        let one_plane = self.buffer_size(
            [min_depths, max_in[H], max_in[W]],
            [1, out[H], out[W]],
        );
        if one_plane <= available
            && self.input_elems(1, max_in[H], max_in[W]) <= MAX_INPUT_ELEMENTS
        {
            return self.split_depths(max_in[H], max_in[W], available);
        }
        let one_row = self.buffer_size([min_depths, min_rows, max_in[W]], [1, 1, out[W]]);
        if one_row <= available && max_in[W] <= MAX_INPUT_ELEMENTS {
            return self.split_rows(min_depths, max_in[W], available);
        }
        self.split_cols(min_depths, min_rows, available)
    }
}

impl TilingTemplate for Pool3dNdhwcSmallKernel {
    fn name(&self) -> &'static str {
        "Pool3dNdhwcSmallKernel"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        let Prepared::Pool3d(p) = ctx.prepared else {
            return false;
        };
        if !ctx.platform.is_regbase() || p.format != Format::NDHWC {
            return false;
        }
        if p.batches * p.output_points() * p.channels < ctx.platform.core_num {
            return false;
        }
        let w = &p.window;
        if (0..3).any(|a| p.output[a] > 1 && w.stride[a] >= 2 * w.effective_kernel(a)) {
            return false;
        }
        Planner::new(p, ctx.platform).buffer_capable()
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let p = ctx.prepared.pool3d(ctx.op())?;
        let planner = Planner::new(p, ctx.platform);
        let (data, used) = planner.tile(ctx.platform.core_num)?;
        let key = planner.tiling_key(data.divisor);
        info!(
            "{}: key {key}, split {}, gather {}, loops {:?}, {used} cores",
            ctx.op(),
            data.split_mode,
            data.gather_mode,
            data.loops
        );
        TilingPlan::new(ctx.op(), ctx.platform, key, used, data.to_blob(), WORKSPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::dispatcher::TilingDispatcher;
    use crate::ops::pool3d::tests::pool_workload;
    use crate::platform::tests::platform_910_95;
    use crate::registry::default_registry;
    use crate::workload::OperatorWorkload;

    fn tile(w: &OperatorWorkload) -> Result<TilingPlan, TilingError> {
        TilingDispatcher::new(default_registry(), platform_910_95()).tile(w)
    }

    fn padded_avg() -> OperatorWorkload {
        pool_workload(
            "AvgPool3D",
            Format::NDHWC,
            Dtype::Float32,
            2,
            8,
            [8, 8, 8],
            [3, 3, 3],
            [1, 1, 1],
            [1; 6],
        )
    }

    #[test]
    fn test_padded_avg_keys() {
        let plan = tile(&padded_avg().with_attr("count_include_pad", true)).unwrap();
        assert_eq!(plan.tiling_key, KEY_SMALL_PADDING);
        let data = Pool3dNdhwcTilingData::from_blob(&plan.blob).unwrap();
        assert_eq!(data.divisor, 27);
        assert_eq!(data.divisor_mode, 10);
        assert_eq!(data.channels, 8);

        let plan = tile(&padded_avg().with_attr("count_include_pad", false)).unwrap();
        assert_eq!(plan.tiling_key, KEY_SMALL_REAL_DIVISOR);
        let data = Pool3dNdhwcTilingData::from_blob(&plan.blob).unwrap();
        assert_eq!(data.divisor, 0);
        assert_eq!(data.divisor_ub_size, 2048);
    }

    #[test]
    fn test_wide_channel_does_not_gather() {
        let w = pool_workload(
            "MaxPool3D",
            Format::NDHWC,
            Dtype::Float16,
            2,
            32,
            [8, 16, 16],
            [2, 2, 2],
            [2, 2, 2],
            [0; 6],
        );
        let plan = tile(&w).unwrap();
        assert_eq!(plan.tiling_key, KEY_BIG_CHANNEL);
        let data = Pool3dNdhwcTilingData::from_blob(&plan.blob).unwrap();
        assert_eq!(data.gather_mode, GatherMode::NotGather as i64);
        assert_eq!(data.use_trai_two, 0);
        assert!(plan.block_dim >= 1 && plan.block_dim <= 64);
    }

    #[test]
    fn test_unpadded_small_channel_key() {
        // The NCDHW template also accepts this shape, so call this one directly.
        let w = pool_workload(
            "MaxPool3D",
            Format::NDHWC,
            Dtype::Float32,
            2,
            8,
            [8, 8, 8],
            [2, 2, 2],
            [2, 2, 2],
            [0; 6],
        );
        let platform = platform_910_95();
        let prepared = crate::ops::prepare(&w, &platform).unwrap();
        let ctx = TilingContext {
            workload: &w,
            platform: &platform,
            prepared: &prepared,
        };
        assert!(Pool3dNdhwcSmallKernel.is_capable(&ctx));
        let plan = Pool3dNdhwcSmallKernel.tile(&ctx).unwrap();
        assert_eq!(plan.tiling_key, KEY_SMALL);
        let data = Pool3dNdhwcTilingData::from_blob(&plan.blob).unwrap();
        assert_eq!(data.divisor, 8);
        assert_eq!(data.n_out, 2);
        let loops: i64 = data.loops.iter().product();
        assert_eq!(
            data.block_factor * 64 + data.block_tail,
            loops,
            "every loop is assigned to a core"
        );
    }

    #[test]
    fn test_declines_wide_stride() {
        let w = pool_workload(
            "MaxPool3D",
            Format::NDHWC,
            Dtype::Float32,
            4,
            8,
            [16, 16, 16],
            [2, 2, 2],
            [4, 4, 4],
            [0; 6],
        );
        let platform = platform_910_95();
        let prepared = crate::ops::prepare(&w, &platform).unwrap();
        let ctx = TilingContext {
            workload: &w,
            platform: &platform,
            prepared: &prepared,
        };
        assert!(!Pool3dNdhwcSmallKernel.is_capable(&ctx));
    }
}
