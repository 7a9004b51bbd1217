//! Small-kernel pooling on the regbase architecture for NCDHW tensors, and for NDHWC tensors
//! whose channel row fits a quarter vector register. Each batch plane is pooled independently
//! and outputs are gathered from UB by index.

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

const UB_RESERVED: i64 = 1024;
const KEY_NO_PADDING: u64 = 300001;
const KEY_PADDING: u64 = 300002;
const KEY_AVG_REAL_DIVISOR: u64 = 300003;
const KEY_NO_PADDING_SPARSE: u64 = 300004;
const MAX_DILATION: i64 = 3;
const SPARSE_W_THRESHOLD: i64 = 128;

crate::tiling_data! {
    pub struct Pool3dNcdhwTilingData {
        pub input: [i64; 3],
        pub output: [i64; 3],
        pub n_out: i64,
        pub channel: i64,
        pub kernel: [i64; 3],
        pub stride: [i64; 3],
        pub dilation: [i64; 3],
        pub pads: [i64; 6],
        pub divisor: i64,
        pub block_factor: i64,
        pub block_tail: i64,
        pub ub_factor_n: i64,
        pub out_ub_factor: [i64; 3],
        pub loops: [i64; 4],
        pub in_ub_size: i64,
        pub out_ub_size: i64,
        pub divisor_ub_size: i64,
        pub gather_mode: i64,
        pub split_mode: i64,
        pub divisor_mode: i64,
        pub real_calc_divisor: i64,
        pub use_trai_two: i64,
        pub sparse_mode: i64,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pool3dNcdhwSmallKernel;

/// Sizing state shared by the capability check and the tiling itself. All buffer sizes are in
/// elements of one channel.
struct Planner<'a> {
    p: &'a PoolParams,
    eff: [i64; 3],
    padded: bool,
    sparse: [bool; 3],
    channel: i64,
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
        let eff = [D, H, W].map(|a| p.window.effective_kernel(a));
        let padded = p.needs_padding();
        let channel = match p.format {
            Format::NCDHW => 1,
            _ => p.channels.max(1),
        };
        let dtype_size = p.dtype.size();
        let (divisor_ub, need_calc_divisor) = divisor_buffer(p, platform.ub_block_size);
        let sparse_axis = |a: usize| {
            !padded && p.window.stride[a] >= 2 * eff[a] && p.output[a] > 1
        };
        let sparse_w = match p.format {
            Format::NCDHW => {
                !padded
                    && p.window.stride[W] > eff[W] + SPARSE_W_THRESHOLD / dtype_size
                    && p.output[W] > 1
            }
            _ => sparse_axis(W),
        };
        Planner {
            p,
            eff,
            padded,
            sparse: [sparse_axis(D), sparse_axis(H), sparse_w],
            channel,
            dtype_size,
            one_block: platform.ub_block_size / dtype_size,
            para: platform.vector_reg_size / dtype_size / channel,
            max_gather: max_gather_elems(p.dtype, platform.vector_reg_size) / channel,
            ub_block: platform.ub_block_size,
            vector_reg_size: platform.vector_reg_size,
            divisor_ub,
            need_calc_divisor,
            available: (platform.ub_size - divisor_ub - UB_RESERVED) / dtype_size / channel,
        }
    }

    /// Input extent needed for `out` consecutive outputs along `axis`.
    fn in_size(&self, out: i64, axis: usize) -> i64 {
        if self.sparse[axis] {
            out * self.eff[axis]
        } else {
            (out - 1) * self.p.window.stride[axis] + self.eff[axis]
        }
    }

    /// Outputs computable from `input` consecutive input values along `axis`.
    fn out_size(&self, input: i64, axis: usize) -> i64 {
        let out = if self.sparse[axis] {
            input / self.eff[axis]
        } else {
            (input - self.eff[axis]) / self.p.window.stride[axis] + 1
        };
        out.min(self.p.output[axis])
    }

    /// A dense axis loaded whole also covers its padding.
    fn widen_to_padding(&self, input: i64, axis: usize) -> i64 {
        if self.sparse[axis] {
            input
        } else {
            input.max(self.p.padded_extent(axis))
        }
    }

    fn max_in(&self, axis: usize) -> i64 {
        self.widen_to_padding(self.in_size(self.p.output[axis], axis), axis)
    }

    fn buffer_size(&self, input: [i64; 3], output: [i64; 3]) -> i64 {
        let in_buf = input[D] * input[H] * ceil_align(input[W], self.one_block);
        let out_points = output[D] * output[H] * output[W];
        let mut out_buf = ceil_align(out_points, self.one_block);
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
        let max_in = [D, H, W].map(|a| self.max_in(a));
        let one_batch = self.buffer_size(
            [max_in[D], max_in[H], ceil_align(max_in[W], self.one_block)],
            out,
        );
        if one_batch == 0 {
            return false;
        }
        let out_points = self.p.output_points();
        if one_batch < self.available && self.available / one_batch * out_points >= self.para {
            return true;
        }

        // The smallest tile that still fills one vector register.
        let para = self.para;
        let mut min_in = self.eff;
        let mut min_out = [1; 3];
        let mut min_batch = 1;
        if out[W] > para {
            min_out[W] = para;
            min_in[W] = self.in_size(para, W);
        } else if out[H] * out[W] > para {
            min_out[W] = out[W];
            min_out[H] = para / out[W];
            min_in[W] = self.in_size(out[W], W);
            min_in[H] = self.in_size(min_out[H], H);
        } else if out_points > para {
            min_out = [para / (out[H] * out[W]), out[H], out[W]];
            min_in = [D, H, W].map(|a| self.in_size(min_out[a], a));
        } else {
            min_out = out;
            min_in = [D, H, W].map(|a| self.in_size(out[a], a));
            min_batch = (para / out_points).min(self.p.batches);
        }
        min_in[W] = ceil_align(min_in[W], self.one_block);
        min_batch * self.buffer_size(min_in, min_out) <= self.available
    }

    fn split_depths(&self, rows: i64, cols: i64, available: i64) -> Result<UbSplit, TilingError> {
        let out = self.p.output;
        let mut depth = binary_search_max(1, out[D], |d| {
            self.buffer_size([self.in_size(d, D), rows, cols], [d, out[H], out[W]]) <= available
        });
        let plane = rows * ceil_align(cols, self.one_block);
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
        let aligned_cols = ceil_align(cols, self.one_block);
        if depths * self.in_size(rows, H) * aligned_cols > MAX_INPUT_ELEMENTS {
            rows = self.out_size(MAX_INPUT_ELEMENTS / (depths * aligned_cols), H);
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
        if depths * rows * ceil_align(self.in_size(cols, W), self.one_block) > MAX_INPUT_ELEMENTS {
            let in_cols = floor_align(MAX_INPUT_ELEMENTS / (depths * rows), self.one_block);
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

    fn sparse_mode(&self, mode: SplitMode) -> i64 {
        let mut sparse = self.sparse;
        match mode {
            SplitMode::Cols => {
                sparse[H] = false;
                sparse[D] = false;
            }
            SplitMode::Rows => sparse[D] = false,
            _ => {}
        }
        (i64::from(sparse[D]) << 2) | (i64::from(sparse[H]) << 1) | i64::from(sparse[W])
    }

    fn gather_mode(&self, split: &UbSplit) -> (GatherMode, i64) {
        let mut max_gather = self.max_gather;
        let mut trai_two = 0;
        if split.outputs_per_loop() >= 2 * max_gather {
            max_gather *= 2;
            trai_two = 1;
        }
        let out = self.p.output;
        let mode = match split.mode {
            SplitMode::Batches if self.p.output_points() <= max_gather => GatherMode::MultiBatch,
            SplitMode::Batches | SplitMode::Depths if out[H] * out[W] <= max_gather => {
                GatherMode::MultiDepth
            }
            m if out[W] <= max_gather && m != SplitMode::Cols => GatherMode::MultiRow,
            _ => GatherMode::SingleRow,
        };
        (mode, trai_two)
    }

    fn tile(&self, cores: i64) -> Result<(Pool3dNcdhwTilingData, i64), TilingError> {
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
            in_ub[a] = self.widen_to_padding(in_ub[a], a);
        }
        let in_ub_size = split.n_factor
            * in_ub[D]
            * in_ub[H]
            * ceil_align(in_ub[W], self.one_block)
            * self.channel;
        let mut out_ub_size =
            ceil_align(split.outputs_per_loop(), self.one_block) * self.channel;
        if p.stages_in_fp32() {
            out_ub_size *= 2;
        }
        let divisor_ub_size = if self.need_calc_divisor {
            ceil_align(split.outputs_per_loop() * 4, self.ub_block)
        } else {
            self.divisor_ub
        };

        let sparse_mode = self.sparse_mode(split.mode);
        let (gather_mode, use_trai_two) = self.gather_mode(&split);
        let divisor = p.divisor();
        let (divisor_mode, real_calc_divisor) = divisor_mode(
            p,
            divisor,
            &split,
            (block_factor, block_tail),
            self.need_calc_divisor,
            self.vector_reg_size,
            1,
        );
        let data = Pool3dNcdhwTilingData {
            input: p.input,
            output: p.output,
            n_out: p.batches,
            channel: self.channel,
            kernel: p.window.kernel,
            stride: p.window.stride,
            dilation: p.window.dilation,
            pads: p.window.pads,
            divisor,
            block_factor,
            block_tail,
            ub_factor_n: split.n_factor,
            out_ub_factor: split.factor,
            loops: split.loops,
            in_ub_size,
            out_ub_size,
            divisor_ub_size,
            gather_mode: gather_mode as i64,
            split_mode: split.mode as i64,
            divisor_mode,
            real_calc_divisor,
            use_trai_two,
            sparse_mode,
        };
        Ok((data, used.max(1)))
    }

    fn tiling_key(&self, data: &Pool3dNcdhwTilingData) -> u64 {
        if self.padded {
            if self.p.kind == PoolKind::Avg && data.divisor == 0 {
                KEY_AVG_REAL_DIVISOR
            } else {
                KEY_PADDING
            }
        } else if data.sparse_mode != 0 {
            KEY_NO_PADDING_SPARSE
        } else {
            KEY_NO_PADDING
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

    /// Keeps as many whole axes resident as `available` allows, outermost first.
    fn split_once(&self, available: i64) -> Result<UbSplit, TilingError> {
        let out = self.p.output;
        let max_in = [D, H, W].map(|a| self.max_in(a));
        let cols = ceil_align(max_in[W], self.one_block);
        let (min_depths, min_rows) = (self.eff[D], self.eff[H]);

        let allow_batches = !(self.sparse[W] && (self.sparse[D] || self.sparse[H]));
        let allow_depths = !(self.sparse[W] && self.sparse[H]);

        let one_batch = self.buffer_size([max_in[D], max_in[H], cols], out);
        let one_batch_input = max_in[D] * max_in[H] * cols;
        if allow_batches && one_batch <= available && one_batch_input <= MAX_INPUT_ELEMENTS {
            return Ok(self.split_batches(one_batch, one_batch_input, available));
        }
        let one_plane = self.buffer_size([min_depths, max_in[H], cols], [1, out[H], out[W]]);
        if allow_depths
            && one_plane <= available
            && min_depths * max_in[H] * cols <= MAX_INPUT_ELEMENTS
        {
            return self.split_depths(max_in[H], cols, available);
        }
        let one_row = self.buffer_size([min_depths, min_rows, cols], [1, 1, out[W]]);
        if one_row <= available && min_depths * min_rows * cols <= MAX_INPUT_ELEMENTS {
            return self.split_rows(min_depths, cols, available);
        }
        self.split_cols(min_depths, min_rows, available)
    }
}

impl TilingTemplate for Pool3dNcdhwSmallKernel {
    fn name(&self) -> &'static str {
        "Pool3dNcdhwSmallKernel"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        let Prepared::Pool3d(p) = ctx.prepared else {
            return false;
        };
        if !ctx.platform.is_regbase() {
            return false;
        }
        let padded = p.needs_padding();
        let supported = match p.format {
            Format::NCDHW => true,
            Format::NDHWC => {
                p.dtype.size() * p.channels < ctx.platform.vector_reg_size / 4 && !padded
            }
            _ => false,
        };
        if !supported {
            return false;
        }
        let w = &p.window;
        if [D, H]
            .iter()
            .any(|&a| w.dilation[a] >= MAX_DILATION && w.stride[a] >= MAX_DILATION)
        {
            return false;
        }
        if p.batches * p.output_points() < ctx.platform.core_num {
            return false;
        }
        if padded
            && [D, H]
                .iter()
                .any(|&a| p.output[a] > 1 && w.stride[a] >= 2 * w.effective_kernel(a))
        {
            return false;
        }
        Planner::new(p, ctx.platform).buffer_capable()
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let p = ctx.prepared.pool3d(ctx.op())?;
        let planner = Planner::new(p, ctx.platform);
        let (data, used) = planner.tile(ctx.platform.core_num)?;
        let key = planner.tiling_key(&data);
        info!(
            "{}: key {key}, split {}, gather {}, loops {:?}, {} cores",
            ctx.op(),
            data.split_mode,
            data.gather_mode,
            data.loops,
            used
        );
        TilingPlan::new(
            ctx.op(),
            ctx.platform,
            key,
            used,
            data.to_blob(),
            WORKSPACE,
        )
    }
}
