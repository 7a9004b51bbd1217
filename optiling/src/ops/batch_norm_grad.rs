//! Tiling for BatchNormGrad in training mode.
//!
//! Every layout is viewed as `(r1, a, r0)`: `a` is the channel axis being normalised, `r1` the
//! reduced axes before it and `r0` the reduced axes after it. Channel-last layouts have `r0 == 1`
//! and are handled by the "RA" templates; the rest go to the "RAR" templates. Each pair has a
//! full-load kernel for slices that fit UB and a recompute kernel that streams the reduction.

use std::str::FromStr;

use log::{debug, info};

use crate::common::{num_elements, Dim, Dtype, Format, Shape};
use crate::error::TilingError;
use crate::ops::Prepared;
use crate::plan::TilingPlan;
use crate::platform::MemoryHierarchyDescriptor;
use crate::registry::{TilingContext, TilingTemplate};
use crate::utils::{binary_search_max, bit_length, ceil_align, ceil_div, prev_power_of_two};
use crate::workload::OperatorWorkload;

const DEFAULT_EPSILON: f64 = 1e-4;
const WORKSPACE: i64 = 16 * 1024 * 1024;
const FP32_SIZE: i64 = 4;
const DOUBLE_BUFFER: i64 = 2;
const MIN_BYTES_PER_CORE: i64 = 1024;
/// mean, rstd, gamma, dbeta and dgamma each reserve one block for alignment.
const RESERVED_BLOCKS: i64 = 5;
/// UB kept aside by the recompute kernel for the cross-loop binary-add buffers.
const RECOMPUTE_EXTRA_UB: i64 = 7 * 1024 + 512;

const KEY_RAR_FULL_LOAD: u64 = 10000000;
const KEY_RA_FULL_LOAD: u64 = 20000000;
const KEY_RAR_RECOMPUTE: u64 = 30000000;
const KEY_RA_RECOMPUTE: u64 = 40000000;
const KEY_SPLIT_R1: u64 = 1000000;
const KEY_SPLIT_R0: u64 = 2000000;

const RA_BASIC_FACTOR: i64 = 64;
const RA_THRESHOLD_B32: i64 = 958;
const RA_THRESHOLD_B16: i64 = 766;

/// Accepted `(dy, x, weight, mean, rstd, reserve)` dtype combinations.
const VALID_DTYPES: [[Dtype; 6]; 3] = {
    use Dtype::{Bfloat16 as B, Float16 as H, Float32 as F};
    [[F, F, F, F, F, F], [H, H, F, F, F, F], [B, B, F, F, F, F]]
};

/// Validated BatchNormGrad workload.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormGradParams {
    pub format: Format,
    pub dtype: Dtype,
    pub weight_dtype: Dtype,
    pub r1: i64,
    pub a: i64,
    pub r0: i64,
    pub epsilon: f32,
}

fn ensure_not_scalar(shape: &Shape) -> Shape {
    if shape.is_empty() {
        crate::shape![1]
    } else {
        shape.clone()
    }
}

/// Maps a layout onto `(r1, a, r0)`. A lone reduce axis is always reported as `r0`.
fn reduce_view(format: Format, shape: &[Dim]) -> (i64, i64, i64) {
    let (r1, a, r0) = match format {
        Format::NCHW | Format::NCDHW => (shape[0], shape[1], shape[2..].iter().product()),
        _ => {
            let last = shape.len() - 1;
            (shape[..last].iter().product(), shape[last], 1)
        }
    };
    if r1 != 1 && a == 1 && r0 == 1 {
        (1, a, r1)
    } else {
        (r1, a, r0)
    }
}

fn check_big_shapes(workload: &OperatorWorkload) -> Result<(Format, Shape), TilingError> {
    let op = workload.op_type.as_str();
    let dy = workload.input(0, "dy")?;
    let x = workload.input(1, "x")?;
    let dx = workload.output(0, "dx")?;
    let dy_shape = ensure_not_scalar(&dy.shape);
    let x_shape = ensure_not_scalar(&x.shape);
    let dx_shape = ensure_not_scalar(&dx.shape);

    if dy_shape.len() != x_shape.len() || dy_shape.len() != dx_shape.len() {
        return Err(TilingError::InvalidRank(
            op.to_string(),
            format!(
                "dy {dy_shape:?}, x {x_shape:?} and dx {dx_shape:?} must have the same rank"
            ),
        ));
    }
    if dy.format != x.format || dy.format != dx.format {
        return Err(TilingError::UnsupportedDtype(
            op.to_string(),
            format!(
                "dy ({}), x ({}) and dx ({}) must share one format",
                dy.format, x.format, dx.format
            ),
        ));
    }
    let rank = match dy.format {
        Format::NCHW | Format::NHWC => 4,
        Format::NCDHW | Format::NDHWC => 5,
        other => {
            return Err(TilingError::UnsupportedDtype(
                op.to_string(),
                format!("format {other} is not supported"),
            ))
        }
    };
    if dy_shape.len() != rank {
        return Err(TilingError::InvalidRank(
            op.to_string(),
            format!("dy {dy_shape:?} must have rank {rank} in {}", dy.format),
        ));
    }
    if dy_shape != x_shape || dy_shape != dx_shape {
        return Err(TilingError::ShapeMismatch(
            op.to_string(),
            format!("dy {dy_shape:?}, x {x_shape:?} and dx {dx_shape:?} must be equal"),
        ));
    }
    if let Some(pos) = dy_shape.iter().position(|&d| d <= 0) {
        return Err(TilingError::InvalidShape(
            op.to_string(),
            format!("dim {pos} of dy {dy_shape:?} must be positive"),
        ));
    }
    Ok((dy.format, dy_shape))
}

fn check_channel_shapes(workload: &OperatorWorkload, a: i64) -> Result<(), TilingError> {
    let op = workload.op_type.as_str();
    let tensors = [
        ("weight", workload.input(2, "weight")?),
        ("mean", workload.input(3, "mean")?),
        ("rstd", workload.input(4, "rstd")?),
        ("dweight", workload.output(1, "dweight")?),
        ("dbias", workload.output(2, "dbias")?),
    ];
    for (name, desc) in tensors {
        if desc.rank() != 1 {
            return Err(TilingError::InvalidRank(
                op.to_string(),
                format!("{name} {:?} must be 1-D", desc.shape),
            ));
        }
        if desc.shape[0] != a {
            return Err(TilingError::ShapeMismatch(
                op.to_string(),
                format!("{name} {:?} must hold {a} channels", desc.shape),
            ));
        }
    }
    Ok(())
}

fn check_dtypes(workload: &OperatorWorkload) -> Result<(Dtype, Dtype), TilingError> {
    let op = workload.op_type.as_str();
    let mut given = vec![];
    for (idx, name) in ["dy", "x", "weight", "mean", "rstd"].into_iter().enumerate() {
        given.push(workload.input(idx, name)?.dtype);
    }
    let reserve = workload.optional_input(5).map(|t| t.dtype);
    let supported = VALID_DTYPES.iter().any(|row| {
        row[..5] == given[..] && reserve.map_or(true, |dtype| dtype == row[5])
    });
    if !supported {
        return Err(TilingError::UnsupportedDtype(
            op.to_string(),
            format!("input dtypes {given:?} with reserve {reserve:?}"),
        ));
    }

    let (dtype, weight_dtype) = (given[0], given[2]);
    for (idx, name, expected) in [
        (0, "dx", dtype),
        (1, "dweight", weight_dtype),
        (2, "dbias", weight_dtype),
    ] {
        let got = workload.output(idx, name)?.dtype;
        if got != expected {
            return Err(TilingError::UnsupportedDtype(
                op.to_string(),
                format!("{name} must be {expected}, got {got}"),
            ));
        }
    }
    Ok((dtype, weight_dtype))
}

/// Checks attributes, shapes and dtypes and derives the `(r1, a, r0)` view.
pub fn prepare(
    workload: &OperatorWorkload,
    _platform: &MemoryHierarchyDescriptor,
) -> Result<Prepared, TilingError> {
    let op = workload.op_type.as_str();
    workload.check_arity(5, 6, 3)?;
    if !workload.attr_bool("is_training", true)? {
        return Err(workload.invalid_attr("only is_training = true is supported"));
    }

    let (format, shape) = check_big_shapes(workload)?;
    num_elements(op, &shape)?;
    let (r1, a, r0) = reduce_view(format, &shape);
    check_channel_shapes(workload, a)?;
    let (dtype, weight_dtype) = check_dtypes(workload)?;

    let raw_format = workload.attr_str("data_format", "NCHW")?;
    let declared = Format::from_str(raw_format)
        .map_err(|_| workload.invalid_attr(format!("unsupported data_format {raw_format}")))?;
    if declared != format {
        debug!("{op}: data_format {declared} differs from tensor format {format}, using {format}");
    }
    let epsilon = workload.attr_float("epsilon", DEFAULT_EPSILON)? as f32;

    Ok(Prepared::BatchNormGrad(BatchNormGradParams {
        format,
        dtype,
        weight_dtype,
        r1,
        a,
        r0,
        epsilon,
    }))
}

/// The core split shared by every template: `block_num` cores, each handling at least
/// [MIN_BYTES_PER_CORE] bytes of per-channel work when possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChannelSplit {
    block_num: i64,
    tail_block_num: i64,
    former_block_dim: i64,
    tail_block_dim: i64,
}

fn channel_split(a: i64, bytes_per_channel: i64, cores: i64) -> ChannelSplit {
    let min_per_core = ceil_div(MIN_BYTES_PER_CORE, bytes_per_channel).max(1);
    let block_num = if min_per_core * cores > a {
        (a / min_per_core).max(1)
    } else {
        cores
    };
    ChannelSplit {
        block_num,
        tail_block_num: a % block_num,
        former_block_dim: a / block_num,
        tail_block_dim: a / block_num + 1,
    }
}

/// Splits a binary-add reduction of `quotient` fp32 values into `(k, last_num)` rounds of
/// vector-length `vl` adds.
fn binary_add(quotient: i64, vl: i64) -> (i64, i64) {
    let vcadd_num = quotient / vl;
    if vcadd_num <= vl {
        (0, vcadd_num)
    } else {
        ((vcadd_num / vl).trailing_zeros() as i64, vl)
    }
}

fn fp32_align(elems: i64, block: i64) -> i64 {
    ceil_align(elems * FP32_SIZE, block) / FP32_SIZE
}

crate::tiling_data! {
    pub struct BatchNormGradRarFullLoadTilingData {
        pub r1: i64,
        pub a: i64,
        pub r0: i64,
        pub r_align: i64,
        pub block_num: i64,
        pub tail_block_num: i64,
        pub former_block_dim: i64,
        pub tail_block_dim: i64,
        pub binary_add_quotient: i64,
        pub binary_add_k: i64,
        pub binary_add_last_num: i64,
        pub former_ub_dim: i64,
        pub ub_loop_of_former_block: i64,
        pub ub_tail_of_former_block: i64,
        pub ub_loop_of_tail_block: i64,
        pub ub_tail_of_tail_block: i64,
    }
}

crate::tiling_data! {
    pub struct BatchNormGradRarRecomputeTilingData {
        pub r1: i64,
        pub a: i64,
        pub r0: i64,
        pub r_align: i64,
        pub block_num: i64,
        pub tail_block_num: i64,
        pub former_block_dim: i64,
        pub tail_block_dim: i64,
        pub general_bin_add_quotient: i64,
        pub general_bin_add_k: i64,
        pub general_bin_add_last_num: i64,
        pub tail_bin_add_quotient: i64,
        pub tail_bin_add_k: i64,
        pub tail_bin_add_last_num: i64,
        pub ub_r_factor: i64,
        pub ub_r_factor_align: i64,
        pub ub_r_loop_num: i64,
        pub ub_r_tail: i64,
        pub ub_r_tail_factor: i64,
        pub ub_r_tail_factor_align: i64,
        pub ub_r_tail_loop_num: i64,
        pub ub_r_tail_tail: i64,
        pub ub_r_tail_tail_factor: i64,
        pub ub_r_tail_tail_factor_align: i64,
        pub ub_r_tail_tail_loop_num: i64,
    }
}

crate::tiling_data! {
    pub struct BatchNormGradRaFullLoadTilingData {
        pub r1: i64,
        pub a: i64,
        pub block_dim: i64,
        pub main_block_factor: i64,
        pub tail_block_factor: i64,
        pub main_block_count: i64,
        pub tail_block_count: i64,
        pub main_a_loop_factor: i64,
        pub main_a_loop_factor_aligned: i64,
        pub tail_a_loop_factor: i64,
        pub tail_a_loop_factor_aligned: i64,
        pub power2k: i64,
        pub reduce_loop_times: i64,
        pub reduce_recursion_loop: i64,
        pub fold_loop_step: [i64; 3],
        pub fold_loop_offset: [i64; 3],
    }
}

crate::tiling_data! {
    pub struct BatchNormGradRaRecomputeTilingData {
        pub r1: i64,
        pub a: i64,
        pub block_dim: i64,
        pub main_block_factor: i64,
        pub tail_block_factor: i64,
        pub main_block_count: i64,
        pub tail_block_count: i64,
        pub a_loop_factor: i64,
        pub a_loop_factor_aligned: i64,
        pub r_loop_factor: i64,
        pub r_loop_times: i64,
        pub r_loop_tail: i64,
        pub binary_fold_point: i64,
        pub binary_block_count: i64,
        pub binary_tail_block: i64,
        pub cache_buffer_count: i64,
        pub reciprocal: f32,
        pub epsilon: f32,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchNormGradRarFullLoad;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchNormGradRaFullLoad;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchNormGradRarRecompute;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchNormGradRaRecompute;

/// UB demand of one channel slice in the RAR full-load kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FullLoadBudget {
    r_align: i64,
    once_proc: i64,
    reserve: i64,
    quotient: i64,
    binary_add_ub: i64,
}

fn full_load_budget(
    p: &BatchNormGradParams,
    platform: &MemoryHierarchyDescriptor,
) -> Option<FullLoadBudget> {
    if p.r0 == 1 {
        return None;
    }
    let block = platform.ub_block_size;
    let vl = platform.vector_reg_size / FP32_SIZE;
    let dts = p.dtype.size();
    let reduce = p.r1 * p.r0;
    let r_align = ceil_align(reduce * dts, block) / dts;
    let dy_ub = r_align * dts;
    // x is widened to fp32 in place, so its buffer is aligned to two blocks.
    let x_ub = ceil_align(r_align * FP32_SIZE, 2 * block);
    let once_proc = dy_ub + x_ub + 4 * FP32_SIZE + p.weight_dtype.size();
    let reserve = RESERVED_BLOCKS * block;

    let mut quotient = prev_power_of_two(reduce);
    if quotient == reduce {
        quotient /= 2;
    }
    let binary_add_ub = ceil_align(quotient / vl * FP32_SIZE, block);
    if (once_proc + reserve) * DOUBLE_BUFFER + binary_add_ub > platform.ub_size {
        debug!(
            "rar full load: slice needs {once_proc} bytes, binary add {binary_add_ub}, UB {}",
            platform.ub_size
        );
        return None;
    }
    Some(FullLoadBudget {
        r_align,
        once_proc,
        reserve,
        quotient,
        binary_add_ub,
    })
}

impl TilingTemplate for BatchNormGradRarFullLoad {
    fn name(&self) -> &'static str {
        "BatchNormGradRarFullLoad"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        match ctx.prepared {
            Prepared::BatchNormGrad(p) => full_load_budget(p, ctx.platform).is_some(),
            _ => false,
        }
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let op = ctx.op();
        let p = ctx.prepared.batch_norm_grad(op)?;
        let platform = ctx.platform;
        let budget = full_load_budget(p, platform).ok_or_else(|| {
            TilingError::ResourceExceeded(
                op.to_string(),
                format!("a {}x{} slice does not fit UB", p.r1, p.r0),
            )
        })?;
        let split = channel_split(p.a, budget.once_proc, platform.core_num);

        let half_ub = (platform.ub_size - budget.binary_add_ub) / DOUBLE_BUFFER;
        let former_ub_dim = (half_ub - budget.reserve) / budget.once_proc;
        if former_ub_dim <= 0 {
            return Err(TilingError::ResourceExceeded(
                op.to_string(),
                format!("UB of {} bytes holds no channel slice", platform.ub_size),
            ));
        }
        let ub_loops = |dim: i64| {
            let loops = ceil_div(dim, former_ub_dim);
            let tail = if dim > 0 {
                dim - former_ub_dim * (loops - 1)
            } else {
                0
            };
            (loops, tail)
        };
        let (former_loops, former_tail) = ub_loops(split.former_block_dim);
        let (tail_loops, tail_tail) = ub_loops(split.tail_block_dim);
        let (k, last_num) = binary_add(budget.quotient, platform.vector_reg_size / FP32_SIZE);

        let data = BatchNormGradRarFullLoadTilingData {
            r1: p.r1,
            a: p.a,
            r0: p.r0,
            r_align: budget.r_align,
            block_num: split.block_num,
            tail_block_num: split.tail_block_num,
            former_block_dim: split.former_block_dim,
            tail_block_dim: split.tail_block_dim,
            binary_add_quotient: budget.quotient,
            binary_add_k: k,
            binary_add_last_num: last_num,
            former_ub_dim,
            ub_loop_of_former_block: former_loops,
            ub_tail_of_former_block: former_tail,
            ub_loop_of_tail_block: tail_loops,
            ub_tail_of_tail_block: tail_tail,
        };
        info!(
            "{op}: full load r1={} a={} r0={}, {} cores, {former_ub_dim} channels per UB pass",
            p.r1, p.a, p.r0, split.block_num
        );
        TilingPlan::new(
            op,
            platform,
            KEY_RAR_FULL_LOAD,
            split.block_num,
            data.to_blob(),
            WORKSPACE,
        )
    }
}

/// How the recompute kernel walks the reduce extent in UB-sized chunks. Chunks that exceed
/// half the buffer are halved for the tail loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ReduceChunks {
    factor: i64,
    factor_align: i64,
    loop_num: i64,
    tail: i64,
    tail_factor: i64,
    tail_factor_align: i64,
    tail_loop_num: i64,
    tail_tail: i64,
    tail_tail_factor: i64,
    tail_tail_factor_align: i64,
    tail_tail_loop_num: i64,
}

fn recompute_buffer(platform: &MemoryHierarchyDescriptor) -> i64 {
    (platform.ub_size - RECOMPUTE_EXTRA_UB) / 2 / DOUBLE_BUFFER
}

/// Whether a whole `r0` row (and its fp32 copy) fits the recompute buffer.
fn r0_fits(p: &BatchNormGradParams, platform: &MemoryHierarchyDescriptor) -> bool {
    ceil_align(p.r0 * FP32_SIZE * 2, platform.ub_block_size) <= recompute_buffer(platform)
}

fn finish_chunks(
    mut c: ReduceChunks,
    total: i64,
    halved_factor: i64,
    buf: i64,
    block: i64,
) -> ReduceChunks {
    let halve = c.factor_align * FP32_SIZE > buf / 2;
    c.tail = total - c.factor * c.loop_num;
    c.tail_factor = if halve { halved_factor } else { c.factor };
    c.tail_factor_align = fp32_align(c.tail_factor, block);
    c.tail_loop_num = if halve {
        c.tail / c.factor * 2
    } else {
        c.tail / c.factor
    };
    c.tail_tail = c.tail - c.tail_loop_num * c.tail_factor;
    c.tail_tail_factor = c.tail_factor;
    c.tail_tail_factor_align = c.tail_factor_align;
    c.tail_tail_loop_num = if halve { 2 } else { 1 };
    c
}

/// Chunks along `r1` with whole `r0` rows per chunk.
fn split_r1_chunks(p: &BatchNormGradParams, buf: i64, block: i64) -> ReduceChunks {
    let reduce = p.r1 * p.r0;
    if ceil_align(reduce * FP32_SIZE, block) <= buf {
        return ReduceChunks {
            factor: reduce,
            factor_align: fp32_align(reduce, block),
            loop_num: 1,
            ..Default::default()
        };
    }
    let r1_factor = ((buf / (p.r0 * FP32_SIZE)) & !1).max(2);
    let factor = r1_factor * p.r0;
    let chunks = ReduceChunks {
        factor,
        factor_align: fp32_align(factor, block),
        loop_num: prev_power_of_two(p.r1 / r1_factor).max(1),
        ..Default::default()
    };
    finish_chunks(chunks, reduce, factor / 2, buf, block)
}

/// Chunks inside a single `r0` row.
fn split_r0_chunks(p: &BatchNormGradParams, buf: i64, block: i64) -> ReduceChunks {
    let r0_factor = p.r0 * FP32_SIZE / buf;
    let factor = p.r0.min(buf / FP32_SIZE);
    let chunks = ReduceChunks {
        factor,
        factor_align: fp32_align(factor, block),
        loop_num: prev_power_of_two(r0_factor).max(1),
        ..Default::default()
    };
    finish_chunks(chunks, p.r0, (factor + 1) / 2, buf, block)
}

impl TilingTemplate for BatchNormGradRarRecompute {
    fn name(&self) -> &'static str {
        "BatchNormGradRarRecompute"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        matches!(ctx.prepared, Prepared::BatchNormGrad(p) if p.r0 != 1)
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let op = ctx.op();
        let p = ctx.prepared.batch_norm_grad(op)?;
        let platform = ctx.platform;
        let (block, vl) = (platform.ub_block_size, platform.vector_reg_size / FP32_SIZE);
        let buf = recompute_buffer(platform);
        if buf < block {
            return Err(TilingError::ResourceExceeded(
                op.to_string(),
                format!("UB of {} bytes leaves no binary-add buffer", platform.ub_size),
            ));
        }
        let split = channel_split(p.a, i64::MAX, platform.core_num);
        let (sub_key, chunks) = if r0_fits(p, platform) {
            (KEY_SPLIT_R1, split_r1_chunks(p, buf, block))
        } else {
            (KEY_SPLIT_R0, split_r0_chunks(p, buf, block))
        };
        let general_quotient = prev_power_of_two(chunks.factor);
        let tail_quotient = prev_power_of_two(chunks.tail_factor);
        let (general_k, general_last) = binary_add(general_quotient, vl);
        let (tail_k, tail_last) = binary_add(tail_quotient, vl);

        let data = BatchNormGradRarRecomputeTilingData {
            r1: p.r1,
            a: p.a,
            r0: p.r0,
            r_align: 0,
            block_num: split.block_num,
            tail_block_num: split.tail_block_num,
            former_block_dim: split.former_block_dim,
            tail_block_dim: split.tail_block_dim,
            general_bin_add_quotient: general_quotient,
            general_bin_add_k: general_k,
            general_bin_add_last_num: general_last,
            tail_bin_add_quotient: tail_quotient,
            tail_bin_add_k: tail_k,
            tail_bin_add_last_num: tail_last,
            ub_r_factor: chunks.factor,
            ub_r_factor_align: chunks.factor_align,
            ub_r_loop_num: chunks.loop_num,
            ub_r_tail: chunks.tail,
            ub_r_tail_factor: chunks.tail_factor,
            ub_r_tail_factor_align: chunks.tail_factor_align,
            ub_r_tail_loop_num: chunks.tail_loop_num,
            ub_r_tail_tail: chunks.tail_tail,
            ub_r_tail_tail_factor: chunks.tail_tail_factor,
            ub_r_tail_tail_factor_align: chunks.tail_tail_factor_align,
            ub_r_tail_tail_loop_num: chunks.tail_tail_loop_num,
        };
        let key = KEY_RAR_RECOMPUTE + sub_key;
        debug!("{op}: {chunks:?}");
        info!(
            "{op}: recompute key {key}, r1={} a={} r0={}, {} cores",
            p.r1, p.a, p.r0, split.block_num
        );
        TilingPlan::new(op, platform, key, split.block_num, data.to_blob(), WORKSPACE)
    }
}

/// Channel split of the RA kernels: at least one block of channels per core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChannelBlocks {
    block_dim: i64,
    main_factor: i64,
    tail_factor: i64,
    main_count: i64,
    tail_count: i64,
}

fn channel_blocks(a: i64, dts: i64, platform: &MemoryHierarchyDescriptor) -> ChannelBlocks {
    let min_factor = platform.ub_block_size / dts;
    let factor = ceil_div(a, platform.core_num).max(min_factor);
    let block_dim = ceil_div(a, factor);
    let factor = ceil_div(a, block_dim);
    let main_count = a / factor;
    let tail_factor = a - main_count * factor;
    ChannelBlocks {
        block_dim,
        main_factor: factor,
        tail_factor,
        main_count,
        tail_count: i64::from(tail_factor > 0),
    }
}

fn ra_full_load_threshold(p: &BatchNormGradParams) -> i64 {
    if p.dtype == Dtype::Float32 {
        RA_THRESHOLD_B32
    } else {
        RA_THRESHOLD_B16
    }
}

impl TilingTemplate for BatchNormGradRaFullLoad {
    fn name(&self) -> &'static str {
        "BatchNormGradRaFullLoad"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        matches!(ctx.prepared, Prepared::BatchNormGrad(p)
            if p.r0 == 1 && p.r1 < ra_full_load_threshold(p))
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let op = ctx.op();
        let p = ctx.prepared.batch_norm_grad(op)?;
        let platform = ctx.platform;
        let (dts, wts) = (p.dtype.size(), p.weight_dtype.size());
        let blocks = channel_blocks(p.a, dts, platform);
        let power2k = prev_power_of_two(p.r1 - 1);

        let ub_bytes = |factor: i64| {
            let aligned = ceil_align(factor * dts, platform.ub_block_size) / dts;
            p.r1 * aligned * dts * DOUBLE_BUFFER * 3
                + aligned * FP32_SIZE * DOUBLE_BUFFER * 2
                + aligned * wts * DOUBLE_BUFFER * 3
                + power2k * aligned * FP32_SIZE * 2
        };
        let loop_factor = |block_factor: i64| {
            if block_factor <= 0 || ub_bytes(1) > platform.ub_size {
                return (0, 0);
            }
            let factor = binary_search_max(1, block_factor, |f| ub_bytes(f) <= platform.ub_size);
            (factor, ceil_align(factor * dts, platform.ub_block_size) / dts)
        };
        let (main_loop, main_loop_aligned) = loop_factor(blocks.main_factor);
        let (tail_loop, tail_loop_aligned) = loop_factor(blocks.tail_factor);
        if main_loop == 0 {
            return Err(TilingError::ResourceExceeded(
                op.to_string(),
                format!("{} rows of one channel block do not fit UB", p.r1),
            ));
        }

        let reduce_loop_times = power2k / 2;
        let reduce_recursion_loop = (bit_length(reduce_loop_times as u64) as i64 - 2).max(0);
        let step1 = (p.r1 - power2k) / 2;
        let step2 = if p.r1 > 1 { p.r1 % 2 } else { 0 };
        let step3 = (reduce_loop_times - step1 - step2).max(0);

        let data = BatchNormGradRaFullLoadTilingData {
            r1: p.r1,
            a: p.a,
            block_dim: blocks.block_dim,
            main_block_factor: blocks.main_factor,
            tail_block_factor: blocks.tail_factor,
            main_block_count: blocks.main_count,
            tail_block_count: blocks.tail_count,
            main_a_loop_factor: main_loop,
            main_a_loop_factor_aligned: main_loop_aligned,
            tail_a_loop_factor: tail_loop,
            tail_a_loop_factor_aligned: tail_loop_aligned,
            power2k,
            reduce_loop_times,
            reduce_recursion_loop,
            fold_loop_step: [step1, step2, step3],
            fold_loop_offset: [power2k, step1 * 2, (step1 + step2) * 2],
        };
        info!(
            "{op}: channel-last full load r1={} a={}, {} cores, {main_loop} channels per pass",
            p.r1, p.a, blocks.block_dim
        );
        TilingPlan::new(
            op,
            platform,
            KEY_RA_FULL_LOAD,
            blocks.block_dim,
            data.to_blob(),
            WORKSPACE,
        )
    }
}

impl TilingTemplate for BatchNormGradRaRecompute {
    fn name(&self) -> &'static str {
        "BatchNormGradRaRecompute"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        matches!(ctx.prepared, Prepared::BatchNormGrad(p) if p.r0 == 1)
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let op = ctx.op();
        let p = ctx.prepared.batch_norm_grad(op)?;
        let blocks = channel_blocks(p.a, p.dtype.size(), ctx.platform);

        let r_loop_times = p.r1 / RA_BASIC_FACTOR;
        let binary_block_count = ceil_div(p.r1, RA_BASIC_FACTOR);
        let binary_fold_point = if binary_block_count <= 1 {
            0
        } else {
            prev_power_of_two(binary_block_count - 1)
        };
        let data = BatchNormGradRaRecomputeTilingData {
            r1: p.r1,
            a: p.a,
            block_dim: blocks.block_dim,
            main_block_factor: blocks.main_factor,
            tail_block_factor: blocks.tail_factor,
            main_block_count: blocks.main_count,
            tail_block_count: blocks.tail_count,
            a_loop_factor: RA_BASIC_FACTOR,
            a_loop_factor_aligned: RA_BASIC_FACTOR,
            r_loop_factor: RA_BASIC_FACTOR,
            r_loop_times,
            r_loop_tail: p.r1 - r_loop_times * RA_BASIC_FACTOR,
            binary_fold_point,
            binary_block_count,
            binary_tail_block: p.r1 - r_loop_times * RA_BASIC_FACTOR,
            cache_buffer_count: bit_length(binary_fold_point as u64) as i64,
            reciprocal: 1.0 / p.r1 as f32,
            epsilon: p.epsilon,
        };
        info!(
            "{op}: channel-last recompute r1={} a={}, {} cores, {binary_block_count} row blocks",
            p.r1, p.a, blocks.block_dim
        );
        TilingPlan::new(
            op,
            ctx.platform,
            KEY_RA_RECOMPUTE,
            blocks.block_dim,
            data.to_blob(),
            WORKSPACE,
        )
    }
}
