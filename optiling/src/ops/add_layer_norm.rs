//! Tiling for AddLayerNorm: `y = LayerNorm(x1 + x2 [+ bias])`, with optional `x` output.
//!
//! Two templates exist. [AddLayerNormRegbase] targets the register-based vector architecture and
//! chooses between a full-load and a Welford (column-streaming) kernel. [AddLayerNormLegacy]
//! targets earlier chips and walks a ladder of progressively less UB-hungry kernels.

use log::{debug, info};

use crate::common::{num_elements, Dim, Dtype, Shape};
use crate::error::TilingError;
use crate::ops::Prepared;
use crate::plan::TilingPlan;
use crate::platform::MemoryHierarchyDescriptor;
use crate::registry::{TilingContext, TilingTemplate};
use crate::utils::{ceil_align, ceil_div, split_evenly};
use crate::workload::OperatorWorkload;

const MAX_RANK: usize = 8;
const DEFAULT_EPSILON: f64 = 1e-5;
const UB_RESERVED: i64 = 256;
const REDUCE_BUF: i64 = 4 * 64;
const FP32_SIZE: i64 = 4;

const REGBASE_KEY_PREFIX: u64 = 8000;
const REGBASE_KEY_WELFORD: u64 = 100;
const REGBASE_MIN_ELEMS_PER_CORE: i64 = 1024;
const REGBASE_WORKSPACE: i64 = 16 * 1024 * 1024;

const LEGACY_BLOCK_SIZE: i64 = 32;
const LEGACY_BIG_N_MAX_D: i64 = 500;
const LEGACY_MAX_REPEAT_TIMES: i64 = 255;
const LEGACY_MAX_REPEAT_STRIDE_ELEM: i64 = 255 * 8;
const LEGACY_CUBE_MAX_ELEM_FP32: f64 = 128.0;
const LEGACY_MIN_COLUMN_SLICE: f64 = 2048.0;
const LEGACY_WORKSPACE: i64 = 16 * 1024 * 1024;
const LEGACY_WORKSPACE_310P: i64 = 2 * 1024 * 1024;
const LEGACY_KEY_ADDITIONAL_OUTPUT: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum BiasKind {
    None,
    /// Bias has the same shape as `x1`.
    Elementwise,
    /// Bias has as many elements as `gamma` and is broadcast over rows.
    Broadcast,
}

/// Validated AddLayerNorm workload, flattened to `rows x cols`.
#[derive(Debug, Clone, PartialEq)]
pub struct AddLayerNormParams {
    pub rows: i64,
    pub cols: i64,
    pub x1_dtype: Dtype,
    pub x2_dtype: Dtype,
    pub gamma_dtype: Dtype,
    pub beta_dtype: Dtype,
    pub bias_dtype: Option<Dtype>,
    pub y_dtype: Dtype,
    pub x_dtype: Dtype,
    pub mean_dtype: Dtype,
    pub rstd_dtype: Dtype,
    pub bias: BiasKind,
    pub epsilon: f32,
    pub additional_output: bool,
}

crate::tiling_data! {
    pub struct AddLayerNormRegbaseTilingData {
        pub block_size: i64,
        pub used_core_num: i64,
        pub vl_fp32: i64,
        pub tail_core_start_index: i64,
        pub rows_per_core: i64,
        pub rows_per_tail_core: i64,
        pub rows_per_loop: i64,
        pub cols: i64,
        pub cols_per_loop: i64,
        pub cols_loop_count: i64,
        pub cols_tail: i64,
        pub binary_add_num: i64,
        pub binary_add_k: i64,
        pub binary_add_last_num: i64,
        pub eps: f32,
        pub output_x: i64,
    }
}

crate::tiling_data! {
    pub struct AddLayerNormTilingData {
        pub num_core: i64,
        pub num_last_dim: i64,
        pub num_first_dim: i64,
        pub first_dim_per_core: i64,
        pub first_dim_per_core_tail: i64,
        pub first_dim_per_time: i64,
        pub last_dim_per_time: i64,
        pub eps: f32,
        pub ave_factor: f32,
        pub col_move_cnt: i64,
        pub col_tail: i64,
        pub workspace_size: i64,
    }
}

/// Kernel variants of the legacy template, in the order their key codes are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyKernel {
    Normal,
    Slice,
    SingleRow,
    SingleRowExt,
    NormalBigN,
    SliceExt,
    NormalSpecial,
    NormalSpecialReduce,
    NormalBigNSpecialReduce,
    SingleRowLessTensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddLayerNormRegbase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddLayerNormLegacy;

fn ensure_not_scalar(shape: &Shape) -> Shape {
    if shape.is_empty() {
        crate::shape![1]
    } else {
        shape.clone()
    }
}

fn check_positive(op: &str, name: &str, shape: &[Dim]) -> Result<(), TilingError> {
    if let Some(pos) = shape.iter().position(|&d| d <= 0) {
        return Err(TilingError::InvalidShape(
            op.to_string(),
            format!("dim {pos} of {name} {shape:?} must be positive"),
        ));
    }
    Ok(())
}

fn check_rank(op: &str, name: &str, shape: &[Dim]) -> Result<(), TilingError> {
    if shape.len() > MAX_RANK {
        return Err(TilingError::InvalidRank(
            op.to_string(),
            format!("{name} has rank {}, at most {MAX_RANK} allowed", shape.len()),
        ));
    }
    Ok(())
}

fn check_equal(op: &str, names: (&str, &str), a: &[Dim], b: &[Dim]) -> Result<(), TilingError> {
    if a != b {
        return Err(TilingError::ShapeMismatch(
            op.to_string(),
            format!("{} {a:?} and {} {b:?} must be equal", names.0, names.1),
        ));
    }
    Ok(())
}

fn check_float_dtype(op: &str, name: &str, dtype: Dtype) -> Result<(), TilingError> {
    match dtype {
        Dtype::Float32 | Dtype::Float16 | Dtype::Bfloat16 => Ok(()),
        _ => Err(TilingError::UnsupportedDtype(
            op.to_string(),
            format!("{name} must be fp32, fp16 or bf16, got {dtype}"),
        )),
    }
}

/// Checks shapes and attributes shared by both templates and computes `rows` and `cols`.
pub fn prepare(
    workload: &OperatorWorkload,
    _platform: &MemoryHierarchyDescriptor,
) -> Result<Prepared, TilingError> {
    let op = workload.op_type.as_str();
    workload.check_arity(4, 5, 4)?;
    let x1 = workload.input(0, "x1")?;
    let x2 = workload.input(1, "x2")?;
    let gamma = workload.input(2, "gamma")?;
    let beta = workload.input(3, "beta")?;
    let bias = workload.optional_input(4);
    let y = workload.output(0, "y")?;
    let mean = workload.output(1, "mean")?;
    let rstd = workload.output(2, "rstd")?;
    let x = workload.output(3, "x")?;

    let x1_shape = ensure_not_scalar(&x1.shape);
    let gamma_shape = ensure_not_scalar(&gamma.shape);
    check_rank(op, "x1", &x1_shape)?;
    check_rank(op, "gamma", &gamma_shape)?;
    check_positive(op, "x1", &x1_shape)?;
    check_positive(op, "gamma", &gamma_shape)?;
    check_equal(op, ("x1", "x2"), &x1_shape, &ensure_not_scalar(&x2.shape))?;
    check_equal(op, ("x1", "y"), &x1_shape, &ensure_not_scalar(&y.shape))?;
    check_equal(op, ("x1", "x"), &x1_shape, &ensure_not_scalar(&x.shape))?;
    check_equal(op, ("gamma", "beta"), &gamma_shape, &ensure_not_scalar(&beta.shape))?;

    if x1_shape.len() < gamma_shape.len() {
        return Err(TilingError::InvalidRank(
            op.to_string(),
            format!("x1 {x1_shape:?} has fewer dims than gamma {gamma_shape:?}"),
        ));
    }
    let lead = x1_shape.len() - gamma_shape.len();
    if x1_shape[lead..] != gamma_shape[..] {
        return Err(TilingError::ShapeMismatch(
            op.to_string(),
            format!("gamma {gamma_shape:?} must equal the trailing dims of x1 {x1_shape:?}"),
        ));
    }
    let rows = num_elements(op, &x1_shape[..lead])?;
    let cols = num_elements(op, &gamma_shape)?;

    let mean_shape = ensure_not_scalar(&mean.shape);
    check_equal(op, ("mean", "rstd"), &mean_shape, &ensure_not_scalar(&rstd.shape))?;
    let expected_mean: Shape = x1_shape[..lead]
        .iter()
        .copied()
        .chain(std::iter::repeat(1).take(gamma_shape.len()))
        .collect();
    if mean_shape != expected_mean {
        return Err(TilingError::ShapeMismatch(
            op.to_string(),
            format!("mean and rstd {mean_shape:?} must be {expected_mean:?}"),
        ));
    }

    let bias_kind = match bias {
        None => BiasKind::None,
        Some(b) => {
            let bias_shape = ensure_not_scalar(&b.shape);
            check_positive(op, "bias", &bias_shape)?;
            check_rank(op, "bias", &bias_shape)?;
            classify_bias(op, &bias_shape, &x1_shape, &gamma_shape, rows, cols)?
        }
    };

    for (name, dtype) in [
        ("x1", x1.dtype),
        ("x2", x2.dtype),
        ("gamma", gamma.dtype),
        ("beta", beta.dtype),
    ] {
        check_float_dtype(op, name, dtype)?;
    }
    if let Some(b) = bias {
        check_float_dtype(op, "bias", b.dtype)?;
    }

    let epsilon = workload.attr_float("epsilon", DEFAULT_EPSILON)? as f32;
    let additional_output = workload.attr_bool("additional_output", false)?;

    Ok(Prepared::AddLayerNorm(AddLayerNormParams {
        rows,
        cols,
        x1_dtype: x1.dtype,
        x2_dtype: x2.dtype,
        gamma_dtype: gamma.dtype,
        beta_dtype: beta.dtype,
        bias_dtype: bias.map(|b| b.dtype),
        y_dtype: y.dtype,
        x_dtype: x.dtype,
        mean_dtype: mean.dtype,
        rstd_dtype: rstd.dtype,
        bias: bias_kind,
        epsilon,
        additional_output,
    }))
}

fn classify_bias(
    op: &str,
    bias: &[Dim],
    x1: &[Dim],
    gamma: &[Dim],
    rows: i64,
    cols: i64,
) -> Result<BiasKind, TilingError> {
    if bias.len() < gamma.len() || bias.len() > x1.len() {
        return Err(TilingError::InvalidRank(
            op.to_string(),
            format!("bias {bias:?} rank must lie between gamma {gamma:?} and x1 {x1:?}"),
        ));
    }
    if bias[bias.len() - gamma.len()..] != gamma[..] {
        return Err(TilingError::ShapeMismatch(
            op.to_string(),
            format!("trailing dims of bias {bias:?} must equal gamma {gamma:?}"),
        ));
    }
    let size = num_elements(op, bias)?;
    if size == rows * cols {
        if bias.len() == x1.len() && bias != x1 {
            return Err(TilingError::ShapeMismatch(
                op.to_string(),
                format!("bias {bias:?} must equal x1 {x1:?}"),
            ));
        }
        Ok(BiasKind::Elementwise)
    } else if size == cols {
        Ok(BiasKind::Broadcast)
    } else {
        Err(TilingError::ShapeMismatch(
            op.to_string(),
            format!("bias {bias:?} must have {} or {cols} elements", rows * cols),
        ))
    }
}

impl TilingTemplate for AddLayerNormRegbase {
    fn name(&self) -> &'static str {
        "AddLayerNormRegbase"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        matches!(ctx.prepared, Prepared::AddLayerNorm(_)) && ctx.platform.is_regbase()
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let p = ctx.prepared.add_layer_norm(ctx.op())?;
        check_regbase_dtypes(ctx.op(), p)?;
        let (data, welford) = regbase_tiling(ctx.op(), p, ctx.platform)?;
        let mut key = REGBASE_KEY_PREFIX;
        if welford {
            key += REGBASE_KEY_WELFORD;
        }
        key += match p.bias {
            BiasKind::None => 0,
            BiasKind::Elementwise => 1,
            BiasKind::Broadcast => 2,
        };
        info!(
            "{}: key {key}, {} cores, rows/loop {}, cols/loop {}",
            ctx.op(),
            data.used_core_num,
            data.rows_per_loop,
            data.cols_per_loop
        );
        TilingPlan::new(
            ctx.op(),
            ctx.platform,
            key,
            data.used_core_num,
            data.to_blob(),
            REGBASE_WORKSPACE,
        )
    }
}

const REGBASE_DTYPES: [[Dtype; 5]; 9] = {
    use Dtype::{Bfloat16 as B, Float16 as H, Float32 as F};
    [
        [F, H, F, F, F],
        [F, B, F, F, F],
        [H, F, F, F, F],
        [B, F, F, F, F],
        [H, H, F, F, H],
        [B, B, F, F, B],
        [B, B, B, B, B],
        [H, H, H, H, H],
        [F, F, F, F, F],
    ]
};

fn check_regbase_dtypes(op: &str, p: &AddLayerNormParams) -> Result<(), TilingError> {
    let given = [p.x1_dtype, p.x2_dtype, p.gamma_dtype, p.beta_dtype];
    let supported = REGBASE_DTYPES.iter().any(|row| match p.bias_dtype {
        None => row[..4] == given,
        Some(bias) => row[..4] == given && row[4] == bias,
    });
    if !supported {
        return Err(TilingError::UnsupportedDtype(
            op.to_string(),
            format!("input dtypes {given:?} with bias {:?}", p.bias_dtype),
        ));
    }

    let expected_out = if p.x1_dtype == p.x2_dtype {
        p.x1_dtype
    } else {
        Dtype::Float32
    };
    if p.y_dtype != expected_out || p.x_dtype != expected_out {
        return Err(TilingError::UnsupportedDtype(
            op.to_string(),
            format!(
                "y ({}) and x ({}) must be {expected_out}",
                p.y_dtype, p.x_dtype
            ),
        ));
    }
    if p.mean_dtype != Dtype::Float32 || p.rstd_dtype != Dtype::Float32 {
        return Err(TilingError::UnsupportedDtype(
            op.to_string(),
            "mean and rstd must be fp32".to_string(),
        ));
    }
    Ok(())
}

/// Core split for the regbase kernel: each core gets at least 1024 elements when possible.
/// Returns `(used_cores, rows_per_core, rows_per_tail_core, tail_core_start_index)`.
fn regbase_core_split(rows: i64, cols: i64, cores: i64) -> (i64, i64, i64, i64) {
    let elems = rows * cols;
    if elems <= REGBASE_MIN_ELEMS_PER_CORE {
        (1, rows, rows, 1)
    } else if elems < REGBASE_MIN_ELEMS_PER_CORE * cores {
        let rows_per_core = ceil_div(REGBASE_MIN_ELEMS_PER_CORE, cols).clamp(1, rows);
        let mut used = rows / rows_per_core;
        let tail_start = used;
        let mut rows_per_tail_core = 0;
        if rows % rows_per_core != 0 {
            used += 1;
            rows_per_tail_core = rows % rows_per_core;
        }
        (used, rows_per_core, rows_per_tail_core, tail_start)
    } else {
        let used = rows.min(cores);
        let rows_per_core = ceil_div(rows, used);
        let rows_per_tail_core = rows_per_core - 1;
        (
            used,
            rows_per_core,
            rows_per_tail_core,
            rows - rows_per_tail_core * used,
        )
    }
}

/// Largest `vl * 2^i` strictly below `n`, or `vl` when `n <= vl`.
fn binary_add_num(vl: i64, n: i64) -> i64 {
    let mut num = vl;
    if n > vl {
        while num < n {
            num *= 2;
        }
        num /= 2;
    }
    num
}

fn regbase_tiling(
    op: &str,
    p: &AddLayerNormParams,
    platform: &MemoryHierarchyDescriptor,
) -> Result<(AddLayerNormRegbaseTilingData, bool), TilingError> {
    let block = platform.ub_block_size;
    let vl = platform.vector_reg_size / FP32_SIZE;
    let ub = platform.ub_size;
    let (rows, cols) = (p.rows, p.cols);

    let mut dtypes = vec![p.x1_dtype, p.x2_dtype, p.gamma_dtype, p.beta_dtype];
    dtypes.extend(p.bias_dtype);
    let is_mix = dtypes.iter().any(|&d| d != dtypes[0]);
    let dts = if is_mix {
        FP32_SIZE
    } else {
        p.x1_dtype.size()
    };
    let align = if is_mix { block * 2 } else { block };

    let (used, rows_per_core, rows_per_tail_core, tail_start) =
        regbase_core_split(rows, cols, platform.core_num);
    debug!("{op}: regbase core split used={used} rows/core={rows_per_core} tail={rows_per_tail_core}");

    let row_bytes = ceil_align(cols * dts, align);
    let (x1_ub, x2_ub, beta_ub, gamma_ub, bias_ub) =
        (row_bytes, row_bytes, row_bytes, row_bytes, row_bytes);
    let has_bias = p.bias != BiasKind::None;
    let input_num = if has_bias { 5 } else { 4 };
    let inputs_ub = x1_ub + x2_ub + beta_ub + gamma_ub + if has_bias { bias_ub } else { 0 };
    let output_ub = row_bytes * 2;
    let x32_ub = ceil_align(cols * FP32_SIZE, align);
    let (mean_ub, rstd_ub) = (block, block);

    let mut bin_num = binary_add_num(vl, cols);
    let bin_ub = ceil_align(bin_num / vl * FP32_SIZE, align);

    let full_load = ub >= inputs_ub + output_ub + mean_ub + rstd_ub + x32_ub + bin_ub + UB_RESERVED;
    let (rows_per_loop, cols_per_loop) = if full_load {
        let per_row = x1_ub + x2_ub + output_ub + x32_ub + mean_ub + rstd_ub;
        let rows_per_loop = match p.bias {
            BiasKind::Elementwise => {
                (ub - UB_RESERVED - bin_ub - beta_ub - gamma_ub) / (per_row + bias_ub)
            }
            BiasKind::Broadcast | BiasKind::None => {
                (ub - UB_RESERVED - bin_ub - beta_ub - gamma_ub - bias_ub) / per_row
            }
        };
        (rows_per_loop.min(rows_per_core), cols)
    } else {
        let welford_bytes = (input_num + 2) * dts + 4 * FP32_SIZE;
        let mut cols_per_loop =
            (ub - UB_RESERVED - mean_ub - rstd_ub) * vl / (welford_bytes * vl + 1);
        cols_per_loop = cols_per_loop * dts / block * block / dts;
        cols_per_loop = cols_per_loop / (block / 2) * (block / 2);
        bin_num = vl;
        while bin_num < cols_per_loop {
            bin_num *= 2;
        }
        bin_num /= 2;
        (1, cols_per_loop)
    };
    if cols_per_loop <= 0 || rows_per_loop <= 0 {
        return Err(TilingError::ResourceExceeded(
            op.to_string(),
            format!("UB of {ub} bytes cannot hold one chunk of a {cols}-column row"),
        ));
    }

    let cols_loop_count = ceil_div(cols, cols_per_loop);
    let cols_tail = match cols % cols_per_loop {
        0 => cols_per_loop,
        r => r,
    };

    let vcadd_num = bin_num / vl;
    let (binary_add_k, binary_add_last_num) = if vcadd_num <= vl {
        (0, vcadd_num)
    } else {
        let mut k = 0;
        let mut cur = 1;
        while cur < vcadd_num / vl {
            k += 1;
            cur *= 2;
        }
        (k, vl)
    };
    debug!("{op}: binaryAddNum={bin_num} k={binary_add_k} last={binary_add_last_num}");

    let data = AddLayerNormRegbaseTilingData {
        block_size: block,
        used_core_num: used,
        vl_fp32: vl,
        tail_core_start_index: tail_start,
        rows_per_core,
        rows_per_tail_core,
        rows_per_loop,
        cols,
        cols_per_loop,
        cols_loop_count,
        cols_tail,
        binary_add_num: bin_num,
        binary_add_k,
        binary_add_last_num,
        eps: p.epsilon,
        output_x: i64::from(p.additional_output),
    };
    Ok((data, !full_load))
}

impl LegacyKernel {
    fn key_code(self) -> u64 {
        match self {
            LegacyKernel::Normal => 0,
            LegacyKernel::Slice => 10,
            LegacyKernel::SingleRow => 20,
            LegacyKernel::SingleRowExt => 30,
            LegacyKernel::NormalBigN => 40,
            LegacyKernel::SliceExt => 50,
            LegacyKernel::NormalSpecial => 60,
            LegacyKernel::NormalSpecialReduce => 70,
            LegacyKernel::NormalBigNSpecialReduce => 80,
            LegacyKernel::SingleRowLessTensor => 90,
        }
    }

    fn is_normal_like(self) -> bool {
        matches!(
            self,
            LegacyKernel::Normal
                | LegacyKernel::NormalBigN
                | LegacyKernel::NormalSpecialReduce
                | LegacyKernel::NormalBigNSpecialReduce
        )
    }
}

struct LadderInput {
    ub: i64,
    dt: i64,
    gamma_dt: i64,
    data_type: Dtype,
    gamma_type: Dtype,
    num_col: i64,
    add_out: bool,
    bias: BiasKind,
    is_310p: bool,
}

/// Walks the legacy kernel ladder, returning the first kernel whose UB formula fits along with
/// its `(rows_per_time, cols_per_time)`.
fn legacy_ladder(l: &LadderInput) -> (LegacyKernel, i64, i64) {
    let ub = l.ub as f64;
    let (dt, gdt, nc) = (l.dt, l.gamma_dt, l.num_col);
    let nca = ceil_align(nc, LEGACY_BLOCK_SIZE);
    let add_out = i64::from(l.add_out);
    let no_bias = l.bias == BiasKind::None;
    let brc_bias = l.bias == BiasKind::Broadcast;
    let bias_num = i64::from(brc_bias);
    let all_fp16 = l.data_type == Dtype::Float16 && l.gamma_type == Dtype::Float16;
    let all_fp32 = l.data_type == Dtype::Float32 && l.gamma_type == Dtype::Float32;
    let x_b16_gamma_b32 = l.data_type.is_b16() && l.gamma_type == Dtype::Float32;
    let block_elems = LEGACY_BLOCK_SIZE / dt;
    let nc_elem_aligned = ceil_align(nc, block_elems);

    if l.is_310p
        && l.add_out
        && no_bias
        && l.data_type == Dtype::Float16
        && nc % block_elems == 0
        && nc_elem_aligned <= LEGACY_MAX_REPEAT_STRIDE_ELEM
    {
        let fixed = 4 * 2 * nca + UB_RESERVED + 2 * 2 * 16 * 16 * 8 + 2 * 16;
        let per_row = dt * 3 * nca + 4 * 2 * nca + REDUCE_BUF;
        let tmp_row = (ub - fixed as f64) / per_row as f64;
        if tmp_row > 1.0 && tmp_row <= LEGACY_CUBE_MAX_ELEM_FP32 {
            return (LegacyKernel::NormalSpecialReduce, tmp_row as i64, nc);
        }
    }

    if !l.is_310p
        && (no_bias || brc_bias)
        && all_fp16
        && nc_elem_aligned <= LEGACY_MAX_REPEAT_STRIDE_ELEM
    {
        let fixed = 4 * 2 * nca + dt * bias_num * nca + UB_RESERVED + 4 * 64 * 8;
        let per_row = dt * 3 * nca + 4 * 2 + 4 * 2 * nca + REDUCE_BUF;
        let tmp_row = (ub - fixed as f64) / per_row as f64;
        if tmp_row > 1.0 {
            return (LegacyKernel::NormalSpecialReduce, tmp_row as i64, nc);
        }
    }

    let fixed = gdt * 2 * nca + dt * bias_num * nca + REDUCE_BUF + UB_RESERVED;
    let per_row = dt * (3 + add_out) * nca + 4 * 2 + 4 * 3 * nca;
    let tmp_row = (ub - fixed as f64) / per_row as f64;
    let special = !l.is_310p && brc_bias && all_fp16;
    let special_fixed = 4 * 2 * nca + dt * nca + REDUCE_BUF + UB_RESERVED;
    let special_per_row = dt * 3 * nca + 4 * 2 + 4 * 2 * nca;
    let tmp_row_special = (ub - special_fixed as f64) / special_per_row as f64;
    if special && tmp_row < 2.0 && tmp_row > 0.0 && tmp_row_special > 2.0 {
        return (LegacyKernel::NormalSpecial, tmp_row_special as i64, nc);
    } else if tmp_row > 1.0 {
        return (LegacyKernel::Normal, tmp_row as i64, nc);
    }

    let single_row = dt * (3 + add_out) * nc + (4 * 2 + gdt * 2) * nc + 4 * 2 + REDUCE_BUF + UB_RESERVED;
    if single_row < l.ub {
        return (LegacyKernel::SingleRow, 1, nc);
    }
    let single_row_ext = dt * 2 * nc + (4 * 2 + gdt * 2) * nc + 4 * 2 + REDUCE_BUF + UB_RESERVED;
    if single_row_ext < l.ub {
        return (LegacyKernel::SingleRowExt, 1, nc);
    }

    if !l.is_310p && no_bias && all_fp32 && l.add_out {
        let need = dt * nc + 4 * 2 + 4 * 2 * nc + REDUCE_BUF + UB_RESERVED;
        if need < l.ub {
            return (LegacyKernel::SingleRowLessTensor, 1, nc);
        }
    }
    if !l.is_310p && (no_bias || brc_bias) && x_b16_gamma_b32 && l.add_out {
        let need = dt * nc + 4 * nc + 4 * 2 + 4 * 2 * nc + REDUCE_BUF + UB_RESERVED;
        if need < l.ub {
            return (LegacyKernel::SingleRowLessTensor, 1, nc);
        }
    }

    let num_per_block = LEGACY_BLOCK_SIZE / dt;
    let slice_fixed = gdt * 2 * nc + dt * bias_num * nc + dt * 2 + 4 * nc + REDUCE_BUF + UB_RESERVED;
    let slice_per_col = dt * (3 + add_out) + 4 * 2;
    let tmp_col = (ub - slice_fixed as f64) / slice_per_col as f64;
    if tmp_col > LEGACY_MIN_COLUMN_SLICE {
        let col = tmp_col as i64;
        if col % num_per_block != 0 {
            return (LegacyKernel::Slice, 1, col / num_per_block * num_per_block);
        }
    }

    let ext_fixed = 4 * 2 + REDUCE_BUF + UB_RESERVED;
    let ext_per_col = dt * (3 + add_out) + gdt * 2 + dt * bias_num + 4 * 3;
    let col = ((ub - ext_fixed as f64) / ext_per_col as f64).floor() as i64;
    (LegacyKernel::SliceExt, 1, col / num_per_block * num_per_block)
}

impl TilingTemplate for AddLayerNormLegacy {
    fn name(&self) -> &'static str {
        "AddLayerNormLegacy"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        matches!(ctx.prepared, Prepared::AddLayerNorm(_)) && !ctx.platform.is_regbase()
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let op = ctx.op();
        let p = ctx.prepared.add_layer_norm(op)?;
        let platform = ctx.platform;
        let split = split_evenly(p.rows, platform.core_num).ok_or_else(|| {
            TilingError::InvalidShape(op.to_string(), "x1 has no rows".to_string())
        })?;

        let data_type = if p.x1_dtype != p.x2_dtype {
            Dtype::Float32
        } else {
            p.x1_dtype
        };
        let dt = data_type.size();
        let (mut kernel, rows_per_time, mut cols_per_time) = legacy_ladder(&LadderInput {
            ub: platform.ub_size,
            dt,
            gamma_dt: p.gamma_dtype.size(),
            data_type,
            gamma_type: p.gamma_dtype,
            num_col: p.cols,
            add_out: p.additional_output,
            bias: p.bias,
            is_310p: platform.is_310p(),
        });
        if cols_per_time <= 0 || rows_per_time <= 0 {
            return Err(TilingError::ResourceExceeded(
                op.to_string(),
                format!("UB of {} bytes cannot hold a column slice", platform.ub_size),
            ));
        }
        debug!("{op}: legacy ladder chose {kernel:?}, rows {rows_per_time}, cols {cols_per_time}");

        let mut first_dim_per_time = rows_per_time.min(split.block_factor);
        let num_col = p.cols;
        let col_move_cnt = ceil_div(num_col, cols_per_time);
        let mut col_tail = match num_col % cols_per_time {
            0 => cols_per_time,
            r => r,
        };
        let block_elems = LEGACY_BLOCK_SIZE / dt;
        if platform.is_310p() {
            if num_col % block_elems != 0 && kernel.is_normal_like() {
                kernel = LegacyKernel::SingleRow;
                first_dim_per_time = 1;
            }
            if col_tail < block_elems {
                let slices = ceil_div(num_col, cols_per_time);
                cols_per_time = ceil_div(num_col, slices * block_elems) * block_elems;
                col_tail = match num_col % cols_per_time {
                    0 => cols_per_time,
                    r => r,
                };
            }
        }
        if num_col < LEGACY_BIG_N_MAX_D {
            kernel = match kernel {
                LegacyKernel::Normal => LegacyKernel::NormalBigN,
                LegacyKernel::NormalSpecialReduce => LegacyKernel::NormalBigNSpecialReduce,
                k => k,
            };
            if matches!(
                kernel,
                LegacyKernel::NormalBigN | LegacyKernel::NormalBigNSpecialReduce
            ) {
                first_dim_per_time = first_dim_per_time.min(LEGACY_MAX_REPEAT_TIMES);
            }
        }

        let workspace_field = 1;
        let data = AddLayerNormTilingData {
            num_core: split.used_cores,
            num_last_dim: num_col,
            num_first_dim: p.rows,
            first_dim_per_core: split.block_factor,
            first_dim_per_core_tail: split.block_tail,
            first_dim_per_time,
            last_dim_per_time: cols_per_time,
            eps: p.epsilon,
            ave_factor: (1.0 / num_col as f64) as f32,
            col_move_cnt,
            col_tail,
            workspace_size: workspace_field,
        };

        let mut key = kernel.key_code();
        if p.additional_output {
            key += LEGACY_KEY_ADDITIONAL_OUTPUT;
        }
        key += match p.bias {
            BiasKind::None => 0,
            BiasKind::Elementwise => 1,
            BiasKind::Broadcast => 2,
        };
        let sys_workspace = if platform.is_310p() {
            LEGACY_WORKSPACE_310P
        } else {
            LEGACY_WORKSPACE
        };
        info!("{op}: key {key}, {} cores, kernel {kernel:?}", split.used_cores);
        TilingPlan::new(
            op,
            platform,
            key,
            split.used_cores,
            data.to_blob(),
            workspace_field + sys_workspace,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TensorDesc;
    use crate::dispatcher::TilingDispatcher;
    use crate::platform::tests::{platform_910_95, platform_910b};
    use crate::registry::default_registry;
    use proptest::prelude::*;

    fn workload(
        x: &[Dim],
        gamma: &[Dim],
        x_dtype: Dtype,
        gamma_dtype: Dtype,
        bias: Option<&[Dim]>,
        additional_output: bool,
    ) -> OperatorWorkload {
        let lead = x.len() - gamma.len();
        let mean: Vec<Dim> = x[..lead]
            .iter()
            .copied()
            .chain(std::iter::repeat(1).take(gamma.len()))
            .collect();
        let mut w = OperatorWorkload::new("AddLayerNorm")
            .with_input(TensorDesc::nd(x, x_dtype))
            .with_input(TensorDesc::nd(x, x_dtype))
            .with_input(TensorDesc::nd(gamma, gamma_dtype))
            .with_input(TensorDesc::nd(gamma, gamma_dtype));
        if let Some(b) = bias {
            w = w.with_input(TensorDesc::nd(b, x_dtype));
        }
        w.with_output(TensorDesc::nd(x, x_dtype))
            .with_output(TensorDesc::nd(&mean, Dtype::Float32))
            .with_output(TensorDesc::nd(&mean, Dtype::Float32))
            .with_output(TensorDesc::nd(x, x_dtype))
            .with_attr("epsilon", 0.01)
            .with_attr("additional_output", additional_output)
    }

    fn tile_910b(w: &OperatorWorkload) -> Result<TilingPlan, TilingError> {
        TilingDispatcher::new(default_registry(), platform_910b()).tile(w)
    }

    fn tile_regbase(w: &OperatorWorkload) -> Result<TilingPlan, TilingError> {
        TilingDispatcher::new(default_registry(), platform_910_95()).tile(w)
    }

    #[test]
    fn test_fp16_without_additional_output_is_key_0() {
        let w = workload(&[24, 1, 2560], &[2560], Dtype::Float16, Dtype::Float16, None, false);
        let plan = tile_910b(&w).unwrap();
        assert_eq!(plan.tiling_key, 0);
        assert_eq!(plan.block_dim, 24);
        assert_eq!(plan.workspace_size, 16 * 1024 * 1024 + 1);
        let data = AddLayerNormTilingData::from_blob(&plan.blob).unwrap();
        assert_eq!(data.num_first_dim, 24);
        assert_eq!(data.num_last_dim, 2560);
        assert_eq!(data.first_dim_per_time, 1);
        assert_eq!(data.col_move_cnt, 1);
        assert_eq!(data.eps, 0.01f32);
    }

    #[test]
    fn test_fp32_with_additional_output_is_key_100() {
        let w = workload(&[24, 1, 2560], &[2560], Dtype::Float32, Dtype::Float32, None, true);
        assert_eq!(tile_910b(&w).unwrap().tiling_key, 100);
    }

    #[test]
    fn test_legacy_ladder_keys() {
        let bf16 = Dtype::Bfloat16;
        let cases: [(&[Dim], Option<&[Dim]>, u64); 6] = [
            (&[1, 1024, 11264], None, 30),
            (&[1, 1024, 10240], None, 20),
            (&[1, 1024, 10240], Some(&[10240][..]), 22),
            (&[1, 1024, 10240], Some(&[1, 1024, 10240][..]), 21),
            (&[1, 1024, 12288], Some(&[1, 1024, 12288][..]), 11),
            (&[1, 1024, 480], Some(&[1, 1024, 480][..]), 41),
        ];
        for (x, bias, expected) in cases {
            let gamma = [x[2]];
            let w = workload(x, &gamma, bf16, bf16, bias, false);
            assert_eq!(tile_910b(&w).unwrap().tiling_key, expected, "x={x:?} bias={bias:?}");
        }
    }

    #[test]
    fn test_legacy_slice_ext() {
        let x = [1, 1024, 58172];
        let w = workload(&x, &[58172], Dtype::Bfloat16, Dtype::Bfloat16, Some(&x[..]), false);
        let plan = tile_910b(&w).unwrap();
        assert_eq!(plan.tiling_key, 51);
        let data = AddLayerNormTilingData::from_blob(&plan.blob).unwrap();
        assert_eq!(data.last_dim_per_time % 16, 0);
        assert!(data.col_move_cnt > 1);
    }

    #[test]
    fn test_big_n_caps_rows_per_time() {
        let w = workload(&[4096, 64], &[64], Dtype::Float32, Dtype::Float32, None, false);
        let plan = tile_910b(&w).unwrap();
        assert_eq!(plan.tiling_key, 40);
        let data = AddLayerNormTilingData::from_blob(&plan.blob).unwrap();
        assert!(data.first_dim_per_time <= LEGACY_MAX_REPEAT_TIMES);
        assert!(data.first_dim_per_time <= data.first_dim_per_core);
    }

    #[test]
    fn test_mismatched_gamma_is_shape_mismatch() {
        let mut w = workload(&[24, 1, 2560], &[2560], Dtype::Float16, Dtype::Float16, None, false);
        w.inputs[2] = Some(TensorDesc::nd(&[2048], Dtype::Float16));
        w.inputs[3] = Some(TensorDesc::nd(&[2048], Dtype::Float16));
        assert!(matches!(tile_910b(&w), Err(TilingError::ShapeMismatch(..))));
    }

    #[test]
    fn test_mismatched_inputs_fail() {
        let mut w = workload(&[24, 1, 2560], &[2560], Dtype::Float16, Dtype::Float16, None, false);
        w.inputs[1] = Some(TensorDesc::nd(&[24, 2, 2560], Dtype::Float16));
        assert!(matches!(tile_910b(&w), Err(TilingError::ShapeMismatch(..))));
    }

    #[test]
    fn test_zero_dim_is_invalid_shape() {
        let w = workload(&[0, 2560], &[2560], Dtype::Float16, Dtype::Float16, None, false);
        assert!(matches!(tile_910b(&w), Err(TilingError::InvalidShape(..))));
    }

    #[test]
    fn test_bad_bias_size_is_rejected() {
        let w = workload(
            &[4, 8, 16],
            &[16],
            Dtype::Float16,
            Dtype::Float16,
            Some(&[8, 16][..]),
            false,
        );
        assert!(matches!(tile_910b(&w), Err(TilingError::ShapeMismatch(..))));
    }

    #[test]
    fn test_regbase_keys() {
        let f32 = Dtype::Float32;
        let x = [1, 1024, 512];
        let cases: [(&[Dim], Option<&[Dim]>, u64); 4] = [
            (&x, None, 8000),
            (&x, Some(&x[..]), 8001),
            (&x, Some(&[512][..]), 8002),
            (&[1, 1024, 16384], None, 8100),
        ];
        for (x, bias, expected) in cases {
            let gamma = [x[2]];
            let w = workload(x, &gamma, f32, f32, bias, true);
            let plan = tile_regbase(&w).unwrap();
            assert_eq!(plan.tiling_key, expected, "x={x:?} bias={bias:?}");
            assert_eq!(plan.workspace_size, 16 * 1024 * 1024);
        }
    }

    #[test]
    fn test_regbase_full_load_split() {
        let x = [1, 1024, 512];
        let w = workload(&x, &[512], Dtype::Float32, Dtype::Float32, None, false);
        let plan = tile_regbase(&w).unwrap();
        let data = AddLayerNormRegbaseTilingData::from_blob(&plan.blob).unwrap();
        assert_eq!(plan.block_dim, 64);
        assert_eq!(data.used_core_num, 64);
        assert_eq!(data.rows_per_core, 16);
        assert_eq!(data.rows_per_tail_core, 15);
        assert_eq!(data.tail_core_start_index, 64);
        assert_eq!(data.cols_per_loop, 512);
        assert_eq!(data.cols_loop_count, 1);
        assert_eq!(data.binary_add_num, 256);
        assert_eq!(data.binary_add_k, 0);
        assert_eq!(data.binary_add_last_num, 4);
        assert_eq!(data.output_x, 0);
    }

    #[test]
    fn test_regbase_welford_cols_are_aligned() {
        let x = [1, 1024, 16384];
        let w = workload(&x, &[16384], Dtype::Float32, Dtype::Float32, None, false);
        let data =
            AddLayerNormRegbaseTilingData::from_blob(&tile_regbase(&w).unwrap().blob).unwrap();
        assert_eq!(data.rows_per_loop, 1);
        assert_eq!(data.cols_per_loop % 16, 0);
        assert!(data.cols_per_loop < 16384);
        assert_eq!(
            data.cols_per_loop * (data.cols_loop_count - 1) + data.cols_tail,
            16384
        );
    }

    #[test]
    fn test_regbase_small_workload_uses_one_core() {
        let w = workload(&[4, 64], &[64], Dtype::Float16, Dtype::Float16, None, false);
        let plan = tile_regbase(&w).unwrap();
        assert_eq!(plan.block_dim, 1);
    }

    #[test]
    fn test_regbase_rejects_unsupported_dtype_tuple() {
        let w = workload(&[4, 64], &[64], Dtype::Float16, Dtype::Bfloat16, None, false);
        assert!(matches!(
            tile_regbase(&w),
            Err(TilingError::UnsupportedDtype(..))
        ));
    }

    #[test]
    fn test_regbase_core_split_middle_case() {
        // 40 rows of 100 columns: 11 rows reach 1024 elements.
        assert_eq!(regbase_core_split(40, 100, 64), (4, 11, 7, 3));
        assert_eq!(regbase_core_split(2, 100, 64), (1, 2, 2, 1));
    }

    proptest! {
        #[test]
        fn test_legacy_plan_is_deterministic_and_bounded(
            rows in 1i64..5000,
            cols in 1i64..70000,
            bias in any::<BiasKind>(),
            additional_output in any::<bool>(),
        ) {
            let x = [rows, cols];
            let bias_shape: Option<Vec<Dim>> = match bias {
                BiasKind::None => None,
                BiasKind::Elementwise => Some(x.to_vec()),
                BiasKind::Broadcast => Some(vec![cols]),
            };
            let w = workload(
                &x,
                &[cols],
                Dtype::Float16,
                Dtype::Float16,
                bias_shape.as_deref(),
                additional_output,
            );
            let a = tile_910b(&w).unwrap();
            let b = tile_910b(&w).unwrap();
            prop_assert_eq!(&a, &b);
            prop_assert!(a.block_dim >= 1 && a.block_dim <= 40);
            let data = AddLayerNormTilingData::from_blob(&a.blob).unwrap();
            prop_assert!(data.last_dim_per_time >= 1);
            prop_assert!(data.first_dim_per_time >= 1);
        }
    }
}
