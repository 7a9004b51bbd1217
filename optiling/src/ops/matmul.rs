//! Shape inference and cube tiling for `MatMulV3` and `BatchMatMulV3`.
//!
//! All three templates share one tiling-data layout ([MatMulTilingData]). They differ in how the
//! base block is chosen and in what is kept resident in L1:
//!
//! - [MatMulMultiBatch] processes several whole batches per core iteration.
//! - [MatMulL1FullLoad] keeps the one un-batched operand resident in L1.
//! - [MatMulBase] is the general fallback.

use log::{debug, info};

use crate::common::{is_unknown_rank, num_elements, Dim, Dtype, Shape, UNKNOWN_DIM, UNKNOWN_RANK};
use crate::error::TilingError;
use crate::ops::Prepared;
use crate::plan::TilingPlan;
use crate::platform::MemoryHierarchyDescriptor;
use crate::registry::{TilingContext, TilingTemplate};
use crate::utils::{ceil_align, ceil_div, floor_align, next_power_of_two, prev_power_of_two};
use crate::workload::OperatorWorkload;

const BLOCK_CUBE: i64 = 16;
const BLOCK_BYTES: i64 = 32;
const MAX_BATCH_DIMS: usize = 4;
const MIN_BATCHED_RANK: usize = 2;
const MAX_BATCHED_RANK: usize = 6;
const FP32_BYTES: i64 = 4;
const L1_RPC_RESERVED: i64 = 256;
const BIAS_MAX_BASE_N: i64 = 256;
const ND2NZ_ON_THE_FLY_LIMIT: i64 = 65535;
const ND2NZ_GM2L0_INNER_BYTES: [i64; 8] = [64, 96, 128, 160, 192, 224, 256, 384];
const CACHELINE: i64 = 512;
const MAX_M_AFTER_MERGE: i64 = i32::MAX as i64;
const MULTI_BATCH_OUT_MIN_BATCH: i64 = 1000;
const CORE_UTILIZATION_THRESHOLD: f64 = 0.6;
const MIN_WORKSPACE: i64 = 32;
const MIB: i64 = 1024 * 1024;
const RPC_WORKSPACE: i64 = 20 * MIB;
const L2_REFERENCE_SIZE: f64 = 192.0 * MIB as f64;
const L2_BIG_SHAPE_MIB: f64 = 100.0;
const MAX_TRANS_CONFLICT: i64 = 6;
const TAIL_CONFLICT_RATIO: f64 = 0.5;

const KEY_MULTI_BATCH: u64 = 1 << 1;
const KEY_LOAD_MODE_SHIFT: u32 = 2;
const KEY_MULTI_BATCH_OUT: u64 = 1 << 4;
const KEY_MIX_ND2NZ: u64 = 1 << 5;

/// Validated matmul workload. Batch extents are right-aligned into four slots, outermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct MatMulParams {
    pub m: i64,
    pub n: i64,
    pub k: i64,
    /// `m` before any batch was folded into it.
    pub m_ori: i64,
    pub trans_a: bool,
    pub trans_b: bool,
    pub dtype: Dtype,
    pub bias: Option<Dtype>,
    pub bias_with_batch: bool,
    pub batch_a: [i64; MAX_BATCH_DIMS],
    pub batch_b: [i64; MAX_BATCH_DIMS],
    pub batch_c: [i64; MAX_BATCH_DIMS],
}

crate::tiling_data! {
    pub struct MatMulTilingData {
        pub used_core_num: i64,
        pub m: i64,
        pub n: i64,
        pub ka: i64,
        pub kb: i64,
        pub single_core_m: i64,
        pub single_core_n: i64,
        pub single_core_k: i64,
        pub base_m: i64,
        pub base_n: i64,
        pub base_k: i64,
        pub depth_a1: i64,
        pub depth_b1: i64,
        pub step_m: i64,
        pub step_n: i64,
        pub step_ka: i64,
        pub step_kb: i64,
        pub db_l0c: i64,
        pub is_bias: i64,
        pub trans_a: i64,
        pub trans_b: i64,
        pub batch_a: [i64; 4],
        pub batch_b: [i64; 4],
        pub batch_c: [i64; 4],
        pub batch_a_all: i64,
        pub batch_b_all: i64,
        pub batch_c_all: i64,
        pub iter_batch: i64,
        pub batch_tile_block: i64,
        pub bias_with_batch: i64,
        pub m_ori: i64,
        pub m_tile_cnt_l2: i64,
        pub n_tile_cnt_l2: i64,
        pub m_tile_block: i64,
        pub n_tile_block: i64,
        pub cal_order: i64,
        reserved: [i64; 4],
    }
}

/// Cube-side capacities taken from the platform descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CubeBuffers {
    /// Bytes in one ping-pong half of L0A or L0B, whichever is smaller.
    l0_half: i64,
    /// fp32 partial sums L0C holds.
    l0c_elems: i64,
    /// Widest `baseN` whose fp32 bias fits the bias table.
    bias_base_n: i64,
}

impl CubeBuffers {
    fn new(op: &str, platform: &MemoryHierarchyDescriptor, size: i64) -> Result<Self, TilingError> {
        let bias_base_n = if platform.bt_size > 0 {
            floor_align(platform.bt_size / FP32_BYTES, BLOCK_CUBE).min(BIAS_MAX_BASE_N)
        } else {
            BIAS_MAX_BASE_N
        };
        let buf = CubeBuffers {
            l0_half: platform.l0a_size.min(platform.l0b_size) / 2,
            l0c_elems: platform.l0c_size / FP32_BYTES,
            bias_base_n,
        };
        let fractal = BLOCK_CUBE * BLOCK_CUBE;
        if buf.l0_half < fractal * size || buf.l0c_elems < fractal {
            return Err(TilingError::ResourceExceeded(
                op.to_string(),
                format!(
                    "L0A {} / L0B {} / L0C {} bytes cannot hold one {BLOCK_CUBE}x{BLOCK_CUBE} block",
                    platform.l0a_size, platform.l0b_size, platform.l0c_size
                ),
            ));
        }
        Ok(buf)
    }
}

/// Which operand, if any, stays resident in L1 for the whole computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Base = 0,
    Al1FullLoad = 1,
    Bl1FullLoad = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatMulMultiBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatMulL1FullLoad;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatMulBase;

fn product(batch: &[i64; MAX_BATCH_DIMS]) -> i64 {
    batch.iter().product()
}

impl MatMulParams {
    pub fn batch_a_all(&self) -> i64 {
        product(&self.batch_a)
    }

    pub fn batch_b_all(&self) -> i64 {
        product(&self.batch_b)
    }

    pub fn batch_c_all(&self) -> i64 {
        product(&self.batch_c)
    }

    fn dtype_size(&self) -> i64 {
        self.dtype.size()
    }

    fn inner_a(&self) -> i64 {
        if self.trans_a {
            self.m
        } else {
            self.k
        }
    }

    fn inner_b(&self) -> i64 {
        if self.trans_b {
            self.k
        } else {
            self.n
        }
    }

    fn outer_a(&self) -> i64 {
        if self.trans_a {
            self.k
        } else {
            self.m
        }
    }

    fn outer_b(&self) -> i64 {
        if self.trans_b {
            self.n
        } else {
            self.k
        }
    }

    /// An inner axis too long to be converted to the fractal layout while being copied in.
    fn exceeds_nd2nz_limit(&self) -> bool {
        self.inner_a() > ND2NZ_ON_THE_FLY_LIMIT || self.inner_b() > ND2NZ_ON_THE_FLY_LIMIT
    }
}

// Shape inference

fn check_dims(op: &str, name: &str, shape: &[Dim]) -> Result<(), TilingError> {
    if is_unknown_rank(shape) {
        return Ok(());
    }
    if let Some(&d) = shape.iter().find(|&&d| d < UNKNOWN_DIM) {
        return Err(TilingError::InvalidShape(
            op.to_string(),
            format!("{name} {shape:?} has invalid extent {d}"),
        ));
    }
    Ok(())
}

fn check_rank_range(
    op: &str,
    name: &str,
    shape: &[Dim],
    min: usize,
    max: usize,
) -> Result<(), TilingError> {
    if shape.len() < min || shape.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min}..={max}")
        };
        return Err(TilingError::InvalidRank(
            op.to_string(),
            format!("{name} {shape:?} must have rank {expected}"),
        ));
    }
    Ok(())
}

/// `(m, k)` of x1 and `(k, n)` of x2 after applying the transpose flags.
fn matrix_dims(shape: &[Dim], trans: bool) -> (Dim, Dim) {
    let r = shape.len();
    if trans {
        (shape[r - 1], shape[r - 2])
    } else {
        (shape[r - 2], shape[r - 1])
    }
}

fn check_k(op: &str, ka: Dim, kb: Dim) -> Result<(), TilingError> {
    if ka >= 0 && kb >= 0 && ka != kb {
        return Err(TilingError::ShapeMismatch(
            op.to_string(),
            format!("reduction extents differ: x1 has {ka}, x2 has {kb}"),
        ));
    }
    Ok(())
}

fn broadcast_dim(op: &str, a: Dim, b: Dim) -> Result<Dim, TilingError> {
    match (a, b) {
        _ if a == b => Ok(a),
        (1, _) => Ok(b),
        (_, 1) => Ok(a),
        (UNKNOWN_DIM, _) => Ok(b),
        (_, UNKNOWN_DIM) => Ok(a),
        _ => Err(TilingError::ShapeMismatch(
            op.to_string(),
            format!("batch extents {a} and {b} cannot be broadcast"),
        )),
    }
}

/// Broadcasts two batch prefixes from the right.
fn broadcast_batch(op: &str, a: &[Dim], b: &[Dim]) -> Result<Shape, TilingError> {
    let len = a.len().max(b.len());
    let mut out = Shape::with_capacity(len);
    for i in 0..len {
        let da = (i + a.len()).checked_sub(len).map_or(1, |j| a[j]);
        let db = (i + b.len()).checked_sub(len).map_or(1, |j| b[j]);
        out.push(broadcast_dim(op, da, db)?);
    }
    Ok(out)
}

/// Infers the output shape of `op` (`MatMulV3` or `BatchMatMulV3`).
///
/// Unknown extents (`-1`) propagate; an unknown-rank operand (`[-2]`) yields an unknown-rank
/// result for batched matmul, or an unknown extent in the corresponding position for 2-D matmul.
/// A known last extent of `bias` fills in an unknown `n`.
pub fn infer_shape(
    op: &str,
    x1: &[Dim],
    x2: &[Dim],
    bias: Option<&[Dim]>,
    trans_a: bool,
    trans_b: bool,
) -> Result<Shape, TilingError> {
    check_dims(op, "x1", x1)?;
    check_dims(op, "x2", x2)?;
    let mut out = if op == "BatchMatMulV3" {
        if is_unknown_rank(x1) || is_unknown_rank(x2) {
            return Ok(crate::shape![UNKNOWN_RANK]);
        }
        check_rank_range(op, "x1", x1, MIN_BATCHED_RANK, MAX_BATCHED_RANK)?;
        check_rank_range(op, "x2", x2, MIN_BATCHED_RANK, MAX_BATCHED_RANK)?;
        let (m, ka) = matrix_dims(x1, trans_a);
        let (kb, n) = matrix_dims(x2, trans_b);
        check_k(op, ka, kb)?;
        let mut out = broadcast_batch(op, &x1[..x1.len() - 2], &x2[..x2.len() - 2])?;
        out.extend([m, n]);
        out
    } else {
        let x1_known = !is_unknown_rank(x1);
        let x2_known = !is_unknown_rank(x2);
        if x1_known {
            check_rank_range(op, "x1", x1, 2, 2)?;
        }
        if x2_known {
            check_rank_range(op, "x2", x2, 2, 2)?;
        }
        match (x1_known, x2_known) {
            (false, false) => return Ok(crate::shape![UNKNOWN_RANK]),
            (false, true) => crate::shape![UNKNOWN_DIM, matrix_dims(x2, trans_b).1],
            (true, false) => crate::shape![matrix_dims(x1, trans_a).0, UNKNOWN_DIM],
            (true, true) => {
                let (m, ka) = matrix_dims(x1, trans_a);
                let (kb, n) = matrix_dims(x2, trans_b);
                check_k(op, ka, kb)?;
                crate::shape![m, n]
            }
        }
    };
    if let Some(bias) = bias.filter(|b| !b.is_empty() && !is_unknown_rank(b)) {
        let last = out.len() - 1;
        let bias_n = bias[bias.len() - 1];
        if out[last] == UNKNOWN_DIM && bias_n >= 0 {
            out[last] = bias_n;
        }
    }
    Ok(out)
}

// Shared validation

fn transpose_attr(
    workload: &OperatorWorkload,
    name: &str,
    alias: &str,
) -> Result<bool, TilingError> {
    if workload.attr(name).is_some() {
        workload.attr_bool(name, false)
    } else {
        workload.attr_bool(alias, false)
    }
}

/// Right-aligns the batch prefix of `shape` into four slots; missing slots are 1.
fn batch_slots(shape: &[Dim]) -> [i64; MAX_BATCH_DIMS] {
    let prefix = &shape[..shape.len().saturating_sub(2)];
    let mut slots = [1; MAX_BATCH_DIMS];
    for (slot, &d) in slots.iter_mut().rev().zip(prefix.iter().rev()) {
        *slot = d;
    }
    slots
}

fn check_positive(op: &str, name: &str, shape: &[Dim]) -> Result<(), TilingError> {
    if let Some(pos) = shape.iter().position(|&d| d <= 0) {
        return Err(TilingError::InvalidShape(
            op.to_string(),
            format!("dim {pos} of {name} {shape:?} must be a known positive extent"),
        ));
    }
    Ok(())
}

fn check_bias(
    op: &str,
    bias: &[Dim],
    n: i64,
    batch_c: &[i64; MAX_BATCH_DIMS],
    batched: bool,
) -> Result<bool, TilingError> {
    match bias.len() {
        1 => {
            if bias[0] != n {
                return Err(TilingError::ShapeMismatch(
                    op.to_string(),
                    format!("bias {bias:?} must have {n} elements"),
                ));
            }
            Ok(false)
        }
        r if r >= 3 && batched => {
            if bias[r - 1] != n || bias[r - 2] != 1 {
                return Err(TilingError::ShapeMismatch(
                    op.to_string(),
                    format!("batched bias {bias:?} must end in [1, {n}]"),
                ));
            }
            if batch_slots(bias) != *batch_c {
                return Err(TilingError::ShapeMismatch(
                    op.to_string(),
                    format!("batch of bias {bias:?} must equal the output batch {batch_c:?}"),
                ));
            }
            Ok(true)
        }
        _ => Err(TilingError::InvalidRank(
            op.to_string(),
            format!("bias {bias:?} must be 1-D or a batched [.., 1, n] tensor"),
        )),
    }
}

/// Validates a matmul workload for tiling and folds the batch of x1 into `m` where the kernel
/// allows it.
pub fn prepare(
    workload: &OperatorWorkload,
    platform: &MemoryHierarchyDescriptor,
) -> Result<Prepared, TilingError> {
    let op = workload.op_type.as_str();
    workload.check_arity(2, 4, 1)?;
    let x1 = workload.input(0, "x1")?;
    let x2 = workload.input(1, "x2")?;
    let bias = workload.optional_input(2);
    let y = workload.output(0, "y")?;
    let trans_a = transpose_attr(workload, "transpose_x1", "adj_x1")?;
    let trans_b = transpose_attr(workload, "transpose_x2", "adj_x2")?;

    let batched = op == "BatchMatMulV3";
    let (min_rank, max_rank) = if batched {
        (MIN_BATCHED_RANK, MAX_BATCHED_RANK)
    } else {
        (2, 2)
    };
    check_rank_range(op, "x1", &x1.shape, min_rank, max_rank)?;
    check_rank_range(op, "x2", &x2.shape, min_rank, max_rank)?;
    check_positive(op, "x1", &x1.shape)?;
    check_positive(op, "x2", &x2.shape)?;
    num_elements(op, &x1.shape)?;
    num_elements(op, &x2.shape)?;

    if !matches!(x1.dtype, Dtype::Float16 | Dtype::Bfloat16 | Dtype::Float32) {
        return Err(TilingError::UnsupportedDtype(
            op.to_string(),
            format!("x1 must be fp16, bf16 or fp32, got {}", x1.dtype),
        ));
    }
    if x2.dtype != x1.dtype {
        return Err(TilingError::UnsupportedDtype(
            op.to_string(),
            format!("x2 ({}) must match x1 ({})", x2.dtype, x1.dtype),
        ));
    }
    if let Some(b) = bias {
        if b.dtype != Dtype::Float32 && b.dtype != x1.dtype {
            return Err(TilingError::UnsupportedDtype(
                op.to_string(),
                format!("bias must be fp32 or {}, got {}", x1.dtype, b.dtype),
            ));
        }
    }

    let expected = infer_shape(
        op,
        &x1.shape,
        &x2.shape,
        bias.map(|b| &b.shape[..]),
        trans_a,
        trans_b,
    )?;
    if y.shape != expected {
        return Err(TilingError::OutputShapeMismatch(
            op.to_string(),
            format!("y is {:?}, expected {expected:?}", y.shape),
        ));
    }

    let (m, k) = matrix_dims(&x1.shape, trans_a);
    let n = matrix_dims(&x2.shape, trans_b).1;
    let batch_a = batch_slots(&x1.shape);
    let batch_b = batch_slots(&x2.shape);
    let batch_c = batch_slots(&expected);
    let bias_with_batch = match bias {
        Some(b) => {
            check_positive(op, "bias", &b.shape)?;
            check_bias(op, &b.shape, n, &batch_c, batched)?
        }
        None => false,
    };

    let mut params = MatMulParams {
        m,
        n,
        k,
        m_ori: m,
        trans_a,
        trans_b,
        dtype: x1.dtype,
        bias: bias.map(|b| b.dtype),
        bias_with_batch,
        batch_a,
        batch_b,
        batch_c,
    };
    merge_batch_into_m(&mut params, platform);
    Ok(Prepared::MatMul(params))
}

/// With an un-batched x2 and a non-transposed x1, the batch of x1 is just more rows.
fn merge_batch_into_m(p: &mut MatMulParams, platform: &MemoryHierarchyDescriptor) {
    if !platform.supports_l0c2out() || p.bias_with_batch {
        return;
    }
    if p.batch_b_all() != 1 || p.trans_a {
        return;
    }
    let merged = p.batch_a_all() * p.m;
    if merged > MAX_M_AFTER_MERGE {
        debug!("merged m {merged} would exceed i32, keeping the batch axis");
        return;
    }
    p.m = merged;
    p.batch_a = [1; MAX_BATCH_DIMS];
    p.batch_c = [1; MAX_BATCH_DIMS];
}

// Base block selection

/// `(baseM, baseN)` giving an even split of `m` and `n`. A larger `divisor` starts the search from
/// proportionally smaller blocks.
fn calc_base_mn(p: &MatMulParams, buf: &CubeBuffers, divisor: i64) -> (i64, i64) {
    let size = p.dtype_size();
    let base_m = if !p.trans_a {
        let max_m = (if p.k >= 32 { 1024 } else { 2048 }) / (size * divisor);
        let m_times = ceil_div(p.m, max_m);
        ceil_align(ceil_div(p.m, m_times), BLOCK_CUBE)
    } else {
        let n_calc = p.n.min(512);
        let min_base_m = (buf.l0c_elems / size / n_calc).max(32);
        let max_base_m = next_power_of_two(p.m).min(2048 / size / divisor);
        let mut best = max_base_m.max(BLOCK_CUBE);
        let mut candidate = best;
        while candidate >= min_base_m {
            if p.m % candidate == 0 {
                break;
            }
            if ceil_align(p.m, candidate) < ceil_align(p.m, best) {
                best = candidate;
            }
            candidate >>= 1;
        }
        best
    };

    let min_base_n = (buf.l0c_elems / size / base_m).min(512 / size).max(32);
    let max_n = if p.trans_b && p.k >= 32 { 1024 } else { 2048 };
    let max_base_n = max_n / size / divisor;
    let mut best = next_power_of_two(p.n).min(max_base_n).max(BLOCK_CUBE);
    let mut candidate = best;
    while candidate >= min_base_n {
        if p.n % candidate == 0 {
            break;
        }
        if ceil_align(p.n, candidate) < ceil_align(p.n, best) {
            best = candidate;
        }
        candidate >>= 1;
    }
    let l0c_n = prev_power_of_two((buf.l0c_elems / base_m).max(BLOCK_CUBE));
    (base_m, l0c_n.min(best))
}

fn core_utilization(p: &MatMulParams, batch_c: i64, cores: i64, base_m: i64, base_n: i64) -> f64 {
    let cnt = ceil_div(p.m, base_m) * ceil_div(p.n, base_n) * batch_c;
    cnt as f64 / ceil_align(cnt, cores) as f64
}

fn tune_base_mn(p: &MatMulParams, buf: &CubeBuffers, batch_c: i64, cores: i64) -> (i64, i64) {
    let (base_m, base_n) = calc_base_mn(p, buf, 1);
    if p.dtype == Dtype::Float32 {
        return (base_m, base_n);
    }
    let (half_m, half_n) = calc_base_mn(p, buf, 2);
    let util = core_utilization(p, batch_c, cores, base_m, base_n);
    if util < CORE_UTILIZATION_THRESHOLD
        && core_utilization(p, batch_c, cores, half_m, half_n) > util
    {
        return (half_m, half_n);
    }
    let copy_ratio = |m: i64, n: i64| 1.0 / m as f64 + 1.0 / n as f64;
    if copy_ratio(half_m, half_n) < copy_ratio(base_m, base_n) {
        (half_m, half_n)
    } else {
        (base_m, base_n)
    }
}

/// `(baseM, baseN, baseK)`. Large shapes keep the 128x256 basic block; small ones are tuned.
fn tune_base_mkn(
    p: &MatMulParams,
    buf: &CubeBuffers,
    batch_c: i64,
    cores: i64,
) -> (i64, i64, i64) {
    let size = p.dtype_size();
    let fit_k = |base_m: i64, base_n: i64| {
        let max_k = floor_align(buf.l0_half / size / base_m.max(base_n), BLOCK_CUBE);
        max_k.min(ceil_align(p.k, BLOCK_CUBE)).max(BLOCK_CUBE)
    };
    let small = p.m < 256 || p.n <= 256 || 128 * 256 > buf.l0c_elems;
    let (base_m, base_n) = if small {
        tune_base_mn(p, buf, batch_c, cores)
    } else {
        (128, 256)
    };
    let base_k = fit_k(base_m, base_n);
    debug!("base block [{base_m}, {base_n}, {base_k}]");
    (base_m, base_n, base_k)
}

fn initial_data(p: &MatMulParams) -> MatMulTilingData {
    MatMulTilingData {
        m: p.m,
        n: p.n,
        ka: p.k,
        kb: p.k,
        is_bias: i64::from(p.bias.is_some()),
        trans_a: i64::from(p.trans_a),
        trans_b: i64::from(p.trans_b),
        batch_a: p.batch_a,
        batch_b: p.batch_b,
        batch_c: p.batch_c,
        batch_a_all: p.batch_a_all(),
        batch_b_all: p.batch_b_all(),
        batch_c_all: p.batch_c_all(),
        iter_batch: 1,
        batch_tile_block: p.batch_c_all(),
        bias_with_batch: i64::from(p.bias_with_batch),
        m_ori: p.m_ori,
        m_tile_cnt_l2: 1,
        n_tile_cnt_l2: 1,
        cal_order: 1,
        ..Default::default()
    }
}

fn l1_budget(platform: &MemoryHierarchyDescriptor) -> i64 {
    platform.l1_size + L1_RPC_RESERVED
}

fn db_l0c(platform: &MemoryHierarchyDescriptor, base_m: i64, base_n: i64) -> i64 {
    if base_m * base_n * 4 * 2 > platform.l0c_size {
        1
    } else {
        2
    }
}

/// Bytes the A and B depths of `data` keep in L1.
fn l1_footprint(data: &MatMulTilingData, size: i64) -> i64 {
    (data.depth_a1 * data.base_m + data.depth_b1 * data.base_n) * data.base_k * size
}

fn check_l1(op: &str, data: &MatMulTilingData, size: i64, total_l1: i64) -> Result<(), TilingError> {
    let footprint = l1_footprint(data, size);
    if footprint > total_l1 {
        return Err(TilingError::ResourceExceeded(
            op.to_string(),
            format!("L1 needs {footprint} bytes, {total_l1} available"),
        ));
    }
    Ok(())
}

fn check_l0(
    op: &str,
    data: &MatMulTilingData,
    size: i64,
    buf: &CubeBuffers,
) -> Result<(), TilingError> {
    let (m, n, k) = (data.base_m, data.base_n, data.base_k);
    if m.max(n) * k * size > buf.l0_half || m * n > buf.l0c_elems {
        return Err(TilingError::ResourceExceeded(
            op.to_string(),
            format!(
                "base block [{m}, {n}, {k}] exceeds L0 half of {} bytes or L0C of {} elements",
                buf.l0_half, buf.l0c_elems
            ),
        ));
    }
    Ok(())
}

/// Base block, L1 depths and steps shared by every template.
fn common_tiling(
    op: &str,
    p: &MatMulParams,
    platform: &MemoryHierarchyDescriptor,
    buf: &CubeBuffers,
) -> Result<MatMulTilingData, TilingError> {
    let cores = platform.core_num;
    let (base_m, mut base_n, base_k) = tune_base_mkn(p, buf, p.batch_c_all(), cores);
    let mut total_l1 = l1_budget(platform);
    if p.bias.is_some() {
        if buf.bias_base_n < BLOCK_CUBE {
            return Err(TilingError::ResourceExceeded(
                op.to_string(),
                format!("bias table of {} bytes", platform.bt_size),
            ));
        }
        total_l1 -= buf.bias_base_n * FP32_BYTES;
        base_n = base_n.min(buf.bias_base_n);
    }
    let size = p.dtype_size();
    let depth = |base_mn: i64| (total_l1 / 2 / size / (base_mn * base_k) / 4 * 4).max(2);
    let mut depth_a1 = depth(base_m);
    let mut depth_b1 = depth(base_n);
    let mut step_ka = depth_a1 / 2;
    let mut step_kb = depth_b1 / 2;
    if step_ka > step_kb {
        step_ka = step_ka / step_kb * step_kb;
        depth_a1 = step_ka * 2;
    } else {
        step_kb = step_kb / step_ka * step_ka;
        depth_b1 = step_kb * 2;
    }

    let mut data = initial_data(p);
    data.base_m = base_m;
    data.base_n = base_n;
    data.base_k = base_k;
    data.depth_a1 = depth_a1;
    data.depth_b1 = depth_b1;
    data.step_ka = step_ka;
    data.step_kb = step_kb;
    data.step_m = 1;
    data.step_n = 1;
    data.single_core_m = p.m.min(base_m);
    data.single_core_n = p.n.min(base_n);
    data.single_core_k = p.k;
    data.db_l0c = db_l0c(platform, base_m, base_n);
    update_used_core_num(&mut data, cores);
    check_l1(op, &data, size, total_l1)?;
    Ok(data)
}

fn update_used_core_num(data: &mut MatMulTilingData, cores: i64) {
    let m_blocks = ceil_div(data.m, data.single_core_m);
    let n_blocks = ceil_div(data.n, data.single_core_n);
    data.used_core_num = (data.batch_c_all * m_blocks * n_blocks).clamp(1, cores);
}

/// Chooses the L2 tile order: either row-major or staggered so that concurrently running cores
/// hit different rows of the output.
fn l2_cache_tiling(data: &mut MatMulTilingData, p: &MatMulParams, l2_size: i64) {
    let used = data.used_core_num;
    let batch_c = data.batch_c_all;
    let l2_ratio = l2_size as f64 / L2_REFERENCE_SIZE;
    let big = batch_c > 1 && {
        let size = p.dtype_size() as f64;
        let total = (p.batch_a_all() as f64 * p.m as f64 * p.k as f64
            + p.batch_b_all() as f64 * p.k as f64 * p.n as f64
            + batch_c as f64 * p.m as f64 * p.n as f64)
            * size;
        total > l2_ratio * L2_BIG_SHAPE_MIB * MIB as f64
    };
    let m_cnt = ceil_div(p.m, data.single_core_m);
    let n_cnt = ceil_div(p.n, data.single_core_n);
    let trans_conflict = ceil_div(used, m_cnt).max(ceil_div(used, n_cnt));
    let mut new_m_cnt = m_cnt;
    if n_cnt < used && m_cnt > used {
        new_m_cnt = ceil_div(used, n_cnt) * n_cnt;
        while new_m_cnt > 0 {
            let tail = m_cnt % new_m_cnt;
            if tail as f64 > TAIL_CONFLICT_RATIO * new_m_cnt as f64 {
                break;
            }
            new_m_cnt -= 1;
        }
    }
    if new_m_cnt <= 0 {
        return;
    }
    let split_m = |data: &mut MatMulTilingData| {
        data.m_tile_cnt_l2 = batch_c * ceil_div(m_cnt, new_m_cnt);
        data.m_tile_block = new_m_cnt;
        data.n_tile_block = n_cnt;
    };
    if big && batch_c < used && trans_conflict <= MAX_TRANS_CONFLICT {
        split_m(data);
    } else {
        let one_core_block = ceil_div(batch_c * m_cnt * n_cnt, used);
        let row_conflict = ceil_div(m_cnt * n_cnt, one_core_block);
        if trans_conflict < row_conflict {
            split_m(data);
            data.cal_order = 0;
        }
    }
}

// L1 full load

/// Bytes an operand occupies in L1 in the fractal layout.
fn matrix_area(batch: i64, outer: i64, inner: i64, size: i64) -> i64 {
    let c0 = BLOCK_BYTES / size;
    batch.max(1) * ceil_align(outer, BLOCK_CUBE) * ceil_align(inner, c0) * size
}

fn l1_full_load_mode(p: &MatMulParams, platform: &MemoryHierarchyDescriptor) -> LoadMode {
    let a_batch = p.batch_a_all();
    let b_batch = p.batch_b_all();
    let a_no_batch = a_batch <= 1;
    let b_no_batch = b_batch <= 1;
    // Exactly one operand un-batched, or both when the batch of x1 was folded into m.
    if a_no_batch == b_no_batch && !(b_no_batch && !p.trans_a) {
        return LoadMode::Base;
    }
    let total_l1 = l1_budget(platform);
    let cores = platform.core_num;
    let size = p.dtype_size();
    let a_size = matrix_area(a_batch, p.outer_a(), p.inner_a(), size);
    let b_size = matrix_area(b_batch, p.outer_b(), p.inner_b(), size);
    if a_no_batch
        && a_size * 2 <= total_l1
        && (b_size >= total_l1 * cores || b_batch >= 4 * cores)
    {
        return LoadMode::Al1FullLoad;
    }
    if b_no_batch
        && b_size * 2 <= total_l1
        && (a_size >= total_l1 * cores || a_batch >= 4 * cores)
    {
        return LoadMode::Bl1FullLoad;
    }
    LoadMode::Base
}

/// Lowers `x` (in multiples of `step`) until `y`, which falls by `dydx` per unit of `x`, is at
/// most `target` or `x` reaches `step`.
fn tune_down_param(target: i64, y: &mut i64, x: &mut i64, dydx: i64, step: i64) {
    if *y <= target || *x <= step || dydx <= 0 {
        return;
    }
    let dx = ceil_align(ceil_div(*y - target, dydx), step);
    if *x >= dx + step {
        *y -= dx * dydx;
        *x -= dx;
    } else {
        *y -= (*x - step) * dydx;
        *x = step;
    }
}

/// Halves `base_mn` or `base_k`, whichever wastes more padding, until the whole operand plus
/// one L0 buffer fits in L1.
fn tune_down_base_block(
    mn: i64,
    k: i64,
    size: i64,
    l1: i64,
    l0_half: i64,
    base_mn: &mut i64,
    base_k: &mut i64,
) {
    loop {
        let load = ceil_align(mn, *base_mn) * ceil_align(k, *base_k) * size;
        if load + 2 * l0_half <= l1 {
            return;
        }
        if ceil_align(k, *base_k) * mn >= ceil_align(mn, *base_mn) * k {
            *base_k = ceil_align(*base_k / 2, BLOCK_CUBE);
            if *base_k <= BLOCK_CUBE {
                return;
            }
        } else {
            *base_mn = ceil_align(*base_mn / 2, BLOCK_CUBE);
            if *base_mn <= BLOCK_CUBE {
                return;
            }
        }
    }
}

fn al1_full_load_tiling(
    data: &mut MatMulTilingData,
    p: &MatMulParams,
    total_l1: i64,
    l0_half: i64,
    l0c: i64,
) {
    let a_size_of = p.dtype_size();
    let b_size_of = p.dtype_size();
    let mut base_m = data.base_m;
    let mut base_k = data.base_k;
    tune_down_base_block(p.m, p.k, a_size_of, total_l1, l0_half, &mut base_m, &mut base_k);
    let step_m = ceil_div(p.m, base_m);
    let step_ka = ceil_div(p.k, base_k);
    let a_size = step_ka * step_m * base_k * base_m * a_size_of;
    data.base_m = base_m;
    data.base_k = base_k;
    data.step_ka = step_ka;
    data.step_m = step_m;
    data.depth_a1 = step_ka * step_m;
    data.single_core_m = p.m;

    let mut base_n = data.base_n;
    let mut step_n = data.step_n;
    let mut step_kb = data.step_kb;
    let b_per_step_n = step_kb * base_k * base_n * b_size_of * 2;
    let bias_per_step_n = p.bias.map_or(0, |b| base_n * b.size() * 2);
    let mut load = a_size + (b_per_step_n + bias_per_step_n) * step_n;
    tune_down_param(total_l1, &mut load, &mut step_n, b_per_step_n + bias_per_step_n, 1);
    let b_per_step_kb = b_per_step_n / step_kb;
    tune_down_param(total_l1, &mut load, &mut step_kb, b_per_step_kb, 1);
    let b_per_base_n = (b_per_step_kb + bias_per_step_n) / base_n;
    tune_down_param(total_l1, &mut load, &mut base_n, b_per_base_n, BLOCK_CUBE);

    data.step_n = step_n;
    data.step_kb = step_kb;
    data.base_n = base_n;
    data.depth_b1 = step_kb * step_n * 2;
    let single_core_n = if step_kb * base_k < p.k {
        step_n * base_n
    } else {
        step_n * base_n * 2
    };
    data.single_core_n = single_core_n.min(p.n);
    data.db_l0c = if base_m * base_n * 4 * 2 > l0c { 1 } else { 2 };
}

fn bl1_full_load_tiling(
    data: &mut MatMulTilingData,
    p: &MatMulParams,
    total_l1: i64,
    l0_half: i64,
    l0c: i64,
) {
    let size = p.dtype_size();
    let mut base_n = data.base_n;
    let mut base_k = data.base_k;
    tune_down_base_block(p.n, p.k, size, total_l1, l0_half, &mut base_n, &mut base_k);
    let step_n = ceil_div(p.n, base_n);
    let step_kb = ceil_div(p.k, base_k);
    let b_size = step_kb * step_n * base_k * base_n * size;
    data.base_n = base_n;
    data.base_k = base_k;
    data.step_kb = step_kb;
    data.step_n = step_n;
    data.depth_b1 = step_kb * step_n;
    data.single_core_n = p.n;

    let mut base_m = data.base_m;
    let mut step_m = data.step_m;
    let mut step_ka = data.step_ka;
    let bias_size = p.bias.map_or(0, |b| base_n * step_n * b.size() * 2);
    let a_per_step_m = step_ka * base_k * base_m * size * 2;
    let mut load = b_size + bias_size + a_per_step_m * step_m;
    tune_down_param(total_l1, &mut load, &mut step_m, a_per_step_m, 1);
    let a_per_step_ka = a_per_step_m / step_ka;
    tune_down_param(total_l1, &mut load, &mut step_ka, a_per_step_ka, 1);
    let a_per_base_m = a_per_step_ka / base_m;
    tune_down_param(total_l1, &mut load, &mut base_m, a_per_base_m, BLOCK_CUBE);

    data.step_m = step_m;
    data.step_ka = step_ka;
    data.base_m = base_m;
    data.depth_a1 = step_ka * step_m * 2;
    let single_core_m = if step_ka * base_k < p.k {
        step_m * base_m
    } else {
        step_m * base_m * 2
    };
    data.single_core_m = single_core_m.min(p.m);
    data.db_l0c = if base_m * base_n * 4 * 2 > l0c { 1 } else { 2 };
}

// Multi-batch

/// Number of whole batches one core keeps in L1 per iteration, when that is more than one.
fn multi_batch_iter(p: &MatMulParams, platform: &MemoryHierarchyDescriptor) -> Option<i64> {
    if p.batch_a != p.batch_b || (p.bias.is_some() && !p.bias_with_batch) {
        return None;
    }
    let shape_m = ceil_align(p.m, BLOCK_CUBE);
    let shape_n = ceil_align(p.n, BLOCK_CUBE);
    let shape_k = ceil_align(p.k, BLOCK_CUBE);
    let bias_size = p.bias.map_or(0, |b| shape_n * b.size());
    let per_batch = (shape_m * shape_k + shape_k * shape_n) * p.dtype_size() + bias_size;
    let fits = platform.l1_size / per_batch;
    let per_core = p.batch_c_all() / platform.core_num;
    let iter = fits.min(per_core).max(1);
    if iter <= 1 {
        return None;
    }
    Some(floor_align(iter, 2))
}

/// Whether an operand needs a separate ND-to-fractal conversion pass before the multi-batch
/// kernel.
fn needs_nd2nz(inner: i64, outer: i64, size: i64) -> bool {
    let bytes = inner * size;
    let aligned = bytes % 256 == 0;
    let on_the_way = ND2NZ_GM2L0_INNER_BYTES.contains(&bytes);
    !aligned
        && !on_the_way
        && outer > 4
        && inner > 1
        && (bytes <= 192
            || (bytes <= 384 && inner % 2 == 0)
            || (bytes <= CACHELINE && inner % 4 == 0))
}

fn nd2nz_workspace(
    data: &mut MatMulTilingData,
    p: &MatMulParams,
    l2_size: i64,
    nd2nz: (bool, bool),
) -> i64 {
    let size = p.dtype_size();
    let c0 = BLOCK_BYTES / size;
    let (align_m, align_ka) = if p.trans_a {
        (ceil_align(p.m, c0), ceil_align(p.k, BLOCK_CUBE))
    } else {
        (ceil_align(p.m, BLOCK_CUBE), ceil_align(p.k, c0))
    };
    let (align_kb, align_n) = if p.trans_b {
        (ceil_align(p.k, c0), ceil_align(p.n, BLOCK_CUBE))
    } else {
        (ceil_align(p.k, BLOCK_CUBE), ceil_align(p.n, c0))
    };
    let mut workspace = 0;
    let mut per_batch = 0;
    if nd2nz.0 {
        workspace += align_m * align_ka * size * p.batch_a_all();
        per_batch += align_m * align_ka * size;
    }
    if nd2nz.1 {
        workspace += align_kb * align_n * size * p.batch_b_all();
        per_batch += align_kb * align_n * size;
    }
    if workspace > l2_size && per_batch != 0 {
        let tile = l2_size / 4 / per_batch;
        if tile > data.iter_batch {
            data.batch_tile_block = tile;
            workspace = tile * per_batch * 2;
        }
    }
    workspace
}

/// Base block for the multi-batch kernel, which keeps whole matrices of one batch per iteration.
fn multi_batch_base_block(data: &mut MatMulTilingData, p: &MatMulParams, buf: &CubeBuffers) {
    let size = p.dtype_size();
    let mut m_times = ceil_div(p.m, 2048 / size);
    let mut base_m = ceil_align(ceil_div(p.m, m_times), BLOCK_CUBE);
    let mut base_n = next_power_of_two(p.n)
        .min(2048 / size)
        .min(prev_power_of_two(buf.l0c_elems / BLOCK_CUBE))
        .max(BLOCK_CUBE);
    let mut cur = base_n;
    let mut best_padded = i64::MAX;
    while p.n % cur != 0 && cur * base_m >= buf.l0c_elems / size {
        let padded = ceil_div(p.n, cur) * cur;
        if padded < best_padded {
            best_padded = padded;
            base_n = cur;
        }
        cur /= 2;
    }
    if p.bias.is_some() {
        base_n = base_n.min(buf.bias_base_n);
    }
    while base_m * base_n > buf.l0c_elems && base_m > BLOCK_CUBE {
        m_times += 1;
        base_m = ceil_align(ceil_div(p.m, m_times), BLOCK_CUBE);
    }
    let valid_k = buf.l0_half / size / base_m.max(base_n) / BLOCK_CUBE * BLOCK_CUBE;
    data.base_m = base_m;
    data.base_n = base_n;
    data.base_k = ceil_align(p.k, BLOCK_CUBE).min(valid_k).max(BLOCK_CUBE);
}

fn tiling_key(load_mode: LoadMode, multi_batch: bool, multi_batch_out: bool, mix: bool) -> u64 {
    let mut key = (load_mode as u64) << KEY_LOAD_MODE_SHIFT;
    if multi_batch {
        key |= KEY_MULTI_BATCH;
    }
    if multi_batch_out {
        key |= KEY_MULTI_BATCH_OUT;
    }
    if mix {
        key |= KEY_MIX_ND2NZ;
    }
    key
}

fn finish(
    ctx: &TilingContext<'_>,
    p: &MatMulParams,
    buf: &CubeBuffers,
    key: u64,
    data: &MatMulTilingData,
    workspace: i64,
) -> Result<TilingPlan, TilingError> {
    check_l0(ctx.op(), data, p.dtype_size(), buf)?;
    info!(
        "{}: key {key:#x}, {} cores, base [{}, {}, {}], single core [{}, {}, {}]",
        ctx.op(),
        data.used_core_num,
        data.base_m,
        data.base_n,
        data.base_k,
        data.single_core_m,
        data.single_core_n,
        data.single_core_k
    );
    TilingPlan::new(
        ctx.op(),
        ctx.platform,
        key,
        data.used_core_num,
        data.to_blob(),
        workspace.max(MIN_WORKSPACE),
    )
}

impl TilingTemplate for MatMulMultiBatch {
    fn name(&self) -> &'static str {
        "MatMulMultiBatch"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        let Prepared::MatMul(p) = ctx.prepared else {
            return false;
        };
        ctx.platform.supports_l0c2out()
            && !p.exceeds_nd2nz_limit()
            && multi_batch_iter(p, ctx.platform).is_some()
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let p = ctx.prepared.matmul(ctx.op())?;
        let platform = ctx.platform;
        let iter_batch = multi_batch_iter(p, platform)
            .ok_or_else(|| TilingError::NoCapableTemplate(ctx.op().to_string()))?;
        let buf = CubeBuffers::new(ctx.op(), platform, p.dtype_size())?;
        let mut data = common_tiling(ctx.op(), p, platform, &buf)?;
        l2_cache_tiling(&mut data, p, platform.l2_size);

        data.used_core_num = ceil_div(p.batch_c_all(), iter_batch).min(platform.core_num);
        data.single_core_m = p.m;
        data.single_core_n = p.n;
        data.single_core_k = p.k;
        data.iter_batch = iter_batch;
        let size = p.dtype_size();
        let nd2nz = (
            needs_nd2nz(p.inner_a(), p.outer_a(), size),
            needs_nd2nz(p.inner_b(), p.outer_b(), size),
        );
        multi_batch_base_block(&mut data, p, &buf);

        let batch_out_cnt = platform.l0c_size / (data.base_n * data.base_m * data.db_l0c * 4);
        let multi_batch_out = batch_out_cnt > 1
            && p.batch_c_all() > MULTI_BATCH_OUT_MIN_BATCH
            && data.single_core_m <= data.base_m
            && data.single_core_n <= data.base_n
            && !(p.m == 1 && p.n == 1);
        let mix = nd2nz.0 || nd2nz.1;
        let workspace = if mix {
            nd2nz_workspace(&mut data, p, platform.l2_size, nd2nz) + RPC_WORKSPACE
        } else {
            0
        };
        debug!(
            "{}: iter batch {iter_batch}, nd2nz {nd2nz:?}, batch out {multi_batch_out}",
            ctx.op()
        );
        let key = tiling_key(LoadMode::Base, true, multi_batch_out, mix);
        finish(ctx, p, &buf, key, &data, workspace)
    }
}

impl TilingTemplate for MatMulL1FullLoad {
    fn name(&self) -> &'static str {
        "MatMulL1FullLoad"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        let Prepared::MatMul(p) = ctx.prepared else {
            return false;
        };
        !ctx.platform.is_310p()
            && !p.exceeds_nd2nz_limit()
            && l1_full_load_mode(p, ctx.platform) != LoadMode::Base
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let p = ctx.prepared.matmul(ctx.op())?;
        let platform = ctx.platform;
        let mode = l1_full_load_mode(p, platform);
        let buf = CubeBuffers::new(ctx.op(), platform, p.dtype_size())?;
        let mut data = common_tiling(ctx.op(), p, platform, &buf)?;
        let total_l1 = l1_budget(platform);
        let (l0_half, l0c) = (buf.l0_half, platform.l0c_size);
        match mode {
            LoadMode::Al1FullLoad => al1_full_load_tiling(&mut data, p, total_l1, l0_half, l0c),
            LoadMode::Bl1FullLoad => bl1_full_load_tiling(&mut data, p, total_l1, l0_half, l0c),
            LoadMode::Base => return Err(TilingError::NoCapableTemplate(ctx.op().to_string())),
        }
        check_l1(ctx.op(), &data, p.dtype_size(), total_l1)?;
        update_used_core_num(&mut data, platform.core_num);
        debug!("{}: {mode:?}", ctx.op());
        finish(ctx, p, &buf, tiling_key(mode, false, false, false), &data, 0)
    }
}

impl TilingTemplate for MatMulBase {
    fn name(&self) -> &'static str {
        "MatMulBase"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        matches!(ctx.prepared, Prepared::MatMul(_))
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let p = ctx.prepared.matmul(ctx.op())?;
        let buf = CubeBuffers::new(ctx.op(), ctx.platform, p.dtype_size())?;
        let mut data = common_tiling(ctx.op(), p, ctx.platform, &buf)?;
        let mix = p.exceeds_nd2nz_limit();
        if !mix {
            l2_cache_tiling(&mut data, p, ctx.platform.l2_size);
        }
        let key = tiling_key(LoadMode::Base, false, false, mix);
        finish(ctx, p, &buf, key, &data, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TensorDesc;
    use crate::platform::tests::{platform_910_95, platform_910b};
    use crate::registry::default_registry;
    use proptest::prelude::*;

    fn infer(op: &str, x1: &[Dim], x2: &[Dim], trans_a: bool, trans_b: bool) -> Shape {
        infer_shape(op, x1, x2, None, trans_a, trans_b).unwrap()
    }

    fn workload(op: &str, x1: &[Dim], x2: &[Dim], dtype: Dtype) -> OperatorWorkload {
        let y = infer_shape(op, x1, x2, None, false, false).unwrap();
        OperatorWorkload::new(op)
            .with_input(TensorDesc::nd(x1, dtype))
            .with_input(TensorDesc::nd(x2, dtype))
            .with_output(TensorDesc::nd(&y, dtype))
    }

    fn tile(w: &OperatorWorkload, platform: &MemoryHierarchyDescriptor) -> TilingPlan {
        default_registry().select_and_run(w, platform).unwrap()
    }

    fn blob(plan: &TilingPlan) -> MatMulTilingData {
        MatMulTilingData::from_blob(&plan.blob).unwrap()
    }

    #[test]
    fn test_infer_2d_known() {
        assert_eq!(
            infer("MatMulV3", &[32, 64], &[64, 128], false, false),
            crate::shape![32, 128]
        );
    }

    #[test]
    fn test_infer_2d_unknown_m() {
        assert_eq!(
            infer("MatMulV3", &[-1, 64], &[64, 128], false, false),
            crate::shape![-1, 128]
        );
    }

    #[test]
    fn test_infer_2d_unknown_rank() {
        assert_eq!(
            infer("MatMulV3", &[-2], &[64, 128], false, false),
            crate::shape![-1, 128]
        );
        assert_eq!(
            infer("MatMulV3", &[32, 64], &[-2], false, false),
            crate::shape![32, -1]
        );
        assert_eq!(
            infer("MatMulV3", &[-2], &[-2], false, false),
            crate::shape![-2]
        );
    }

    #[test]
    fn test_infer_2d_transposed() {
        assert_eq!(
            infer("MatMulV3", &[64, 32], &[128, 64], true, true),
            crate::shape![32, 128]
        );
    }

    #[test]
    fn test_infer_k_mismatch() {
        assert!(matches!(
            infer_shape("MatMulV3", &[32, 64], &[65, 128], None, false, false),
            Err(TilingError::ShapeMismatch(..))
        ));
        assert!(matches!(
            infer_shape("BatchMatMulV3", &[-1, 13, 16], &[-1, 13, 16], None, false, false),
            Err(TilingError::ShapeMismatch(..))
        ));
    }

    #[test]
    fn test_infer_batched() {
        let op = "BatchMatMulV3";
        assert_eq!(
            infer(op, &[4, 8, 16, 32, 64], &[16, 64, 64], false, false),
            crate::shape![4, 8, 16, 32, 64]
        );
        assert_eq!(
            infer(op, &[-1, 13, 16], &[-1, 13, 16], true, false),
            crate::shape![-1, 16, 16]
        );
        assert_eq!(
            infer(op, &[1024, 8, -1, -1], &[1024, 8, -1, 64], false, false),
            crate::shape![1024, 8, -1, 64]
        );
        assert_eq!(
            infer(op, &[-1, -1, -1], &[2048, 64, 300], false, true),
            crate::shape![2048, -1, 64]
        );
        assert_eq!(
            infer(op, &[-1, -1, -1, 512], &[512, -1], false, false),
            crate::shape![-1, -1, -1, -1]
        );
        assert_eq!(infer(op, &[4, 3, 5], &[-2], false, false), crate::shape![-2]);
        assert_eq!(infer(op, &[0, 10], &[10, 20], false, false), crate::shape![0, 20]);
    }

    #[test]
    fn test_infer_rejects_bad_extents_and_batches() {
        let op = "BatchMatMulV3";
        assert!(matches!(
            infer_shape(op, &[-3, 10], &[10, 20], None, false, false),
            Err(TilingError::InvalidShape(..))
        ));
        assert!(matches!(
            infer_shape(op, &[3, 4, 10], &[5, 10, 20], None, false, false),
            Err(TilingError::ShapeMismatch(..))
        ));
        assert!(matches!(
            infer_shape(op, &[1, 1, 1, 1, 1, 2, 3], &[3, 4], None, false, false),
            Err(TilingError::InvalidRank(..))
        ));
        assert!(matches!(
            infer_shape("MatMulV3", &[2, 2, 3], &[3, 4], None, false, false),
            Err(TilingError::InvalidRank(..))
        ));
    }

    #[test]
    fn test_infer_bias_fills_unknown_n() {
        let bias: &[Dim] = &[7];
        assert_eq!(
            infer_shape("BatchMatMulV3", &[4, 3, 5], &[4, 5, -1], Some(bias), false, false)
                .unwrap(),
            crate::shape![4, 3, 7]
        );
    }

    #[test]
    fn test_small_2d_uses_base_template() {
        let plan = tile(
            &workload("MatMulV3", &[32, 64], &[64, 128], Dtype::Float16),
            &platform_910b(),
        );
        assert_eq!(plan.tiling_key, 0);
        assert_eq!(plan.block_dim, 1);
        assert_eq!(plan.workspace_size, 32);
        let data = blob(&plan);
        assert_eq!((data.base_m, data.base_n, data.base_k), (32, 128, 64));
        assert_eq!((data.depth_a1, data.depth_b1), (64, 16));
        assert_eq!((data.step_ka, data.step_kb), (32, 8));
        assert_eq!((data.single_core_m, data.single_core_n), (32, 128));
    }

    #[test]
    fn test_large_2d_keeps_basic_block() {
        let plan = tile(
            &workload("MatMulV3", &[4096, 1024], &[1024, 4096], Dtype::Float16),
            &platform_910b(),
        );
        assert_eq!(plan.tiling_key, 0);
        assert_eq!(plan.block_dim, 40);
        let data = blob(&plan);
        assert_eq!((data.base_m, data.base_n, data.base_k), (128, 256, 64));
    }

    #[test]
    fn test_multi_batch_on_regbase() {
        let plan = tile(
            &workload("BatchMatMulV3", &[512, 32, 64], &[512, 64, 32], Dtype::Float16),
            &platform_910_95(),
        );
        assert_eq!(plan.tiling_key, KEY_MULTI_BATCH);
        assert_eq!(plan.block_dim, 64);
        let data = blob(&plan);
        assert_eq!(data.iter_batch, 8);
        assert_eq!(data.batch_c_all, 512);
        assert_eq!((data.single_core_m, data.single_core_n), (32, 32));
    }

    #[test]
    fn test_multi_batch_needs_l0c2out() {
        let plan = tile(
            &workload("BatchMatMulV3", &[512, 32, 64], &[512, 64, 32], Dtype::Float16),
            &platform_910b(),
        );
        assert_eq!(plan.tiling_key & KEY_MULTI_BATCH, 0);
    }

    #[test]
    fn test_batch_merged_into_m_on_regbase() {
        let w = workload("BatchMatMulV3", &[8, 32, 64], &[64, 128], Dtype::Float16);
        let platform = platform_910_95();
        let Prepared::MatMul(p) = crate::ops::prepare(&w, &platform).unwrap() else {
            panic!("expected matmul params");
        };
        assert_eq!((p.m, p.m_ori), (256, 32));
        assert_eq!(p.batch_c_all(), 1);

        let Prepared::MatMul(p) = crate::ops::prepare(&w, &platform_910b()).unwrap() else {
            panic!("expected matmul params");
        };
        assert_eq!(p.m, 32);
        assert_eq!(p.batch_a_all(), 8);
    }

    #[test]
    fn test_al1_full_load() {
        let w = workload("MatMulV3", &[16, 2048], &[2048, 8192], Dtype::Float16);
        let plan = tile(&w, &platform_910b());
        assert_eq!(plan.tiling_key, (LoadMode::Al1FullLoad as u64) << 2);
        let data = blob(&plan);
        assert_eq!(data.single_core_m, 16);
        assert!((1..=40).contains(&plan.block_dim));
    }

    #[test]
    fn test_bl1_full_load() {
        let w = workload("BatchMatMulV3", &[200, 64, 128], &[128, 64], Dtype::Float16);
        let plan = tile(&w, &platform_910b());
        assert_eq!(plan.tiling_key, (LoadMode::Bl1FullLoad as u64) << 2);
        let data = blob(&plan);
        assert_eq!(data.single_core_n, 64);
        assert_eq!(plan.block_dim, 40);
    }

    #[test]
    fn test_no_l1_full_load_on_310p() {
        let w = workload("MatMulV3", &[16, 2048], &[2048, 8192], Dtype::Float16);
        let platform = platform_910b().with_soc_version("Ascend310P");
        assert_eq!(tile(&w, &platform).tiling_key, 0);
    }

    #[test]
    fn test_long_inner_axis_sets_mix_nd2nz() {
        let w = workload("MatMulV3", &[16, 70000], &[70000, 16], Dtype::Float16);
        let plan = tile(&w, &platform_910b());
        assert_eq!(plan.tiling_key, KEY_MIX_ND2NZ);
        assert_eq!(plan.block_dim, 1);
    }

    #[test]
    fn test_validation_errors() {
        let platform = platform_910b();
        let run = |w: &OperatorWorkload| default_registry().select_and_run(w, &platform);

        let w = OperatorWorkload::new("MatMulV3")
            .with_input(TensorDesc::nd(&[32, 64], Dtype::Float16))
            .with_input(TensorDesc::nd(&[64, 128], Dtype::Float32))
            .with_output(TensorDesc::nd(&[32, 128], Dtype::Float16));
        assert!(matches!(run(&w), Err(TilingError::UnsupportedDtype(..))));

        let w = workload("MatMulV3", &[0, 64], &[64, 128], Dtype::Float16);
        assert!(matches!(run(&w), Err(TilingError::InvalidShape(..))));

        let w = workload("MatMulV3", &[32, 64], &[64, 128], Dtype::Float16)
            .with_input(TensorDesc::nd(&[64], Dtype::Float32));
        assert!(matches!(run(&w), Err(TilingError::ShapeMismatch(..))));

        let w = workload("MatMulV3", &[32, 64], &[64, 128], Dtype::Float16)
            .with_input(TensorDesc::nd(&[1, 128], Dtype::Float32));
        assert!(matches!(run(&w), Err(TilingError::InvalidRank(..))));

        let w = OperatorWorkload::new("MatMulV3")
            .with_input(TensorDesc::nd(&[32, 64], Dtype::Float16))
            .with_input(TensorDesc::nd(&[64, 128], Dtype::Float16))
            .with_output(TensorDesc::nd(&[32, 64], Dtype::Float16));
        assert!(matches!(run(&w), Err(TilingError::OutputShapeMismatch(..))));

        let w = workload("MatMulV3", &[32, 64], &[64, 128], Dtype::Int8);
        assert!(matches!(run(&w), Err(TilingError::UnsupportedDtype(..))));
    }

    #[test]
    fn test_transpose_attr_aliases() {
        let w = OperatorWorkload::new("BatchMatMulV3")
            .with_input(TensorDesc::nd(&[2, 64, 32], Dtype::Float16))
            .with_input(TensorDesc::nd(&[2, 64, 128], Dtype::Float16))
            .with_output(TensorDesc::nd(&[2, 32, 128], Dtype::Float16))
            .with_attr("adj_x1", true);
        let Prepared::MatMul(p) = crate::ops::prepare(&w, &platform_910b()).unwrap() else {
            panic!("expected matmul params");
        };
        assert!(p.trans_a);
        assert_eq!((p.m, p.k, p.n), (32, 64, 128));
    }

    #[test]
    fn test_batched_bias() {
        let platform = platform_910_95();
        let w = workload("BatchMatMulV3", &[4, 32, 64], &[4, 64, 128], Dtype::Float16)
            .with_input(TensorDesc::nd(&[4, 1, 128], Dtype::Float32));
        let Prepared::MatMul(p) = crate::ops::prepare(&w, &platform).unwrap() else {
            panic!("expected matmul params");
        };
        assert!(p.bias_with_batch);

        let w = workload("BatchMatMulV3", &[4, 32, 64], &[4, 64, 128], Dtype::Float16)
            .with_input(TensorDesc::nd(&[4, 2, 128], Dtype::Float32));
        assert!(matches!(
            crate::ops::prepare(&w, &platform),
            Err(TilingError::ShapeMismatch(..))
        ));
    }

    #[test]
    fn test_platform_without_cube_buffers_is_resource_exceeded() {
        let platform = MemoryHierarchyDescriptor::parse(
            r#"{"hardware_info": {"CORE_NUM": 8, "UB_SIZE": 196608}}"#,
        )
        .unwrap();
        let w = workload("MatMulV3", &[1024, 1024], &[1024, 1024], Dtype::Float16);
        assert!(matches!(
            default_registry().select_and_run(&w, &platform),
            Err(TilingError::ResourceExceeded(..))
        ));
    }

    #[test]
    fn test_missing_l1_is_resource_exceeded() {
        let mut platform = platform_910b();
        platform.l1_size = 0;
        let w = workload("MatMulV3", &[1024, 1024], &[1024, 1024], Dtype::Float16);
        assert!(matches!(
            default_registry().select_and_run(&w, &platform),
            Err(TilingError::ResourceExceeded(..))
        ));
    }

    #[test]
    fn test_base_block_follows_l0_sizes() {
        let mut platform = platform_910b();
        platform.l0a_size = 32768;
        platform.l0b_size = 32768;
        platform.l0c_size = 65536;
        let w = workload("MatMulV3", &[4096, 1024], &[1024, 4096], Dtype::Float16);
        let data = blob(&tile(&w, &platform));
        assert_eq!((data.base_m, data.base_n, data.base_k), (256, 64, 32));
        assert!(data.base_m * data.base_n <= 65536 / 4);
        assert!(data.base_m * data.base_k * 2 <= 32768 / 2);
    }

    #[test]
    fn test_bias_table_caps_base_n() {
        let mut platform = platform_910b();
        platform.bt_size = 256;
        let w = workload("MatMulV3", &[4096, 1024], &[1024, 4096], Dtype::Float16)
            .with_input(TensorDesc::nd(&[4096], Dtype::Float32));
        assert_eq!(blob(&tile(&w, &platform)).base_n, 64);

        platform.bt_size = 32;
        assert!(matches!(
            default_registry().select_and_run(&w, &platform),
            Err(TilingError::ResourceExceeded(..))
        ));
    }

    #[test]
    fn test_tune_down_param() {
        let (mut y, mut x) = (100, 10);
        tune_down_param(60, &mut y, &mut x, 10, 1);
        assert_eq!((y, x), (60, 6));
        let (mut y, mut x) = (100, 10);
        tune_down_param(0, &mut y, &mut x, 10, 1);
        assert_eq!((y, x), (10, 1));
    }

    proptest! {
        #[test]
        fn test_plans_respect_buffers(
            m in 1i64..3000,
            n in 1i64..3000,
            k in 1i64..3000,
            batch in 1i64..80,
            dtype in prop::sample::select(vec![Dtype::Float16, Dtype::Bfloat16, Dtype::Float32]),
            regbase in any::<bool>(),
        ) {
            let platform = if regbase { platform_910_95() } else { platform_910b() };
            let w = workload("BatchMatMulV3", &[batch, m, k], &[batch, k, n], dtype);
            let plan = tile(&w, &platform);
            prop_assert!(plan.block_dim >= 1);
            prop_assert!(i64::from(plan.block_dim) <= platform.core_num);
            prop_assert_eq!(&plan, &tile(&w, &platform));
            let d = blob(&plan);
            let size = dtype.size();
            let buf = CubeBuffers::new("BatchMatMulV3", &platform, size).unwrap();
            prop_assert!(d.base_m * d.base_k * size <= buf.l0_half);
            prop_assert!(d.base_n * d.base_k * size <= buf.l0_half);
            prop_assert!(d.base_m * d.base_n <= buf.l0c_elems);
            prop_assert!(d.single_core_m <= d.m && d.single_core_n <= d.n);
        }

        #[test]
        fn test_small_cube_buffers_fit_or_fail(
            m in 1i64..2000,
            n in 1i64..2000,
            k in 1i64..2000,
            dtype in prop::sample::select(vec![Dtype::Float16, Dtype::Float32]),
            cores in 1i64..48,
            l1_size in prop::sample::select(vec![0i64, 16 * 1024, 64 * 1024, 256 * 1024, 524288]),
            l0ab_size in prop::sample::select(vec![0i64, 4 * 1024, 16 * 1024, 65536]),
            l0c_size in prop::sample::select(vec![0i64, 8 * 1024, 32 * 1024, 131072]),
        ) {
            let mut platform = platform_910b();
            platform.core_num = cores;
            platform.l1_size = l1_size;
            platform.l0a_size = l0ab_size;
            platform.l0b_size = l0ab_size;
            platform.l0c_size = l0c_size;
            let w = workload("MatMulV3", &[m, k], &[k, n], dtype);
            let run = || default_registry().select_and_run(&w, &platform);
            let result = run();
            prop_assert_eq!(&result, &run());
            match result {
                Ok(plan) => {
                    prop_assert!(plan.block_dim >= 1 && i64::from(plan.block_dim) <= cores);
                    let d = blob(&plan);
                    let size = dtype.size();
                    let buf = CubeBuffers::new("MatMulV3", &platform, size).unwrap();
                    prop_assert!(d.base_m.max(d.base_n) * d.base_k * size <= buf.l0_half);
                    prop_assert!(d.base_m * d.base_n <= buf.l0c_elems);
                }
                Err(e) => prop_assert!(matches!(e, TilingError::ResourceExceeded(..)), "{}", e),
            }
        }
    }
}
