//! Tiling for AscendQuantV2: `y = round(x * scale [+ offset])`, quantizing to int8 or int4.
//!
//! The input is merged to three dims according to the quantization mode: per-tensor
//! `[1, size, 1]`, per-channel `[rows, channels, 1]` and per-head `[batch, heads, head_dim]`.
//! [AscendQuantV2Legacy] tiles earlier chips, including the FRACTAL_NZ kernel.
//! [AscendQuantV2Regbase] tiles the register-based vector architecture with double-buffered UB.

use std::str::FromStr;

use log::{debug, info};

use crate::common::{num_elements, Dim, Dtype, Format, Shape};
use crate::error::TilingError;
use crate::ops::Prepared;
use crate::plan::TilingPlan;
use crate::platform::MemoryHierarchyDescriptor;
use crate::registry::{TilingContext, TilingTemplate};
use crate::utils::{ceil_align, ceil_div, floor_align, split_evenly};
use crate::workload::OperatorWorkload;

/// `dst_type` attribute codes, as in the graph engine's data type enum.
pub const DST_TYPE_INT8: i64 = 2;
pub const DST_TYPE_INT4: i64 = 29;

const MIN_SPLIT_LEN: i64 = 32;
const BLOCK_BYTES: i64 = 32;
const CACHE_LINE_910B: i64 = 512;
const CACHE_LINE_310P: i64 = 32;
const CACHE_LINE_REGBASE: i64 = 128;
const CAST_BYTES: i64 = 4;
const Y_BYTES: i64 = 1;
const REGBASE_BUFFERS: i64 = 2;
const NZ_FRACTAL: i64 = 16;
const WORKSPACE: i64 = 16 * 1024 * 1024;

/// `block_axis` value marking a split over both merged rows and channels.
pub const BLOCK_AXIS_DOUBLE_CUT: i64 = 11;

const LEGACY_KEY_NZ: u64 = 3;
const REGBASE_KEY_MODE: u64 = 1000;
const REGBASE_KEY_OFFSET: u64 = 100;
const REGBASE_KEY_ROUND: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum QuantMode {
    /// `scale` holds a single element.
    PerTensor,
    /// `scale` runs along the last axis of `x`.
    PerChannel,
    /// `scale` runs along the second-to-last axis of `x`.
    PerHead,
}

impl QuantMode {
    fn code(self) -> u64 {
        match self {
            QuantMode::PerTensor => 0,
            QuantMode::PerChannel => 1,
            QuantMode::PerHead => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RoundMode {
    Round,
    Floor,
    Ceil,
    Trunc,
}

impl RoundMode {
    fn code(self) -> i64 {
        match self {
            RoundMode::Round => 0,
            RoundMode::Floor => 1,
            RoundMode::Ceil => 2,
            RoundMode::Trunc => 3,
        }
    }
}

/// Validated AscendQuantV2 workload with `x` merged to three dims.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantParams {
    pub dims: [i64; 3],
    pub mode: QuantMode,
    pub x_dtype: Dtype,
    pub scale_dtype: Dtype,
    pub offset_dtype: Option<Dtype>,
    pub dst: Dtype,
    pub round: RoundMode,
    pub sqrt_mode: bool,
    /// `x` is stored as FRACTAL_NZ and `dims` is its `[E, K, N]` storage shape.
    pub nz: bool,
}

impl QuantParams {
    pub fn has_offset(&self) -> bool {
        self.offset_dtype.is_some()
    }
}

crate::tiling_data! {
    pub struct AscendQuantV2TilingData {
        pub num_core: i64,
        pub block_axis: i64,
        pub ub_axis: i64,
        pub dim0: i64,
        pub dim1: i64,
        pub dim2: i64,
        pub block_union: i64,
        pub block_factor: i64,
        pub block_tail_factor: i64,
        pub base_n: i64,
        pub base_len: i64,
        pub has_offset: i64,
        pub sqrt_mode: i64,
        pub round_mode: i64,
    }
}

crate::tiling_data! {
    pub struct AscendQuantV2NzTilingData {
        pub e: i64,
        pub k: i64,
        pub n: i64,
        pub need_core_num: i64,
        pub has_offset: i64,
        pub sqrt_mode: i64,
        pub round_mode: i64,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AscendQuantV2Legacy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AscendQuantV2Regbase;

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

fn check_float_dtype(op: &str, name: &str, dtype: Dtype) -> Result<(), TilingError> {
    match dtype {
        Dtype::Float32 | Dtype::Float16 | Dtype::Bfloat16 => Ok(()),
        _ => Err(TilingError::UnsupportedDtype(
            op.to_string(),
            format!("{name} must be fp32, fp16 or bf16, got {dtype}"),
        )),
    }
}

/// Checks that `param` (scale or offset) runs along `axis` of `x`: either rank 1 or the rank of
/// `x`, with every dim but the one at `axis` equal to 1.
fn check_quant_param(
    op: &str,
    name: &str,
    x: &[Dim],
    param: &[Dim],
    axis: usize,
) -> Result<(), TilingError> {
    if param.len() != x.len() && param.len() != 1 {
        return Err(TilingError::InvalidRank(
            op.to_string(),
            format!("{name} {param:?} must have rank 1 or the rank of x {x:?}"),
        ));
    }
    let param_axis = if param.len() == 1 { 0 } else { axis };
    let (x_dim, param_dim) = (x[axis], param[param_axis]);
    if param_dim != x_dim && param_dim != 1 {
        return Err(TilingError::ShapeMismatch(
            op.to_string(),
            format!("dim {param_axis} of {name} {param:?} must be 1 or {x_dim}"),
        ));
    }
    if num_elements(op, param)? != param_dim {
        return Err(TilingError::ShapeMismatch(
            op.to_string(),
            format!("{name} {param:?} may only be larger than 1 along axis {axis}"),
        ));
    }
    Ok(())
}

fn dst_dtype(workload: &OperatorWorkload) -> Result<Dtype, TilingError> {
    match workload.attr_int("dst_type", DST_TYPE_INT8)? {
        DST_TYPE_INT8 => Ok(Dtype::Int8),
        DST_TYPE_INT4 => Ok(Dtype::Int4),
        other => Err(workload.invalid_attr(format!("dst_type {other} must be int8 or int4"))),
    }
}

/// Normalizes `axis` into `0..rank`, requiring one of the last two axes for rank above 2.
fn resolve_axis(workload: &OperatorWorkload, axis: i64, rank: usize) -> Result<usize, TilingError> {
    let rank = rank as i64;
    if axis >= rank || axis < -rank {
        return Err(workload.invalid_attr(format!("axis {axis} out of range for rank {rank}")));
    }
    let resolved = if axis < 0 { axis + rank } else { axis };
    if resolved < rank - 2 {
        return Err(workload.invalid_attr(format!(
            "axis {axis} must be one of the last two axes of a rank {rank} x"
        )));
    }
    Ok(resolved as usize)
}

/// Collapses `x` to `[dim0, dim1, dim2]`. A per-head split with a head dim of 1 is per-channel.
fn merge_dims(x: &[Dim], mode: QuantMode) -> ([i64; 3], QuantMode) {
    let rank = x.len();
    match mode {
        QuantMode::PerTensor => ([1, x.iter().product(), 1], mode),
        QuantMode::PerHead if x[rank - 1] != 1 => {
            let batch = x[..rank - 2].iter().product();
            ([batch, x[rank - 2], x[rank - 1]], mode)
        }
        QuantMode::PerHead | QuantMode::PerChannel => {
            let rows = x[..rank - 1].iter().product();
            ([rows, x[rank - 1], 1], QuantMode::PerChannel)
        }
    }
}

pub fn prepare(
    workload: &OperatorWorkload,
    platform: &MemoryHierarchyDescriptor,
) -> Result<Prepared, TilingError> {
    let op = workload.op_type.as_str();
    workload.check_arity(2, 3, 1)?;
    let x = workload.input(0, "x")?;
    let scale = workload.input(1, "scale")?;
    let offset = workload.optional_input(2);
    let y = workload.output(0, "y")?;

    let x_shape = ensure_not_scalar(&x.shape);
    let scale_shape = ensure_not_scalar(&scale.shape);
    check_positive(op, "x", &x_shape)?;
    check_positive(op, "scale", &scale_shape)?;
    check_float_dtype(op, "x", x.dtype)?;
    check_float_dtype(op, "scale", scale.dtype)?;

    let sqrt_mode = workload.attr_bool("sqrt_mode", false)?;
    let raw_round = workload.attr_str("round_mode", "round")?;
    let round = RoundMode::from_str(raw_round).map_err(|_| {
        workload.invalid_attr(format!(
            "round_mode {raw_round:?} must be round, floor, ceil or trunc"
        ))
    })?;
    let dst = dst_dtype(workload)?;
    let mut axis = workload.attr_int("axis", -1)?;
    if platform.is_310p() {
        if dst != Dtype::Int8 {
            return Err(TilingError::UnsupportedDtype(
                op.to_string(),
                format!("dst_type must be int8 on Ascend310P, got {dst}"),
            ));
        }
        axis = -1;
    }
    if y.dtype != dst {
        return Err(TilingError::UnsupportedDtype(
            op.to_string(),
            format!("y is {} but dst_type is {dst}", y.dtype),
        ));
    }
    let last = x_shape[x_shape.len() - 1];
    if dst == Dtype::Int4 && last % 2 != 0 {
        return Err(TilingError::InvalidShape(
            op.to_string(),
            format!("last dim of x {x_shape:?} must be even for int4 output"),
        ));
    }
    let axis_idx = resolve_axis(workload, axis, x_shape.len())?;

    check_quant_param(op, "scale", &x_shape, &scale_shape, axis_idx)?;
    if let Some(offset) = offset {
        let offset_shape = ensure_not_scalar(&offset.shape);
        if offset_shape != scale_shape {
            return Err(TilingError::ShapeMismatch(
                op.to_string(),
                format!("offset {offset_shape:?} must equal scale {scale_shape:?}"),
            ));
        }
        check_float_dtype(op, "offset", offset.dtype)?;
        check_quant_param(op, "offset", &x_shape, &offset_shape, axis_idx)?;
    }
    if ensure_not_scalar(&y.shape) != x_shape {
        return Err(TilingError::OutputShapeMismatch(
            op.to_string(),
            format!("y {:?} must equal x {x_shape:?}", y.shape),
        ));
    }

    let rank = x_shape.len();
    let mode = if num_elements(op, &scale_shape)? == 1 {
        QuantMode::PerTensor
    } else if rank > 1 && axis_idx == rank - 2 {
        QuantMode::PerHead
    } else {
        QuantMode::PerChannel
    };

    let nz = x.format == Format::FractalNz;
    let (dims, mode) = if nz {
        if rank != 3 {
            return Err(TilingError::InvalidRank(
                op.to_string(),
                format!("FRACTAL_NZ x {x_shape:?} must have rank 3"),
            ));
        }
        ([x_shape[0], x_shape[1], x_shape[2]], mode)
    } else {
        merge_dims(&x_shape, mode)
    };
    debug!("{op}: {mode:?} over merged dims {dims:?}");

    Ok(Prepared::AscendQuantV2(QuantParams {
        dims,
        mode,
        x_dtype: x.dtype,
        scale_dtype: scale.dtype,
        offset_dtype: offset.map(|o| o.dtype),
        dst,
        round,
        sqrt_mode,
        nz,
    }))
}

/// Cores used when `units` are spread evenly over at most `cores`.
fn used_cores(units: i64, cores: i64) -> i64 {
    split_evenly(units, cores).map_or(0, |s| s.used_cores)
}

/// Cores used when each of `outer` rows gets its own group of cores splitting `inner`.
/// Zero when there are fewer cores than rows.
fn double_cut_cores(outer: i64, inner: i64, cores: i64) -> i64 {
    if outer <= 0 || cores / outer == 0 {
        return 0;
    }
    outer * used_cores(inner, cores / outer)
}

fn tail(extent: i64, factor: i64, parts: i64) -> i64 {
    match extent - factor * (parts - 1) {
        0 => factor,
        t => t,
    }
}

/// UB budget and cache-line geometry of one kernel generation.
struct Planner<'a> {
    p: &'a QuantParams,
    cores: i64,
    ub: i64,
    x_size: i64,
    /// Elements of `x` per cache line.
    per_line: i64,
    /// Extra bytes per element for fp32 copies of b16 inputs.
    cast: i64,
    buffers: i64,
    double_cut: bool,
    /// Per-tensor input is split as one flat row rather than as `[1, size]` rows.
    flat_per_tensor: bool,
    /// Short rows are bound together so one core moves at least a block.
    bind_short_rows: bool,
}

impl<'a> Planner<'a> {
    fn legacy(p: &'a QuantParams, platform: &MemoryHierarchyDescriptor) -> Self {
        let cache_line = if platform.is_310p() {
            CACHE_LINE_310P
        } else {
            CACHE_LINE_910B
        };
        Planner {
            p,
            cores: platform.core_num,
            ub: platform.ub_size,
            x_size: p.x_dtype.size(),
            per_line: cache_line / p.x_dtype.size(),
            cast: if p.x_dtype.is_b16() { CAST_BYTES } else { 0 },
            buffers: 1,
            double_cut: true,
            flat_per_tensor: false,
            bind_short_rows: platform.is_310p(),
        }
    }

    fn regbase(p: &'a QuantParams, platform: &MemoryHierarchyDescriptor) -> Self {
        Planner {
            p,
            cores: platform.core_num,
            ub: platform.ub_size,
            x_size: p.x_dtype.size(),
            per_line: CACHE_LINE_REGBASE / p.x_dtype.size(),
            cast: 0,
            buffers: REGBASE_BUFFERS,
            double_cut: false,
            flat_per_tensor: true,
            bind_short_rows: false,
        }
    }

    /// Tensors of `x`'s width resident per element: `x` plus scale and offset unless per-tensor.
    fn streams(&self) -> i64 {
        match self.p.mode {
            QuantMode::PerTensor => 1,
            _ if self.p.has_offset() => 3,
            _ => 2,
        }
    }

    /// Longest cache-line aligned row segment UB can hold.
    fn max_base(&self, op: &str) -> Result<i64, TilingError> {
        let per_elem = self.buffers * ((self.x_size + self.cast) * self.streams() + Y_BYTES);
        let max_base = floor_align(self.ub / per_elem, self.per_line);
        if max_base < self.per_line {
            return Err(TilingError::ResourceExceeded(
                op.to_string(),
                format!(
                    "UB of {} bytes cannot hold one {}-element cache line",
                    self.ub, self.per_line
                ),
            ));
        }
        Ok(max_base)
    }

    /// Rows of width `base` that fit once the scale and offset rows are resident.
    fn max_rows(&self, base: i64) -> i64 {
        let params = self.streams() - 1;
        let left = self.ub
            - self.buffers * base * (self.x_size + self.cast) * params
            - base * self.cast;
        if left <= 0 {
            return 1;
        }
        (left / (self.x_size + Y_BYTES) / base / self.buffers).max(1)
    }

    fn tile(&self, op: &str) -> Result<AscendQuantV2TilingData, TilingError> {
        let max_base = self.max_base(op)?;
        let [dim0, dim1, dim2] = self.p.dims;
        let mut data = AscendQuantV2TilingData {
            dim0,
            dim1,
            dim2,
            block_union: 1,
            has_offset: self.p.has_offset().into(),
            sqrt_mode: self.p.sqrt_mode.into(),
            round_mode: self.p.round.code(),
            ..Default::default()
        };
        match self.p.mode {
            QuantMode::PerHead => self.split_heads(&mut data, max_base),
            QuantMode::PerTensor if self.flat_per_tensor => self.split_flat(&mut data, max_base),
            _ => self.split_rows(&mut data, max_base),
        }
        Ok(data)
    }

    /// A single flat row split by cache lines.
    fn split_flat(&self, d: &mut AscendQuantV2TilingData, max_base: i64) {
        let lines = ceil_div(d.dim1, self.per_line);
        d.num_core = used_cores(lines, self.cores);
        d.block_axis = 1;
        d.block_factor = ceil_div(lines, d.num_core) * self.per_line;
        d.block_tail_factor = tail(d.dim1, d.block_factor, d.num_core);
        d.ub_axis = 1;
        d.base_n = 1;
        d.base_len = ceil_align(d.block_factor, self.per_line).min(max_base);
    }

    /// `[rows, channels]`: split the axis that feeds more cores, or both when neither fills them.
    fn split_rows(&self, d: &mut AscendQuantV2TilingData, max_base: i64) {
        let (dim0, dim1) = (d.dim0, d.dim1);
        let mut bind = 1;
        let mut rows = dim0;
        if self.bind_short_rows && dim1 < BLOCK_BYTES {
            bind = ceil_div(BLOCK_BYTES, dim1);
            rows = ceil_div(dim0, bind).max(1);
        }
        let lines = ceil_div(dim1, self.per_line);
        let by_rows = used_cores(rows, self.cores);
        let by_lines = used_cores(lines, self.cores);
        let single = by_rows.max(by_lines);
        let both = double_cut_cores(rows, lines, self.cores);

        if self.double_cut
            && single < self.cores
            && rows > 1
            && dim1 > MIN_SPLIT_LEN
            && both > single
        {
            d.num_core = both;
            d.block_axis = BLOCK_AXIS_DOUBLE_CUT;
            d.block_union = both / rows;
            d.block_factor = ceil_div(lines, d.block_union) * self.per_line;
            d.block_tail_factor = tail(dim1, d.block_factor, d.block_union);
            d.ub_axis = 1;
            d.base_n = 1;
            d.base_len = ceil_align(d.block_factor, self.per_line).min(max_base);
            return;
        }

        d.num_core = single;
        let (width, inner) = if by_rows >= by_lines {
            d.block_axis = 0;
            d.block_factor = ceil_div(rows, single) * bind;
            d.block_tail_factor = tail(dim0, d.block_factor, single);
            (dim1, d.block_factor)
        } else {
            d.block_axis = 1;
            d.block_factor = ceil_div(lines, single) * self.per_line;
            d.block_tail_factor = tail(dim1, d.block_factor, single);
            (d.block_factor, dim0)
        };
        let base = ceil_align(width, self.per_line);
        if base <= max_base / 2 {
            d.ub_axis = 0;
            d.base_n = self.max_rows(base).min(inner);
            d.base_len = base;
        } else {
            d.ub_axis = 1;
            d.base_n = 1;
            d.base_len = base.min(max_base);
        }
    }

    /// `[batch, heads, head_dim]`: split whichever of the three axes feeds the most cores.
    fn split_heads(&self, d: &mut AscendQuantV2TilingData, max_base: i64) {
        let (s0, s1, s2) = (d.dim0, d.dim1, d.dim2);
        let lines = ceil_div(s2, self.per_line);
        let by_batch = used_cores(s0, self.cores);
        let by_heads = double_cut_cores(s0, s1, self.cores);
        let by_lines = double_cut_cores(s0 * s1, lines, self.cores);

        d.block_axis = 0;
        d.num_core = by_batch;
        if by_heads > d.num_core {
            d.block_axis = 1;
            d.num_core = by_heads;
        }
        if by_lines > d.num_core && s2 > MIN_SPLIT_LEN {
            d.block_axis = 2;
            d.num_core = by_lines;
        }

        match d.block_axis {
            0 => {
                d.block_factor = ceil_div(s0, d.num_core);
                d.block_tail_factor = tail(s0, d.block_factor, d.num_core);
            }
            1 => {
                d.block_union = d.num_core / s0;
                d.block_factor = ceil_div(s1, d.block_union);
                d.block_tail_factor = tail(s1, d.block_factor, d.block_union);
            }
            _ => {
                d.block_union = d.num_core / (s0 * s1);
                d.block_factor = ceil_div(lines, d.block_union) * self.per_line;
                d.block_tail_factor = tail(s2, d.block_factor, d.block_union);
            }
        }

        let width = ceil_align(s2, self.per_line);
        let (ub_axis, base_n, base_len) = match d.block_axis {
            0 if s1 * width <= max_base => (0, s1, width),
            0 if width <= max_base => (1, max_base / width, width),
            1 if width <= max_base => (1, d.block_factor.min(max_base / width), width),
            0 | 1 => (2, 1, max_base),
            _ => (2, 1, ceil_align(d.block_factor, self.per_line).min(max_base)),
        };
        d.ub_axis = ub_axis;
        d.base_n = base_n;
        d.base_len = base_len;
    }
}

fn log_plan(op: &str, key: u64, d: &AscendQuantV2TilingData) {
    info!(
        "{op}: key {key}, {} cores on axis {} (factor {}, tail {}), ub axis {} with {}x{}",
        d.num_core,
        d.block_axis,
        d.block_factor,
        d.block_tail_factor,
        d.ub_axis,
        d.base_n,
        d.base_len
    );
}

impl AscendQuantV2Legacy {
    fn tile_nz(&self, ctx: &TilingContext<'_>, p: &QuantParams) -> Result<TilingPlan, TilingError> {
        let [e, k, n] = p.dims;
        let data = AscendQuantV2NzTilingData {
            e,
            k,
            n,
            need_core_num: (k / NZ_FRACTAL).clamp(1, ctx.platform.core_num),
            has_offset: p.has_offset().into(),
            sqrt_mode: p.sqrt_mode.into(),
            round_mode: p.round.code(),
        };
        info!(
            "{}: key {LEGACY_KEY_NZ}, {} cores over FRACTAL_NZ [{e}, {k}, {n}]",
            ctx.op(),
            data.need_core_num
        );
        TilingPlan::new(
            ctx.op(),
            ctx.platform,
            LEGACY_KEY_NZ,
            data.need_core_num,
            data.to_blob(),
            WORKSPACE,
        )
    }
}

impl TilingTemplate for AscendQuantV2Legacy {
    fn name(&self) -> &'static str {
        "AscendQuantV2Legacy"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        matches!(ctx.prepared, Prepared::AscendQuantV2(_)) && !ctx.platform.is_regbase()
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let p = ctx.prepared.ascend_quant_v2(ctx.op())?;
        if p.nz {
            return self.tile_nz(ctx, p);
        }
        let data = Planner::legacy(p, ctx.platform).tile(ctx.op())?;
        let key = p.mode.code();
        log_plan(ctx.op(), key, &data);
        TilingPlan::new(
            ctx.op(),
            ctx.platform,
            key,
            data.num_core,
            data.to_blob(),
            WORKSPACE,
        )
    }
}

impl TilingTemplate for AscendQuantV2Regbase {
    fn name(&self) -> &'static str {
        "AscendQuantV2Regbase"
    }

    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool {
        match ctx.prepared {
            Prepared::AscendQuantV2(p) => ctx.platform.is_regbase() && !p.nz,
            _ => false,
        }
    }

    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError> {
        let p = ctx.prepared.ascend_quant_v2(ctx.op())?;
        let mismatched = std::iter::once(p.scale_dtype)
            .chain(p.offset_dtype)
            .find(|&d| d != p.x_dtype);
        if let Some(other) = mismatched {
            return Err(TilingError::UnsupportedDtype(
                ctx.op().to_string(),
                format!("scale and offset must match x ({}), got {other}", p.x_dtype),
            ));
        }
        let data = Planner::regbase(p, ctx.platform).tile(ctx.op())?;
        let key = p.mode.code() * REGBASE_KEY_MODE
            + u64::from(p.has_offset()) * REGBASE_KEY_OFFSET
            + (p.round.code() as u64 + 1) * REGBASE_KEY_ROUND
            + u64::from(p.sqrt_mode);
        log_plan(ctx.op(), key, &data);
        TilingPlan::new(
            ctx.op(),
            ctx.platform,
            key,
            data.num_core,
            data.to_blob(),
            WORKSPACE,
        )
    }
}
