//! Tiling for 3-D max and average pooling over NCDHW or NDHWC tensors.
//!
//! [prepare] validates attributes and the declared output shape once; the regbase templates
//! ([ncdhw_small], [ndhwc_small], [big_kernel]) and the legacy vector template ([avg_vector])
//! then work from the normalized [PoolParams].

pub mod avg_vector;
pub mod big_kernel;
pub mod ncdhw_small;
pub mod ndhwc_small;

use std::str::FromStr;

use itertools::Itertools;
use log::debug;

use crate::common::{num_elements, Dim, Dtype, Format};
use crate::error::TilingError;
use crate::ops::Prepared;
use crate::platform::MemoryHierarchyDescriptor;
use crate::utils::{ceil_align, ceil_div, div_rtn};
use crate::workload::OperatorWorkload;

pub const D: usize = 0;
pub const H: usize = 1;
pub const W: usize = 2;

const RANK: usize = 5;
pub(crate) const MAX_INPUT_ELEMENTS: i64 = u16::MAX as i64;
pub(crate) const BLOCK_SPLIT_THRESHOLD: i64 = 4096;
pub(crate) const WORKSPACE: i64 = 16 * 1024 * 1024;
const MIN_DIVISOR_UB: i64 = 1024;
const MAX_DIVISOR_UB: i64 = 64 * 1024;
const NO_NEED_CALC_DIVISOR: i64 = 10;
const FP32_SIZE: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Avg,
}

impl PoolKind {
    pub fn op_type(&self) -> &'static str {
        match self {
            PoolKind::Max => "MaxPool3D",
            PoolKind::Avg => "AvgPool3D",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum PaddingMode {
    Calculated,
    Same,
    Valid,
}

/// Kernel, stride and dilation per D/H/W axis. `pads` is `[front, back, top, bottom, left, right]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolWindow {
    pub kernel: [i64; 3],
    pub stride: [i64; 3],
    pub dilation: [i64; 3],
    pub pads: [i64; 6],
}

impl PoolWindow {
    /// The input extent covered by one window along `axis`.
    pub fn effective_kernel(&self, axis: usize) -> i64 {
        (self.kernel[axis] - 1) * self.dilation[axis] + 1
    }

    pub fn pad_before(&self, axis: usize) -> i64 {
        self.pads[2 * axis]
    }

    pub fn pad_after(&self, axis: usize) -> i64 {
        self.pads[2 * axis + 1]
    }

    pub fn kernel_volume(&self) -> i64 {
        self.kernel.iter().product()
    }
}

/// A validated pooling workload.
///
/// `declared` holds the window exactly as the attributes give it; `window` has output-1 axes
/// collapsed and is what the regbase templates tile against.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolParams {
    pub kind: PoolKind,
    pub format: Format,
    pub dtype: Dtype,
    pub n: i64,
    pub c: i64,
    /// Independent planes: `N * C` for NCDHW, `N` for NDHWC.
    pub batches: i64,
    /// Values per spatial point: 1 for NCDHW, `C` for NDHWC.
    pub channels: i64,
    pub input: [i64; 3],
    pub output: [i64; 3],
    pub padding_mode: PaddingMode,
    pub declared: PoolWindow,
    pub window: PoolWindow,
    pub ceil_mode: bool,
    pub count_include_pad: bool,
    pub divisor_override: i64,
}

impl PoolParams {
    pub fn padded_extent(&self, axis: usize) -> i64 {
        self.input[axis] + self.window.pad_before(axis) + self.window.pad_after(axis)
    }

    pub fn output_points(&self) -> i64 {
        self.output.iter().product()
    }

    fn last_window_end(&self, axis: usize) -> i64 {
        (self.output[axis] - 1) * self.window.stride[axis] + self.window.effective_kernel(axis)
    }

    /// Whether any window reads outside the unpadded input, either through explicit pads or
    /// through ceil mode running past the end.
    pub fn needs_padding(&self) -> bool {
        if self.window.pads.iter().any(|&p| p != 0) {
            return true;
        }
        self.ceil_mode && (0..3).any(|a| self.last_window_end(a) > self.input[a])
    }

    /// Whether every window lies inside the padded input on all three axes.
    pub fn windows_inside_padding(&self) -> bool {
        (0..3).all(|a| self.last_window_end(a) <= self.padded_extent(a))
    }

    /// The constant average divisor, or 0 when it varies per output point.
    pub fn divisor(&self) -> i64 {
        if self.divisor_override != 0 {
            self.divisor_override
        } else if !self.needs_padding()
            || (self.windows_inside_padding() && self.count_include_pad)
        {
            self.window.kernel_volume()
        } else {
            0
        }
    }

    /// Whether the kernel keeps fp16/bf16 results in an fp32 staging buffer.
    pub(crate) fn stages_in_fp32(&self) -> bool {
        self.kind == PoolKind::Avg && self.divisor_override == 0 && self.dtype.is_b16()
    }
}

/// Output extent of one axis in CALCULATED mode.
pub fn calculated_output_size(
    input: i64,
    kernel: i64,
    pad_before: i64,
    pad_after: i64,
    stride: i64,
    dilation: i64,
    ceil_mode: bool,
) -> i64 {
    let mut total = input + pad_before + pad_after - (kernel - 1) * dilation - 1;
    if ceil_mode {
        total += stride - 1;
    }
    let mut out = div_rtn(total, stride) + 1;
    if ceil_mode && (out - 1) * stride >= input + pad_before {
        out -= 1;
    }
    out
}

fn layout_axes(format: Format) -> (usize, usize, [usize; 3]) {
    match format {
        Format::NCDHW => (0, 1, [2, 3, 4]),
        _ => (0, 4, [1, 2, 3]),
    }
}

/// Expands a 1-, 3- or 5-element attribute to D/H/W. With 5 elements the N and C entries must
/// equal `nc_value` when one is given.
fn expand_axes(
    workload: &OperatorWorkload,
    name: &str,
    values: &[i64],
    format: Format,
    nc_value: Option<i64>,
) -> Result<[i64; 3], TilingError> {
    let (n_axis, c_axis, dhw) = layout_axes(format);
    match values.len() {
        1 => Ok([values[0]; 3]),
        3 => values
            .iter()
            .copied()
            .collect_tuple()
            .map(|(d, h, w)| [d, h, w])
            .ok_or_else(|| workload.invalid_attr(format!("{name} {values:?}"))),
        5 => {
            if let Some(expected) = nc_value {
                if values[n_axis] != expected || values[c_axis] != expected {
                    return Err(workload.invalid_attr(format!(
                        "{name} {values:?} must be {expected} on the N and C axes"
                    )));
                }
            }
            Ok(dhw.map(|a| values[a]))
        }
        len => Err(workload.invalid_attr(format!(
            "{name} must have 1, 3 or 5 elements, got {len}"
        ))),
    }
}

fn required_list(w: &OperatorWorkload, name: &str) -> Result<Vec<i64>, TilingError> {
    w.attr_int_list(name)?
        .ok_or_else(|| w.invalid_attr(format!("{name} is required")))
}

fn check_spatial_shape(op: &str, name: &str, shape: &[Dim]) -> Result<(), TilingError> {
    if shape.len() != RANK {
        return Err(TilingError::InvalidRank(
            op.to_string(),
            format!("{name} {shape:?} must have rank {RANK}"),
        ));
    }
    if shape.iter().any(|&d| d < 0) {
        return Err(TilingError::InvalidShape(
            op.to_string(),
            format!("{name} {shape:?} has an unknown dim"),
        ));
    }
    Ok(())
}

/// Validates shapes and attributes of MaxPool3D and AvgPool3D and normalizes them.
pub fn prepare(
    workload: &OperatorWorkload,
    _platform: &MemoryHierarchyDescriptor,
) -> Result<Prepared, TilingError> {
    let op = workload.op_type.as_str();
    let kind = if op == "AvgPool3D" {
        PoolKind::Avg
    } else {
        PoolKind::Max
    };
    workload.check_arity(1, 1, 1)?;
    let x = workload.input(0, "x")?;
    let y = workload.output(0, "y")?;

    let padding_mode = match kind {
        PoolKind::Avg => PaddingMode::Calculated,
        PoolKind::Max => {
            let raw = workload.attr_str("padding_mode", "CALCULATED")?;
            PaddingMode::from_str(raw)
                .map_err(|_| workload.invalid_attr(format!("unsupported padding_mode {raw}")))?
        }
    };
    let ceil_mode = workload.attr_bool("ceil_mode", false)?;
    let raw_format = workload.attr_str("data_format", "NDHWC")?;
    let format = match Format::from_str(raw_format) {
        Ok(f @ (Format::NCDHW | Format::NDHWC)) => f,
        _ => {
            return Err(workload.invalid_attr(format!(
                "data_format must be NCDHW or NDHWC, got {raw_format}"
            )))
        }
    };

    if !matches!(x.dtype, Dtype::Float32 | Dtype::Float16 | Dtype::Bfloat16) {
        return Err(TilingError::UnsupportedDtype(
            op.to_string(),
            format!("x must be fp32, fp16 or bf16, got {}", x.dtype),
        ));
    }
    if y.dtype != x.dtype {
        return Err(TilingError::UnsupportedDtype(
            op.to_string(),
            format!("y ({}) must match x ({})", y.dtype, x.dtype),
        ));
    }

    check_spatial_shape(op, "x", &x.shape)?;
    check_spatial_shape(op, "y", &y.shape)?;
    let in_size = num_elements(op, &x.shape)?;
    let out_size = num_elements(op, &y.shape)?;
    let (n_axis, c_axis, dhw) = layout_axes(format);
    if in_size == 0 || out_size == 0 {
        return Err(TilingError::InvalidShape(
            op.to_string(),
            format!("x {:?} and y {:?} must not be empty", x.shape, y.shape),
        ));
    }
    for (axis, label) in [(n_axis, "N"), (c_axis, "C")] {
        if x.shape[axis] != y.shape[axis] {
            return Err(TilingError::ShapeMismatch(
                op.to_string(),
                format!("{label} differs between x {:?} and y {:?}", x.shape, y.shape),
            ));
        }
    }
    let input = dhw.map(|a| x.shape[a]);
    let output = dhw.map(|a| y.shape[a]);

    let kernel = expand_axes(workload, "ksize", &required_list(workload, "ksize")?, format, Some(1))?;
    let stride = expand_axes(workload, "strides", &required_list(workload, "strides")?, format, Some(1))?;
    let dilation = match kind {
        PoolKind::Max => match workload.attr_int_list("dilation")? {
            Some(v) => expand_axes(workload, "dilation", &v, format, None)?,
            None => [1; 3],
        },
        PoolKind::Avg => [1; 3],
    };
    for (name, values) in [("ksize", kernel), ("strides", stride), ("dilation", dilation)] {
        if values.iter().any(|&v| v <= 0) {
            return Err(workload.invalid_attr(format!("{name} {values:?} must be positive")));
        }
    }

    let mut window = PoolWindow {
        kernel,
        stride,
        dilation,
        pads: [0; 6],
    };
    match padding_mode {
        PaddingMode::Calculated => {
            window.pads = read_pads(workload, kind)?;
            for axis in 0..3 {
                let limit = window.effective_kernel(axis);
                let (before, after) = (window.pad_before(axis), window.pad_after(axis));
                if !(0..limit).contains(&before) || !(0..limit).contains(&after) {
                    return Err(workload.invalid_attr(format!(
                        "pads {:?} must lie in [0, {limit}) on axis {axis}",
                        window.pads
                    )));
                }
            }
        }
        PaddingMode::Valid => {}
        PaddingMode::Same => {
            for axis in 0..3 {
                let need = ((output[axis] - 1) * stride[axis] + window.effective_kernel(axis)
                    - input[axis])
                    .max(0);
                window.pads[2 * axis] = need / 2;
                window.pads[2 * axis + 1] = need - need / 2;
            }
        }
    }

    let expected = [D, H, W].map(|a| match padding_mode {
        PaddingMode::Valid => (input[a] - window.effective_kernel(a) + stride[a]) / stride[a],
        PaddingMode::Same => (input[a] + stride[a] - 1) / stride[a],
        PaddingMode::Calculated => calculated_output_size(
            input[a],
            kernel[a],
            window.pad_before(a),
            window.pad_after(a),
            stride[a],
            dilation[a],
            ceil_mode,
        ),
    });
    if expected != output {
        return Err(TilingError::OutputShapeMismatch(
            op.to_string(),
            format!(
                "{padding_mode} pooling of {input:?} gives D/H/W {expected:?}, declared {output:?}"
            ),
        ));
    }

    let (count_include_pad, divisor_override) = match kind {
        PoolKind::Avg => (
            workload.attr_bool("count_include_pad", true)?,
            workload.attr_int("divisor_override", 0)?,
        ),
        PoolKind::Max => (false, 0),
    };
    if divisor_override < 0 {
        return Err(workload.invalid_attr(format!(
            "divisor_override {divisor_override} must not be negative"
        )));
    }

    let declared = window;
    if divisor_override == 0 || !count_include_pad {
        refine_unit_axes(&mut window, &input, &output);
    }

    let (n, c) = (x.shape[n_axis], x.shape[c_axis]);
    let (batches, channels) = match format {
        Format::NCDHW => (n * c, 1),
        _ => (n, c),
    };
    debug!("{op}: batches {batches}, channels {channels}, in {input:?}, out {output:?}, {window:?}");
    Ok(Prepared::Pool3d(PoolParams {
        kind,
        format,
        dtype: x.dtype,
        n,
        c,
        batches,
        channels,
        input,
        output,
        padding_mode,
        declared,
        window,
        ceil_mode,
        count_include_pad,
        divisor_override,
    }))
}

fn read_pads(w: &OperatorWorkload, kind: PoolKind) -> Result<[i64; 6], TilingError> {
    let pads = required_list(w, "pads")?;
    match (kind, pads.len()) {
        (_, 6) => Ok([pads[0], pads[1], pads[2], pads[3], pads[4], pads[5]]),
        (PoolKind::Avg, 1) => Ok([pads[0]; 6]),
        (PoolKind::Avg, 3) => Ok([pads[0], pads[0], pads[1], pads[1], pads[2], pads[2]]),
        (_, len) => Err(w.invalid_attr(format!("pads has {len} elements"))),
    }
}

/// Collapses every axis with a single output point to one window covering the input.
fn refine_unit_axes(window: &mut PoolWindow, input: &[i64; 3], output: &[i64; 3]) {
    for axis in 0..3 {
        if output[axis] != 1 || window.dilation[axis] != 1 {
            continue;
        }
        let k = (window.kernel[axis] - window.pad_before(axis)).min(input[axis]);
        window.kernel[axis] = k;
        window.pads[2 * axis] = 0;
        window.pads[2 * axis + 1] = 0;
        window.stride[axis] = k;
    }
}

/// How the small-kernel templates cut the output into UB-sized pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    Cols = 1,
    Rows = 2,
    Depths = 3,
    Batches = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherMode {
    SingleRow = 0,
    MultiRow = 1,
    MultiDepth = 2,
    MultiBatch = 3,
    NotGather = 1001,
}

/// One UB-level tiling: outputs produced per iteration and iteration counts per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UbSplit {
    pub mode: SplitMode,
    pub n_factor: i64,
    /// Output extents per iteration along D/H/W.
    pub factor: [i64; 3],
    /// Iterations along N/D/H/W.
    pub loops: [i64; 4],
}

impl UbSplit {
    pub fn total_loops(&self) -> i64 {
        self.loops.iter().product()
    }

    pub fn outputs_per_loop(&self) -> i64 {
        self.n_factor * self.factor.iter().product::<i64>()
    }
}

/// The UB search shared by the small-kernel templates. Implementors say how one split is
/// chosen for a given budget; the shrinking loop that balances it against the core count is
/// common.
pub(crate) trait UbPlanner {
    fn params(&self) -> &PoolParams;
    fn dtype_size(&self) -> i64;
    /// UB elements usable for input and output tiles.
    fn available(&self) -> i64;
    fn split_once(&self, available: i64) -> Result<UbSplit, TilingError>;

    fn too_small(&self, what: &str, factor: i64) -> TilingError {
        TilingError::ResourceExceeded(
            self.params().kind.op_type().to_string(),
            format!("{what} UB factor {factor} leaves no room for one window"),
        )
    }

    fn split_batches(&self, one_batch_buf: i64, one_batch_input: i64, available: i64) -> UbSplit {
        let p = self.params();
        let mut n = p.batches.min(available / one_batch_buf);
        if n * one_batch_input > MAX_INPUT_ELEMENTS {
            n = MAX_INPUT_ELEMENTS / one_batch_input;
        }
        UbSplit {
            mode: SplitMode::Batches,
            n_factor: n,
            factor: p.output,
            loops: [ceil_div(p.batches, n), 1, 1, 1],
        }
    }

    /// Shrinks the usable UB until the split yields at least one loop per core.
    fn ub_split(&self, cores: i64) -> Result<UbSplit, TilingError> {
        let step = BLOCK_SPLIT_THRESHOLD / self.dtype_size();
        let mut available = self.available();
        let mut best = None;
        let mut last_err = None;
        while available > 0 {
            match self.split_once(available) {
                Ok(split) => {
                    let enough = split.total_loops() >= cores;
                    best = Some(split);
                    if enough {
                        break;
                    }
                }
                Err(e) => {
                    debug!("{}: UB split at {available} failed: {e}", self.params().kind.op_type());
                    last_err = Some(e);
                }
            }
            available -= step;
            if available <= step {
                break;
            }
        }
        match (best, last_err) {
            (Some(split), _) => Ok(split),
            (None, Some(e)) => Err(e),
            (None, None) => Err(self.too_small("UB", available)),
        }
    }
}

/// `(block_factor, block_tail, used_cores)`: every core gets `block_factor` loops and the first
/// `block_tail` cores one more.
pub(crate) fn spread_loops(total: i64, cores: i64) -> (i64, i64, i64) {
    let factor = total / cores;
    let tail = total - factor * cores;
    let used = if factor == 0 { tail } else { cores };
    (factor, tail, used)
}

/// UB bytes reserved for per-point divisors, and whether they must instead be computed per tile.
pub(crate) fn divisor_buffer(p: &PoolParams, ub_block: i64) -> (i64, bool) {
    if p.kind != PoolKind::Avg
        || !p.needs_padding()
        || (p.windows_inside_padding() && p.count_include_pad)
    {
        return (0, false);
    }
    let bytes = ceil_align(p.output_points() * FP32_SIZE, ub_block);
    if bytes <= MIN_DIVISOR_UB {
        (MIN_DIVISOR_UB, false)
    } else if bytes <= MAX_DIVISOR_UB {
        (bytes, false)
    } else {
        (0, true)
    }
}

/// Encodes how the kernel derives divisors: `(divisor_mode, real_calc_divisor)`.
///
/// Mode bits are int64 indexing, count-include-pad, and multi-batch reuse. `batch_reuse` is how
/// many batches' divisors one vector register must hold for reuse to pay off.
pub(crate) fn divisor_mode(
    p: &PoolParams,
    divisor: i64,
    split: &UbSplit,
    block: (i64, i64),
    need_calc_divisor: bool,
    vector_reg_size: i64,
    batch_reuse: i64,
) -> (i64, i64) {
    if divisor != 0 {
        return (NO_NEED_CALC_DIVISOR, 0);
    }
    let max_i32 = i64::from(i32::MAX);
    let one_batch = p.output_points();
    let need_int64 = (0..3).any(|a| p.padded_extent(a) > max_i32) || one_batch > max_i32;
    let reg_elems = vector_reg_size / FP32_SIZE;
    let multi_batch = reg_elems >= batch_reuse * one_batch && split.n_factor > 1;
    let mode =
        (i64::from(need_int64) << 2) + (i64::from(p.count_include_pad) << 1) + i64::from(multi_batch);
    let (factor, tail) = block;
    let max_loops = if tail == 0 { factor } else { factor + 1 };
    let real = need_calc_divisor
        || (max_loops * split.outputs_per_loop() < one_batch && one_batch > reg_elems);
    (mode, i64::from(real))
}

/// Elements of the gather/scatter index register for `dtype`.
pub(crate) fn max_gather_elems(dtype: Dtype, vector_reg_size: i64) -> i64 {
    // b8 and b16 gather with u16 indices, wider types with u32.
    if dtype.size() <= 2 {
        vector_reg_size / 2
    } else {
        vector_reg_size / 4
    }
}
