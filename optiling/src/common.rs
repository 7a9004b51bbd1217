use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{self, Display};

use crate::error::TilingError;

pub type Dim = i64;

/// A tensor shape as seen by shape inference and tiling.
///
/// Extents are signed. [UNKNOWN_DIM] marks a dimension whose extent is not yet known and a
/// shape consisting of the single entry [UNKNOWN_RANK] marks a tensor whose rank is unknown.
pub type Shape = SmallVec<[Dim; 6]>;

pub const UNKNOWN_DIM: Dim = -1;
pub const UNKNOWN_RANK: Dim = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum Dtype {
    #[serde(alias = "fp32", alias = "float")]
    Float32,
    #[serde(alias = "fp16", alias = "half")]
    Float16,
    #[serde(alias = "bf16")]
    Bfloat16,
    #[serde(alias = "int4")]
    Int4,
    #[serde(alias = "int8")]
    Int8,
    #[serde(alias = "int32")]
    Int32,
    #[serde(alias = "int64")]
    Int64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::EnumString)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[allow(clippy::upper_case_acronyms)]
pub enum Format {
    ND,
    NCHW,
    NHWC,
    NCDHW,
    NDHWC,
    /// Fractal layout grouping a 3D tensor's trailing two axes into 16x16 blocks.
    #[serde(rename = "FRACTAL_NZ")]
    #[strum(serialize = "FRACTAL_NZ")]
    FractalNz,
}

/// Shape, element type, and physical layout of one operator input or output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TensorDesc {
    pub shape: Shape,
    pub dtype: Dtype,
    #[serde(default = "default_format")]
    pub format: Format,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype. Int4 values are packed two per
    /// byte and report the size of the containing byte.
    pub fn size(&self) -> i64 {
        match self {
            Dtype::Int4 | Dtype::Int8 => 1,
            Dtype::Float16 | Dtype::Bfloat16 => 2,
            Dtype::Float32 | Dtype::Int32 => 4,
            Dtype::Int64 => 8,
        }
    }

    pub fn is_b16(&self) -> bool {
        matches!(self, Dtype::Float16 | Dtype::Bfloat16)
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dtype::Float32 => write!(f, "fp32"),
            Dtype::Float16 => write!(f, "fp16"),
            Dtype::Bfloat16 => write!(f, "bf16"),
            Dtype::Int4 => write!(f, "i4"),
            Dtype::Int8 => write!(f, "i8"),
            Dtype::Int32 => write!(f, "i32"),
            Dtype::Int64 => write!(f, "i64"),
        }
    }
}

impl Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Format::ND => "ND",
            Format::NCHW => "NCHW",
            Format::NHWC => "NHWC",
            Format::NCDHW => "NCDHW",
            Format::NDHWC => "NDHWC",
            Format::FractalNz => "FRACTAL_NZ",
        };
        f.write_str(s)
    }
}

fn default_format() -> Format {
    Format::ND
}

impl TensorDesc {
    pub fn new(shape: impl Into<Shape>, dtype: Dtype, format: Format) -> Self {
        TensorDesc {
            shape: shape.into(),
            dtype,
            format,
        }
    }

    pub fn nd(shape: &[Dim], dtype: Dtype) -> Self {
        TensorDesc::new(Shape::from_slice(shape), dtype, Format::ND)
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

pub fn is_unknown_rank(shape: &[Dim]) -> bool {
    shape.len() == 1 && shape[0] == UNKNOWN_RANK
}

pub fn is_fully_known(shape: &[Dim]) -> bool {
    shape.iter().all(|&d| d >= 0)
}

/// Returns the number of elements in `shape`, treating a rank-0 shape as a scalar.
///
/// Fails with [TilingError::ResourceExceeded] rather than wrapping on overflow.
pub fn num_elements(op: &str, shape: &[Dim]) -> Result<i64, TilingError> {
    shape.iter().try_fold(1i64, |acc, &d| {
        acc.checked_mul(d).ok_or_else(|| {
            TilingError::ResourceExceeded(op.to_string(), format!("element count of {shape:?}"))
        })
    })
}

#[macro_export]
macro_rules! shape {
    ($($dim:expr),* $(,)*) => {{
        let s: $crate::common::Shape = $crate::smallvec::smallvec![ $( ($dim) as $crate::common::Dim ),* ];
        s
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_unknown_rank_detection() {
        assert!(is_unknown_rank(&[-2]));
        assert!(!is_unknown_rank(&[-2, 3]));
        assert!(!is_unknown_rank(&[-1]));
    }

    #[test]
    fn test_num_elements_overflow_is_an_error() {
        assert!(matches!(
            num_elements("Op", &[i64::MAX, 2]),
            Err(TilingError::ResourceExceeded(..))
        ));
        assert_eq!(num_elements("Op", &[]).unwrap(), 1);
    }

    #[test]
    fn test_dtype_deserializes_short_names() {
        let d: Dtype = serde_json::from_str("\"fp16\"").unwrap();
        assert_eq!(d, Dtype::Float16);
        let d: Dtype = serde_json::from_str("\"Bfloat16\"").unwrap();
        assert_eq!(d, Dtype::Bfloat16);
    }

    proptest! {
        #[test]
        fn test_dtype_size_is_power_of_two(dtype in any::<Dtype>()) {
            prop_assert!(dtype.size().count_ones() == 1);
        }
    }
}
