//! Operator families: shared validation plus their tiling templates.

pub mod add_layer_norm;
pub mod ascend_quant_v2;
pub mod batch_norm_grad;
pub mod matmul;
pub mod pool3d;

use crate::error::TilingError;
use crate::platform::MemoryHierarchyDescriptor;
use crate::workload::OperatorWorkload;

use add_layer_norm::AddLayerNormParams;
use ascend_quant_v2::QuantParams;
use batch_norm_grad::BatchNormGradParams;
use matmul::MatMulParams;
use pool3d::PoolParams;

/// The validated, normalized parameters of one operator family.
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    MatMul(MatMulParams),
    AddLayerNorm(AddLayerNormParams),
    Pool3d(PoolParams),
    BatchNormGrad(BatchNormGradParams),
    AscendQuantV2(QuantParams),
}

/// Runs the shared validation for `workload`'s operator family.
pub fn prepare(
    workload: &OperatorWorkload,
    platform: &MemoryHierarchyDescriptor,
) -> Result<Prepared, TilingError> {
    match workload.op_type.as_str() {
        "MatMulV3" | "BatchMatMulV3" => matmul::prepare(workload, platform),
        "AddLayerNorm" => add_layer_norm::prepare(workload, platform),
        "MaxPool3D" | "AvgPool3D" => pool3d::prepare(workload, platform),
        "BatchNormGrad" => batch_norm_grad::prepare(workload, platform),
        "AscendQuantV2" => ascend_quant_v2::prepare(workload, platform),
        other => Err(TilingError::NoCapableTemplate(other.to_string())),
    }
}

macro_rules! prepared_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        pub fn $fn_name(&self, op: &str) -> Result<&$ty, TilingError> {
            match self {
                Prepared::$variant(p) => Ok(p),
                _ => Err(TilingError::NoCapableTemplate(op.to_string())),
            }
        }
    };
}

impl Prepared {
    prepared_accessor!(matmul, MatMul, MatMulParams);
    prepared_accessor!(add_layer_norm, AddLayerNorm, AddLayerNormParams);
    prepared_accessor!(pool3d, Pool3d, PoolParams);
    prepared_accessor!(batch_norm_grad, BatchNormGrad, BatchNormGradParams);
    prepared_accessor!(ascend_quant_v2, AscendQuantV2, QuantParams);
}
