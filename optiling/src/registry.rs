use enum_dispatch::enum_dispatch;
use indexmap::IndexMap;
use lazy_static::lazy_static;
use log::{debug, info};

use crate::error::TilingError;
use crate::ops::add_layer_norm::{AddLayerNormLegacy, AddLayerNormRegbase};
use crate::ops::ascend_quant_v2::{AscendQuantV2Legacy, AscendQuantV2Regbase};
use crate::ops::batch_norm_grad::{
    BatchNormGradRaFullLoad, BatchNormGradRaRecompute, BatchNormGradRarFullLoad,
    BatchNormGradRarRecompute,
};
use crate::ops::matmul::{MatMulBase, MatMulL1FullLoad, MatMulMultiBatch};
use crate::ops::pool3d::avg_vector::AvgPool3dVector;
use crate::ops::pool3d::big_kernel::Pool3dBigKernel;
use crate::ops::pool3d::ncdhw_small::Pool3dNcdhwSmallKernel;
use crate::ops::pool3d::ndhwc_small::Pool3dNdhwcSmallKernel;
use crate::ops::{self, Prepared};
use crate::plan::TilingPlan;
use crate::platform::MemoryHierarchyDescriptor;
use crate::workload::OperatorWorkload;

/// Everything a template sees for one invocation.
///
/// `prepared` holds the operator family's validated parameters; it is computed once, before any
/// template is probed.
pub struct TilingContext<'a> {
    pub workload: &'a OperatorWorkload,
    pub platform: &'a MemoryHierarchyDescriptor,
    pub prepared: &'a Prepared,
}

impl TilingContext<'_> {
    pub fn op(&self) -> &str {
        &self.workload.op_type
    }
}

#[enum_dispatch]
pub trait TilingTemplate {
    fn name(&self) -> &'static str;

    /// Whether this template can tile the workload. Must be cheap and must not fail; a workload
    /// the template cannot handle simply yields `false`.
    fn is_capable(&self, ctx: &TilingContext<'_>) -> bool;

    /// Computes the complete plan. Only called after [TilingTemplate::is_capable] returned `true`.
    fn tile(&self, ctx: &TilingContext<'_>) -> Result<TilingPlan, TilingError>;
}

/// The closed set of tiling strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[enum_dispatch(TilingTemplate)]
pub enum Template {
    MatMulMultiBatch(MatMulMultiBatch),
    MatMulL1FullLoad(MatMulL1FullLoad),
    MatMulBase(MatMulBase),
    AddLayerNormRegbase(AddLayerNormRegbase),
    AddLayerNormLegacy(AddLayerNormLegacy),
    Pool3dNcdhwSmallKernel(Pool3dNcdhwSmallKernel),
    Pool3dNdhwcSmallKernel(Pool3dNdhwcSmallKernel),
    Pool3dBigKernel(Pool3dBigKernel),
    AvgPool3dVector(AvgPool3dVector),
    BatchNormGradRarFullLoad(BatchNormGradRarFullLoad),
    BatchNormGradRaFullLoad(BatchNormGradRaFullLoad),
    BatchNormGradRarRecompute(BatchNormGradRarRecompute),
    BatchNormGradRaRecompute(BatchNormGradRaRecompute),
    AscendQuantV2Regbase(AscendQuantV2Regbase),
    AscendQuantV2Legacy(AscendQuantV2Legacy),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub template: Template,
    pub priority: u32,
}

/// Maps operator names to their candidate templates, sorted by ascending priority.
#[derive(Debug, Clone, Default)]
pub struct TilingTemplateRegistry {
    ops: IndexMap<String, Vec<Candidate>>,
}

lazy_static! {
    static ref DEFAULT_REGISTRY: TilingTemplateRegistry = TilingTemplateRegistry::with_defaults();
}

/// The process-wide registry holding every built-in operator. Populated on first use.
pub fn default_registry() -> &'static TilingTemplateRegistry {
    &DEFAULT_REGISTRY
}

impl TilingTemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for op in ["MatMulV3", "BatchMatMulV3"] {
            registry.register(op, MatMulMultiBatch.into(), 10);
            registry.register(op, MatMulL1FullLoad.into(), 20);
            registry.register(op, MatMulBase.into(), 30);
        }
        registry.register("AddLayerNorm", AddLayerNormRegbase.into(), 10);
        registry.register("AddLayerNorm", AddLayerNormLegacy.into(), 20);
        for op in ["MaxPool3D", "AvgPool3D"] {
            registry.register(op, Pool3dNcdhwSmallKernel.into(), 10);
            registry.register(op, Pool3dNdhwcSmallKernel.into(), 12);
            registry.register(op, Pool3dBigKernel.into(), 20);
        }
        registry.register("AvgPool3D", AvgPool3dVector.into(), 30);
        registry.register("BatchNormGrad", BatchNormGradRarFullLoad.into(), 10000000);
        registry.register("BatchNormGrad", BatchNormGradRaFullLoad.into(), 20000000);
        registry.register("BatchNormGrad", BatchNormGradRarRecompute.into(), 30000000);
        registry.register("BatchNormGrad", BatchNormGradRaRecompute.into(), 40000000);
        registry.register("AscendQuantV2", AscendQuantV2Regbase.into(), 10);
        registry.register("AscendQuantV2", AscendQuantV2Legacy.into(), 20);
        registry
    }

    /// Adds a candidate for `op`. Candidates with equal priority keep their insertion order.
    pub fn register(&mut self, op: &str, template: Template, priority: u32) {
        let candidates = self.ops.entry(op.to_string()).or_default();
        candidates.push(Candidate { template, priority });
        candidates.sort_by_key(|c| c.priority);
    }

    pub fn candidates(&self, op: &str) -> &[Candidate] {
        self.ops.get(op).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ops(&self) -> impl Iterator<Item = (&str, &[Candidate])> {
        self.ops.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Validates the workload, then runs the first capable candidate in priority order.
    pub fn select_and_run(
        &self,
        workload: &OperatorWorkload,
        platform: &MemoryHierarchyDescriptor,
    ) -> Result<TilingPlan, TilingError> {
        let op = workload.op_type.as_str();
        let candidates = self.candidates(op);
        if candidates.is_empty() {
            return Err(TilingError::NoCapableTemplate(op.to_string()));
        }
        let prepared = ops::prepare(workload, platform)?;
        let ctx = TilingContext {
            workload,
            platform,
            prepared: &prepared,
        };
        for candidate in candidates {
            if candidate.template.is_capable(&ctx) {
                info!(
                    "{op}: selected template {} (priority {})",
                    candidate.template.name(),
                    candidate.priority
                );
                let plan = candidate.template.tile(&ctx)?;
                debug!(
                    "{op}: key {}, block dim {}, workspace {}, {} blob bytes",
                    plan.tiling_key,
                    plan.block_dim,
                    plan.workspace_size,
                    plan.blob.len()
                );
                return Ok(plan);
            }
            debug!("{op}: template {} declined", candidate.template.name());
        }
        Err(TilingError::NoCapableTemplate(op.to_string()))
    }
}
