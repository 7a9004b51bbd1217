use log::warn;

use crate::error::TilingError;
use crate::plan::TilingPlan;
use crate::platform::MemoryHierarchyDescriptor;
use crate::registry::TilingTemplateRegistry;
use crate::workload::OperatorWorkload;

/// Top-level entry point: holds one parsed platform descriptor and a registry to select from.
///
/// Tiling calls take `&self` and share no mutable state, so a dispatcher may be used from many
/// threads at once.
pub struct TilingDispatcher<'r> {
    registry: &'r TilingTemplateRegistry,
    platform: MemoryHierarchyDescriptor,
}

impl<'r> TilingDispatcher<'r> {
    pub fn new(registry: &'r TilingTemplateRegistry, platform: MemoryHierarchyDescriptor) -> Self {
        TilingDispatcher { registry, platform }
    }

    /// Parses the platform document and builds a dispatcher over `registry`.
    pub fn from_platform_json(
        registry: &'r TilingTemplateRegistry,
        raw_platform: &str,
    ) -> Result<Self, TilingError> {
        Ok(Self::new(registry, Self::parse_platform(raw_platform)?))
    }

    pub fn parse_platform(raw_platform: &str) -> Result<MemoryHierarchyDescriptor, TilingError> {
        MemoryHierarchyDescriptor::parse(raw_platform)
    }

    pub fn platform(&self) -> &MemoryHierarchyDescriptor {
        &self.platform
    }

    pub fn tile(&self, workload: &OperatorWorkload) -> Result<TilingPlan, TilingError> {
        self.registry
            .select_and_run(workload, &self.platform)
            .map_err(|e| {
                warn!("tiling {} failed: {e}", workload.op_type);
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Dtype, TensorDesc};
    use crate::ops::add_layer_norm::AddLayerNormLegacy;
    use crate::platform::tests::PLATFORM_910B;
    use crate::registry::default_registry;

    fn layer_norm() -> OperatorWorkload {
        OperatorWorkload::new("AddLayerNorm")
            .with_input(TensorDesc::nd(&[24, 1, 2560], Dtype::Float16))
            .with_input(TensorDesc::nd(&[24, 1, 2560], Dtype::Float16))
            .with_input(TensorDesc::nd(&[2560], Dtype::Float16))
            .with_input(TensorDesc::nd(&[2560], Dtype::Float16))
            .with_output(TensorDesc::nd(&[24, 1, 2560], Dtype::Float16))
            .with_output(TensorDesc::nd(&[24, 1, 1], Dtype::Float32))
            .with_output(TensorDesc::nd(&[24, 1, 1], Dtype::Float32))
            .with_output(TensorDesc::nd(&[24, 1, 2560], Dtype::Float16))
            .with_attr("epsilon", 0.01)
    }

    #[test]
    fn test_malformed_platform_fails_before_tiling() {
        assert!(matches!(
            TilingDispatcher::from_platform_json(default_registry(), "{}"),
            Err(TilingError::PlatformParseError(_))
        ));
    }

    #[test]
    fn test_scoped_registry_is_used() {
        let empty = TilingTemplateRegistry::new();
        let dispatcher = TilingDispatcher::from_platform_json(&empty, PLATFORM_910B).unwrap();
        assert!(matches!(
            dispatcher.tile(&layer_norm()),
            Err(TilingError::NoCapableTemplate(_))
        ));

        let mut scoped = TilingTemplateRegistry::new();
        scoped.register("AddLayerNorm", AddLayerNormLegacy.into(), 1);
        let dispatcher = TilingDispatcher::from_platform_json(&scoped, PLATFORM_910B).unwrap();
        assert_eq!(dispatcher.tile(&layer_norm()).unwrap().tiling_key, 0);
    }

    #[test]
    fn test_repeated_calls_are_identical() {
        let dispatcher =
            TilingDispatcher::from_platform_json(default_registry(), PLATFORM_910B).unwrap();
        let w = layer_norm();
        assert_eq!(dispatcher.tile(&w).unwrap(), dispatcher.tile(&w).unwrap());
    }
}
