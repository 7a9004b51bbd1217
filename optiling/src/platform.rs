use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TilingError;

pub const DEFAULT_VECTOR_REG_SIZE: i64 = 256;
pub const DEFAULT_UB_BLOCK_SIZE: i64 = 32;
const MIN_VECTOR_REG_SIZE: i64 = 32;
const MIN_BLOCK_SIZE: i64 = 32;

const REGBASE_SOC: &str = "Ascend910_95";
const SOC_310P: &str = "Ascend310P";

/// Capacities of each on-chip memory level and the number of parallel cores.
///
/// Parsed once per session with [MemoryHierarchyDescriptor::parse] and shared read-only by every
/// tiling call. Memory sizes are in bytes; a level the platform document does not describe is 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryHierarchyDescriptor {
    pub core_num: i64,
    pub ub_size: i64,
    pub l1_size: i64,
    pub l0a_size: i64,
    pub l0b_size: i64,
    pub l0c_size: i64,
    pub l2_size: i64,
    pub bt_size: i64,
    pub soc_version: Option<String>,
    pub vector_reg_size: i64,
    pub ub_block_size: i64,
}

#[derive(Deserialize)]
struct RawPlatform {
    hardware_info: Option<IndexMap<String, Value>>,
    #[serde(default)]
    version: IndexMap<String, Value>,
    vector_reg_size: Option<Value>,
    ub_block_size: Option<Value>,
}

impl MemoryHierarchyDescriptor {
    /// A descriptor with only a core count and a UB size; other levels are zero.
    pub fn new(core_num: i64, ub_size: i64) -> Self {
        MemoryHierarchyDescriptor {
            core_num,
            ub_size,
            l1_size: 0,
            l0a_size: 0,
            l0b_size: 0,
            l0c_size: 0,
            l2_size: 0,
            bt_size: 0,
            soc_version: None,
            vector_reg_size: DEFAULT_VECTOR_REG_SIZE,
            ub_block_size: DEFAULT_UB_BLOCK_SIZE,
        }
    }

    pub fn with_soc_version(mut self, soc_version: &str) -> Self {
        self.soc_version = Some(soc_version.to_string());
        self
    }

    /// Parses a platform-info JSON document.
    ///
    /// `hardware_info.CORE_NUM` and at least one memory-level size are required. Numeric fields
    /// may be JSON numbers or decimal strings.
    pub fn parse(raw: &str) -> Result<Self, TilingError> {
        let raw: RawPlatform = serde_json::from_str(raw)
            .map_err(|e| TilingError::PlatformParseError(format!("malformed document: {e}")))?;
        let hw = raw.hardware_info.ok_or_else(|| {
            TilingError::PlatformParseError("missing \"hardware_info\" object".to_string())
        })?;

        let core_num = read_size(&hw, "CORE_NUM")?
            .ok_or_else(|| TilingError::PlatformParseError("missing CORE_NUM".to_string()))?;
        if core_num == 0 {
            return Err(TilingError::PlatformParseError(
                "CORE_NUM must be positive".to_string(),
            ));
        }

        let levels = ["UB_SIZE", "L1_SIZE", "L0A_SIZE", "L0B_SIZE", "L0C_SIZE", "L2_SIZE", "BT_SIZE"]
            .into_iter()
            .map(|key| read_size(&hw, key))
            .collect::<Result<Vec<_>, _>>()?;
        if levels.iter().all(Option::is_none) {
            return Err(TilingError::PlatformParseError(
                "no memory-level size present".to_string(),
            ));
        }
        let level = |i: usize| levels[i].unwrap_or(0);

        let soc_version = match raw
            .version
            .get("Short_SoC_version")
            .or_else(|| hw.get("Short_SoC_version"))
        {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(TilingError::PlatformParseError(format!(
                    "Short_SoC_version must be a string, got {other}"
                )))
            }
        };

        let vector_reg_size = match raw.vector_reg_size {
            Some(v) => parse_size("vector_reg_size", &v)?,
            None => DEFAULT_VECTOR_REG_SIZE,
        };
        let ub_block_size = match raw.ub_block_size {
            Some(v) => parse_size("ub_block_size", &v)?,
            None => DEFAULT_UB_BLOCK_SIZE,
        };
        if ub_block_size < MIN_BLOCK_SIZE || ub_block_size % MIN_BLOCK_SIZE != 0 {
            return Err(TilingError::PlatformParseError(format!(
                "ub_block_size {ub_block_size} must be a positive multiple of {MIN_BLOCK_SIZE}"
            )));
        }
        if vector_reg_size < MIN_VECTOR_REG_SIZE || vector_reg_size % ub_block_size != 0 {
            return Err(TilingError::PlatformParseError(format!(
                "vector_reg_size {vector_reg_size} must be a multiple of ub_block_size \
                 {ub_block_size} and at least {MIN_VECTOR_REG_SIZE}"
            )));
        }

        let descriptor = MemoryHierarchyDescriptor {
            core_num,
            ub_size: level(0),
            l1_size: level(1),
            l0a_size: level(2),
            l0b_size: level(3),
            l0c_size: level(4),
            l2_size: level(5),
            bt_size: level(6),
            soc_version,
            vector_reg_size,
            ub_block_size,
        };
        debug!("parsed platform: {descriptor:?}");
        Ok(descriptor)
    }

    /// Whether the chip uses the register-based vector architecture.
    pub fn is_regbase(&self) -> bool {
        self.soc_version.as_deref() == Some(REGBASE_SOC)
    }

    pub fn is_310p(&self) -> bool {
        self.soc_version.as_deref() == Some(SOC_310P)
    }

    /// Whether the cube unit can write L0C results directly to global memory.
    pub fn supports_l0c2out(&self) -> bool {
        self.is_regbase()
    }
}

fn read_size(map: &IndexMap<String, Value>, key: &str) -> Result<Option<i64>, TilingError> {
    map.get(key).map(|v| parse_size(key, v)).transpose()
}

fn parse_size(key: &str, value: &Value) -> Result<i64, TilingError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v >= 0 => Ok(v),
        _ => Err(TilingError::PlatformParseError(format!(
            "{key} must be a non-negative integer, got {value}"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const PLATFORM_910B: &str = r#"{
       "hardware_info": {"BT_SIZE": 0, "load3d_constraints": "1",
                         "Intrinsic_fix_pipe_l0c2out": false, "Intrinsic_data_move_l12ub": true,
                         "UB_SIZE": 196608, "L2_SIZE": 33554432, "L1_SIZE": 524288,
                         "L0A_SIZE": 65536, "L0B_SIZE": 65536, "L0C_SIZE": 131072,
                         "CORE_NUM": 40},
       "version": {"SoC_version": "Ascend910B4", "Short_SoC_version": "Ascend910B"}
    }"#;

    pub(crate) const PLATFORM_910_95: &str = r#"{
       "hardware_info": {"BT_SIZE": 0, "UB_SIZE": 245760, "L2_SIZE": 33554432, "L1_SIZE": 524288,
                         "L0A_SIZE": 65536, "L0B_SIZE": 65536, "L0C_SIZE": 131072,
                         "CORE_NUM": 64},
       "version": {"Short_SoC_version": "Ascend910_95"}
    }"#;

    pub(crate) fn platform_910b() -> MemoryHierarchyDescriptor {
        MemoryHierarchyDescriptor::parse(PLATFORM_910B).unwrap()
    }

    pub(crate) fn platform_910_95() -> MemoryHierarchyDescriptor {
        MemoryHierarchyDescriptor::parse(PLATFORM_910_95).unwrap()
    }

    #[test]
    fn test_parse_910b() {
        let p = platform_910b();
        assert_eq!(p.core_num, 40);
        assert_eq!(p.ub_size, 196608);
        assert_eq!(p.l1_size, 524288);
        assert_eq!(p.l0c_size, 131072);
        assert_eq!(p.bt_size, 0);
        assert_eq!(p.vector_reg_size, DEFAULT_VECTOR_REG_SIZE);
        assert!(!p.is_regbase());
        assert!(!p.is_310p());
    }

    #[test]
    fn test_parse_regbase() {
        let p = platform_910_95();
        assert!(p.is_regbase());
        assert!(p.supports_l0c2out());
        assert_eq!(p.core_num, 64);
    }

    #[test]
    fn test_string_numbers_are_accepted() {
        let p = MemoryHierarchyDescriptor::parse(
            r#"{"hardware_info": {"CORE_NUM": "8", "UB_SIZE": "262144"}}"#,
        )
        .unwrap();
        assert_eq!(p.core_num, 8);
        assert_eq!(p.ub_size, 262144);
    }

    #[test]
    fn test_missing_core_num_is_rejected() {
        let err = MemoryHierarchyDescriptor::parse(r#"{"hardware_info": {"UB_SIZE": 1024}}"#)
            .unwrap_err();
        assert!(matches!(err, TilingError::PlatformParseError(_)));
    }

    #[test]
    fn test_missing_memory_levels_are_rejected() {
        let err =
            MemoryHierarchyDescriptor::parse(r#"{"hardware_info": {"CORE_NUM": 4}}"#).unwrap_err();
        assert!(matches!(err, TilingError::PlatformParseError(_)));
    }

    #[test]
    fn test_vector_geometry_is_validated() {
        let parse = |extra: &str| {
            MemoryHierarchyDescriptor::parse(&format!(
                r#"{{"hardware_info": {{"CORE_NUM": 8, "UB_SIZE": 196608}}{extra}}}"#
            ))
        };
        for extra in [
            r#", "vector_reg_size": 0"#,
            r#", "vector_reg_size": 16"#,
            r#", "vector_reg_size": 100"#,
            r#", "vector_reg_size": 96, "ub_block_size": 64"#,
            r#", "ub_block_size": 0"#,
            r#", "ub_block_size": 48"#,
        ] {
            assert!(
                matches!(parse(extra), Err(TilingError::PlatformParseError(_))),
                "{extra} was accepted"
            );
        }
        let p = parse(r#", "vector_reg_size": "512", "ub_block_size": 64"#).unwrap();
        assert_eq!((p.vector_reg_size, p.ub_block_size), (512, 64));
        assert_eq!(parse("").unwrap().vector_reg_size, DEFAULT_VECTOR_REG_SIZE);
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(matches!(
            MemoryHierarchyDescriptor::parse("{\"hardware_info\": "),
            Err(TilingError::PlatformParseError(_))
        ));
        assert!(matches!(
            MemoryHierarchyDescriptor::parse(r#"{"hardware_info": {"CORE_NUM": -3, "UB_SIZE": 1}}"#),
            Err(TilingError::PlatformParseError(_))
        ));
    }
}
