use serde::Serialize;

use crate::error::TilingError;
use crate::platform::MemoryHierarchyDescriptor;

pub const BLOB_FIELD_BYTES: usize = 8;

/// The result of one tiling invocation.
///
/// `blob` is a flat sequence of 8-byte little-endian fields in the order declared by the chosen
/// template's tiling-data struct. Field order and width are part of the contract with the kernel
/// consuming the blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TilingPlan {
    pub tiling_key: u64,
    pub block_dim: u32,
    pub blob: Vec<u8>,
    pub workspace_size: u64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("blob ended after {0} bytes")]
    Truncated(usize),
    #[error("{0} trailing bytes after the last field")]
    TrailingBytes(usize),
    #[error("field value {0} does not fit its declared type")]
    OutOfRange(i64),
}

#[derive(Debug, Default)]
pub struct BlobWriter {
    buf: Vec<u8>,
}

pub struct BlobReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

/// A value which occupies whole 8-byte slots in a tiling blob.
pub trait BlobField: Sized {
    fn write(&self, w: &mut BlobWriter);
    fn read(r: &mut BlobReader<'_>) -> Result<Self, BlobError>;
}

impl BlobWriter {
    pub fn push(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

impl<'a> BlobReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BlobReader { buf, pos: 0 }
    }

    pub fn next(&mut self) -> Result<i64, BlobError> {
        let end = self.pos + BLOB_FIELD_BYTES;
        let slot = self
            .buf
            .get(self.pos..end)
            .ok_or(BlobError::Truncated(self.buf.len()))?;
        let mut bytes = [0u8; BLOB_FIELD_BYTES];
        bytes.copy_from_slice(slot);
        self.pos = end;
        Ok(i64::from_le_bytes(bytes))
    }

    pub fn finish(self) -> Result<(), BlobError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            n => Err(BlobError::TrailingBytes(n)),
        }
    }
}

impl BlobField for i64 {
    fn write(&self, w: &mut BlobWriter) {
        w.push(*self);
    }

    fn read(r: &mut BlobReader<'_>) -> Result<Self, BlobError> {
        r.next()
    }
}

/// Stored as the IEEE-754 bit pattern, zero-extended into the slot.
impl BlobField for f32 {
    fn write(&self, w: &mut BlobWriter) {
        w.push(i64::from(self.to_bits()));
    }

    fn read(r: &mut BlobReader<'_>) -> Result<Self, BlobError> {
        let raw = r.next()?;
        u32::try_from(raw)
            .map(f32::from_bits)
            .map_err(|_| BlobError::OutOfRange(raw))
    }
}

impl<const N: usize> BlobField for [i64; N] {
    fn write(&self, w: &mut BlobWriter) {
        self.iter().for_each(|v| w.push(*v));
    }

    fn read(r: &mut BlobReader<'_>) -> Result<Self, BlobError> {
        let mut out = [0; N];
        for slot in out.iter_mut() {
            *slot = r.next()?;
        }
        Ok(out)
    }
}

/// Declares a tiling-data struct whose field order is its blob layout.
///
/// Generates the struct along with `to_blob`, `from_blob`, and `FIELD_NAMES`. Each field type
/// must implement [BlobField].
#[macro_export]
macro_rules! tiling_data {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$fmeta:meta])* $fvis:vis $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq)]
        $vis struct $name {
            $( $(#[$fmeta])* $fvis $field: $ty ),*
        }

        impl $name {
            pub const FIELD_NAMES: &'static [&'static str] = &[$(stringify!($field)),*];

            pub fn to_blob(&self) -> Vec<u8> {
                let mut w = $crate::plan::BlobWriter::default();
                $( $crate::plan::BlobField::write(&self.$field, &mut w); )*
                w.finish()
            }

            pub fn from_blob(blob: &[u8]) -> Result<Self, $crate::plan::BlobError> {
                let mut r = $crate::plan::BlobReader::new(blob);
                let data = $name {
                    $( $field: $crate::plan::BlobField::read(&mut r)? ),*
                };
                r.finish()?;
                Ok(data)
            }
        }
    };
}

impl TilingPlan {
    /// Assembles a plan, checking `1 <= block_dim <= core_num`, a non-negative workspace, and a
    /// non-empty blob.
    pub fn new(
        op: &str,
        platform: &MemoryHierarchyDescriptor,
        tiling_key: u64,
        block_dim: i64,
        blob: Vec<u8>,
        workspace_size: i64,
    ) -> Result<Self, TilingError> {
        if block_dim < 1 || block_dim > platform.core_num {
            return Err(TilingError::ResourceExceeded(
                op.to_string(),
                format!(
                    "block dim {block_dim} outside 1..={}",
                    platform.core_num
                ),
            ));
        }
        let block_dim = u32::try_from(block_dim).map_err(|_| {
            TilingError::ResourceExceeded(op.to_string(), format!("block dim {block_dim}"))
        })?;
        let workspace_size = u64::try_from(workspace_size).map_err(|_| {
            TilingError::ResourceExceeded(op.to_string(), format!("workspace {workspace_size}"))
        })?;
        if blob.is_empty() || blob.len() % BLOB_FIELD_BYTES != 0 {
            return Err(TilingError::ResourceExceeded(
                op.to_string(),
                format!("malformed tiling blob of {} bytes", blob.len()),
            ));
        }
        Ok(TilingPlan {
            tiling_key,
            block_dim,
            blob,
            workspace_size,
        })
    }

    /// The blob decoded as raw 8-byte fields.
    pub fn fields(&self) -> Vec<i64> {
        self.blob
            .chunks_exact(BLOB_FIELD_BYTES)
            .map(|c| {
                let mut bytes = [0u8; BLOB_FIELD_BYTES];
                bytes.copy_from_slice(c);
                i64::from_le_bytes(bytes)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    tiling_data! {
        struct SampleTilingData {
            rows: i64,
            eps: f32,
            reserved: [i64; 2],
            cols: i64,
        }
    }

    #[test]
    fn test_field_order_is_declaration_order() {
        let data = SampleTilingData {
            rows: 3,
            eps: 0.5,
            reserved: [0, 0],
            cols: -7,
        };
        let blob = data.to_blob();
        assert_eq!(blob.len(), 5 * BLOB_FIELD_BYTES);
        assert_eq!(&blob[..8], &3i64.to_le_bytes());
        assert_eq!(&blob[8..16], &i64::from(0.5f32.to_bits()).to_le_bytes());
        assert_eq!(&blob[16..32], &[0u8; 16]);
        assert_eq!(&blob[32..], &(-7i64).to_le_bytes());
        assert_eq!(SampleTilingData::from_blob(&blob).unwrap(), data);
        assert_eq!(
            SampleTilingData::FIELD_NAMES,
            &["rows", "eps", "reserved", "cols"]
        );
    }

    #[test]
    fn test_from_blob_rejects_bad_lengths() {
        let blob = SampleTilingData::default().to_blob();
        assert_eq!(
            SampleTilingData::from_blob(&blob[..16]),
            Err(BlobError::Truncated(16))
        );
        let mut longer = blob.clone();
        longer.extend_from_slice(&[0; 8]);
        assert_eq!(
            SampleTilingData::from_blob(&longer),
            Err(BlobError::TrailingBytes(8))
        );
    }

    #[test]
    fn test_plan_block_dim_bounds() {
        let platform = MemoryHierarchyDescriptor::new(8, 1 << 16);
        let blob = SampleTilingData::default().to_blob();
        assert!(TilingPlan::new("Op", &platform, 1, 8, blob.clone(), 32).is_ok());
        assert!(matches!(
            TilingPlan::new("Op", &platform, 1, 9, blob.clone(), 32),
            Err(TilingError::ResourceExceeded(..))
        ));
        assert!(matches!(
            TilingPlan::new("Op", &platform, 1, 0, blob.clone(), 32),
            Err(TilingError::ResourceExceeded(..))
        ));
        assert!(TilingPlan::new("Op", &platform, 1, 1, vec![], 32).is_err());
        assert!(TilingPlan::new("Op", &platform, 1, 1, blob, -1).is_err());
    }

    #[test]
    fn test_fields_decodes_slots() {
        let platform = MemoryHierarchyDescriptor::new(8, 1 << 16);
        let data = SampleTilingData {
            rows: 11,
            cols: 12,
            ..Default::default()
        };
        let plan = TilingPlan::new("Op", &platform, 0, 1, data.to_blob(), 0).unwrap();
        let fields = plan.fields();
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[0], 11);
        assert_eq!(fields[4], 12);
    }
}
