//! Element types and device labels shared by the tessel buffer runtime.
//!
//! A buffer in tessel is an untyped run of bytes; element types only matter
//! when a byte count is computed from an element count, when a typed view is
//! taken, and when a constant value is deduplicated by its bit pattern.

pub mod ext;


pub use ext::Element;

/// Scalar element types a buffer can be created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::EnumIter, strum::VariantArray, strum::Display)]
#[cfg_attr(feature = "proptest", derive(proptest_derive::Arbitrary))]
pub enum ScalarDType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float16,
    BFloat16,
    Float32,
    Float64,
}

impl ScalarDType {
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 | Self::BFloat16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub const fn is_unsigned(&self) -> bool {
        matches!(self, Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64)
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float16 | Self::BFloat16 | Self::Float32 | Self::Float64)
    }

    /// Byte count of `count` elements, or `None` on overflow.
    pub const fn byte_count(&self, count: usize) -> Option<usize> {
        count.checked_mul(self.bytes())
    }

    /// Native-endian bytes of a value given as a raw bit pattern.
    ///
    /// The low `bytes() * 8` bits of `bits` hold the value; higher bits are ignored.
    pub fn bits_to_bytes(&self, bits: u64) -> Vec<u8> {
        let width = self.bytes();
        let raw = bits.to_ne_bytes();
        if cfg!(target_endian = "little") { raw[..width].to_vec() } else { raw[8 - width..].to_vec() }
    }

    /// Raw bit pattern of a value given as native-endian bytes.
    ///
    /// # Panics
    ///
    /// Panics if `bytes.len()` differs from `self.bytes()`.
    pub fn bytes_to_bits(&self, bytes: &[u8]) -> u64 {
        let width = self.bytes();
        assert_eq!(bytes.len(), width, "{self} values are {width} bytes wide");
        let mut raw = [0u8; 8];
        if cfg!(target_endian = "little") {
            raw[..width].copy_from_slice(bytes);
        } else {
            raw[8 - width..].copy_from_slice(bytes);
        }
        u64::from_ne_bytes(raw)
    }
}

/// Human-facing label of a device slot.
///
/// Device 0 is always the host. Accelerators are numbered by ordinal, which is
/// the device index minus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceSpec {
    Host,
    Accelerator { ordinal: usize },
}

impl DeviceSpec {
    /// Label for the device at `index` in a registry's device table.
    pub const fn for_index(index: usize) -> Self {
        match index {
            0 => Self::Host,
            n => Self::Accelerator { ordinal: n - 1 },
        }
    }

    /// Device table index this label refers to.
    pub const fn index(&self) -> usize {
        match self {
            Self::Host => 0,
            Self::Accelerator { ordinal } => *ordinal + 1,
        }
    }

    pub fn canonicalize(&self) -> String {
        match self {
            Self::Host => "HOST".to_string(),
            Self::Accelerator { ordinal } => format!("ACCEL:{ordinal}"),
        }
    }

    pub const fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }
}

impl std::fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonicalize())
    }
}
