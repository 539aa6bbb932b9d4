use super::*;

/// A Rust scalar that can be stored in and viewed from a buffer.
pub trait Element: bytemuck::Pod + Send + Sync + std::fmt::Debug {
    const DTYPE: ScalarDType;

    /// Raw bit pattern of this value, zero-extended to 64 bits.
    fn to_bits(self) -> u64 {
        Self::DTYPE.bytes_to_bits(bytemuck::bytes_of(&self))
    }
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(impl Element for $ty { const DTYPE: ScalarDType = $dtype; })*
    };
}

impl_element! {
    i8 => ScalarDType::Int8, i16 => ScalarDType::Int16, i32 => ScalarDType::Int32, i64 => ScalarDType::Int64,
    u8 => ScalarDType::UInt8, u16 => ScalarDType::UInt16, u32 => ScalarDType::UInt32, u64 => ScalarDType::UInt64,
    f32 => ScalarDType::Float32, f64 => ScalarDType::Float64,
}
