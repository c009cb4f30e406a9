use std::fmt;

use serde::{Deserialize, Serialize};

/// Element data types a tensor descriptor can carry.
///
/// Compute kernels operate on `F32`; the quantized and integer types are
/// carried through shape propagation and memory planning so that byte sizes
/// are right even where arithmetic is delegated to external kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataType {
    /// 8-bit unsigned integer
    U8,
    /// 8-bit signed integer
    S8,
    /// 8-bit asymmetric quantized (scale + offset in `QuantizationInfo`)
    QAsymm8,
    /// 32-bit signed integer (quantized accumulators, biases)
    S32,
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 32-bit IEEE 754 single-precision float
    #[default]
    F32,
}

impl DataType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DataType::U8 | DataType::S8 | DataType::QAsymm8 => 1,
            DataType::F16 => 2,
            DataType::S32 | DataType::F32 => 4,
        }
    }

    /// Number of bytes needed to store `n` elements of this type.
    pub fn storage_bytes(&self, n: usize) -> usize {
        self.element_size() * n
    }

    /// Whether this type is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F16 | DataType::F32)
    }

    /// Whether this type carries quantization parameters.
    pub fn is_quantized(&self) -> bool {
        matches!(self, DataType::QAsymm8)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::U8 => write!(f, "u8"),
            DataType::S8 => write!(f, "s8"),
            DataType::QAsymm8 => write!(f, "qasymm8"),
            DataType::S32 => write!(f, "s32"),
            DataType::F16 => write!(f, "f16"),
            DataType::F32 => write!(f, "f32"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DataType::F32.element_size(), 4);
        assert_eq!(DataType::F16.element_size(), 2);
        assert_eq!(DataType::QAsymm8.element_size(), 1);
        assert_eq!(DataType::S32.storage_bytes(10), 40);
    }

    #[test]
    fn test_categories() {
        assert!(DataType::F32.is_float());
        assert!(!DataType::S32.is_float());
        assert!(DataType::QAsymm8.is_quantized());
        assert!(!DataType::U8.is_quantized());
    }

    #[test]
    fn test_display() {
        assert_eq!(DataType::F32.to_string(), "f32");
        assert_eq!(DataType::QAsymm8.to_string(), "qasymm8");
    }
}
