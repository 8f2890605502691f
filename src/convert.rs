//! Element conversion between numeric descriptors.

use crate::buffer::BufferError;
use crate::chunk::TypedChunk;
use crate::dtype::{DType, ElementKind};
use thiserror::Error;

/// Errors from [`TypedChunk::convert`] and friends.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConvertError {
    /// A value does not fit the target type.
    #[error("value {value} out of range for {target}")]
    Range {
        /// Offending value, rendered.
        value: String,
        /// Target descriptor.
        target: DType,
    },
    /// A value would not survive the conversion unchanged.
    #[error("value {value} is not exactly representable as {target}")]
    Inexact {
        /// Offending value, rendered.
        value: String,
        /// Target descriptor.
        target: DType,
    },
    /// No conversion exists between the two descriptors.
    #[error("cannot convert {from} to {to}")]
    Unsupported {
        /// Source descriptor.
        from: DType,
        /// Target descriptor.
        to: DType,
    },
    /// The scalar count does not divide into whole target samples.
    #[error("{scalars} scalars do not fill whole samples of dimension {dimension}")]
    Dimension {
        /// Scalars in the source.
        scalars: usize,
        /// Target dimension.
        dimension: usize,
    },
    /// More elements were requested than the chunk holds.
    #[error("requested {requested} elements, chunk holds {available}")]
    Insufficient {
        /// Requested element count.
        requested: usize,
        /// Available element count.
        available: usize,
    },
    /// Output allocation failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i128),
    Float(f64),
}

impl Num {
    fn render(self) -> String {
        match self {
            Num::Int(v) => v.to_string(),
            Num::Float(v) => v.to_string(),
        }
    }

    fn is_zero(self) -> bool {
        match self {
            Num::Int(v) => v == 0,
            Num::Float(v) => v == 0.0,
        }
    }
}

fn read_num(kind: ElementKind, bytes: &[u8]) -> Num {
    macro_rules! ne {
        ($ty:ty) => {
            <$ty>::from_ne_bytes(bytemuck::pod_read_unaligned(bytes))
        };
    }
    match (kind, bytes.len()) {
        (ElementKind::Signed, 1) => Num::Int(ne!(i8) as i128),
        (ElementKind::Signed, 2) => Num::Int(ne!(i16) as i128),
        (ElementKind::Signed, 4) => Num::Int(ne!(i32) as i128),
        (ElementKind::Signed, 8) => Num::Int(ne!(i64) as i128),
        (ElementKind::Unsigned, 1) => Num::Int(ne!(u8) as i128),
        (ElementKind::Unsigned, 2) => Num::Int(ne!(u16) as i128),
        (ElementKind::Unsigned, 4) => Num::Int(ne!(u32) as i128),
        (ElementKind::Unsigned, 8) => Num::Int(ne!(u64) as i128),
        (ElementKind::Float, 4) => Num::Float(ne!(f32) as f64),
        _ => Num::Float(ne!(f64)),
    }
}

fn int_bounds(kind: ElementKind, size: usize) -> (i128, i128) {
    let bits = (size * 8) as u32;
    match kind {
        ElementKind::Signed => (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1),
        _ => (0, (1i128 << bits) - 1),
    }
}

fn write_num(value: Num, target: DType, out: &mut [u8]) -> Result<(), ConvertError> {
    let kind = target.kind();
    let size = out.len();
    let out_of_range = || ConvertError::Range {
        value: value.render(),
        target,
    };
    let inexact = || ConvertError::Inexact {
        value: value.render(),
        target,
    };
    if kind == ElementKind::Float {
        let v = match value {
            Num::Int(v) if (v as f64) as i128 != v => return Err(inexact()),
            Num::Int(v) => v as f64,
            Num::Float(v) => v,
        };
        if size == 4 {
            if v.is_finite() && v.abs() > f32::MAX as f64 {
                return Err(out_of_range());
            }
            let narrow = v as f32;
            if !v.is_nan() && narrow as f64 != v {
                return Err(inexact());
            }
            out.copy_from_slice(&narrow.to_ne_bytes());
        } else {
            out.copy_from_slice(&v.to_ne_bytes());
        }
        return Ok(());
    }
    let (min, max) = int_bounds(kind, size);
    let v = match value {
        Num::Int(v) => v,
        Num::Float(f) => {
            // max + 1 is a power of two and exact as f64
            if f.is_finite() && (f < min as f64 || f >= (max + 1) as f64) {
                return Err(out_of_range());
            }
            if !f.is_finite() || f.fract() != 0.0 {
                return Err(inexact());
            }
            f as i128
        }
    };
    if v < min || v > max {
        return Err(out_of_range());
    }
    let bytes = v.to_ne_bytes();
    #[cfg(target_endian = "little")]
    out.copy_from_slice(&bytes[..size]);
    #[cfg(target_endian = "big")]
    out.copy_from_slice(&bytes[16 - size..]);
    Ok(())
}

fn same_layout(a: DType, b: DType) -> bool {
    a.kind() == b.kind() && a.is_complex() == b.is_complex() && a.elem_size() == b.elem_size()
}

/// Convert `scalars` elements of `from` in `src` into `to` elements in `dst`.
fn convert_scalars(
    src: &[u8],
    from: DType,
    dst: &mut [u8],
    to: DType,
    scalars: usize,
) -> Result<(), ConvertError> {
    let in_comp = from.component_size();
    let out_comp = to.component_size();
    let in_kind = from.kind();
    for i in 0..scalars {
        let elem = &src[i * from.elem_size()..(i + 1) * from.elem_size()];
        let out = &mut dst[i * to.elem_size()..(i + 1) * to.elem_size()];
        let re = read_num(in_kind, &elem[..in_comp]);
        let im = from
            .is_complex()
            .then(|| read_num(in_kind, &elem[in_comp..]));
        match (to.is_complex(), im) {
            (true, Some(im)) => {
                write_num(re, to, &mut out[..out_comp])?;
                write_num(im, to, &mut out[out_comp..])?;
            }
            (true, None) => {
                write_num(re, to, &mut out[..out_comp])?;
                write_num(Num::Int(0), to, &mut out[out_comp..])?;
            }
            (false, Some(im)) if !im.is_zero() => {
                return Err(ConvertError::Range {
                    value: format!("{} + {}j", re.render(), im.render()),
                    target: to,
                });
            }
            (false, _) => write_num(re, to, out)?,
        }
    }
    Ok(())
}

impl TypedChunk {
    fn requested(&self, num_elems: usize) -> Result<usize, ConvertError> {
        let available = self.elements();
        let requested = if num_elems == 0 { available } else { num_elems };
        if requested > available {
            return Err(ConvertError::Insufficient {
                requested,
                available,
            });
        }
        Ok(requested)
    }

    /// Convert the first `num_elems` elements (all when zero) to `out`.
    ///
    /// Descriptors with the same element layout share memory with `self`;
    /// only the dimension changes. Other numeric targets get a new buffer.
    pub fn convert(&self, out: DType, num_elems: usize) -> Result<TypedChunk, ConvertError> {
        let elems = self.requested(num_elems)?;
        let scalars = elems * self.dtype.dimension();
        if scalars % out.dimension() != 0 {
            return Err(ConvertError::Dimension {
                scalars,
                dimension: out.dimension(),
            });
        }
        if same_layout(self.dtype, out) {
            let mut shared = self.slice(0, elems * self.dtype.size())?;
            shared.dtype = out;
            return Ok(shared);
        }
        let mut converted = TypedChunk::new(out, scalars / out.dimension())?;
        self.convert_into(&mut converted, elems)?;
        Ok(converted)
    }

    /// Convert into an existing chunk, returning the number of output elements written.
    ///
    /// `out` must be the only view of its bytes; see [`TypedChunk::get_mut`].
    pub fn convert_into(&self, out: &mut TypedChunk, num_elems: usize) -> Result<usize, ConvertError> {
        let elems = self.requested(num_elems)?;
        let (from, to) = (self.dtype, out.dtype);
        if !from.is_numeric() || !to.is_numeric() {
            return Err(ConvertError::Unsupported { from, to });
        }
        let scalars = elems * from.dimension();
        if scalars % to.dimension() != 0 {
            return Err(ConvertError::Dimension {
                scalars,
                dimension: to.dimension(),
            });
        }
        let out_elems = scalars / to.dimension();
        if out_elems > out.elements() {
            return Err(ConvertError::Insufficient {
                requested: out_elems,
                available: out.elements(),
            });
        }
        let src = &self.as_bytes()[..scalars * from.elem_size()];
        let dst = &mut out.get_mut().ok_or(BufferError::Shared)?[..scalars * to.elem_size()];
        convert_scalars(src, from, dst, to, scalars)?;
        Ok(out_elems)
    }

    /// Split complex elements into real and imaginary chunks of the real type `out`.
    pub fn convert_complex(
        &self,
        out: DType,
        num_elems: usize,
    ) -> Result<(TypedChunk, TypedChunk), ConvertError> {
        let from = self.dtype;
        if !from.is_complex() || out.is_complex() || !out.is_numeric() {
            return Err(ConvertError::Unsupported { from, to: out });
        }
        let elems = self.requested(num_elems)?;
        let scalars = elems * from.dimension();
        if scalars % out.dimension() != 0 {
            return Err(ConvertError::Dimension {
                scalars,
                dimension: out.dimension(),
            });
        }
        let mut re = TypedChunk::new(out, scalars / out.dimension())?;
        let mut im = TypedChunk::new(out, scalars / out.dimension())?;
        let in_comp = from.component_size();
        let out_size = out.elem_size();
        let src = self.as_bytes();
        let re_bytes = re.get_mut().ok_or(BufferError::Shared)?;
        let im_bytes = im.get_mut().ok_or(BufferError::Shared)?;
        for i in 0..scalars {
            let elem = &src[i * from.elem_size()..(i + 1) * from.elem_size()];
            let slot = i * out_size..(i + 1) * out_size;
            write_num(read_num(from.kind(), &elem[..in_comp]), out, &mut re_bytes[slot.clone()])?;
            write_num(read_num(from.kind(), &elem[in_comp..]), out, &mut im_bytes[slot])?;
        }
        Ok((re, im))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn identity_shares_memory() {
        let chunk = TypedChunk::from_elements(&[1i16, -2, 3]).unwrap();
        let same = chunk.convert(DType::of::<i16>(), 0).unwrap();
        assert_eq!(same.address(), chunk.address());
        assert_eq!(same.as_bytes(), chunk.as_bytes());
    }

    #[test]
    fn reshape_keeps_memory() {
        let chunk = TypedChunk::from_elements(&[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let pairs = chunk
            .convert(DType::of::<f32>().with_dimension(2), 0)
            .unwrap();
        assert_eq!(pairs.elements(), 2);
        assert_eq!(pairs.address(), chunk.address());
        assert!(matches!(
            chunk.convert(DType::of::<f32>().with_dimension(3), 0),
            Err(ConvertError::Dimension { .. })
        ));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let chunk = TypedChunk::from_elements(&[1i32, 300]).unwrap();
        assert!(matches!(
            chunk.convert(DType::of::<i8>(), 0),
            Err(ConvertError::Range { .. })
        ));
        let nan = TypedChunk::from_elements(&[f32::NAN]).unwrap();
        assert!(nan.convert(DType::of::<i32>(), 0).is_err());
        let big = TypedChunk::from_elements(&[1e300f64]).unwrap();
        assert!(big.convert(DType::of::<f32>(), 0).is_err());
        let inf = TypedChunk::from_elements(&[f64::INFINITY]).unwrap();
        let out = inf.convert(DType::of::<f32>(), 0).unwrap();
        assert_eq!(out.read::<f32>(0), Some(f32::INFINITY));
    }

    #[test]
    fn negative_to_unsigned_is_a_range_error() {
        let chunk = TypedChunk::from_elements(&[3i32, -1]).unwrap();
        assert!(matches!(
            chunk.convert(DType::of::<u8>(), 0),
            Err(ConvertError::Range { .. })
        ));
        let float = TypedChunk::from_elements(&[-2.0f32]).unwrap();
        assert!(matches!(
            float.convert(DType::of::<u16>(), 0),
            Err(ConvertError::Range { .. })
        ));
    }

    #[test]
    fn lossy_values_are_rejected() {
        let fraction = TypedChunk::from_elements(&[2.0f64, 2.7]).unwrap();
        assert!(matches!(
            fraction.convert(DType::of::<i32>(), 0),
            Err(ConvertError::Inexact { .. })
        ));
        let whole = fraction.convert(DType::of::<i32>(), 1).unwrap();
        assert_eq!(whole.to_vec::<i32>(), vec![2]);

        let narrow = TypedChunk::from_elements(&[0.5f64, 0.1]).unwrap();
        assert!(matches!(
            narrow.convert(DType::of::<f32>(), 0),
            Err(ConvertError::Inexact { .. })
        ));
        assert_eq!(narrow.convert(DType::of::<f32>(), 1).unwrap().to_vec::<f32>(), vec![0.5]);

        let wide_int = TypedChunk::from_elements(&[16_777_217i32]).unwrap();
        assert!(matches!(
            wide_int.convert(DType::of::<f32>(), 0),
            Err(ConvertError::Inexact { .. })
        ));
        let nan = TypedChunk::from_elements(&[f64::NAN]).unwrap();
        assert!(nan.convert(DType::of::<f32>(), 0).unwrap().read::<f32>(0).unwrap().is_nan());
    }

    #[test]
    fn complex_to_real_needs_zero_imaginary() {
        let chunk = TypedChunk::from_elements(&[[1.0f32, 0.0], [2.0, 0.0]]).unwrap();
        let real = chunk.convert(DType::of::<i16>(), 0).unwrap();
        assert_eq!(real.to_vec::<i16>(), vec![1, 2]);
        let noisy = TypedChunk::from_elements(&[[1.0f32, 0.5]]).unwrap();
        assert!(noisy.convert(DType::of::<f32>(), 0).is_err());
    }

    #[test]
    fn complex_split() {
        let chunk = TypedChunk::from_elements(&[[1i16, -1], [2, -2]]).unwrap();
        let (re, im) = chunk.convert_complex(DType::of::<f64>(), 0).unwrap();
        assert_eq!(re.to_vec::<f64>(), vec![1.0, 2.0]);
        assert_eq!(im.to_vec::<f64>(), vec![-1.0, -2.0]);
    }

    #[test]
    fn partial_conversion() {
        let chunk = TypedChunk::from_elements(&[1u8, 2, 3, 4]).unwrap();
        let head = chunk.convert(DType::of::<u32>(), 2).unwrap();
        assert_eq!(head.to_vec::<u32>(), vec![1, 2]);
        assert!(matches!(
            chunk.convert(DType::of::<u32>(), 5),
            Err(ConvertError::Insufficient { .. })
        ));
    }

    #[test]
    fn custom_has_no_numeric_conversion() {
        let mut chunk = TypedChunk::with_bytes(4).unwrap();
        chunk.dtype = DType::custom(1);
        assert!(matches!(
            chunk.convert(DType::of::<f32>(), 0),
            Err(ConvertError::Unsupported { .. })
        ));
    }

    proptest! {
        #[test]
        fn widening_roundtrip_i16_f32(values in prop::collection::vec(any::<i16>(), 1..64)) {
            let chunk = TypedChunk::from_elements(&values).unwrap();
            let wide = chunk.convert(DType::of::<f32>(), 0).unwrap();
            let back = wide.convert(DType::of::<i16>(), 0).unwrap();
            prop_assert_eq!(back.to_vec::<i16>(), values);
        }

        #[test]
        fn widening_roundtrip_u8_i64(values in prop::collection::vec(any::<u8>(), 1..64)) {
            let chunk = TypedChunk::from_elements(&values).unwrap();
            let wide = chunk.convert(DType::of::<i64>(), 0).unwrap();
            let back = wide.convert(DType::of::<u8>(), 0).unwrap();
            prop_assert_eq!(back.to_vec::<u8>(), values);
        }

        #[test]
        fn complex_roundtrip_i16_f32(values in prop::collection::vec(any::<[i16; 2]>(), 1..32)) {
            let chunk = TypedChunk::from_elements(&values).unwrap();
            let wide = chunk.convert(DType::of::<[f32; 2]>(), 0).unwrap();
            prop_assert!(wide.dtype.is_complex());
            let back = wide.convert(DType::of::<[i16; 2]>(), 0).unwrap();
            prop_assert_eq!(back.to_vec::<[i16; 2]>(), values);
        }

        #[test]
        fn complex_roundtrip_f32_f64(values in prop::collection::vec([-1e30f32..1e30, -1e30f32..1e30], 1..32)) {
            let chunk = TypedChunk::from_elements(&values).unwrap();
            let wide = chunk.convert(DType::of::<[f64; 2]>(), 0).unwrap();
            let back = wide.convert(DType::of::<[f32; 2]>(), 0).unwrap();
            prop_assert_eq!(back.to_vec::<[f32; 2]>(), values);
        }

        #[test]
        fn widening_roundtrip_f32_f64(values in prop::collection::vec(-1e30f32..1e30, 1..64)) {
            let chunk = TypedChunk::from_elements(&values).unwrap();
            let wide = chunk.convert(DType::of::<f64>(), 0).unwrap();
            let back = wide.convert(DType::of::<f32>(), 0).unwrap();
            prop_assert_eq!(back.to_vec::<f32>(), values);
        }
    }
}
