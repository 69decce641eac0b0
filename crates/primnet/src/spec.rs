use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

/// Ordered dimension sizes of a tensor operand.
pub type Dims = SmallVec<[usize; 4]>;

/// Rank every pooling operand carries: batch, channels, two spatial axes.
pub const POOL_RANK: usize = 4;

/// Number of spatial axes covered by window/stride/padding parameters.
pub const SPATIAL_RANK: usize = 2;

/// Enumerates scalar element types the primitive interface understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    Si32,
    Si8,
    Ui8,
}

impl DType {
    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }

    /// Returns the storage size in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::Si32 => 4,
            DType::Si8 | DType::Ui8 => 1,
        }
    }
}

/// Concrete arrangement of a rank-4 shape in memory, or `Any` to let the
/// engine pick the most efficient one when a primitive is instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemFormat {
    Any,
    Nchw,
    Nhwc,
    Chwn,
    NChw8c,
}

impl MemFormat {
    /// Returns `true` for every format except the `Any` placeholder.
    pub fn is_concrete(self) -> bool {
        !matches!(self, MemFormat::Any)
    }

    /// Channel-block width imposed by the format, if any.
    pub fn channel_block(self) -> Option<usize> {
        match self {
            MemFormat::NChw8c => Some(8),
            _ => None,
        }
    }
}

/// A shape bound to an element type and a memory format.
///
/// Equality is structural and doubles as the layout-equality test used during
/// negotiation: two descriptors describe the same bytes-in-memory arrangement
/// iff they compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryDesc {
    pub dims: Dims,
    pub dtype: DType,
    pub format: MemFormat,
}

impl MemoryDesc {
    pub fn new(dims: impl Into<Dims>, dtype: DType, format: MemFormat) -> Self {
        Self {
            dims: dims.into(),
            dtype,
            format,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Returns total element count unless it overflows `usize`.
    pub fn element_count(&self) -> Option<usize> {
        let mut count = 1usize;
        for dim in &self.dims {
            count = count.checked_mul(*dim)?;
        }
        Some(count)
    }

    /// Returns total byte length unless it overflows `usize`.
    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?
            .checked_mul(self.dtype.size_in_bytes())
    }

    /// Copy of this descriptor rebound to another memory format.
    pub fn with_format(&self, format: MemFormat) -> Self {
        Self {
            dims: self.dims.clone(),
            dtype: self.dtype,
            format,
        }
    }
}

/// Pooling algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    Max,
    Avg,
}

/// Direction a primitive computes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropKind {
    Forward,
    Backward,
}

/// Names the operand role a canonical-layout query refers to.
///
/// Forward templates define `Src`/`Dst`, backward templates `DiffDst` (the
/// incoming gradient, read side) and `DiffSrc` (the outgoing gradient, write
/// side). `Workspace` is defined only on max-pooling templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayoutRole {
    Src,
    Dst,
    Workspace,
    DiffSrc,
    DiffDst,
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("{side} must be rank {expected}, got rank {rank}")]
    Rank {
        side: &'static str,
        expected: usize,
        rank: usize,
    },
    #[error("{side} has zero extent on axis {axis}")]
    ZeroDim { side: &'static str, axis: usize },
    #[error("window/stride/padding must cover {expected} spatial axes, got {got}")]
    SpatialRank { expected: usize, got: usize },
    #[error("window has zero extent on spatial axis {axis}")]
    ZeroWindow { axis: usize },
    #[error("stride is zero on spatial axis {axis}")]
    ZeroStride { axis: usize },
    #[error("padded extent overflows usize on spatial axis {axis}")]
    PaddedExtentOverflow { axis: usize },
    #[error("window {window} exceeds padded extent {padded} on spatial axis {axis}")]
    WindowTooLarge {
        axis: usize,
        window: usize,
        padded: usize,
    },
    #[error("{side} dims {got:?} do not match pooled dims {expected:?}")]
    PooledDimsMismatch {
        side: &'static str,
        expected: Dims,
        got: Dims,
    },
    #[error("{read_side} dtype {read:?} differs from {write_side} dtype {write:?}")]
    DTypeMismatch {
        read_side: &'static str,
        read: DType,
        write_side: &'static str,
        write: DType,
    },
    #[error("format {format:?} blocks channels by {block} but {side} has {channels} channels")]
    ChannelBlock {
        side: &'static str,
        format: MemFormat,
        block: usize,
        channels: usize,
    },
    #[error("byte length overflow for {side} dims {dims:?}")]
    ByteLenOverflow { side: &'static str, dims: Dims },
}

/// Destination dims implied by pooling a source shape:
/// `floor((extent + 2 * padding - window) / stride) + 1` per spatial axis;
/// batch and channel extents pass through unchanged.
pub fn pooled_output_dims(
    src_dims: &[usize],
    window: &[usize],
    strides: &[usize],
    padding: &[usize],
) -> Result<Dims, DescriptorError> {
    if src_dims.len() != POOL_RANK {
        return Err(DescriptorError::Rank {
            side: "src",
            expected: POOL_RANK,
            rank: src_dims.len(),
        });
    }
    for (axis, dim) in src_dims.iter().enumerate() {
        if *dim == 0 {
            return Err(DescriptorError::ZeroDim { side: "src", axis });
        }
    }
    for params in [window, strides, padding] {
        if params.len() != SPATIAL_RANK {
            return Err(DescriptorError::SpatialRank {
                expected: SPATIAL_RANK,
                got: params.len(),
            });
        }
    }

    let mut out = Dims::new();
    out.push(src_dims[0]);
    out.push(src_dims[1]);
    for axis in 0..SPATIAL_RANK {
        if window[axis] == 0 {
            return Err(DescriptorError::ZeroWindow { axis });
        }
        if strides[axis] == 0 {
            return Err(DescriptorError::ZeroStride { axis });
        }
        let padded = padding[axis]
            .checked_mul(2)
            .and_then(|pad| src_dims[POOL_RANK - SPATIAL_RANK + axis].checked_add(pad))
            .ok_or(DescriptorError::PaddedExtentOverflow { axis })?;
        if window[axis] > padded {
            return Err(DescriptorError::WindowTooLarge {
                axis,
                window: window[axis],
                padded,
            });
        }
        out.push((padded - window[axis]) / strides[axis] + 1);
    }
    Ok(out)
}

/// Logical specification of one pooling primitive, validated at construction.
///
/// `src` is the side the primitive reads (forward: the source tensor;
/// backward: the incoming gradient) and `dst` the side it writes (forward:
/// the pooled destination; backward: the outgoing gradient). A value of this
/// type always satisfies the pooling shape rule; instantiation may still fail
/// if the engine has no implementation for the requested layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolingDesc {
    kind: PoolKind,
    prop: PropKind,
    src: MemoryDesc,
    dst: MemoryDesc,
    window: Dims,
    strides: Dims,
    padding: Dims,
}

impl PoolingDesc {
    /// Descriptor for a forward pass reading `src` and writing `dst`.
    pub fn forward(
        kind: PoolKind,
        src: MemoryDesc,
        dst: MemoryDesc,
        window: &[usize],
        strides: &[usize],
        padding: &[usize],
    ) -> Result<Self, DescriptorError> {
        validate_pair(
            Sides {
                unpooled: &src,
                unpooled_name: "src",
                pooled: &dst,
                pooled_name: "dst",
            },
            window,
            strides,
            padding,
        )?;
        Ok(Self {
            kind,
            prop: PropKind::Forward,
            src,
            dst,
            window: Dims::from_slice(window),
            strides: Dims::from_slice(strides),
            padding: Dims::from_slice(padding),
        })
    }

    /// Descriptor for a backward pass reading the incoming gradient
    /// (`diff_dst`, pooled shape) and writing the outgoing gradient
    /// (`diff_src`, source shape).
    pub fn backward(
        kind: PoolKind,
        diff_dst: MemoryDesc,
        diff_src: MemoryDesc,
        window: &[usize],
        strides: &[usize],
        padding: &[usize],
    ) -> Result<Self, DescriptorError> {
        validate_pair(
            Sides {
                unpooled: &diff_src,
                unpooled_name: "diff_src",
                pooled: &diff_dst,
                pooled_name: "diff_dst",
            },
            window,
            strides,
            padding,
        )?;
        Ok(Self {
            kind,
            prop: PropKind::Backward,
            src: diff_dst,
            dst: diff_src,
            window: Dims::from_slice(window),
            strides: Dims::from_slice(strides),
            padding: Dims::from_slice(padding),
        })
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn prop(&self) -> PropKind {
        self.prop
    }

    /// Side the primitive reads from.
    pub fn src(&self) -> &MemoryDesc {
        &self.src
    }

    /// Side the primitive writes to.
    pub fn dst(&self) -> &MemoryDesc {
        &self.dst
    }

    pub fn window(&self) -> &[usize] {
        &self.window
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn padding(&self) -> &[usize] {
        &self.padding
    }
}

struct Sides<'a> {
    unpooled: &'a MemoryDesc,
    unpooled_name: &'static str,
    pooled: &'a MemoryDesc,
    pooled_name: &'static str,
}

fn validate_pair(
    sides: Sides<'_>,
    window: &[usize],
    strides: &[usize],
    padding: &[usize],
) -> Result<(), DescriptorError> {
    let Sides {
        unpooled,
        unpooled_name,
        pooled,
        pooled_name,
    } = sides;

    for (side, desc) in [(unpooled_name, unpooled), (pooled_name, pooled)] {
        if desc.rank() != POOL_RANK {
            return Err(DescriptorError::Rank {
                side,
                expected: POOL_RANK,
                rank: desc.rank(),
            });
        }
        for (axis, dim) in desc.dims.iter().enumerate() {
            if *dim == 0 {
                return Err(DescriptorError::ZeroDim { side, axis });
            }
        }
    }
    if unpooled.dtype != pooled.dtype {
        return Err(DescriptorError::DTypeMismatch {
            read_side: unpooled_name,
            read: unpooled.dtype,
            write_side: pooled_name,
            write: pooled.dtype,
        });
    }

    for (side, desc) in [(unpooled_name, unpooled), (pooled_name, pooled)] {
        if let Some(block) = desc.format.channel_block() {
            let channels = desc.dims.get(1).copied().unwrap_or(0);
            if channels % block != 0 {
                return Err(DescriptorError::ChannelBlock {
                    side,
                    format: desc.format,
                    block,
                    channels,
                });
            }
        }
        if desc.byte_len().is_none() {
            return Err(DescriptorError::ByteLenOverflow {
                side,
                dims: desc.dims.clone(),
            });
        }
    }

    let expected = pooled_output_dims(&unpooled.dims, window, strides, padding)?;
    if expected != pooled.dims {
        return Err(DescriptorError::PooledDimsMismatch {
            side: pooled_name,
            expected,
            got: pooled.dims.clone(),
        });
    }
    Ok(())
}
