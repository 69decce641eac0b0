use thiserror::Error;

use crate::mem::AlignedBuffer;
use crate::spec::{LayoutRole, MemoryDesc, PoolingDesc};

/// Failure surfaced by an engine call.
///
/// Recoverable only at the optimistic instantiation site in the kernel
/// builders, where any failure triggers the fixed-default retry; every other
/// engine call that fails aborts the build.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported by engine: {what}")]
    Unsupported { what: String },
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
    #[error("resource exhausted: {reason}")]
    ResourceExhausted { reason: String },
}

impl EngineError {
    pub fn unsupported(what: impl Into<String>) -> Self {
        EngineError::Unsupported { what: what.into() }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        EngineError::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub fn resource(reason: impl Into<String>) -> Self {
        EngineError::ResourceExhausted {
            reason: reason.into(),
        }
    }
}

/// Materializes tensor handles bound to concrete memory layouts and manages
/// their backing storage.
pub trait TensorMaterializer {
    /// Tensor handle usable as a primitive operand. Cloning is cheap and
    /// shares the underlying binding.
    type Tensor: Clone + Send + Sync + 'static;

    /// Creates a tensor handle bound to `desc`. `MemFormat::Any` is not a
    /// materializable layout and must be rejected.
    fn materialize(&self, desc: &MemoryDesc) -> Result<Self::Tensor, EngineError>;

    /// Returns the layout a handle was materialized with.
    fn memory_desc(&self, tensor: &Self::Tensor) -> MemoryDesc;

    /// Allocates zeroed storage for conversion scratch.
    fn allocate_aligned(&self, byte_len: usize, align: usize) -> Result<AlignedBuffer, EngineError> {
        AlignedBuffer::zeroed(byte_len, align)
    }

    /// Attaches backing storage to an unbound tensor handle; the handle takes
    /// ownership of the buffer.
    fn bind(&self, tensor: &Self::Tensor, buffer: AlignedBuffer) -> Result<(), EngineError>;
}

/// The layout/primitive factory side of an engine: instantiates pooling
/// descriptors into primitive templates, answers canonical-layout queries,
/// and creates runnable primitives.
pub trait PoolingEngine: TensorMaterializer {
    /// Instantiated primitive descriptor. Canonical layouts are queried from
    /// it, and backward builds pass the paired forward template as `hint`.
    type Template: Clone + Send + Sync + 'static;
    /// Runnable primitive handle; equality is handle identity.
    type Primitive: Clone + PartialEq + Send + Sync + 'static;

    fn engine_name(&self) -> &str;

    /// Instantiates `desc` against this engine. Backward descriptors require
    /// the paired forward template in `hint`; forward descriptors take none.
    fn instantiate(
        &self,
        desc: &PoolingDesc,
        hint: Option<&Self::Template>,
    ) -> Result<Self::Template, EngineError>;

    /// Canonical layout the template requires for `role`. Only the roles the
    /// template's direction defines may be queried.
    fn query_layout(
        &self,
        template: &Self::Template,
        role: LayoutRole,
    ) -> Result<MemoryDesc, EngineError>;

    /// Conversion primitive reading `src` and writing `dst`. The descriptors
    /// must share dims and dtype and must differ in layout.
    fn create_reorder(
        &self,
        src: &Self::Tensor,
        dst: &Self::Tensor,
    ) -> Result<Self::Primitive, EngineError>;

    /// Compute primitive for `template` bound to fully resolved operands.
    fn create_pooling(
        &self,
        template: &Self::Template,
        srcs: &[Self::Tensor],
        dsts: &[Self::Tensor],
    ) -> Result<Self::Primitive, EngineError>;
}
