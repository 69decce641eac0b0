pub mod engine;
mod env;
pub mod kernel;
pub mod mem;
pub mod pooling;
pub mod profiling;
pub mod spec;

pub use engine::{EngineError, PoolingEngine, TensorMaterializer};
pub use kernel::{Conversion, KernelSlot, OpKernel, PlanError};
pub use mem::{AlignedBuffer, SCRATCH_ALIGN};
pub use pooling::{
    build_backward, build_forward, BuildError, PoolingSpec, DEFAULT_DESC_FORMAT,
    DEFAULT_TENSOR_FORMAT,
};
pub use spec::{
    pooled_output_dims, DType, DescriptorError, Dims, LayoutRole, MemFormat, MemoryDesc, PoolKind,
    PoolingDesc, PropKind,
};
