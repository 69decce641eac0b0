pub mod cpu;

pub use cpu::{CpuEngine, CpuPrimitive, CpuTemplate, CpuTensor, PrimitiveKind};
