//! Reference CPU engine.
//!
//! Implements the materializer and factory traits with enough layout policy
//! to exercise every negotiation path: a fixed support matrix for pooling
//! source formats, `Any` resolution, workspace derivation, forward/backward
//! pairing validation, and strict operand checking. Primitives are inert plan
//! nodes; nothing here computes a pooled value.

use std::sync::{Arc, Mutex};

use primnet::engine::{EngineError, PoolingEngine, TensorMaterializer};
use primnet::mem::AlignedBuffer;
use primnet::spec::{DType, LayoutRole, MemFormat, MemoryDesc, PoolKind, PoolingDesc, PropKind};

/// Engine handle. Stateless; every product of the engine is owned by the
/// kernel that requested it.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuEngine;

impl CpuEngine {
    pub fn new() -> Self {
        CpuEngine
    }
}

struct TensorInner {
    desc: MemoryDesc,
    storage: Mutex<Option<AlignedBuffer>>,
}

/// Tensor handle bound to a concrete layout. Starts without backing storage;
/// `bind` attaches an [`AlignedBuffer`] exactly once.
#[derive(Clone)]
pub struct CpuTensor {
    inner: Arc<TensorInner>,
}

impl CpuTensor {
    pub fn desc(&self) -> &MemoryDesc {
        &self.inner.desc
    }

    pub fn is_bound(&self) -> bool {
        self.inner
            .storage
            .lock()
            .expect("tensor storage mutex poisoned")
            .is_some()
    }

    /// Byte length of the bound storage, if any.
    pub fn bound_len(&self) -> Option<usize> {
        self.inner
            .storage
            .lock()
            .expect("tensor storage mutex poisoned")
            .as_ref()
            .map(AlignedBuffer::byte_len)
    }
}

impl std::fmt::Debug for CpuTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuTensor")
            .field("desc", &self.inner.desc)
            .field("bound", &self.is_bound())
            .finish()
    }
}

struct TemplateInner {
    desc: PoolingDesc,
    // Resolved layouts for the descriptor's read and write sides. For a
    // forward template these answer Src/Dst queries, for a backward template
    // DiffDst/DiffSrc.
    read: MemoryDesc,
    write: MemoryDesc,
    workspace: Option<MemoryDesc>,
}

/// Instantiated pooling descriptor: the layouts this engine committed to.
#[derive(Clone)]
pub struct CpuTemplate {
    inner: Arc<TemplateInner>,
}

impl CpuTemplate {
    pub fn descriptor(&self) -> &PoolingDesc {
        &self.inner.desc
    }

    /// Layout committed for the side the primitive reads.
    pub fn read_desc(&self) -> &MemoryDesc {
        &self.inner.read
    }

    /// Layout committed for the side the primitive writes.
    pub fn write_desc(&self) -> &MemoryDesc {
        &self.inner.write
    }

    pub fn workspace_desc(&self) -> Option<&MemoryDesc> {
        self.inner.workspace.as_ref()
    }
}

impl std::fmt::Debug for CpuTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuTemplate")
            .field("kind", &self.inner.desc.kind())
            .field("prop", &self.inner.desc.prop())
            .field("read", &self.inner.read)
            .field("write", &self.inner.write)
            .field("workspace", &self.inner.workspace)
            .finish()
    }
}

/// Classifies an inert plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Pooling,
    Reorder,
}

struct PrimitiveInner {
    kind: PrimitiveKind,
    srcs: Vec<MemoryDesc>,
    dsts: Vec<MemoryDesc>,
}

/// Inert plan node recording the operand layouts it was created against.
/// Equality is handle identity, so two structurally identical primitives from
/// separate builds compare unequal.
#[derive(Clone)]
pub struct CpuPrimitive {
    inner: Arc<PrimitiveInner>,
}

impl CpuPrimitive {
    fn new(kind: PrimitiveKind, srcs: Vec<MemoryDesc>, dsts: Vec<MemoryDesc>) -> Self {
        Self {
            inner: Arc::new(PrimitiveInner { kind, srcs, dsts }),
        }
    }

    pub fn kind(&self) -> PrimitiveKind {
        self.inner.kind
    }

    pub fn src_descs(&self) -> &[MemoryDesc] {
        &self.inner.srcs
    }

    pub fn dst_descs(&self) -> &[MemoryDesc] {
        &self.inner.dsts
    }
}

impl PartialEq for CpuPrimitive {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for CpuPrimitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuPrimitive")
            .field("kind", &self.inner.kind)
            .field("srcs", &self.inner.srcs)
            .field("dsts", &self.inner.dsts)
            .finish()
    }
}

/// Pooling support matrix for the side the primitive reads. `Chwn` has no
/// pooling implementation here, so a caller pinning it always lands on the
/// fixed-default fallback; blocked formats need f32 and the block-divisible
/// channel count the descriptor already guarantees.
fn check_pool_format(desc: &MemoryDesc, side: &str) -> Result<(), EngineError> {
    match desc.format {
        MemFormat::Nchw | MemFormat::Nhwc => Ok(()),
        MemFormat::NChw8c => {
            if desc.dtype != DType::F32 {
                return Err(EngineError::unsupported(format!(
                    "format {:?} is implemented for f32 only, {side} has {:?}",
                    desc.format, desc.dtype
                )));
            }
            Ok(())
        }
        other => Err(EngineError::unsupported(format!(
            "no pooling implementation for {side} format {other:?}"
        ))),
    }
}

impl CpuEngine {
    fn instantiate_forward(&self, desc: &PoolingDesc) -> Result<CpuTemplate, EngineError> {
        check_pool_format(desc.src(), "source")?;
        let write_format = match desc.dst().format {
            // Pooling preserves the layout family of its input.
            MemFormat::Any => desc.src().format,
            _ => {
                check_pool_format(desc.dst(), "destination")?;
                desc.dst().format
            }
        };
        let read = desc.src().clone();
        let write = desc.dst().with_format(write_format);
        let workspace = match desc.kind() {
            PoolKind::Max => Some(MemoryDesc::new(
                write.dims.clone(),
                DType::Si32,
                write_format,
            )),
            PoolKind::Avg => None,
        };
        Ok(CpuTemplate {
            inner: Arc::new(TemplateInner {
                desc: desc.clone(),
                read,
                write,
                workspace,
            }),
        })
    }

    fn instantiate_backward(
        &self,
        desc: &PoolingDesc,
        forward: &CpuTemplate,
    ) -> Result<CpuTemplate, EngineError> {
        let paired = &forward.inner;
        if paired.desc.prop() != PropKind::Forward {
            return Err(EngineError::invalid(
                "pairing hint must be a forward template",
            ));
        }
        if paired.desc.kind() != desc.kind() {
            return Err(EngineError::invalid(format!(
                "paired templates disagree on pooling kind: forward {:?}, backward {:?}",
                paired.desc.kind(),
                desc.kind()
            )));
        }
        if paired.desc.src().dtype != desc.src().dtype {
            return Err(EngineError::invalid(format!(
                "paired templates disagree on dtype: forward {:?}, backward {:?}",
                paired.desc.src().dtype,
                desc.src().dtype
            )));
        }
        // The gradient shapes must mirror the forward pair: the incoming
        // gradient is shaped like the forward destination and the outgoing
        // gradient like the forward source.
        if paired.desc.dst().dims != desc.src().dims {
            return Err(EngineError::invalid(format!(
                "incoming gradient dims {:?} do not match forward destination dims {:?}",
                desc.src().dims,
                paired.desc.dst().dims
            )));
        }
        if paired.desc.src().dims != desc.dst().dims {
            return Err(EngineError::invalid(format!(
                "outgoing gradient dims {:?} do not match forward source dims {:?}",
                desc.dst().dims,
                paired.desc.src().dims
            )));
        }

        check_pool_format(desc.src(), "incoming gradient")?;
        let write_format = match desc.dst().format {
            MemFormat::Any => desc.src().format,
            _ => {
                check_pool_format(desc.dst(), "outgoing gradient")?;
                desc.dst().format
            }
        };
        let read = desc.src().clone();
        let write = desc.dst().with_format(write_format);
        // The backward workspace is the forward's, read back unchanged.
        let workspace = match desc.kind() {
            PoolKind::Max => Some(paired.workspace.clone().ok_or_else(|| {
                EngineError::invalid("paired forward template carries no workspace")
            })?),
            PoolKind::Avg => None,
        };
        Ok(CpuTemplate {
            inner: Arc::new(TemplateInner {
                desc: desc.clone(),
                read,
                write,
                workspace,
            }),
        })
    }
}

impl TensorMaterializer for CpuEngine {
    type Tensor = CpuTensor;

    fn materialize(&self, desc: &MemoryDesc) -> Result<CpuTensor, EngineError> {
        if !desc.format.is_concrete() {
            return Err(EngineError::invalid(
                "cannot materialize a tensor with format Any; resolve it through a template first",
            ));
        }
        if let Some(block) = desc.format.channel_block() {
            let channels = desc.dims.get(1).copied().unwrap_or(0);
            if channels % block != 0 {
                return Err(EngineError::invalid(format!(
                    "format {:?} blocks channels by {block} but tensor has {channels} channels",
                    desc.format
                )));
            }
        }
        Ok(CpuTensor {
            inner: Arc::new(TensorInner {
                desc: desc.clone(),
                storage: Mutex::new(None),
            }),
        })
    }

    fn memory_desc(&self, tensor: &CpuTensor) -> MemoryDesc {
        tensor.inner.desc.clone()
    }

    fn bind(&self, tensor: &CpuTensor, buffer: AlignedBuffer) -> Result<(), EngineError> {
        let want = tensor.inner.desc.byte_len().ok_or_else(|| {
            EngineError::invalid(format!(
                "byte length overflow for {:?}",
                tensor.inner.desc.dims
            ))
        })?;
        if buffer.byte_len() != want {
            return Err(EngineError::invalid(format!(
                "buffer of {} bytes does not cover a tensor of {} bytes",
                buffer.byte_len(),
                want
            )));
        }
        let mut storage = tensor
            .inner
            .storage
            .lock()
            .expect("tensor storage mutex poisoned");
        if storage.is_some() {
            return Err(EngineError::invalid(
                "tensor already has backing storage bound",
            ));
        }
        *storage = Some(buffer);
        Ok(())
    }
}

impl PoolingEngine for CpuEngine {
    type Template = CpuTemplate;
    type Primitive = CpuPrimitive;

    fn engine_name(&self) -> &str {
        "ref-cpu"
    }

    fn instantiate(
        &self,
        desc: &PoolingDesc,
        hint: Option<&CpuTemplate>,
    ) -> Result<CpuTemplate, EngineError> {
        match desc.prop() {
            PropKind::Forward => {
                if hint.is_some() {
                    return Err(EngineError::invalid(
                        "forward pooling instantiation takes no pairing hint",
                    ));
                }
                self.instantiate_forward(desc)
            }
            PropKind::Backward => {
                let forward = hint.ok_or_else(|| {
                    EngineError::invalid(
                        "backward pooling instantiation requires the paired forward template",
                    )
                })?;
                self.instantiate_backward(desc, forward)
            }
        }
    }

    fn query_layout(
        &self,
        template: &CpuTemplate,
        role: LayoutRole,
    ) -> Result<MemoryDesc, EngineError> {
        let inner = &template.inner;
        match (inner.desc.prop(), role) {
            (PropKind::Forward, LayoutRole::Src) => Ok(inner.read.clone()),
            (PropKind::Forward, LayoutRole::Dst) => Ok(inner.write.clone()),
            (PropKind::Backward, LayoutRole::DiffDst) => Ok(inner.read.clone()),
            (PropKind::Backward, LayoutRole::DiffSrc) => Ok(inner.write.clone()),
            (_, LayoutRole::Workspace) => inner.workspace.clone().ok_or_else(|| {
                EngineError::invalid(format!(
                    "{:?} pooling template defines no workspace",
                    inner.desc.kind()
                ))
            }),
            (prop, role) => Err(EngineError::invalid(format!(
                "{prop:?} pooling template does not define role {role:?}"
            ))),
        }
    }

    fn create_reorder(
        &self,
        src: &CpuTensor,
        dst: &CpuTensor,
    ) -> Result<CpuPrimitive, EngineError> {
        let from = src.desc();
        let to = dst.desc();
        if from.dims != to.dims {
            return Err(EngineError::invalid(format!(
                "reorder endpoints disagree on dims: {:?} vs {:?}",
                from.dims, to.dims
            )));
        }
        if from.dtype != to.dtype {
            return Err(EngineError::invalid(format!(
                "reorder endpoints disagree on dtype: {:?} vs {:?}",
                from.dtype, to.dtype
            )));
        }
        if !from.format.is_concrete() || !to.format.is_concrete() {
            return Err(EngineError::invalid(
                "reorder endpoints must be bound to concrete formats",
            ));
        }
        if from == to {
            return Err(EngineError::invalid(format!(
                "reorder endpoints share layout {:?}; nothing to convert",
                from.format
            )));
        }
        Ok(CpuPrimitive::new(
            PrimitiveKind::Reorder,
            vec![from.clone()],
            vec![to.clone()],
        ))
    }

    fn create_pooling(
        &self,
        template: &CpuTemplate,
        srcs: &[CpuTensor],
        dsts: &[CpuTensor],
    ) -> Result<CpuPrimitive, EngineError> {
        let inner = &template.inner;
        match inner.desc.prop() {
            PropKind::Forward => {
                if srcs.len() != 1 {
                    return Err(EngineError::invalid(format!(
                        "forward pooling takes one source operand, got {}",
                        srcs.len()
                    )));
                }
                let want_dsts = if inner.workspace.is_some() { 2 } else { 1 };
                if dsts.len() != want_dsts {
                    return Err(EngineError::invalid(format!(
                        "forward pooling takes {want_dsts} destination operands, got {}",
                        dsts.len()
                    )));
                }
                check_operand("source", &srcs[0], &inner.read)?;
                check_operand("destination", &dsts[0], &inner.write)?;
                if let Some(workspace) = &inner.workspace {
                    check_operand("workspace", &dsts[1], workspace)?;
                }
            }
            PropKind::Backward => {
                let want_srcs = if inner.workspace.is_some() { 2 } else { 1 };
                if srcs.len() != want_srcs {
                    return Err(EngineError::invalid(format!(
                        "backward pooling takes {want_srcs} source operands, got {}",
                        srcs.len()
                    )));
                }
                if dsts.len() != 1 {
                    return Err(EngineError::invalid(format!(
                        "backward pooling takes one destination operand, got {}",
                        dsts.len()
                    )));
                }
                check_operand("incoming gradient", &srcs[0], &inner.read)?;
                if let Some(workspace) = &inner.workspace {
                    check_operand("workspace", &srcs[1], workspace)?;
                }
                check_operand("outgoing gradient", &dsts[0], &inner.write)?;
            }
        }
        Ok(CpuPrimitive::new(
            PrimitiveKind::Pooling,
            srcs.iter().map(|t| t.desc().clone()).collect(),
            dsts.iter().map(|t| t.desc().clone()).collect(),
        ))
    }
}

fn check_operand(role: &str, tensor: &CpuTensor, want: &MemoryDesc) -> Result<(), EngineError> {
    let got = tensor.desc();
    if got != want {
        return Err(EngineError::invalid(format!(
            "{role} operand layout {got:?} does not match template layout {want:?}"
        )));
    }
    Ok(())
}
