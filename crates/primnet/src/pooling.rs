use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use crate::engine::{EngineError, PoolingEngine};
use crate::env;
use crate::kernel::{Conversion, KernelSlot, OpKernel};
use crate::mem::SCRATCH_ALIGN;
use crate::profiling;
use crate::spec::{
    DType, DescriptorError, Dims, LayoutRole, MemFormat, MemoryDesc, PoolKind, PoolingDesc,
};

/// Fixed read-side layout the descriptor is rebuilt with when the optimistic
/// instantiation is skipped or rejected. Instantiation against it must
/// succeed; a failure is a configuration error.
pub const DEFAULT_DESC_FORMAT: MemFormat = MemFormat::Nchw;

/// Layout the read-side tensor is materialized with when the caller supplies
/// none. Not the same as `DEFAULT_DESC_FORMAT`, so the no-hint path always
/// carries a conversion.
pub const DEFAULT_TENSOR_FORMAT: MemFormat = MemFormat::Chwn;

/// Caller-facing description of one pooling operation, forward orientation.
/// Backward builds take the same value and derive the gradient shapes from it
/// (incoming gradient = `dst_dims`, outgoing gradient = `src_dims`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolingSpec {
    pub kind: PoolKind,
    pub dtype: DType,
    pub src_dims: Dims,
    pub dst_dims: Dims,
    pub window: Dims,
    pub strides: Dims,
    pub padding: Dims,
}

impl PoolingSpec {
    /// Source-side descriptor in the given format.
    pub fn src_desc(&self, format: MemFormat) -> MemoryDesc {
        MemoryDesc::new(self.src_dims.clone(), self.dtype, format)
    }

    /// Incoming-gradient descriptor in the given format.
    pub fn diff_dst_desc(&self, format: MemFormat) -> MemoryDesc {
        MemoryDesc::new(self.dst_dims.clone(), self.dtype, format)
    }

    fn forward_desc(&self, src: MemoryDesc) -> Result<PoolingDesc, DescriptorError> {
        let dst = MemoryDesc::new(self.dst_dims.clone(), self.dtype, MemFormat::Any);
        PoolingDesc::forward(self.kind, src, dst, &self.window, &self.strides, &self.padding)
    }

    fn backward_desc(&self, diff_dst: MemoryDesc) -> Result<PoolingDesc, DescriptorError> {
        let diff_src = MemoryDesc::new(self.src_dims.clone(), self.dtype, MemFormat::Any);
        PoolingDesc::backward(
            self.kind,
            diff_dst,
            diff_src,
            &self.window,
            &self.strides,
            &self.padding,
        )
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid pooling descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("default-layout instantiation failed: {source}")]
    Fallback {
        #[source]
        source: EngineError,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

struct Negotiated<E: PoolingEngine> {
    /// Tensor the compute primitive reads: the internal tensor when a
    /// conversion was inserted, otherwise the slot tensor itself.
    operand: E::Tensor,
    conversion: Option<Conversion<E>>,
}

/// Layout reconciliation shared by both builders. If the materialized tensor
/// already carries the canonical layout it is consumed directly; otherwise an
/// internal tensor is materialized in the canonical layout, backed by zeroed
/// scratch at `SCRATCH_ALIGN`, and a conversion primitive is created from the
/// tensor to it. Deterministic for a given layout pair.
fn negotiate<E: PoolingEngine>(
    engine: &E,
    tensor: &E::Tensor,
    canonical: &MemoryDesc,
) -> Result<Negotiated<E>, EngineError> {
    let bound = engine.memory_desc(tensor);
    if bound == *canonical {
        return Ok(Negotiated {
            operand: tensor.clone(),
            conversion: None,
        });
    }

    let internal = engine.materialize(canonical)?;
    let byte_len = canonical.byte_len().ok_or_else(|| {
        EngineError::invalid(format!("byte length overflow for {:?}", canonical.dims))
    })?;
    let scratch = engine.allocate_aligned(byte_len, SCRATCH_ALIGN)?;
    engine.bind(&internal, scratch)?;
    let primitive = engine.create_reorder(tensor, &internal)?;
    Ok(Negotiated {
        operand: internal.clone(),
        conversion: Some(Conversion::new(internal, primitive)),
    })
}

/// Builds a forward pooling kernel.
///
/// When `src_layout` is supplied the descriptor is first instantiated against
/// that exact layout; the engine may reject it, in which case (or when no
/// layout is supplied at all) the descriptor is rebuilt with
/// `DEFAULT_DESC_FORMAT` and instantiated again, fatally this time. The
/// source tensor is materialized from the caller layout when present and from
/// `DEFAULT_TENSOR_FORMAT` otherwise; a conversion into the template's
/// canonical source layout is inserted when the two differ. Max-pooling
/// kernels carry the workspace as a second output.
pub fn build_forward<E: PoolingEngine>(
    engine: &E,
    spec: &PoolingSpec,
    src_layout: Option<&MemoryDesc>,
) -> Result<OpKernel<E>, BuildError> {
    // Only the instantiation may fail recoverably here; descriptor validation
    // errors propagate even on the optimistic attempt.
    let optimistic = match src_layout {
        Some(requested) if !env::force_default_layout() => {
            let desc = spec.forward_desc(requested.clone())?;
            engine
                .instantiate(&desc, None)
                .ok()
                .map(|template| (desc, template))
        }
        _ => None,
    };

    let (desc, template) = match optimistic {
        Some(instantiated) => instantiated,
        None => {
            profiling::layout_event("pool_fprop_fallback");
            let desc = spec.forward_desc(spec.src_desc(DEFAULT_DESC_FORMAT))?;
            let template = engine
                .instantiate(&desc, None)
                .map_err(|source| BuildError::Fallback { source })?;
            (desc, template)
        }
    };

    let canonical_src = engine.query_layout(&template, LayoutRole::Src)?;
    let canonical_dst = engine.query_layout(&template, LayoutRole::Dst)?;

    let input_desc = match src_layout {
        Some(requested) => requested.clone(),
        None => spec.src_desc(DEFAULT_TENSOR_FORMAT),
    };
    let input = engine.materialize(&input_desc)?;
    // The output layout is always dictated by the template, never the caller.
    let output = engine.materialize(&canonical_dst)?;

    let negotiated = negotiate(engine, &input, &canonical_src)?;
    if negotiated.conversion.is_some() {
        profiling::layout_event("pool_fprop_src_reorder");
    }

    let mut srcs: SmallVec<[E::Tensor; 2]> = SmallVec::new();
    srcs.push(negotiated.operand);
    let mut dsts: SmallVec<[E::Tensor; 2]> = SmallVec::new();
    dsts.push(output.clone());

    let workspace = if spec.kind == PoolKind::Max {
        let workspace_desc = engine.query_layout(&template, LayoutRole::Workspace)?;
        let workspace = engine.materialize(&workspace_desc)?;
        dsts.push(workspace.clone());
        Some(workspace)
    } else {
        None
    };

    let compute = engine.create_pooling(&template, &srcs, &dsts)?;
    let conversion_primitive = negotiated
        .conversion
        .as_ref()
        .map(|conversion| conversion.primitive().clone());

    let mut kernel = OpKernel::new(desc, template);
    kernel.push_input(KernelSlot::new(
        LayoutRole::Src,
        input,
        negotiated.conversion,
    ));
    kernel.push_output(KernelSlot::new(LayoutRole::Dst, output, None));
    if let Some(workspace) = workspace {
        kernel.push_output(KernelSlot::new(LayoutRole::Workspace, workspace, None));
    }
    if let Some(primitive) = conversion_primitive {
        kernel.push_net(primitive);
    }
    kernel.push_net(compute);
    Ok(kernel)
}

/// Builds a backward pooling kernel paired with `forward`.
///
/// Mirrors `build_forward` with the operand sides inverted: the incoming
/// gradient (shaped like the forward destination) is the read side subject to
/// layout negotiation, the outgoing gradient (shaped like the forward source)
/// the write side. Both instantiation attempts pass the forward template so
/// the engine can keep the pair consistent. Max-pooling kernels consume the
/// workspace as a second input, wired as the primitive's second source
/// operand.
pub fn build_backward<E: PoolingEngine>(
    engine: &E,
    spec: &PoolingSpec,
    diff_dst_layout: Option<&MemoryDesc>,
    forward: &OpKernel<E>,
) -> Result<OpKernel<E>, BuildError> {
    let optimistic = match diff_dst_layout {
        Some(requested) if !env::force_default_layout() => {
            let desc = spec.backward_desc(requested.clone())?;
            engine
                .instantiate(&desc, Some(forward.template()))
                .ok()
                .map(|template| (desc, template))
        }
        _ => None,
    };

    let (desc, template) = match optimistic {
        Some(instantiated) => instantiated,
        None => {
            profiling::layout_event("pool_bprop_fallback");
            let desc = spec.backward_desc(spec.diff_dst_desc(DEFAULT_DESC_FORMAT))?;
            let template = engine
                .instantiate(&desc, Some(forward.template()))
                .map_err(|source| BuildError::Fallback { source })?;
            (desc, template)
        }
    };

    let canonical_src = engine.query_layout(&template, LayoutRole::DiffDst)?;
    let canonical_dst = engine.query_layout(&template, LayoutRole::DiffSrc)?;

    let input_desc = match diff_dst_layout {
        Some(requested) => requested.clone(),
        None => spec.diff_dst_desc(DEFAULT_TENSOR_FORMAT),
    };
    let input = engine.materialize(&input_desc)?;
    let output = engine.materialize(&canonical_dst)?;

    let negotiated = negotiate(engine, &input, &canonical_src)?;
    if negotiated.conversion.is_some() {
        profiling::layout_event("pool_bprop_diff_dst_reorder");
    }

    let mut srcs: SmallVec<[E::Tensor; 2]> = SmallVec::new();
    srcs.push(negotiated.operand);

    let workspace = if spec.kind == PoolKind::Max {
        let workspace_desc = engine.query_layout(&template, LayoutRole::Workspace)?;
        let workspace = engine.materialize(&workspace_desc)?;
        srcs.push(workspace.clone());
        Some(workspace)
    } else {
        None
    };

    let mut dsts: SmallVec<[E::Tensor; 2]> = SmallVec::new();
    dsts.push(output.clone());

    let compute = engine.create_pooling(&template, &srcs, &dsts)?;
    let conversion_primitive = negotiated
        .conversion
        .as_ref()
        .map(|conversion| conversion.primitive().clone());

    let mut kernel = OpKernel::new(desc, template);
    kernel.push_input(KernelSlot::new(
        LayoutRole::DiffDst,
        input,
        negotiated.conversion,
    ));
    if let Some(workspace) = workspace {
        kernel.push_input(KernelSlot::new(LayoutRole::Workspace, workspace, None));
    }
    kernel.push_output(KernelSlot::new(LayoutRole::DiffSrc, output, None));
    if let Some(primitive) = conversion_primitive {
        kernel.push_net(primitive);
    }
    kernel.push_net(compute);
    Ok(kernel)
}
