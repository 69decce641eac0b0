use primnet::engine::TensorMaterializer;
use primnet::kernel::OpKernel;
use primnet::pooling::{
    build_backward, build_forward, BuildError, PoolingSpec, DEFAULT_DESC_FORMAT,
    DEFAULT_TENSOR_FORMAT,
};
use primnet::spec::{DType, Dims, LayoutRole, MemFormat, MemoryDesc, PoolKind, PropKind};
use primnet_engine_ref_cpu::{CpuEngine, PrimitiveKind};

fn dims(values: &[usize]) -> Dims {
    Dims::from_slice(values)
}

fn max_spec() -> PoolingSpec {
    PoolingSpec {
        kind: PoolKind::Max,
        dtype: DType::F32,
        src_dims: dims(&[1, 3, 8, 8]),
        dst_dims: dims(&[1, 3, 4, 4]),
        window: dims(&[2, 2]),
        strides: dims(&[2, 2]),
        padding: dims(&[0, 0]),
    }
}

fn avg_spec() -> PoolingSpec {
    PoolingSpec {
        kind: PoolKind::Avg,
        ..max_spec()
    }
}

fn grad_layout(spec: &PoolingSpec, format: MemFormat) -> MemoryDesc {
    MemoryDesc::new(spec.dst_dims.clone(), spec.dtype, format)
}

fn forward_kernel(
    engine: &CpuEngine,
    spec: &PoolingSpec,
    format: Option<MemFormat>,
) -> OpKernel<CpuEngine> {
    let layout = format.map(|f| MemoryDesc::new(spec.src_dims.clone(), spec.dtype, f));
    build_forward(engine, spec, layout.as_ref()).expect("forward kernel")
}

#[test]
fn paired_backward_build_mirrors_the_forward_shapes() {
    let engine = CpuEngine::new();
    let spec = max_spec();
    let forward = forward_kernel(&engine, &spec, None);
    let kernel = build_backward(&engine, &spec, None, &forward).expect("backward kernel");

    let desc = kernel.descriptor();
    assert_eq!(desc.prop(), PropKind::Backward);
    assert_eq!(desc.src().dims.as_slice(), &[1, 3, 4, 4]);
    assert_eq!(desc.src().format, DEFAULT_DESC_FORMAT);
    assert_eq!(desc.dst().dims.as_slice(), &[1, 3, 8, 8]);

    assert_eq!(kernel.inputs().len(), 2);
    assert_eq!(kernel.inputs()[0].role(), LayoutRole::DiffDst);
    assert_eq!(
        engine.memory_desc(kernel.inputs()[0].tensor()).format,
        DEFAULT_TENSOR_FORMAT
    );
    assert_eq!(kernel.inputs()[1].role(), LayoutRole::Workspace);

    assert_eq!(kernel.outputs().len(), 1);
    assert_eq!(kernel.outputs()[0].role(), LayoutRole::DiffSrc);
    let out = engine.memory_desc(kernel.outputs()[0].tensor());
    assert_eq!(out.dims.as_slice(), &[1, 3, 8, 8]);
    assert_eq!(out.format, DEFAULT_DESC_FORMAT);

    assert_eq!(kernel.net().len(), 2);
    assert_eq!(kernel.net()[0].kind(), PrimitiveKind::Reorder);
    assert_eq!(kernel.net()[1].kind(), PrimitiveKind::Pooling);
    kernel.verify().expect("net order");
}

#[test]
fn workspace_flows_from_forward_output_to_backward_input() {
    let engine = CpuEngine::new();
    let spec = max_spec();
    let forward = forward_kernel(&engine, &spec, None);
    let kernel = build_backward(&engine, &spec, None, &forward).expect("backward kernel");

    let forward_ws = forward.workspace_output().expect("forward workspace");
    let backward_ws = kernel.workspace_input().expect("backward workspace");
    assert_eq!(
        engine.memory_desc(forward_ws.tensor()),
        engine.memory_desc(backward_ws.tensor())
    );
    let desc = engine.memory_desc(backward_ws.tensor());
    assert_eq!(desc.dims.as_slice(), &[1, 3, 4, 4]);
    assert_eq!(desc.dtype, DType::Si32);
    assert!(kernel.workspace_output().is_none());
}

#[test]
fn avg_backward_takes_only_the_gradient() {
    let engine = CpuEngine::new();
    let spec = avg_spec();
    let forward = forward_kernel(&engine, &spec, Some(MemFormat::Nchw));
    let layout = grad_layout(&spec, MemFormat::Nchw);
    let kernel =
        build_backward(&engine, &spec, Some(&layout), &forward).expect("backward kernel");

    assert_eq!(kernel.inputs().len(), 1);
    assert!(kernel.workspace_input().is_none());
    assert_eq!(kernel.net().len(), 1);
    assert_eq!(kernel.net()[0].kind(), PrimitiveKind::Pooling);
}

#[test]
fn matching_gradient_layout_is_consumed_zero_copy() {
    let engine = CpuEngine::new();
    let spec = max_spec();
    let forward = forward_kernel(&engine, &spec, Some(MemFormat::Nchw));
    let layout = grad_layout(&spec, MemFormat::Nchw);
    let kernel =
        build_backward(&engine, &spec, Some(&layout), &forward).expect("backward kernel");

    assert_eq!(kernel.descriptor().src().format, MemFormat::Nchw);
    assert!(kernel.inputs()[0].conversion().is_none());
    assert!(!kernel.has_conversions());
    assert_eq!(kernel.net().len(), 1);
    kernel.verify().expect("net order");
}

#[test]
fn gradient_layouts_follow_the_paired_family() {
    let engine = CpuEngine::new();
    let spec = max_spec();
    let forward = forward_kernel(&engine, &spec, Some(MemFormat::Nhwc));
    let layout = grad_layout(&spec, MemFormat::Nhwc);
    let kernel =
        build_backward(&engine, &spec, Some(&layout), &forward).expect("backward kernel");

    assert_eq!(kernel.net().len(), 1);
    let out = engine.memory_desc(kernel.outputs()[0].tensor());
    assert_eq!(out.format, MemFormat::Nhwc);
    assert_eq!(out.dims.as_slice(), &[1, 3, 8, 8]);
    let ws = kernel.workspace_input().expect("workspace slot");
    assert_eq!(engine.memory_desc(ws.tensor()).format, MemFormat::Nhwc);
}

#[test]
fn rejected_gradient_layout_falls_back_but_keeps_the_tensor() {
    let engine = CpuEngine::new();
    let spec = max_spec();
    let forward = forward_kernel(&engine, &spec, None);
    let layout = grad_layout(&spec, MemFormat::Chwn);
    let kernel =
        build_backward(&engine, &spec, Some(&layout), &forward).expect("backward kernel");

    assert_eq!(kernel.descriptor().src().format, DEFAULT_DESC_FORMAT);
    assert_eq!(
        engine.memory_desc(kernel.inputs()[0].tensor()).format,
        MemFormat::Chwn
    );
    assert!(kernel.inputs()[0].conversion().is_some());
    assert_eq!(kernel.net().len(), 2);
    kernel.verify().expect("net order");
}

#[test]
fn kind_mismatch_with_the_paired_forward_is_fatal() {
    let engine = CpuEngine::new();
    let forward = forward_kernel(&engine, &avg_spec(), None);
    let err = build_backward(&engine, &max_spec(), None, &forward)
        .expect_err("max backward cannot pair with avg forward");
    assert!(matches!(err, BuildError::Fallback { .. }));
}

#[test]
fn shape_mismatch_with_the_paired_forward_is_fatal() {
    let engine = CpuEngine::new();
    let forward = forward_kernel(&engine, &max_spec(), None);
    let wider = PoolingSpec {
        src_dims: dims(&[1, 3, 16, 16]),
        dst_dims: dims(&[1, 3, 8, 8]),
        ..max_spec()
    };
    let err = build_backward(&engine, &wider, None, &forward)
        .expect_err("gradient shapes must mirror the forward pair");
    assert!(matches!(err, BuildError::Fallback { .. }));
}

#[test]
fn invalid_spec_fails_before_pairing() {
    let engine = CpuEngine::new();
    let spec = max_spec();
    let forward = forward_kernel(&engine, &spec, None);
    let broken = PoolingSpec {
        dst_dims: dims(&[1, 3, 5, 5]),
        ..spec
    };
    let err = build_backward(&engine, &broken, None, &forward)
        .expect_err("dst dims are not pooled dims");
    assert!(matches!(err, BuildError::Descriptor(_)));
}
