use primnet::engine::TensorMaterializer;
use primnet::pooling::{
    build_forward, BuildError, PoolingSpec, DEFAULT_DESC_FORMAT, DEFAULT_TENSOR_FORMAT,
};
use primnet::spec::{DType, Dims, LayoutRole, MemFormat, MemoryDesc, PoolKind};
use primnet_engine_ref_cpu::{CpuEngine, PrimitiveKind};

fn dims(values: &[usize]) -> Dims {
    Dims::from_slice(values)
}

/// 1x3x8x8 max pool over a 2x2 window at stride 2.
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

fn src_layout(spec: &PoolingSpec, format: MemFormat) -> MemoryDesc {
    MemoryDesc::new(spec.src_dims.clone(), spec.dtype, format)
}

#[test]
fn no_hint_build_falls_back_and_inserts_a_conversion() {
    let engine = CpuEngine::new();
    let kernel = build_forward(&engine, &max_spec(), None).expect("forward kernel");

    assert_eq!(kernel.descriptor().src().format, DEFAULT_DESC_FORMAT);

    let input = &kernel.inputs()[0];
    assert_eq!(kernel.inputs().len(), 1);
    assert_eq!(input.role(), LayoutRole::Src);
    assert_eq!(
        engine.memory_desc(input.tensor()).format,
        DEFAULT_TENSOR_FORMAT
    );

    let conversion = input.conversion().expect("source conversion");
    let internal = engine.memory_desc(conversion.internal());
    assert_eq!(internal.format, DEFAULT_DESC_FORMAT);
    assert_eq!(internal.dims.as_slice(), &[1, 3, 8, 8]);

    assert_eq!(kernel.net().len(), 2);
    assert_eq!(kernel.net()[0].kind(), PrimitiveKind::Reorder);
    assert_eq!(kernel.net()[1].kind(), PrimitiveKind::Pooling);
    assert!(kernel.has_conversions());
    kernel.verify().expect("net order");
}

#[test]
fn max_kernel_carries_the_workspace_as_second_output() {
    let engine = CpuEngine::new();
    let kernel = build_forward(&engine, &max_spec(), None).expect("forward kernel");

    assert_eq!(kernel.outputs().len(), 2);
    assert_eq!(kernel.outputs()[0].role(), LayoutRole::Dst);
    assert_eq!(kernel.outputs()[1].role(), LayoutRole::Workspace);

    let workspace = kernel.workspace_output().expect("workspace slot");
    let desc = engine.memory_desc(workspace.tensor());
    assert_eq!(desc.dims.as_slice(), &[1, 3, 4, 4]);
    assert_eq!(desc.dtype, DType::Si32);
}

#[test]
fn avg_kernel_has_no_workspace() {
    let engine = CpuEngine::new();
    let layout = src_layout(&avg_spec(), MemFormat::Nchw);
    let kernel = build_forward(&engine, &avg_spec(), Some(&layout)).expect("forward kernel");

    assert_eq!(kernel.outputs().len(), 1);
    assert!(kernel.workspace_output().is_none());
    assert_eq!(kernel.net().len(), 1);
}

#[test]
fn avg_without_hint_still_converts_but_skips_the_workspace() {
    let engine = CpuEngine::new();
    let kernel = build_forward(&engine, &avg_spec(), None).expect("forward kernel");

    assert_eq!(kernel.outputs().len(), 1);
    let output = engine.memory_desc(kernel.outputs()[0].tensor());
    assert_eq!(output.dims.as_slice(), &[1, 3, 4, 4]);
    assert_eq!(kernel.net().len(), 2);
    assert_eq!(kernel.net()[1].kind(), PrimitiveKind::Pooling);
    kernel.verify().expect("net order");
}

#[test]
fn matching_caller_layout_is_consumed_zero_copy() {
    let engine = CpuEngine::new();
    let spec = max_spec();
    let layout = src_layout(&spec, MemFormat::Nchw);
    let kernel = build_forward(&engine, &spec, Some(&layout)).expect("forward kernel");

    assert_eq!(kernel.descriptor().src().format, MemFormat::Nchw);
    assert!(kernel.inputs()[0].conversion().is_none());
    assert!(!kernel.has_conversions());
    assert_eq!(kernel.net().len(), 1);
    assert_eq!(kernel.net()[0].kind(), PrimitiveKind::Pooling);
    kernel.verify().expect("net order");
}

#[test]
fn accepted_caller_layout_drives_the_output_layout() {
    let engine = CpuEngine::new();
    let spec = max_spec();
    let layout = src_layout(&spec, MemFormat::Nhwc);
    let kernel = build_forward(&engine, &spec, Some(&layout)).expect("forward kernel");

    assert_eq!(kernel.descriptor().src().format, MemFormat::Nhwc);
    assert_eq!(kernel.net().len(), 1);

    let output = engine.memory_desc(kernel.outputs()[0].tensor());
    assert_eq!(output.format, MemFormat::Nhwc);
    assert_eq!(output.dims.as_slice(), &[1, 3, 4, 4]);
    let workspace = kernel.workspace_output().expect("workspace slot");
    assert_eq!(engine.memory_desc(workspace.tensor()).format, MemFormat::Nhwc);
}

#[test]
fn rejected_caller_layout_falls_back_but_keeps_the_tensor() {
    let engine = CpuEngine::new();
    let spec = max_spec();
    let layout = src_layout(&spec, MemFormat::Chwn);
    let kernel = build_forward(&engine, &spec, Some(&layout)).expect("forward kernel");

    // The descriptor was rebuilt with the fixed default, but the caller's
    // tensor keeps the layout it was promised.
    assert_eq!(kernel.descriptor().src().format, DEFAULT_DESC_FORMAT);
    assert_eq!(
        engine.memory_desc(kernel.inputs()[0].tensor()).format,
        MemFormat::Chwn
    );
    assert!(kernel.inputs()[0].conversion().is_some());
    assert_eq!(kernel.net().len(), 2);
    assert_eq!(kernel.net()[0].kind(), PrimitiveKind::Reorder);
    kernel.verify().expect("net order");
}

#[test]
fn unsupported_dtype_on_blocked_layout_falls_back() {
    let engine = CpuEngine::new();
    let spec = PoolingSpec {
        dtype: DType::Si8,
        src_dims: dims(&[1, 8, 8, 8]),
        dst_dims: dims(&[1, 8, 4, 4]),
        ..max_spec()
    };
    let layout = src_layout(&spec, MemFormat::NChw8c);
    let kernel = build_forward(&engine, &spec, Some(&layout)).expect("forward kernel");

    assert_eq!(kernel.descriptor().src().format, DEFAULT_DESC_FORMAT);
    assert_eq!(
        engine.memory_desc(kernel.inputs()[0].tensor()).format,
        MemFormat::NChw8c
    );
    assert_eq!(kernel.net().len(), 2);
}

#[test]
fn descriptor_errors_are_not_swallowed_by_the_optimistic_path() {
    let engine = CpuEngine::new();
    let spec = max_spec();
    // 3 channels cannot carry an 8-wide blocked layout; the build must fail
    // loudly instead of quietly falling back.
    let layout = src_layout(&spec, MemFormat::NChw8c);
    let err = build_forward(&engine, &spec, Some(&layout))
        .expect_err("ragged blocked layout is a caller error");
    assert!(matches!(err, BuildError::Descriptor(_)));
}

#[test]
fn invalid_spec_fails_before_touching_the_engine() {
    let engine = CpuEngine::new();
    let spec = PoolingSpec {
        dst_dims: dims(&[1, 3, 5, 5]),
        ..max_spec()
    };
    let err = build_forward(&engine, &spec, None).expect_err("dst dims are not pooled dims");
    assert!(matches!(err, BuildError::Descriptor(_)));
}

#[test]
fn conversion_scratch_is_bound_to_the_internal_tensor_only() {
    let engine = CpuEngine::new();
    let kernel = build_forward(&engine, &max_spec(), None).expect("forward kernel");

    let input = &kernel.inputs()[0];
    let conversion = input.conversion().expect("source conversion");
    assert!(conversion.internal().is_bound());
    let canonical = engine.memory_desc(conversion.internal());
    assert_eq!(
        conversion.internal().bound_len(),
        canonical.byte_len()
    );

    // Caller-visible tensors stay unbound; the caller owns their storage.
    assert!(!input.tensor().is_bound());
    assert!(!kernel.outputs()[0].tensor().is_bound());
}

#[test]
fn destination_shrunk_to_one_element_still_builds() {
    let engine = CpuEngine::new();
    let spec = PoolingSpec {
        kind: PoolKind::Max,
        dtype: DType::F32,
        src_dims: dims(&[1, 1, 4, 4]),
        dst_dims: dims(&[1, 1, 1, 1]),
        window: dims(&[4, 4]),
        strides: dims(&[1, 1]),
        padding: dims(&[0, 0]),
    };
    let layout = src_layout(&spec, MemFormat::Nchw);
    let kernel = build_forward(&engine, &spec, Some(&layout)).expect("forward kernel");

    let output = engine.memory_desc(kernel.outputs()[0].tensor());
    assert_eq!(output.dims.as_slice(), &[1, 1, 1, 1]);
    assert_eq!(kernel.net().last().expect("net").kind(), PrimitiveKind::Pooling);
}

#[test]
fn rebuilding_the_same_spec_yields_fresh_primitives() {
    let engine = CpuEngine::new();
    let first = build_forward(&engine, &max_spec(), None).expect("first kernel");
    let second = build_forward(&engine, &max_spec(), None).expect("second kernel");

    assert_eq!(first.descriptor(), second.descriptor());
    assert_eq!(first.net().len(), second.net().len());
    assert_eq!(
        engine.memory_desc(first.inputs()[0].tensor()),
        engine.memory_desc(second.inputs()[0].tensor())
    );
    // Same structure, distinct primitive handles.
    assert_ne!(first.net()[0], second.net()[0]);
    assert_ne!(first.net()[1], second.net()[1]);
}
