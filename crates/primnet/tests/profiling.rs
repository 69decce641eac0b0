#![cfg(feature = "profiler")]

use primnet::pooling::{build_forward, PoolingSpec};
use primnet::profiling;
use primnet::spec::{DType, Dims, PoolKind};
use primnet_engine_ref_cpu::CpuEngine;

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

// Counters are process-global, so this binary keeps everything in one test.
#[test]
fn layout_events_accumulate_and_reset() {
    profiling::reset_counters();
    assert!(profiling::counters().is_empty());
    assert_eq!(profiling::counters_json(), None);

    // A build without a caller layout takes the fallback and inserts a
    // source reorder, one event each.
    let engine = CpuEngine::new();
    let kernel = build_forward(&engine, &max_spec(), None).expect("forward kernel");
    assert_eq!(kernel.net().len(), 2);

    assert_eq!(
        profiling::counters(),
        vec![
            ("pool_fprop_fallback".to_string(), 1),
            ("pool_fprop_src_reorder".to_string(), 1),
        ]
    );

    profiling::layout_event("pool_fprop_fallback");
    assert_eq!(
        profiling::counters()[0],
        ("pool_fprop_fallback".to_string(), 2)
    );

    let json = profiling::counters_json().expect("non-empty counters serialize");
    assert!(json.contains("\"pool_fprop_fallback\":2"));
    assert!(json.contains("\"pool_fprop_src_reorder\":1"));

    profiling::reset_counters();
    assert!(profiling::counters().is_empty());
    assert_eq!(profiling::counters_json(), None);
}
