//! Layout-decision counters recorded while kernels are built.
//!
//! Compiled to no-ops unless the `profiler` feature is enabled. The builders
//! emit one event per fallback taken (`pool_fprop_fallback`,
//! `pool_bprop_fallback`) and one per conversion inserted
//! (`pool_fprop_src_reorder`, `pool_bprop_diff_dst_reorder`), so a run's
//! counter snapshot shows how often layout negotiation had to do real work.

#[cfg(feature = "profiler")]
use std::collections::BTreeMap;
#[cfg(feature = "profiler")]
use std::sync::Mutex;

#[cfg(feature = "profiler")]
use once_cell::sync::Lazy;

#[cfg(feature = "profiler")]
static LAYOUT_COUNTERS: Lazy<Mutex<BTreeMap<&'static str, u64>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

/// Records one occurrence of a named layout decision.
#[inline(always)]
pub fn layout_event(name: &'static str) {
    #[cfg(feature = "profiler")]
    {
        let mut counters = LAYOUT_COUNTERS
            .lock()
            .expect("layout counter mutex poisoned");
        let entry = counters.entry(name).or_insert(0);
        *entry = entry.saturating_add(1);
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
    }
}

/// Snapshot of every counter recorded so far, sorted by event name.
#[cfg(feature = "profiler")]
pub fn counters() -> Vec<(String, u64)> {
    let counters = LAYOUT_COUNTERS
        .lock()
        .expect("layout counter mutex poisoned");
    counters
        .iter()
        .map(|(name, count)| (name.to_string(), *count))
        .collect()
}

#[cfg(not(feature = "profiler"))]
pub fn counters() -> Vec<(String, u64)> {
    Vec::new()
}

#[cfg(feature = "profiler")]
pub fn reset_counters() {
    LAYOUT_COUNTERS
        .lock()
        .expect("layout counter mutex poisoned")
        .clear();
}

#[cfg(not(feature = "profiler"))]
pub fn reset_counters() {}

#[cfg(feature = "profiler")]
pub fn counters_json() -> Option<String> {
    let counters = LAYOUT_COUNTERS
        .lock()
        .expect("layout counter mutex poisoned");
    if counters.is_empty() {
        return None;
    }
    serde_json::to_string(&*counters).ok()
}

#[cfg(not(feature = "profiler"))]
pub fn counters_json() -> Option<String> {
    None
}
