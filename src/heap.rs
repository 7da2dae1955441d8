//! Heap statistics for the radio stack's allocator.

/// Log current heap usage, tagged with `context`.
pub fn log_stats(context: &str) {
    let free = esp_alloc::HEAP.free();
    let used = esp_alloc::HEAP.used();

    log::info!(
        "heap[{}]: used={}KB free={}KB (total={}KB)",
        context,
        used / 1024,
        free / 1024,
        (free + used) / 1024,
    );
}

/// Log a warning if free heap is under `threshold_kb`.
pub fn warn_if_low(threshold_kb: usize, context: &str) {
    let free_kb = esp_alloc::HEAP.free() / 1024;
    if free_kb < threshold_kb {
        log::warn!(
            "heap[{}]: LOW MEMORY - only {}KB free (threshold={}KB)",
            context,
            free_kb,
            threshold_kb
        );
    }
}
