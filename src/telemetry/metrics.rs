//! Session metrics via the `metrics` facade.
//!
//! Nothing here installs a recorder; hosts pick their exporter.

/// Tokens pushed through the engine. `batched` = prompt-side decode.
pub fn record_decode(tokens: usize, batched: bool) {
    let kind = if batched { "batch" } else { "single" };
    ::metrics::counter!("eva_core_tokens_decoded_total", "kind" => kind).increment(tokens as u64);
}

pub fn record_token_generated() {
    ::metrics::counter!("eva_core_tokens_generated_total").increment(1);
}

pub fn record_truncation(discarded: usize) {
    ::metrics::counter!("eva_core_context_truncations_total").increment(1);
    ::metrics::counter!("eva_core_tokens_discarded_total").increment(discarded as u64);
}

pub fn record_filler() {
    ::metrics::counter!("eva_core_filler_insertions_total").increment(1);
}

pub fn record_media_failure() {
    ::metrics::counter!("eva_core_media_failures_total").increment(1);
}

pub fn record_cache_fill(percent: f32) {
    ::metrics::gauge!("eva_core_cache_fill_percent").set(f64::from(percent));
}

/// End-of-generation totals.
pub fn record_generation(reason: &'static str, single_tps: f64, batch_tps: f64) {
    ::metrics::counter!("eva_core_generations_total", "reason" => reason).increment(1);
    if single_tps > 0.0 {
        ::metrics::histogram!("eva_core_tokens_per_second", "kind" => "single").record(single_tps);
    }
    if batch_tps > 0.0 {
        ::metrics::histogram!("eva_core_tokens_per_second", "kind" => "batch").record(batch_tps);
    }
}
