//! Metrics/tracing hooks.
//!
//! Kept to plain `tracing` events; exporters belong in the embedding binary.

#[cfg(feature = "tracing")]
pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::trace_span!("planstage", event);
    let _enter = span.enter();
    for (k, v) in key_values {
        tracing::trace!(%k, %v, "metric");
    }
}

#[cfg(not(feature = "tracing"))]
pub fn emit_span(_event: &str, _key_values: &[(&str, String)]) { /* no-op */
}
