//! Prometheus text exposition output for the CLI's `--metrics` flag.

use prometheus_client::encoding::text::encode;

use crate::MetricsRegistry;

/// Render every registered metric, terminated by `# EOF`.
pub fn render_metrics(registry: &MetricsRegistry) -> String {
    let mut out = String::new();
    // Encoding into a String has no I/O to fail on.
    let _ = encode(&mut out, &registry.registry);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_metrics_empty() {
        let registry = MetricsRegistry::new();
        let output = render_metrics(&registry);

        // Definitions are present even without samples
        assert!(output.contains("paramdeck_snapshots_applied"));
        assert!(output.contains("paramdeck_active_connections"));
    }

    #[test]
    fn test_render_metrics_with_data() {
        let registry = MetricsRegistry::new();
        registry.connection_opened();
        registry.record_snapshot(true);
        registry.record_connection_failure("protocol");

        let output = render_metrics(&registry);

        assert!(output.contains("paramdeck_active_connections 1"));
        assert!(output.contains("paramdeck_snapshots_applied_total 1"));
        assert!(output.contains("kind=\"protocol\""));
        assert!(output.trim_end().ends_with("# EOF"));
    }
}
