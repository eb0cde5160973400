use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::errors::Result;
use crate::orchestrator::Termination;
use crate::quota::ModelTier;
use crate::tools::{RUN_TOOL, WRITE_TOOL};

pub struct AgentMetrics {
    registry: Registry,
    chat_requests: IntCounterVec,
    chat_duration: HistogramVec,
    model_calls: IntCounterVec,
    tool_calls: IntCounterVec,
    rate_limited: IntCounter,
}

impl AgentMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let chat_requests = IntCounterVec::new(
            Opts::new("chat_requests_total", "Chat requests by how the agent loop ended"),
            &["outcome"],
        )?;
        let chat_duration = HistogramVec::new(
            HistogramOpts::new(
                "chat_request_duration_seconds",
                "Wall time of one agent loop in seconds",
            ),
            &["outcome"],
        )?;
        let model_calls = IntCounterVec::new(
            Opts::new("model_calls_total", "Remote model invocations by tier"),
            &["tier"],
        )?;
        let tool_calls = IntCounterVec::new(
            Opts::new("tool_calls_total", "Tool dispatches by tool and status"),
            &["tool", "status"],
        )?;
        let rate_limited = IntCounter::new(
            "rate_limited_total",
            "Chat requests rejected by the per-user rate limiter",
        )?;

        registry.register(Box::new(chat_requests.clone()))?;
        registry.register(Box::new(chat_duration.clone()))?;
        registry.register(Box::new(model_calls.clone()))?;
        registry.register(Box::new(tool_calls.clone()))?;
        registry.register(Box::new(rate_limited.clone()))?;

        Ok(Self {
            registry,
            chat_requests,
            chat_duration,
            model_calls,
            tool_calls,
            rate_limited,
        })
    }

    pub fn record_chat(&self, termination: &Termination, duration: Duration) {
        let outcome = termination.label();
        self.chat_requests.with_label_values(&[outcome]).inc();
        self.chat_duration
            .with_label_values(&[outcome])
            .observe(duration.as_secs_f64());
    }

    pub fn record_model_call(&self, tier: ModelTier) {
        self.model_calls.with_label_values(&[tier.as_str()]).inc();
    }

    pub fn record_tool_call(&self, tool: &str, success: bool) {
        // model-chosen names would otherwise grow the label set without bound
        let tool = match tool {
            WRITE_TOOL | RUN_TOOL => tool,
            _ => "unknown",
        };
        let status = if success { "success" } else { "error" };
        self.tool_calls.with_label_values(&[tool, status]).inc();
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.inc();
    }

    pub fn render(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_recorded_counters() {
        let metrics = AgentMetrics::new().unwrap();
        metrics.record_chat(&Termination::Completed, Duration::from_millis(20));
        metrics.record_model_call(ModelTier::Secondary);
        metrics.record_tool_call("write", true);
        metrics.record_tool_call("rm -rf", false);
        metrics.record_rate_limited();

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"chat_requests_total{outcome="completed"} 1"#));
        assert!(text.contains(r#"model_calls_total{tier="secondary"} 1"#));
        assert!(text.contains(r#"tool_calls_total{status="success",tool="write"} 1"#));
        assert!(text.contains(r#"tool_calls_total{status="error",tool="unknown"} 1"#));
        assert!(text.contains("rate_limited_total 1"));
    }
}
