use prometheus::{Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    pub envelopes_dispatched: IntCounterVec,
    pub protocol_errors: IntCounter,
    pub handler_errors: IntCounter,
    pub rate_limit_suppressed: IntCounter,
    pub rate_limit_cooldowns: IntCounter,
    pub reconnect_attempts: IntCounter,
    pub heartbeat_timeouts: IntCounter,
    pub poll_failures: IntCounter,
    pub poller_active: IntGauge,
    pub connection_latency_ms: Gauge,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        let envelopes_dispatched = IntCounterVec::new(
            Opts::new("envelopes_dispatched", "Envelopes dispatched by kind and source"),
            &["kind", "source"],
        )
        .unwrap();
        let protocol_errors =
            IntCounter::with_opts(Opts::new("protocol_errors", "Frames rejected at the dispatcher"))
                .unwrap();
        let handler_errors =
            IntCounter::with_opts(Opts::new("handler_errors", "Handler invocations that failed"))
                .unwrap();
        let rate_limit_suppressed = IntCounter::with_opts(Opts::new(
            "rate_limit_suppressed",
            "Metric updates held back by the rate limiter",
        ))
        .unwrap();
        let rate_limit_cooldowns = IntCounter::with_opts(Opts::new(
            "rate_limit_cooldowns",
            "Rate limiter cooldowns entered",
        ))
        .unwrap();
        let reconnect_attempts =
            IntCounter::with_opts(Opts::new("reconnect_attempts", "Push channel reconnect attempts"))
                .unwrap();
        let heartbeat_timeouts =
            IntCounter::with_opts(Opts::new("heartbeat_timeouts", "Missed heartbeat responses"))
                .unwrap();
        let poll_failures =
            IntCounter::with_opts(Opts::new("poll_failures", "Failed fallback poll requests"))
                .unwrap();
        let poller_active =
            IntGauge::with_opts(Opts::new("poller_active", "1 while fallback polling is active"))
                .unwrap();
        let connection_latency_ms = Gauge::with_opts(Opts::new(
            "connection_latency_ms",
            "Last measured heartbeat round trip",
        ))
        .unwrap();
        registry.register(Box::new(envelopes_dispatched.clone())).ok();
        registry.register(Box::new(protocol_errors.clone())).ok();
        registry.register(Box::new(handler_errors.clone())).ok();
        registry.register(Box::new(rate_limit_suppressed.clone())).ok();
        registry.register(Box::new(rate_limit_cooldowns.clone())).ok();
        registry.register(Box::new(reconnect_attempts.clone())).ok();
        registry.register(Box::new(heartbeat_timeouts.clone())).ok();
        registry.register(Box::new(poll_failures.clone())).ok();
        registry.register(Box::new(poller_active.clone())).ok();
        registry.register(Box::new(connection_latency_ms.clone())).ok();
        Arc::new(Self {
            envelopes_dispatched,
            protocol_errors,
            handler_errors,
            rate_limit_suppressed,
            rate_limit_cooldowns,
            reconnect_attempts,
            heartbeat_timeouts,
            poll_failures,
            poller_active,
            connection_latency_ms,
        })
    }

    /// Metrics bound to a throwaway registry, for tests and tools.
    pub fn detached() -> Arc<Self> {
        Self::new(&Registry::new())
    }
}
