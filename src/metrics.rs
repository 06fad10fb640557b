use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};

/// Request-path outcome labels for `thumbserve_requests_total`.
#[derive(Debug, Clone, Copy)]
pub enum RequestOutcome {
    CacheHit,
    Generated,
    Deferred,
    Original,
    Denied,
    NotModified,
}

impl RequestOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::CacheHit => "cache_hit",
            Self::Generated => "generated",
            Self::Deferred => "deferred",
            Self::Original => "original",
            Self::Denied => "denied",
            Self::NotModified => "not_modified",
        }
    }
}

pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    queue_inserts: IntCounterVec,
    generation_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new(
                "thumbserve_requests_total",
                "Thumbnail requests by outcome",
            ),
            &["outcome"],
        )
        .expect("requests_total");
        let queue_inserts = IntCounterVec::new(
            Opts::new(
                "thumbserve_queue_inserts_total",
                "Deferred generation queue inserts by result",
            ),
            &["result"],
        )
        .expect("queue_inserts_total");
        let generation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "thumbserve_generation_duration_seconds",
                "Synchronous thumbnail generation duration",
            )
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .expect("generation_duration_seconds");
        registry
            .register(Box::new(requests.clone()))
            .expect("register requests_total");
        registry
            .register(Box::new(queue_inserts.clone()))
            .expect("register queue_inserts_total");
        registry
            .register(Box::new(generation_duration.clone()))
            .expect("register generation_duration_seconds");
        Self {
            registry,
            requests,
            queue_inserts,
            generation_duration,
        }
    }

    pub fn observe_request(&self, outcome: RequestOutcome) {
        self.requests.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn observe_queue_insert(&self, inserted: bool) {
        let result = if inserted { "inserted" } else { "duplicate" };
        self.queue_inserts.with_label_values(&[result]).inc();
    }

    pub fn observe_generation_seconds(&self, seconds: f64) {
        self.generation_duration.observe(seconds);
    }

    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
