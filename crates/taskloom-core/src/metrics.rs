use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};

struct CoreMetrics {
    tasks: Counter<u64>,
    task_latency_ms: Histogram<f64>,
    deliveries: Counter<u64>,
    dead_letters: Counter<u64>,
    queue_depth: Histogram<u64>,
    credits: Counter<u64>,
}

static METRICS: OnceCell<CoreMetrics> = OnceCell::new();

fn handles() -> &'static CoreMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("taskloom.core");
        CoreMetrics {
            tasks: meter
                .u64_counter("tasks_total")
                .with_description("Task executions by handler and outcome")
                .init(),
            task_latency_ms: meter
                .f64_histogram("task_latency_ms")
                .with_description("Handler execution latency in milliseconds")
                .init(),
            deliveries: meter
                .u64_counter("bus_deliveries_total")
                .with_description("Event deliveries by type and outcome")
                .init(),
            dead_letters: meter
                .u64_counter("bus_dead_letters_total")
                .with_description("Events moved to the dead-letter queue")
                .init(),
            queue_depth: meter
                .u64_histogram("task_queue_depth")
                .with_description("Pending task queue depth observed at dispatch time")
                .init(),
            credits: meter
                .u64_counter("billing_cycles_total")
                .with_description("Orchestration cycles billed")
                .init(),
        }
    })
}

/// Record one handler invocation (no-op without an installed provider).
pub fn record_task(handler: &str, success: bool, duration_ms: f64) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("handler", handler.to_string()),
        KeyValue::new("status", if success { "success" } else { "failed" }),
    ];
    metrics.tasks.add(1, &attrs);
    metrics.task_latency_ms.record(duration_ms, &attrs);
}

pub fn record_delivery(event_type: &str, success: bool) {
    handles().deliveries.add(
        1,
        &[
            KeyValue::new("event_type", event_type.to_string()),
            KeyValue::new("status", if success { "delivered" } else { "failed" }),
        ],
    );
}

pub fn record_dead_letter(event_type: &str) {
    handles()
        .dead_letters
        .add(1, &[KeyValue::new("event_type", event_type.to_string())]);
}

pub fn record_queue_depth(depth: u64) {
    handles().queue_depth.record(depth, &[]);
}

pub fn record_billing_cycle(user_id: &str) {
    handles()
        .credits
        .add(1, &[KeyValue::new("user", user_id.to_string())]);
}
