use shared::metrics_defs::{MetricDef, MetricType};

pub const NOTIFICATIONS_SENT: MetricDef = MetricDef {
    name: "formations.notifications.sent",
    metric_type: MetricType::Counter,
    description: "Outbound notifications sent. Tagged with kind and mode.",
};

pub const NOTIFICATION_FAILURES: MetricDef = MetricDef {
    name: "formations.notifications.failed",
    metric_type: MetricType::Counter,
    description: "Notifications that left an assignment or formation in an error state. Tagged with kind.",
};

pub const NOTIFICATION_DURATION: MetricDef = MetricDef {
    name: "formations.notifications.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent waiting for a notification response, in seconds. Tagged with kind.",
};

pub const CONSTRAINT_DENIALS: MetricDef = MetricDef {
    name: "formations.constraints.denied",
    metric_type: MetricType::Counter,
    description: "Operations denied by a constraint. Tagged with join_point.",
};

pub const CALLBACKS_RECEIVED: MetricDef = MetricDef {
    name: "formations.callbacks.received",
    metric_type: MetricType::Counter,
    description: "Asynchronous status reports received. Tagged with kind.",
};

pub const RESYNCHRONIZATIONS: MetricDef = MetricDef {
    name: "formations.resynchronizations",
    metric_type: MetricType::Counter,
    description: "Resynchronization requests. Tagged with reset.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    NOTIFICATIONS_SENT,
    NOTIFICATION_FAILURES,
    NOTIFICATION_DURATION,
    CONSTRAINT_DENIALS,
    CALLBACKS_RECEIVED,
    RESYNCHRONIZATIONS,
];
