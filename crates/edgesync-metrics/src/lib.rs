mod probe;

pub use probe::{
    primary_ipv4,
    SystemMetricsProbe,
    SystemMetricsSource,
    TOP_PROCESS_COUNT,
};
