use num_format::{CustomFormat, Grouping};

/// Number format for step and episode counters in log lines, e.g. `1_920_000`
pub fn number_format() -> CustomFormat {
    CustomFormat::builder()
        .grouping(Grouping::Standard)
        .minus_sign("-")
        .separator("_")
        .build()
        .unwrap_or_default()
}
