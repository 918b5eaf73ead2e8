#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_provider(name: &'static str, provider: &str) {
    metrics::increment_counter!(name, "provider" => provider.to_string());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_provider(_name: &'static str, _provider: &str) {}
