// Datapoint assertion - picks a trustworthy value out of a trailing series
//
// Azion Analytics aggregates the most recent minute or two late, so the
// newest datapoints are usually under-reported. The newest one is always
// ignored and the scan walks back to the latest strictly positive value.

use super::series::Datapoint;

/// Returns the most recent positive value, excluding the newest datapoint.
///
/// `datapoints` must be ordered ascending by time. Yields `0.0` when fewer
/// than two datapoints exist or no earlier value is positive.
pub fn assert_latest_value(datapoints: &[Datapoint]) -> f64 {
    let Some((_newest, trusted)) = datapoints.split_last() else {
        return 0.0;
    };

    trusted
        .iter()
        .rev()
        .filter_map(|datapoint| datapoint.value)
        .find(|value| *value > 0.0)
        .unwrap_or(0.0)
}
