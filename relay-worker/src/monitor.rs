use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::MonitorError;

/// The admission decision: accept while utilization is strictly below the
/// threshold. A reading exactly at the threshold is denied.
pub fn admit(utilization: f64, threshold: f64) -> bool {
    utilization < threshold
}

/// Source of the live utilization signal gating admission.
#[async_trait]
pub trait UtilizationMonitor {
    /// Latest utilization of the downstream capacity, in `[0.0, 1.0]`.
    async fn latest_utilization(&self) -> Result<f64, MonitorError>;
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricResponse {
    #[serde(default)]
    pub value: Vec<Metric>,
}

#[derive(Debug, Deserialize)]
pub struct Metric {
    #[serde(default)]
    pub timeseries: Vec<TimeSeries>,
}

#[derive(Debug, Deserialize)]
pub struct TimeSeries {
    #[serde(default)]
    pub data: Vec<DataPoint>,
}

#[derive(Debug, Deserialize)]
pub struct DataPoint {
    pub average: Option<f64>,
}

/// Latest aggregate in the response, or `0.0` when the metric has no recent
/// data points. No data reads as fully available on purpose: when the signal
/// goes quiet, we keep processing rather than stall every partition.
pub fn latest_average(response: &MetricResponse) -> f64 {
    for metric in &response.value {
        for series in &metric.timeseries {
            if let Some(average) = series.data.last().and_then(|point| point.average) {
                return average;
            }
        }
    }

    0.0
}

/// Utilization monitor backed by an HTTP metrics service.
pub struct MonitorClient {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    metric_name: String,
    window_secs: u64,
}

impl MonitorClient {
    pub fn new(
        endpoint: &str,
        metric_name: &str,
        window_secs: u64,
        timeout: Duration,
    ) -> Result<Self, MonitorError> {
        if endpoint.is_empty() {
            return Err(MonitorError::Unconfigured);
        }
        let endpoint = reqwest::Url::parse(endpoint).map_err(|_| MonitorError::Unconfigured)?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to construct reqwest client for utilization monitor");

        Ok(Self {
            client,
            endpoint,
            metric_name: metric_name.to_owned(),
            window_secs,
        })
    }
}

#[async_trait]
impl UtilizationMonitor for MonitorClient {
    async fn latest_utilization(&self) -> Result<f64, MonitorError> {
        let window = self.window_secs.to_string();
        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[
                ("metric", self.metric_name.as_str()),
                ("window_secs", window.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<MetricResponse>()
            .await?;

        Ok(latest_average(&response))
    }
}
