//! Records as the provider returns them. Every field is optional: the
//! normalizer decides what is usable.

use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMeter {
    pub service_point_number: Option<String>,
    pub meter_number: Option<String>,
    pub meter_point_number: Option<String>,
    pub fuel_type: Option<String>,
    #[serde(default)]
    pub has_ami_smart_meter: bool,
    #[serde(default)]
    pub is_smart_meter: bool,
    pub premise_number: Option<String>,
    pub region: Option<String>,
}

/// Monthly billing total.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBillingUsage {
    /// `YYYYMM`.
    pub usage_year_month: Option<i64>,
    /// `TOTAL_KWH` or `THERMS`.
    pub usage_type: Option<String>,
    pub usage: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBillingCost {
    /// `YYYYMM`.
    pub month: Option<i64>,
    pub fuel_type: Option<String>,
    pub amount: Option<f64>,
}

/// One hour of AMI usage. Gas quantities are in therms.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawAmiUsage {
    pub date: Option<String>,
    pub quantity: Option<f64>,
}

/// One 15-minute interval read, kWh.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawIntervalRead {
    pub start_time: Option<String>,
    pub value: Option<f64>,
}
