use std::{fmt, str::FromStr};

/// Commodity a meter measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FuelKind {
    Electric,
    Gas,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown fuel type '{0}'")]
pub struct UnknownFuel(pub String);

impl FuelKind {
    /// Segment used inside statistic identifiers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Electric => "electric",
            Self::Gas => "gas",
        }
    }

    /// Unit of the long-term statistics written for this fuel.
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Electric => "kWh",
            Self::Gas => "CCF",
        }
    }

    /// `usageType` the provider uses for monthly billing totals of this fuel.
    pub fn billing_usage_type(&self) -> &'static str {
        match self {
            Self::Electric => "TOTAL_KWH",
            Self::Gas => "THERMS",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Electric => "Electric",
            Self::Gas => "Gas",
        }
    }
}

impl fmt::Display for FuelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FuelKind {
    type Err = UnknownFuel;

    /// Accepts both the provider spelling (`Electric`, `GAS`) and ours.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "electric" => Ok(Self::Electric),
            "gas" => Ok(Self::Gas),
            _ => Err(UnknownFuel(s.to_string())),
        }
    }
}

/// What a meter can report. Re-derived on every cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeterCapabilities {
    pub supports_ami: bool,
    pub supports_interval: bool,
    /// Net-metered (solar) meter; set once a return reading has been seen.
    pub has_return: bool,
    pub is_smart_meter: bool,
}

impl MeterCapabilities {
    /// Interval reads are only published for AMI electric meters.
    pub fn derive(fuel: FuelKind, has_ami_smart_meter: bool, is_smart_meter: bool) -> Self {
        Self {
            supports_ami: has_ami_smart_meter,
            supports_interval: has_ami_smart_meter && fuel == FuelKind::Electric,
            has_return: false,
            is_smart_meter: has_ami_smart_meter || is_smart_meter,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BillingMetadata {
    pub meter_number: String,
    pub meter_point_number: String,
    pub premise_number: String,
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Meter {
    /// Stable per-meter key; every statistic identifier is derived from it.
    pub service_point: String,
    pub account_id: String,
    pub fuel: FuelKind,
    pub capabilities: MeterCapabilities,
    pub billing: BillingMetadata,
}

/// A billing account handled by one configured entry.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Account {
    pub account_id: String,
    /// Entry (login) the account belongs to.
    pub entry_id: String,
    pub meters: Vec<Meter>,
}
