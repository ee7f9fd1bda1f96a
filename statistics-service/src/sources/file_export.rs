use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use energy_client::domain::Meter;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use super::{
    raw::{RawAmiUsage, RawBillingCost, RawBillingUsage, RawIntervalRead, RawMeter},
    UtilitySource,
};
use crate::error::FetchError;

/// Utility source backed by a provider export on disk.
///
/// Layout, one directory per billing account:
/// - `<root>/<account>/meters.json` (JSON array of meters)
/// - `<root>/<account>/billing.ndjson`, `<root>/<account>/costs.ndjson`
/// - `<root>/<account>/<service_point>/ami.ndjson`
/// - `<root>/<account>/<service_point>/interval.ndjson`
///
/// Data files are returned whole; the normalizer applies the fetch window.
/// A missing data file is an empty feed, a missing account is `Unavailable`.
pub struct FileExportSource {
    root: PathBuf,
}

impl FileExportSource {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn account_dir(&self, account_id: &str) -> PathBuf {
        self.root.join(account_id)
    }

    fn meter_dir(&self, meter: &Meter) -> PathBuf {
        self.account_dir(&meter.account_id).join(&meter.service_point)
    }
}

async fn read_ndjson<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, FetchError> {
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(FetchError::Unavailable(format!(
                "failed to open {}: {e}",
                path.display()
            )))
        }
    };

    let mut lines = BufReader::new(file).lines();
    let mut out = Vec::new();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| FetchError::Unavailable(format!("failed to read {}: {e}", path.display())))?
    {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(record) => out.push(record),
            Err(e) => {
                metrics::counter!("file_export_parse_errors_total").increment(1);
                tracing::debug!(error = %e, path = %path.display(), "skipping malformed export line");
            }
        }
    }

    Ok(out)
}

#[async_trait::async_trait]
impl UtilitySource for FileExportSource {
    async fn fetch_meters(&self, account_id: &str) -> Result<Vec<RawMeter>, FetchError> {
        let path = self.account_dir(account_id).join("meters.json");
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            FetchError::Unavailable(format!("no export for account {account_id}: {e}"))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| FetchError::Unavailable(format!("invalid {}: {e}", path.display())))
    }

    async fn fetch_billing(
        &self,
        account_id: &str,
        _meter: &Meter,
        _since: OffsetDateTime,
    ) -> Result<Vec<RawBillingUsage>, FetchError> {
        read_ndjson(&self.account_dir(account_id).join("billing.ndjson")).await
    }

    async fn fetch_costs(
        &self,
        account_id: &str,
        _meter: &Meter,
        _since: OffsetDateTime,
    ) -> Result<Vec<RawBillingCost>, FetchError> {
        read_ndjson(&self.account_dir(account_id).join("costs.ndjson")).await
    }

    async fn fetch_ami(
        &self,
        meter: &Meter,
        _since: OffsetDateTime,
        _until: OffsetDateTime,
    ) -> Result<Vec<RawAmiUsage>, FetchError> {
        read_ndjson(&self.meter_dir(meter).join("ami.ndjson")).await
    }

    async fn fetch_interval(
        &self,
        meter: &Meter,
        _since: OffsetDateTime,
        _until: OffsetDateTime,
    ) -> Result<Vec<RawIntervalRead>, FetchError> {
        read_ndjson(&self.meter_dir(meter).join("interval.ndjson")).await
    }
}
