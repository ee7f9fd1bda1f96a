use super::{EntitySurface, MeterSnapshot};

/// Entity surface for headless runs: logs each snapshot and mirrors it
/// into Prometheus gauges labelled by service point.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEntitySurface;

#[async_trait::async_trait]
impl EntitySurface for TracingEntitySurface {
    async fn publish_meter(&self, snapshot: &MeterSnapshot) {
        let sp = snapshot.service_point.clone();
        let fuel = snapshot.fuel.as_str();

        if let Some((_, usage)) = snapshot.last_billing_usage {
            metrics::gauge!("meter_last_billing_usage", "service_point" => sp.clone(), "fuel" => fuel).set(usage);
        }
        if let Some((_, cost)) = snapshot.last_billing_cost {
            metrics::gauge!("meter_last_billing_cost", "service_point" => sp.clone(), "fuel" => fuel).set(cost);
        }
        metrics::gauge!("meter_is_smart_meter", "service_point" => sp, "fuel" => fuel)
            .set(if snapshot.is_smart_meter { 1.0 } else { 0.0 });

        tracing::info!(
            account_id = %snapshot.account_id,
            service_point = %snapshot.service_point,
            fuel,
            last_billing_usage = ?snapshot.last_billing_usage.map(|(_, v)| v),
            last_billing_cost = ?snapshot.last_billing_cost.map(|(_, v)| v),
            is_smart_meter = snapshot.is_smart_meter,
            "meter state updated"
        );
    }

    async fn reauth_required(&self, entry_id: &str, account_id: &str) {
        metrics::counter!("reauth_required_total").increment(1);
        tracing::error!(entry_id, account_id, "provider rejected credentials, reauthentication required");
    }
}
