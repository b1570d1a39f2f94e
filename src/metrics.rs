use crate::normalizer::NormalizedReading;
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

const SGS_LABELS: &[&str] = &["serial_number"];
const PV_LABELS: &[&str] = &["serial_number", "port_number"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollResult {
    Ok,
    SoftMiss,
    TransportError,
}

impl PollResult {
    fn label(self) -> &'static str {
        match self {
            PollResult::Ok => "ok",
            PollResult::SoftMiss => "soft_miss",
            PollResult::TransportError => "transport_error",
        }
    }
}

/// Owns the prometheus registry and every series the exporter publishes.
/// Gauges are internally synchronized, so the HTTP responder can gather
/// while the poller publishes.
pub struct MetricRegistry {
    registry: Registry,

    sgs_voltage: GaugeVec,
    sgs_frequency: GaugeVec,
    sgs_active_power: GaugeVec,
    sgs_current_amps: GaugeVec,
    sgs_power_factor: GaugeVec,
    sgs_temperature: GaugeVec,

    pv_voltage: GaugeVec,
    pv_current_amps: GaugeVec,
    pv_current_power: GaugeVec,
    pv_energy_total: GaugeVec,
    pv_energy_daily: GaugeVec,

    polls: IntCounterVec,
    handshakes: IntCounterVec,
}

impl MetricRegistry {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let gauge = |name: &str, help: &str, labels: &[&str]| -> prometheus::Result<GaugeVec> {
            let g = GaugeVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let counter = |name: &str, help: &str, labels: &[&str]| -> prometheus::Result<IntCounterVec> {
            let c = IntCounterVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let sgs_voltage = gauge("hoymiles_sgs_voltage", "SGS Voltage (V)", SGS_LABELS)?;
        let sgs_frequency = gauge("hoymiles_sgs_frequency", "SGS Frequency (Hz)", SGS_LABELS)?;
        let sgs_active_power = gauge("hoymiles_sgs_active_power", "SGS Active Power (W)", SGS_LABELS)?;
        let sgs_current_amps = gauge("hoymiles_sgs_current_amps", "SGS Current Amperage (A)", SGS_LABELS)?;
        let sgs_power_factor = gauge("hoymiles_sgs_power_factor", "SGS Power Factor (%)", SGS_LABELS)?;
        let sgs_temperature = gauge("hoymiles_sgs_temperature", "SGS Temperature (C)", SGS_LABELS)?;

        let pv_voltage = gauge("hoymiles_pv_voltage", "PV Voltage (V)", PV_LABELS)?;
        let pv_current_amps = gauge("hoymiles_pv_current_amps", "PV Current Amperage (A)", PV_LABELS)?;
        let pv_current_power = gauge("hoymiles_pv_current_power", "PV Current Power (W)", PV_LABELS)?;
        let pv_energy_total = gauge("hoymiles_pv_energy_total", "PV Energy Total (Wh)", PV_LABELS)?;
        let pv_energy_daily = gauge("hoymiles_pv_energy_daily", "PV Energy Daily (Wh)", PV_LABELS)?;

        let polls = counter(
            "hoymiles_exporter_polls_total",
            "DTU data requests by result",
            &["result"],
        )?;
        let handshakes = counter(
            "hoymiles_exporter_handshakes_total",
            "DTU handshakes by result",
            &["result"],
        )?;

        Ok(Self {
            registry,
            sgs_voltage,
            sgs_frequency,
            sgs_active_power,
            sgs_current_amps,
            sgs_power_factor,
            sgs_temperature,
            pv_voltage,
            pv_current_amps,
            pv_current_power,
            pv_energy_total,
            pv_energy_daily,
            polls,
            handshakes,
        })
    }

    pub fn publish(&self, reading: &NormalizedReading) {
        for inv in &reading.inverters {
            let labels = [inv.serial_number.as_str()];
            self.sgs_voltage.with_label_values(&labels).set(inv.voltage);
            self.sgs_frequency.with_label_values(&labels).set(inv.frequency);
            self.sgs_active_power.with_label_values(&labels).set(inv.active_power);
            self.sgs_current_amps.with_label_values(&labels).set(inv.current);
            self.sgs_power_factor.with_label_values(&labels).set(inv.power_factor);
            self.sgs_temperature.with_label_values(&labels).set(inv.temperature);
        }

        for pv in &reading.panels {
            let labels = [pv.serial_number.as_str(), pv.port_number.as_str()];
            self.pv_voltage.with_label_values(&labels).set(pv.voltage);
            self.pv_current_amps.with_label_values(&labels).set(pv.current);
            self.pv_current_power.with_label_values(&labels).set(pv.power);
            self.pv_energy_total.with_label_values(&labels).set(pv.energy_total);
            self.pv_energy_daily.with_label_values(&labels).set(pv.energy_daily);
        }
    }

    pub fn record_poll(&self, result: PollResult) {
        self.polls.with_label_values(&[result.label()]).inc();
    }

    pub fn record_handshake(&self, ok: bool) {
        let result = if ok { "ok" } else { "failed" };
        self.handshakes.with_label_values(&[result]).inc();
    }

    /// Text exposition of every registered series.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
