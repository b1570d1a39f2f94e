use crate::dtu::{PvRecord, RawReading, SgsRecord};

// fixed-point divisors of the DTU encoding (raw integer -> physical unit)
pub const SGS_VOLTAGE_DIV: f64 = 10.0; //V
pub const SGS_FREQUENCY_DIV: f64 = 100.0; //Hz
pub const SGS_ACTIVE_POWER_DIV: f64 = 10.0; //W
pub const SGS_CURRENT_DIV: f64 = 100.0; //A
pub const SGS_POWER_FACTOR_DIV: f64 = 10.0; //%
pub const SGS_TEMPERATURE_DIV: f64 = 10.0; //C
pub const PV_VOLTAGE_DIV: f64 = 10.0; //V
pub const PV_CURRENT_DIV: f64 = 100.0; //A
pub const PV_POWER_DIV: f64 = 10.0; //W
pub const PV_ENERGY_DIV: f64 = 1.0; //Wh

pub const UNKNOWN_PORT: &str = "unknown";

#[derive(Clone, Debug, PartialEq)]
pub struct InverterReading {
    pub serial_number: String,
    pub voltage: f64,
    pub frequency: f64,
    pub active_power: f64,
    pub current: f64,
    pub power_factor: f64,
    pub temperature: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PanelReading {
    pub serial_number: String,
    pub port_number: String,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy_total: f64,
    pub energy_daily: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NormalizedReading {
    pub inverters: Vec<InverterReading>,
    pub panels: Vec<PanelReading>,
}

impl NormalizedReading {
    pub fn is_empty(&self) -> bool {
        self.inverters.is_empty() && self.panels.is_empty()
    }
}

fn scaled(raw: Option<i64>, divisor: f64) -> f64 {
    raw.unwrap_or(0) as f64 / divisor
}

// records without a serial number cannot be attributed to a series
fn serial(raw: &Option<String>) -> Option<String> {
    raw.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn inverter(rec: &SgsRecord) -> Option<InverterReading> {
    Some(InverterReading {
        serial_number: serial(&rec.serial_number)?,
        voltage: scaled(rec.voltage, SGS_VOLTAGE_DIV),
        frequency: scaled(rec.frequency, SGS_FREQUENCY_DIV),
        active_power: scaled(rec.active_power, SGS_ACTIVE_POWER_DIV),
        current: scaled(rec.current, SGS_CURRENT_DIV),
        power_factor: scaled(rec.power_factor, SGS_POWER_FACTOR_DIV),
        temperature: scaled(rec.temperature, SGS_TEMPERATURE_DIV),
    })
}

fn panel(rec: &PvRecord) -> Option<PanelReading> {
    Some(PanelReading {
        serial_number: serial(&rec.serial_number)?,
        port_number: serial(&rec.port_number).unwrap_or_else(|| UNKNOWN_PORT.to_string()),
        voltage: scaled(rec.voltage, PV_VOLTAGE_DIV),
        current: scaled(rec.current, PV_CURRENT_DIV),
        power: scaled(rec.power, PV_POWER_DIV),
        energy_total: scaled(rec.energy_total, PV_ENERGY_DIV),
        energy_daily: scaled(rec.energy_daily, PV_ENERGY_DIV),
    })
}

pub fn normalize(raw: &RawReading) -> NormalizedReading {
    NormalizedReading {
        inverters: raw.sgs_data.iter().filter_map(inverter).collect(),
        panels: raw.pv_data.iter().filter_map(panel).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sn1() -> SgsRecord {
        SgsRecord {
            serial_number: Some("SN1".into()),
            voltage: Some(2300),
            frequency: Some(5000),
            active_power: Some(2500),
            current: Some(1050),
            power_factor: Some(970),
            temperature: Some(350),
        }
    }

    #[test]
    fn inverter_values_are_scaled() {
        let raw = RawReading {
            sgs_data: vec![sn1()],
            pv_data: vec![],
        };
        let out = normalize(&raw);
        assert_eq!(
            out.inverters,
            vec![InverterReading {
                serial_number: "SN1".into(),
                voltage: 230.0,
                frequency: 50.0,
                active_power: 250.0,
                current: 10.5,
                power_factor: 97.0,
                temperature: 35.0,
            }]
        );
        assert!(out.panels.is_empty());
    }

    #[test]
    fn panel_values_are_scaled() {
        let raw = RawReading {
            sgs_data: vec![],
            pv_data: vec![PvRecord {
                serial_number: Some("116180212345".into()),
                port_number: Some("2".into()),
                voltage: Some(345),
                current: Some(812),
                power: Some(2803),
                energy_total: Some(1234567),
                energy_daily: Some(2048),
            }],
        };
        let p = &normalize(&raw).panels[0];
        assert_eq!(p.port_number, "2");
        assert_eq!(p.voltage, 34.5);
        assert_eq!(p.current, 8.12);
        assert_eq!(p.power, 280.3);
        assert_eq!(p.energy_total, 1234567.0);
        assert_eq!(p.energy_daily, 2048.0);
    }

    #[test]
    fn missing_port_defaults_to_unknown() {
        let raw = RawReading {
            sgs_data: vec![],
            pv_data: vec![PvRecord {
                serial_number: Some("SN2".into()),
                ..PvRecord::default()
            }],
        };
        let out = normalize(&raw);
        assert_eq!(out.panels.len(), 1);
        assert_eq!(out.panels[0].port_number, UNKNOWN_PORT);
        assert_eq!(out.panels[0].voltage, 0.0);
    }

    #[test]
    fn records_without_serial_are_dropped() {
        let raw = RawReading {
            sgs_data: vec![
                SgsRecord {
                    serial_number: None,
                    ..sn1()
                },
                SgsRecord {
                    serial_number: Some("  ".into()),
                    ..sn1()
                },
                sn1(),
            ],
            pv_data: vec![PvRecord::default()],
        };
        let out = normalize(&raw);
        assert_eq!(out.inverters.len(), 1);
        assert_eq!(out.inverters[0].serial_number, "SN1");
        assert!(out.panels.is_empty());
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let raw = RawReading {
            sgs_data: vec![SgsRecord {
                serial_number: Some("SN3".into()),
                temperature: Some(-52),
                ..SgsRecord::default()
            }],
            pv_data: vec![],
        };
        let inv = &normalize(&raw).inverters[0];
        assert_eq!(inv.voltage, 0.0);
        assert_eq!(inv.frequency, 0.0);
        assert_eq!(inv.temperature, -5.2);
        assert!(inv.temperature.is_finite());
    }

    #[test]
    fn empty_reading_normalizes_to_empty() {
        let out = normalize(&RawReading::default());
        assert!(out.is_empty());
        assert_eq!(out, NormalizedReading::default());
    }
}
