use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::topology::{
    Calibration, ChlorineSensor, LineId, Meter, MeterId, PressureTransmitter, SensorId,
    TransmissionLine, TransmitterId, Zone, ZoneId, ZonePressureLink,
};

/// Rejections raised while loading a network; nothing invalid reaches reconciliation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AssociationError {
    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: &'static str, id: String },
    #[error("meter '{meter}' is not associated with any zone or transmission line")]
    Unassigned { meter: MeterId },
    #[error("meter '{meter}' is associated with both a zone and a transmission line")]
    ZoneAndLine { meter: MeterId },
    #[error("meter '{meter}' is both input and output of '{target}'")]
    SameTarget { meter: MeterId, target: String },
    #[error("device '{device}' references unknown zone '{zone}'")]
    UnknownZone { device: String, zone: ZoneId },
    #[error("meter '{meter}' references unknown transmission line '{line}'")]
    UnknownLine { meter: MeterId, line: LineId },
    #[error("transmission line '{line}' needs exactly one input and one output meter (found {inputs} in, {outputs} out)")]
    LineEnds {
        line: LineId,
        inputs: usize,
        outputs: usize,
    },
}

/// Serialized form of the network topology.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub lines: Vec<TransmissionLine>,
    #[serde(default)]
    pub meters: Vec<Meter>,
    #[serde(default)]
    pub pressure_transmitters: Vec<PressureTransmitter>,
    #[serde(default)]
    pub chlorine_sensors: Vec<ChlorineSensor>,
    /// Users notified of every leak alert.
    #[serde(default)]
    pub subscribers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEnds {
    pub input: MeterId,
    pub output: MeterId,
}

impl LineEnds {
    pub fn contains(&self, meter_id: &str) -> bool {
        self.input == meter_id || self.output == meter_id
    }
}

/// Validated, indexed network topology.
#[derive(Debug, Clone)]
pub struct Network {
    zones: HashMap<ZoneId, Zone>,
    lines: HashMap<LineId, TransmissionLine>,
    meters: HashMap<MeterId, Meter>,
    transmitters: HashMap<TransmitterId, PressureTransmitter>,
    chlorine_sensors: HashMap<SensorId, ChlorineSensor>,
    zone_inputs: HashMap<ZoneId, Vec<MeterId>>,
    zone_outputs: HashMap<ZoneId, Vec<MeterId>>,
    line_ends: HashMap<LineId, LineEnds>,
    subscribers: Vec<String>,
}

fn index_unique<T, F>(
    kind: &'static str,
    items: Vec<T>,
    id_of: F,
) -> Result<HashMap<String, T>, AssociationError>
where
    F: Fn(&T) -> &str,
{
    let mut out = HashMap::with_capacity(items.len());
    for item in items {
        let id = id_of(&item).to_string();
        if out.contains_key(&id) {
            return Err(AssociationError::DuplicateId { kind, id });
        }
        out.insert(id, item);
    }
    Ok(out)
}

impl Network {
    pub fn build(cfg: NetworkConfig) -> Result<Self, AssociationError> {
        let zones = index_unique("zone", cfg.zones, |z| &z.id)?;
        let lines = index_unique("line", cfg.lines, |l| &l.id)?;
        let meters = index_unique("meter", cfg.meters, |m| &m.id)?;
        let transmitters = index_unique("pressure transmitter", cfg.pressure_transmitters, |t| &t.id)?;
        let chlorine_sensors = index_unique("chlorine sensor", cfg.chlorine_sensors, |s| &s.id)?;

        let mut zone_inputs: HashMap<ZoneId, Vec<MeterId>> = HashMap::new();
        let mut zone_outputs: HashMap<ZoneId, Vec<MeterId>> = HashMap::new();
        let mut line_inputs: HashMap<LineId, Vec<MeterId>> = HashMap::new();
        let mut line_outputs: HashMap<LineId, Vec<MeterId>> = HashMap::new();

        for meter in meters.values() {
            validate_meter(meter, &zones, &lines)?;

            if let Some(z) = &meter.input_for {
                zone_inputs.entry(z.clone()).or_default().push(meter.id.clone());
            }
            if let Some(z) = &meter.output_for {
                zone_outputs.entry(z.clone()).or_default().push(meter.id.clone());
            }
            if let Some(l) = &meter.line_input {
                line_inputs.entry(l.clone()).or_default().push(meter.id.clone());
            }
            if let Some(l) = &meter.line_output {
                line_outputs.entry(l.clone()).or_default().push(meter.id.clone());
            }
        }

        for list in zone_inputs.values_mut().chain(zone_outputs.values_mut()) {
            list.sort();
        }

        let mut line_ends = HashMap::with_capacity(lines.len());
        for line_id in lines.keys() {
            let ins = line_inputs.remove(line_id).unwrap_or_default();
            let outs = line_outputs.remove(line_id).unwrap_or_default();
            match (ins.as_slice(), outs.as_slice()) {
                ([input], [output]) => {
                    line_ends.insert(
                        line_id.clone(),
                        LineEnds {
                            input: input.clone(),
                            output: output.clone(),
                        },
                    );
                }
                _ => {
                    return Err(AssociationError::LineEnds {
                        line: line_id.clone(),
                        inputs: ins.len(),
                        outputs: outs.len(),
                    })
                }
            }
        }

        for t in transmitters.values() {
            for link in &t.zones {
                if !zones.contains_key(&link.zone) {
                    return Err(AssociationError::UnknownZone {
                        device: t.id.clone(),
                        zone: link.zone.clone(),
                    });
                }
            }
        }

        Ok(Self {
            zones,
            lines,
            meters,
            transmitters,
            chlorine_sensors,
            zone_inputs,
            zone_outputs,
            line_ends,
            subscribers: cfg.subscribers,
        })
    }

    pub fn meter(&self, id: &str) -> Option<&Meter> {
        self.meters.get(id)
    }

    pub fn zone(&self, id: &str) -> Option<&Zone> {
        self.zones.get(id)
    }

    pub fn line(&self, id: &str) -> Option<&TransmissionLine> {
        self.lines.get(id)
    }

    pub fn transmitter(&self, id: &str) -> Option<&PressureTransmitter> {
        self.transmitters.get(id)
    }

    pub fn chlorine_sensor(&self, id: &str) -> Option<&ChlorineSensor> {
        self.chlorine_sensors.get(id)
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub fn zone_inputs(&self, zone: &str) -> &[MeterId] {
        self.zone_inputs.get(zone).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn zone_outputs(&self, zone: &str) -> &[MeterId] {
        self.zone_outputs.get(zone).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every meter bordering `zone`, inputs first.
    pub fn zone_meters(&self, zone: &str) -> Vec<&Meter> {
        self.zone_inputs(zone)
            .iter()
            .chain(self.zone_outputs(zone))
            .filter_map(|id| self.meters.get(id))
            .collect()
    }

    pub fn line_ends(&self, line: &str) -> Option<&LineEnds> {
        self.line_ends.get(line)
    }

    /// Transmitters contributing to the zone's average pressure, with their link.
    pub fn azp_transmitters(&self, zone: &str) -> Vec<(&PressureTransmitter, &ZonePressureLink)> {
        let mut out: Vec<_> = self
            .transmitters
            .values()
            .flat_map(|t| {
                t.zones
                    .iter()
                    .filter(|link| link.zone == zone && link.use_for_azp)
                    .map(move |link| (t, link))
            })
            .collect();
        out.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        out
    }

    pub fn subscribers(&self) -> &[String] {
        &self.subscribers
    }

    pub fn calibration_of(&self, device_id: &str) -> Option<Calibration> {
        self.meters
            .get(device_id)
            .map(|m| m.calibration)
            .or_else(|| self.transmitters.get(device_id).map(|t| t.calibration))
            .or_else(|| self.chlorine_sensors.get(device_id).map(|s| s.calibration))
    }
}

fn validate_meter(
    meter: &Meter,
    zones: &HashMap<ZoneId, Zone>,
    lines: &HashMap<LineId, TransmissionLine>,
) -> Result<(), AssociationError> {
    match (meter.is_zone_meter(), meter.is_line_meter()) {
        (false, false) => {
            return Err(AssociationError::Unassigned {
                meter: meter.id.clone(),
            })
        }
        (true, true) => {
            return Err(AssociationError::ZoneAndLine {
                meter: meter.id.clone(),
            })
        }
        _ => {}
    }

    if let (Some(a), Some(b)) = (&meter.input_for, &meter.output_for) {
        if a == b {
            return Err(AssociationError::SameTarget {
                meter: meter.id.clone(),
                target: a.clone(),
            });
        }
    }
    if let (Some(a), Some(b)) = (&meter.line_input, &meter.line_output) {
        if a == b {
            return Err(AssociationError::SameTarget {
                meter: meter.id.clone(),
                target: a.clone(),
            });
        }
    }

    for z in meter.zones() {
        if !zones.contains_key(z) {
            return Err(AssociationError::UnknownZone {
                device: meter.id.clone(),
                zone: z.clone(),
            });
        }
    }
    for l in meter.lines() {
        if !lines.contains_key(l) {
            return Err(AssociationError::UnknownLine {
                meter: meter.id.clone(),
                line: l.clone(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(id: &str) -> Zone {
        Zone {
            id: id.to_string(),
            name: None,
            legitimate_night_use: 0.0,
            n1: 1.0,
            burst_threshold: 0.0,
        }
    }

    fn meter(id: &str) -> Meter {
        Meter {
            id: id.to_string(),
            calibration: Calibration::default(),
            input_for: None,
            output_for: None,
            line_input: None,
            line_output: None,
        }
    }

    #[test]
    fn meters_may_border_two_zones() {
        let mut m = meter("m-2");
        m.input_for = Some("yellow".into());
        m.output_for = Some("red".into());
        let mut m1 = meter("m-1");
        m1.input_for = Some("red".into());

        let net = Network::build(NetworkConfig {
            zones: vec![zone("red"), zone("yellow")],
            meters: vec![m, m1],
            ..NetworkConfig::default()
        })
        .unwrap();

        assert_eq!(net.zone_inputs("red"), ["m-1".to_string()]);
        assert_eq!(net.zone_outputs("red"), ["m-2".to_string()]);
        assert_eq!(net.zone_inputs("yellow"), ["m-2".to_string()]);
        let ids: Vec<_> = net.zone_meters("red").iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["m-1", "m-2"]);
    }

    #[test]
    fn rejects_meter_on_zone_and_line() {
        let mut m = meter("m-1");
        m.input_for = Some("red".into());
        m.line_input = Some("tsm".into());

        let err = Network::build(NetworkConfig {
            zones: vec![zone("red")],
            lines: vec![TransmissionLine {
                id: "tsm".into(),
                volume: 0.0,
            }],
            meters: vec![m],
            ..NetworkConfig::default()
        })
        .unwrap_err();

        assert!(matches!(err, AssociationError::ZoneAndLine { .. }));
    }

    #[test]
    fn rejects_unassigned_and_self_bordering_meters() {
        let err = Network::build(NetworkConfig {
            meters: vec![meter("m-1")],
            ..NetworkConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, AssociationError::Unassigned { .. }));

        let mut m = meter("m-1");
        m.input_for = Some("red".into());
        m.output_for = Some("red".into());
        let err = Network::build(NetworkConfig {
            zones: vec![zone("red")],
            meters: vec![m],
            ..NetworkConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, AssociationError::SameTarget { .. }));
    }

    #[test]
    fn line_needs_both_ends() {
        let mut m = meter("m-11");
        m.line_input = Some("tsm".into());

        let err = Network::build(NetworkConfig {
            lines: vec![TransmissionLine {
                id: "tsm".into(),
                volume: 0.0,
            }],
            meters: vec![m],
            ..NetworkConfig::default()
        })
        .unwrap_err();

        assert_eq!(
            err,
            AssociationError::LineEnds {
                line: "tsm".into(),
                inputs: 1,
                outputs: 0
            }
        );
    }

    #[test]
    fn rejects_unknown_references() {
        let mut m = meter("m-1");
        m.input_for = Some("ghost".into());
        let err = Network::build(NetworkConfig {
            meters: vec![m],
            ..NetworkConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, AssociationError::UnknownZone { .. }));
    }
}
