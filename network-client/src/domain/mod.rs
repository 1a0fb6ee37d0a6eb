pub mod alert;
pub mod network;
pub mod pending;
pub mod pulse;
pub mod reading;
pub mod rollup;
pub mod topology;

pub use alert::{Alert, AlertKind, LossRecord};
pub use network::{AssociationError, LineEnds, Network, NetworkConfig};
pub use pending::{PendingKey, PendingKind, PendingRecord};
pub use pulse::{Pulse, PulseKey, SensorKind, SensorReading};
pub use reading::{DeviceKind, RawReading};
pub use rollup::{Resolution, RollupKey, RollupRow, Series};
pub use topology::{
    Calibration, ChlorineSensor, LineId, Meter, MeterId, PressureTransmitter, SensorId, Target,
    TransmissionLine, TransmitterId, Zone, ZoneId, ZonePressureLink,
};
