//! Observation records
//!
//! These structures represent what the driver hands to its sink,
//! independent of any I/O or wire format.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::units::{Quantity, UnitSelection, UnitTag};

/// A named value reported by the console
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    InTemp,
    OutTemp,
    DewPoint,
    WindChill,
    HeatIndex,
    InHumidity,
    OutHumidity,
    AbsolutePressure,
    RelativePressure,
    WindSpeed,
    WindGust,
    WindDir,
    RainRate,
    DailyRain,
    WeeklyRain,
    MonthlyRain,
    YearlyRain,
    /// Rain since the previous observation, derived from [`Field::DailyRain`]
    Rain,
    Radiation,
    /// UV index as shown on the console (live data)
    UvIndex,
    /// UV irradiance in µW/cm² (archive data)
    UvIrradiance,
}

impl Field {
    /// The selectable quantity this field is measured in, if any.
    pub fn quantity(&self) -> Option<Quantity> {
        match self {
            Field::InTemp
            | Field::OutTemp
            | Field::DewPoint
            | Field::WindChill
            | Field::HeatIndex => Some(Quantity::Temperature),
            Field::AbsolutePressure | Field::RelativePressure => Some(Quantity::Pressure),
            Field::WindSpeed | Field::WindGust => Some(Quantity::Speed),
            Field::RainRate
            | Field::DailyRain
            | Field::WeeklyRain
            | Field::MonthlyRain
            | Field::YearlyRain
            | Field::Rain => Some(Quantity::Rain),
            Field::Radiation => Some(Quantity::SolarRadiation),
            Field::InHumidity
            | Field::OutHumidity
            | Field::WindDir
            | Field::UvIndex
            | Field::UvIrradiance => None,
        }
    }

    /// Unit of this field under the given selection.
    ///
    /// Rain rate carries the rain length unit; the console reports it per hour.
    pub fn unit(&self, units: &UnitSelection) -> UnitTag {
        match self.quantity() {
            Some(quantity) => units.unit(quantity),
            None => match self {
                Field::InHumidity | Field::OutHumidity => UnitTag::Percent,
                Field::WindDir => UnitTag::DegreeCompass,
                Field::UvIndex => UnitTag::UvIndex,
                _ => UnitTag::MicrowattPerSquareCentimeter,
            },
        }
    }
}

/// Values as decoded from the wire, not yet tagged.
///
/// Fields the console marked as "no reading" are absent.
pub type RawValues = BTreeMap<Field, f64>;

/// A value and the unit it is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaggedValue {
    pub value: f64,
    pub unit: UnitTag,
}

pub type Observations = BTreeMap<Field, TaggedValue>;

/// Attach units to every raw value.
pub fn tag_values(raw: &RawValues, units: &UnitSelection) -> Observations {
    raw.iter()
        .map(|(field, value)| {
            (
                *field,
                TaggedValue {
                    value: *value,
                    unit: field.unit(units),
                },
            )
        })
        .collect()
}

/// A historical measurement set logged by the console
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub timestamp: DateTime<Utc>,
    pub values: Observations,
}

impl ArchiveRecord {
    pub fn new(timestamp: DateTime<Utc>, values: Observations) -> Self {
        ArchiveRecord { timestamp, values }
    }
}

/// A current-conditions measurement set.
///
/// The console doesn't timestamp live data, so `timestamp` is the client's
/// clock at acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveReading {
    pub timestamp: DateTime<Utc>,
    pub values: Observations,
}
