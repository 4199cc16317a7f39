//! Unit table: console selector codes to unit tags.
//!
//! The console reports values in whatever units were chosen on its set-up
//! screen. The SETUP frame carries one selector code per quantity; this module
//! maps those codes to [`UnitTag`]s. It never converts values.

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// A measured quantity whose unit is selectable on the console
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Temperature,
    Pressure,
    Speed,
    Rain,
    SolarRadiation,
}

impl Quantity {
    pub const ALL: [Quantity; 5] = [
        Quantity::Temperature,
        Quantity::Pressure,
        Quantity::Speed,
        Quantity::Rain,
        Quantity::SolarRadiation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Quantity::Temperature => "temperature",
            Quantity::Pressure => "pressure",
            Quantity::Speed => "speed",
            Quantity::Rain => "rain",
            Quantity::SolarRadiation => "solar_radiation",
        }
    }

    /// Unit used when the console reports a code we don't know.
    ///
    /// These match the console's factory settings (selector code 0).
    pub fn default_unit(&self) -> UnitTag {
        match self {
            Quantity::Temperature => UnitTag::Celsius,
            Quantity::Pressure => UnitTag::Hectopascal,
            Quantity::Speed => UnitTag::MeterPerSecond,
            Quantity::Rain => UnitTag::Millimeter,
            Quantity::SolarRadiation => UnitTag::Lux,
        }
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Quantity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Semantic unit attached to a value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitTag {
    #[serde(rename = "degree_C")]
    Celsius,
    #[serde(rename = "degree_F")]
    Fahrenheit,
    #[serde(rename = "hPa")]
    Hectopascal,
    #[serde(rename = "inHg")]
    InchMercury,
    #[serde(rename = "mmHg")]
    MillimeterMercury,
    #[serde(rename = "meter_per_second")]
    MeterPerSecond,
    #[serde(rename = "km_per_hour")]
    KilometerPerHour,
    #[serde(rename = "knot")]
    Knot,
    #[serde(rename = "mile_per_hour")]
    MilePerHour,
    #[serde(rename = "beaufort")]
    Beaufort,
    #[serde(rename = "foot_per_second")]
    FootPerSecond,
    #[serde(rename = "mm")]
    Millimeter,
    #[serde(rename = "inch")]
    Inch,
    #[serde(rename = "lux")]
    Lux,
    #[serde(rename = "foot_candle")]
    FootCandle,
    #[serde(rename = "watt_per_meter_squared")]
    WattPerSquareMeter,
    #[serde(rename = "percent")]
    Percent,
    #[serde(rename = "degree_compass")]
    DegreeCompass,
    #[serde(rename = "uv_index")]
    UvIndex,
    #[serde(rename = "microwatt_per_cm_squared")]
    MicrowattPerSquareCentimeter,
}

impl UnitTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitTag::Celsius => "degree_C",
            UnitTag::Fahrenheit => "degree_F",
            UnitTag::Hectopascal => "hPa",
            UnitTag::InchMercury => "inHg",
            UnitTag::MillimeterMercury => "mmHg",
            UnitTag::MeterPerSecond => "meter_per_second",
            UnitTag::KilometerPerHour => "km_per_hour",
            UnitTag::Knot => "knot",
            UnitTag::MilePerHour => "mile_per_hour",
            UnitTag::Beaufort => "beaufort",
            UnitTag::FootPerSecond => "foot_per_second",
            UnitTag::Millimeter => "mm",
            UnitTag::Inch => "inch",
            UnitTag::Lux => "lux",
            UnitTag::FootCandle => "foot_candle",
            UnitTag::WattPerSquareMeter => "watt_per_meter_squared",
            UnitTag::Percent => "percent",
            UnitTag::DegreeCompass => "degree_compass",
            UnitTag::UvIndex => "uv_index",
            UnitTag::MicrowattPerSquareCentimeter => "microwatt_per_cm_squared",
        }
    }
}

impl std::fmt::Display for UnitTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The console reported a selector code outside the documented range
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Unknown {quantity} unit selector {code}")]
pub struct UnknownSelector {
    pub quantity: Quantity,
    pub code: i8,
}

/// Map a console selector code to a unit tag.
pub fn resolve(quantity: Quantity, code: i8) -> Result<UnitTag, UnknownSelector> {
    let tag = match (quantity, code) {
        (Quantity::Temperature, 0) => UnitTag::Celsius,
        (Quantity::Temperature, 1) => UnitTag::Fahrenheit,

        (Quantity::Pressure, 0) => UnitTag::Hectopascal,
        (Quantity::Pressure, 1) => UnitTag::InchMercury,
        (Quantity::Pressure, 2) => UnitTag::MillimeterMercury,

        (Quantity::Speed, 0) => UnitTag::MeterPerSecond,
        (Quantity::Speed, 1) => UnitTag::KilometerPerHour,
        (Quantity::Speed, 2) => UnitTag::Knot,
        (Quantity::Speed, 3) => UnitTag::MilePerHour,
        (Quantity::Speed, 4) => UnitTag::Beaufort,
        (Quantity::Speed, 5) => UnitTag::FootPerSecond,

        (Quantity::Rain, 0) => UnitTag::Millimeter,
        (Quantity::Rain, 1) => UnitTag::Inch,

        (Quantity::SolarRadiation, 0) => UnitTag::Lux,
        (Quantity::SolarRadiation, 1) => UnitTag::FootCandle,
        (Quantity::SolarRadiation, 2) => UnitTag::WattPerSquareMeter,

        _ => return Err(UnknownSelector { quantity, code }),
    };
    Ok(tag)
}

/// Raw selector codes as reported in the SETUP frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnitCodes {
    pub temperature: i8,
    pub pressure: i8,
    pub speed: i8,
    pub rain: i8,
    pub solar_radiation: i8,
}

impl UnitCodes {
    pub fn code(&self, quantity: Quantity) -> i8 {
        match quantity {
            Quantity::Temperature => self.temperature,
            Quantity::Pressure => self.pressure,
            Quantity::Speed => self.speed,
            Quantity::Rain => self.rain,
            Quantity::SolarRadiation => self.solar_radiation,
        }
    }
}

/// The unit in force for every selectable quantity.
///
/// A selection belongs to one station session; it is fetched after each
/// connection and dropped with the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSelection {
    pub temperature: UnitTag,
    pub pressure: UnitTag,
    pub speed: UnitTag,
    pub rain: UnitTag,
    pub solar_radiation: UnitTag,
}

impl Default for UnitSelection {
    fn default() -> Self {
        UnitSelection {
            temperature: Quantity::Temperature.default_unit(),
            pressure: Quantity::Pressure.default_unit(),
            speed: Quantity::Speed.default_unit(),
            rain: Quantity::Rain.default_unit(),
            solar_radiation: Quantity::SolarRadiation.default_unit(),
        }
    }
}

impl UnitSelection {
    /// Units of archive records, which the console always stores in metric
    /// with radiation in lux, whatever the set-up screen says.
    pub const ARCHIVE: UnitSelection = UnitSelection {
        temperature: UnitTag::Celsius,
        pressure: UnitTag::Hectopascal,
        speed: UnitTag::MeterPerSecond,
        rain: UnitTag::Millimeter,
        solar_radiation: UnitTag::Lux,
    };

    /// Resolve every code, falling back to the quantity's default for codes
    /// that are not documented. The unknown ones are returned so the caller
    /// can log them.
    pub fn from_codes(codes: &UnitCodes) -> (UnitSelection, Vec<UnknownSelector>) {
        let mut selection = UnitSelection::default();
        let mut unknown = Vec::new();
        for quantity in Quantity::ALL {
            let tag = match resolve(quantity, codes.code(quantity)) {
                Ok(tag) => tag,
                Err(e) => {
                    unknown.push(e);
                    quantity.default_unit()
                }
            };
            selection.set(quantity, tag);
        }
        (selection, unknown)
    }

    pub fn unit(&self, quantity: Quantity) -> UnitTag {
        match quantity {
            Quantity::Temperature => self.temperature,
            Quantity::Pressure => self.pressure,
            Quantity::Speed => self.speed,
            Quantity::Rain => self.rain,
            Quantity::SolarRadiation => self.solar_radiation,
        }
    }

    fn set(&mut self, quantity: Quantity, tag: UnitTag) {
        match quantity {
            Quantity::Temperature => self.temperature = tag,
            Quantity::Pressure => self.pressure = tag,
            Quantity::Speed => self.speed = tag,
            Quantity::Rain => self.rain = tag,
            Quantity::SolarRadiation => self.solar_radiation = tag,
        }
    }
}

impl std::fmt::Display for UnitSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "temperature={} pressure={} speed={} rain={} solar_radiation={}",
            self.temperature, self.pressure, self.speed, self.rain, self.solar_radiation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_codes() {
        let table = [
            (Quantity::Temperature, 0, UnitTag::Celsius),
            (Quantity::Temperature, 1, UnitTag::Fahrenheit),
            (Quantity::Pressure, 0, UnitTag::Hectopascal),
            (Quantity::Pressure, 1, UnitTag::InchMercury),
            (Quantity::Pressure, 2, UnitTag::MillimeterMercury),
            (Quantity::Speed, 0, UnitTag::MeterPerSecond),
            (Quantity::Speed, 1, UnitTag::KilometerPerHour),
            (Quantity::Speed, 2, UnitTag::Knot),
            (Quantity::Speed, 3, UnitTag::MilePerHour),
            (Quantity::Speed, 4, UnitTag::Beaufort),
            (Quantity::Speed, 5, UnitTag::FootPerSecond),
            (Quantity::Rain, 0, UnitTag::Millimeter),
            (Quantity::Rain, 1, UnitTag::Inch),
            (Quantity::SolarRadiation, 0, UnitTag::Lux),
            (Quantity::SolarRadiation, 1, UnitTag::FootCandle),
            (Quantity::SolarRadiation, 2, UnitTag::WattPerSquareMeter),
        ];
        for (quantity, code, expected) in table {
            assert_eq!(resolve(quantity, code), Ok(expected), "{quantity} code {code}");
        }
    }

    #[test]
    fn test_undocumented_codes_fail() {
        let out_of_range = [
            (Quantity::Temperature, 2),
            (Quantity::Pressure, 3),
            (Quantity::Speed, 6),
            (Quantity::Rain, 2),
            (Quantity::SolarRadiation, 3),
        ];
        for (quantity, code) in out_of_range {
            assert_eq!(
                resolve(quantity, code),
                Err(UnknownSelector { quantity, code })
            );
        }
        for quantity in Quantity::ALL {
            assert!(resolve(quantity, -1).is_err());
            assert!(resolve(quantity, i8::MAX).is_err());
        }
    }

    #[test]
    fn test_from_codes_falls_back_to_default() {
        let codes = UnitCodes {
            temperature: 1,
            pressure: 9,
            speed: 3,
            rain: 1,
            solar_radiation: 2,
        };
        let (selection, unknown) = UnitSelection::from_codes(&codes);
        assert_eq!(selection.temperature, UnitTag::Fahrenheit);
        assert_eq!(selection.pressure, UnitTag::Hectopascal);
        assert_eq!(selection.speed, UnitTag::MilePerHour);
        assert_eq!(selection.rain, UnitTag::Inch);
        assert_eq!(selection.solar_radiation, UnitTag::WattPerSquareMeter);
        assert_eq!(
            unknown,
            vec![UnknownSelector {
                quantity: Quantity::Pressure,
                code: 9
            }]
        );
    }

    #[test]
    fn test_every_quantity_has_one_unit() {
        let (selection, unknown) = UnitSelection::from_codes(&UnitCodes::default());
        assert!(unknown.is_empty());
        for quantity in Quantity::ALL {
            assert_eq!(selection.unit(quantity), quantity.default_unit());
        }
    }

    #[test]
    fn test_unit_tag_serializes_as_name() {
        for tag in [UnitTag::Celsius, UnitTag::Knot, UnitTag::WattPerSquareMeter] {
            let json = serde_json::to_string(&tag).unwrap();
            assert_eq!(json, format!("\"{}\"", tag.as_str()));
        }
    }
}
