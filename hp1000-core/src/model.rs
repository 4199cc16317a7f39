//! Station model definitions

use serde::{Deserialize, Serialize, Serializer};

/// Supported console families.
///
/// The HP1000, WS1001 and XC0422 are rebadges of the same console and all
/// speak the "easyweather" LAN protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum StationModel {
    #[default]
    #[serde(rename = "HP1000", alias = "hp1000", alias = "WS1001", alias = "ws1001", alias = "XC0422", alias = "xc0422")]
    Hp1000,
}

impl StationModel {
    /// Get the model name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            StationModel::Hp1000 => "HP1000",
        }
    }
}

impl std::fmt::Display for StationModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for StationModel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl TryFrom<&str> for StationModel {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_ascii_lowercase().as_str() {
            "hp1000" | "ws1001" | "xc0422" => Ok(StationModel::Hp1000),
            _ => Err(format!("Unknown station model: {}", s)),
        }
    }
}

impl std::str::FromStr for StationModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StationModel::try_from(s)
    }
}
