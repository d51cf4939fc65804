//! Environment hints supplied by the caller: network type and data saving.

use serde::{Deserialize, Serialize};

/// Kind of network the device is currently attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NetworkType {
    /// Wi-Fi or other unmetered link
    #[default]
    Wifi,
    /// 2G GPRS
    CellularGprs,
    /// 2.5G EDGE
    CellularEdge,
    /// 3G
    Cellular3g,
    /// 4G LTE
    CellularLte,
}

impl NetworkType {
    /// True for every mobile network
    #[must_use]
    pub fn is_cellular(self) -> bool {
        !matches!(self, NetworkType::Wifi)
    }

    /// True for networks too slow for video
    #[must_use]
    pub fn is_low_bandwidth(self) -> bool {
        matches!(self, NetworkType::CellularGprs | NetworkType::CellularEdge)
    }
}

/// User preference for limiting bandwidth use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DataSavingMode {
    /// Never limit
    #[default]
    Never,
    /// Limit while on a cellular network
    Cellular,
    /// Always limit
    Always,
}

impl DataSavingMode {
    /// Whether data saving is in effect on `network`.
    #[must_use]
    pub fn is_active(self, network: NetworkType) -> bool {
        match self {
            DataSavingMode::Never => false,
            DataSavingMode::Cellular => network.is_cellular(),
            DataSavingMode::Always => true,
        }
    }
}
