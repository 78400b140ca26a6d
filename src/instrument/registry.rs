//! Model-name lookup and driver construction.
//!
//! The bench knows a fixed set of instrument families. [`DeviceFamily::resolve`] matches a
//! human-readable model name (as written in the device table) against that set, and
//! [`build_driver`] builds the matching driver variant from a descriptor.

use super::{
    AddressableDriver, BinaryDriver, DeviceDescriptor, DeviceDriver, DirectDriver, Framing,
};
use crate::error::AppResult;
use crate::hardware::ConnectionRegistry;
use serde::Serialize;

/// Known instrument families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceFamily {
    /// TDK-Lambda Zup, several units multiplexed on one port by address
    ZupSupply,
    /// TDK-Lambda Genesys on its own port
    GenesysSupply,
    /// Agilent N3300 electronic load on its own port
    N3300Supply,
    /// Device under test speaking single-byte commands
    BinaryTester,
}

/// Driver variant a family is served by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverKind {
    /// Shared port with address selection
    Addressable,
    /// Exclusive port, text protocol
    Direct,
    /// Exclusive port, byte protocol
    Binary,
}

/// Lower-case name fragments, checked in order.
const MODEL_TABLE: &[(&str, DeviceFamily)] = &[
    ("tdk-lambda zup", DeviceFamily::ZupSupply),
    ("agilent n3300", DeviceFamily::N3300Supply),
    ("tdk-lambda genesys", DeviceFamily::GenesysSupply),
    ("device", DeviceFamily::BinaryTester),
    ("test", DeviceFamily::BinaryTester),
];

impl DeviceFamily {
    /// Case-insensitive substring match of `model` against the known families.
    ///
    /// Returns `None` for unrecognised models; callers decide how to report that.
    pub fn resolve(model: &str) -> Option<Self> {
        let model = model.to_lowercase();
        MODEL_TABLE
            .iter()
            .find(|(fragment, _)| model.contains(fragment))
            .map(|(_, family)| *family)
    }

    /// Driver variant for this family.
    pub fn kind(self) -> DriverKind {
        match self {
            DeviceFamily::ZupSupply => DriverKind::Addressable,
            DeviceFamily::GenesysSupply | DeviceFamily::N3300Supply => DriverKind::Direct,
            DeviceFamily::BinaryTester => DriverKind::Binary,
        }
    }

    /// Wire framing tokens. The binary family has no text framing; its tokens are empty.
    pub fn framing(self) -> Framing {
        match self {
            DeviceFamily::ZupSupply => Framing::new(":", "", ";"),
            DeviceFamily::GenesysSupply | DeviceFamily::N3300Supply => Framing::new("", " ", ""),
            DeviceFamily::BinaryTester => Framing::new("", "", ""),
        }
    }

    /// Display name.
    pub fn name(self) -> &'static str {
        match self {
            DeviceFamily::ZupSupply => "TDK-Lambda Zup",
            DeviceFamily::GenesysSupply => "TDK-Lambda Genesys",
            DeviceFamily::N3300Supply => "Agilent N3300",
            DeviceFamily::BinaryTester => "Binary test device",
        }
    }
}

/// Build the driver variant for `descriptor.family`.
///
/// # Errors
/// Whatever the variant's `connect` returns, most importantly
/// [`BenchError::PortUnavailable`](crate::error::BenchError::PortUnavailable).
pub async fn build_driver(
    descriptor: DeviceDescriptor,
    registry: &ConnectionRegistry,
) -> AppResult<Box<dyn DeviceDriver>> {
    tracing::debug!(
        device = %descriptor.label,
        family = descriptor.family.name(),
        port = %descriptor.port.name,
        "Building driver"
    );
    let driver: Box<dyn DeviceDriver> = match descriptor.family.kind() {
        DriverKind::Addressable => Box::new(AddressableDriver::connect(descriptor, registry).await?),
        DriverKind::Direct => Box::new(DirectDriver::connect(descriptor, registry).await?),
        DriverKind::Binary => Box::new(BinaryDriver::connect(descriptor, registry).await?),
    };
    Ok(driver)
}
