//! RX device families and their boot mode differences.
use std::fmt;
use std::str::FromStr;

use crate::constants::{framed, legacy};
use crate::error::Error;

/// Family a device name belongs to. Selected before connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Rx220,
    Rx23x,
    Rx24t,
    Rx26t,
    Rx62x,
    Rx63x,
    Rx64m,
    Rx65x,
    Rx66t,
}

/// Device name prefixes, longest match wins.
const NAME_TABLE: &[(&str, Family)] = &[
    ("RX220", Family::Rx220),
    ("RX230", Family::Rx23x),
    ("RX231", Family::Rx23x),
    ("RX23T", Family::Rx23x),
    ("RX23W", Family::Rx23x),
    ("RX24T", Family::Rx24t),
    ("RX24U", Family::Rx24t),
    ("RX26T", Family::Rx26t),
    ("RX621", Family::Rx62x),
    ("RX62N", Family::Rx62x),
    ("RX62T", Family::Rx62x),
    ("RX62G", Family::Rx62x),
    ("RX631", Family::Rx63x),
    ("RX63N", Family::Rx63x),
    ("RX63T", Family::Rx63x),
    ("RX64M", Family::Rx64m),
    ("RX71M", Family::Rx64m),
    ("RX651", Family::Rx65x),
    ("RX65N", Family::Rx65x),
    ("RX66T", Family::Rx66t),
    ("RX72T", Family::Rx66t),
    ("RX66N", Family::Rx66t),
    ("RX72N", Family::Rx66t),
    ("RX72M", Family::Rx66t),
];

impl Family {
    pub const ALL: [Family; 9] = [
        Family::Rx220,
        Family::Rx23x,
        Family::Rx24t,
        Family::Rx26t,
        Family::Rx62x,
        Family::Rx63x,
        Family::Rx64m,
        Family::Rx65x,
        Family::Rx66t,
    ];

    /// Map a device name (`RX63T`, `rx72t`, `RX231-xxx`) to its family.
    pub fn from_device_name(name: &str) -> Option<Family> {
        let name = name.trim().to_ascii_uppercase();
        NAME_TABLE
            .iter()
            .filter(|(prefix, _)| name.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|&(_, family)| family)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Family::Rx220 => "RX220",
            Family::Rx23x => "RX23x",
            Family::Rx24t => "RX24T",
            Family::Rx26t => "RX26T",
            Family::Rx62x => "RX62x",
            Family::Rx63x => "RX63x",
            Family::Rx64m => "RX64M",
            Family::Rx65x => "RX65x",
            Family::Rx66t => "RX66T/RX72T",
        }
    }

    pub fn profile(&self) -> Profile {
        match self {
            Family::Rx220 => Profile::Legacy(&RX220),
            Family::Rx23x => Profile::Legacy(&RX23X),
            Family::Rx24t => Profile::Legacy(&RX24T),
            Family::Rx62x => Profile::Legacy(&RX62X),
            Family::Rx63x => Profile::Legacy(&RX63X),
            Family::Rx64m => Profile::Legacy(&RX64M),
            Family::Rx65x => Profile::Legacy(&RX65X),
            Family::Rx26t => Profile::Framed(&RX26T),
            Family::Rx66t => Profile::Framed(&RX66T),
        }
    }

    pub fn page_size(&self) -> u32 {
        match self.profile() {
            Profile::Legacy(p) => p.page_size,
            Profile::Framed(p) => p.page_size,
        }
    }

    pub fn max_baud(&self) -> u32 {
        match self.profile() {
            Profile::Legacy(p) => p.max_baud,
            Profile::Framed(p) => p.max_baud,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Family {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Family::from_device_name(s).ok_or_else(|| Error::UnsupportedDevice(s.to_string()))
    }
}

/// Wire grammar plus the family constants it needs.
#[derive(Debug, Clone, Copy)]
pub enum Profile {
    Legacy(&'static LegacyProfile),
    Framed(&'static FramedProfile),
}

/// How the block erase command addresses an erase unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseAddressing {
    /// One byte index into the erase block table.
    BlockNumber,
    /// Four byte base address of the unit.
    Address,
}

/// Layout of the erase block inquiry response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFormat {
    /// `{start, end}` per block.
    Ranges,
    /// `{start, end, block_size, block_count}` per area.
    Geometry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyProfile {
    pub connection_id: u8,
    pub page_size: u32,
    pub max_baud: u32,
    pub erase: EraseAddressing,
    pub blocks: BlockFormat,
    /// Family has a data flash area to inquire.
    pub data_area: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramedProfile {
    pub connection_id: u8,
    pub page_size: u32,
    pub max_baud: u32,
    /// Number of flash areas reported by the area information inquiry.
    pub areas: u8,
    pub endian: u8,
}

static RX220: LegacyProfile = LegacyProfile {
    connection_id: legacy::CONNECTION_ID,
    page_size: 128,
    max_baud: 115_200,
    erase: EraseAddressing::Address,
    blocks: BlockFormat::Ranges,
    data_area: false,
};

static RX23X: LegacyProfile = LegacyProfile {
    connection_id: legacy::CONNECTION_ID,
    page_size: 256,
    max_baud: 115_200,
    erase: EraseAddressing::Address,
    blocks: BlockFormat::Ranges,
    data_area: true,
};

static RX24T: LegacyProfile = LegacyProfile {
    connection_id: legacy::CONNECTION_ID,
    page_size: 256,
    max_baud: 115_200,
    erase: EraseAddressing::Address,
    blocks: BlockFormat::Ranges,
    data_area: true,
};

static RX62X: LegacyProfile = LegacyProfile {
    connection_id: legacy::CONNECTION_ID,
    page_size: 256,
    max_baud: 115_200,
    erase: EraseAddressing::BlockNumber,
    blocks: BlockFormat::Ranges,
    data_area: false,
};

static RX63X: LegacyProfile = LegacyProfile {
    connection_id: legacy::CONNECTION_ID,
    page_size: 256,
    max_baud: 230_400,
    erase: EraseAddressing::Address,
    blocks: BlockFormat::Ranges,
    data_area: true,
};

static RX64M: LegacyProfile = LegacyProfile {
    connection_id: legacy::CONNECTION_ID,
    page_size: 256,
    max_baud: 230_400,
    erase: EraseAddressing::Address,
    blocks: BlockFormat::Geometry,
    data_area: true,
};

static RX65X: LegacyProfile = LegacyProfile {
    connection_id: legacy::CONNECTION_ID,
    page_size: 256,
    max_baud: 230_400,
    erase: EraseAddressing::Address,
    blocks: BlockFormat::Geometry,
    data_area: true,
};

static RX26T: FramedProfile = FramedProfile {
    connection_id: framed::CONNECTION_ID,
    page_size: 256,
    max_baud: 1_000_000,
    areas: 2,
    endian: framed::endian::LITTLE,
};

static RX66T: FramedProfile = FramedProfile {
    connection_id: framed::CONNECTION_ID,
    page_size: 256,
    max_baud: 1_500_000,
    areas: 2,
    endian: framed::endian::LITTLE,
};
