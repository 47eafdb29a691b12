use std::time::Duration;

/// Read window for bulk exchanges.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read window of one connection polling attempt.
pub const CONNECT_POLL_TIMEOUT: Duration = Duration::from_millis(10);
pub const CONNECT_ATTEMPTS: usize = 30;

/// Baud rate the boot program starts at.
pub const INITIAL_BAUD: u32 = 9600;

/// Byte sent repeatedly until the boot program echoes it.
pub const SYNC_BYTE: u8 = 0x00;
/// Byte sent once synchronized, answered by the family connection ID.
pub const GENERIC_CODE: u8 = 0x55;

pub mod legacy {
    use std::time::Duration;

    pub const ACK: u8 = 0x06;
    pub const CONNECTION_ID: u8 = 0xe6;

    /// Settle time between the bit rate ACK and switching the local baud rate.
    pub const BAUD_SETTLE: Duration = Duration::from_millis(25);
    /// Hardware buffer granularity of the program command.
    pub const WRITE_CHUNK: usize = 16;

    /// Inquiry responses carry `opcode | RESPONSE_FLAG` as tag.
    pub const RESPONSE_FLAG: u8 = 0x10;
    /// Error responses carry `opcode | ERROR_FLAG` followed by an error code.
    pub const ERROR_FLAG: u8 = 0x80;

    pub mod commands {
        pub const DEVICE_SELECT: u8 = 0x10;
        pub const CLOCK_MODE_SELECT: u8 = 0x11;
        pub const DEVICE_INQUIRY: u8 = 0x20;
        pub const CLOCK_MODE_INQUIRY: u8 = 0x21;
        pub const MULTIPLIER_INQUIRY: u8 = 0x22;
        pub const FREQUENCY_INQUIRY: u8 = 0x23;
        pub const BOOT_AREA_INQUIRY: u8 = 0x24;
        pub const USER_AREA_INQUIRY: u8 = 0x25;
        pub const BLOCK_INQUIRY: u8 = 0x26;
        pub const PROGRAM_SIZE_INQUIRY: u8 = 0x27;
        pub const DATA_AREA_INQUIRY: u8 = 0x2a;
        pub const DATA_AREA_INFO_INQUIRY: u8 = 0x2b;
        pub const BIT_RATE: u8 = 0x3f;
        pub const PROGRAM_ERASE: u8 = 0x40;
        pub const USER_AREA_WRITE_SELECT: u8 = 0x43;
        pub const ERASE_SELECT: u8 = 0x48;
        pub const USER_AREA_BLANK_CHECK: u8 = 0x4d;
        pub const BOOT_STATUS_INQUIRY: u8 = 0x4f;
        pub const PROGRAM: u8 = 0x50;
        pub const READ: u8 = 0x52;
        pub const BLOCK_ERASE: u8 = 0x58;
        pub const ID_CODE_CHECK: u8 = 0x60;
    }

    pub mod responses {
        /// P/E transition: ID code protection disabled.
        pub const ID_DISABLED: u8 = 0x26;
        /// P/E transition: ID code protection enabled.
        pub const ID_ENABLED: u8 = 0x16;
        /// Blank check: area is not blank.
        pub const NOT_BLANK: u8 = 0xcd;
        pub const NOT_BLANK_CODE: u8 = 0x52;
    }

    /// Read area selector of the read command.
    pub mod area {
        pub const USER_BOOT: u8 = 0x00;
        pub const USER: u8 = 0x01;
    }
}

pub mod framed {
    use std::time::Duration;

    pub const SOH: u8 = 0x01;
    pub const SOD: u8 = 0x81;
    pub const ETX: u8 = 0x03;

    pub const CONNECTION_ID: u8 = 0xc3;
    pub const STATUS_OK: u8 = 0x00;
    pub const ERROR_FLAG: u8 = 0x80;

    pub const BAUD_SETTLE: Duration = Duration::from_millis(1);
    /// Largest payload the boot program returns in one read data frame.
    pub const MAX_READ_CHUNK: usize = 1024;

    pub mod commands {
        pub const SYNC: u8 = 0x00;
        pub const ERASE: u8 = 0x12;
        pub const WRITE: u8 = 0x13;
        pub const READ: u8 = 0x15;
        pub const ID_AUTH: u8 = 0x30;
        pub const FREQUENCY: u8 = 0x32;
        pub const BIT_RATE: u8 = 0x34;
        pub const ENDIAN: u8 = 0x36;
        pub const DEVICE_TYPE: u8 = 0x38;
        pub const AREA_INFO: u8 = 0x3b;
    }

    pub mod errors {
        pub const PACKET: u8 = 0xc1;
        pub const CHECKSUM: u8 = 0xc2;
        pub const FLOW: u8 = 0xc3;
        pub const ADDRESS: u8 = 0xd0;
        pub const BAUD_MARGIN: u8 = 0xd4;
        pub const PROTECTION: u8 = 0xda;
        pub const ID_MISMATCH: u8 = 0xdb;
        pub const PROGRAMMING_DISABLED: u8 = 0xdc;
        pub const ALREADY_BLANK: u8 = 0xe0;
        pub const ERASE: u8 = 0xe1;
        pub const WRITE: u8 = 0xe2;
        pub const SEQUENCER: u8 = 0xe7;
    }

    /// Endian selector of the endian setting command.
    pub mod endian {
        pub const LITTLE: u8 = 0x01;
        pub const BIG: u8 = 0x00;
    }
}
