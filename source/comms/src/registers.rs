//! Holding register table
//!
//! A fixed set of named 16-bit registers. The bus addresses them by position,
//! everything else in the crate addresses them by [`RegisterId`]. Writes are
//! never rejected here: each one is clamped to the register's legal range.
//! Read-only protection is the dispatcher's job.

use embassy_time::Duration;

use crate::{
    baud::BaudRate,
    error::{ErrorKind, ERROR_MASK_CEILING},
};

/// Number of holding registers
pub const REGISTER_COUNT: usize = 8;

/// Identity of each holding register, in address order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[repr(u8)]
pub enum RegisterId {
    /// Our address on the bus, one byte
    DeviceAddress = 0,
    /// Line speed code, see [`BaudRate`]
    BaudRate = 1,
    /// Milliseconds a transmission may take before it counts as timed out
    TransmitTimeout = 2,
    /// How many times a timed out transmission is retried
    TransmitRetries = 3,
    /// Accumulated [`ErrorKind`] bits
    Errors = 4,
    /// Sensor inputs, maintained by the control loop. Read-only on the bus.
    SensorState = 5,
    /// Relay outputs requested over the bus
    ActuatorState = 6,
    /// Milliseconds without bus traffic before the control loop fails safe
    WatchdogTimeout = 7,
}

impl RegisterId {
    /// All registers, in address order
    pub const ALL: [RegisterId; REGISTER_COUNT] = [
        RegisterId::DeviceAddress,
        RegisterId::BaudRate,
        RegisterId::TransmitTimeout,
        RegisterId::TransmitRetries,
        RegisterId::Errors,
        RegisterId::SensorState,
        RegisterId::ActuatorState,
        RegisterId::WatchdogTimeout,
    ];

    /// Position in the table, which is also the bus address
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Look up the register at bus address `addr`
    pub fn from_address(addr: u16) -> Option<Self> {
        Self::ALL.get(usize::from(addr)).copied()
    }

    /// Registers the bus may never write
    #[inline]
    pub const fn is_read_only(self) -> bool {
        matches!(self, RegisterId::SensorState)
    }

    /// Value at startup
    pub const fn default_value(self) -> u16 {
        match self {
            RegisterId::DeviceAddress => 0x0007,
            RegisterId::BaudRate => BaudRate::DEFAULT.code(),
            RegisterId::TransmitTimeout => 1000,
            RegisterId::TransmitRetries => 2,
            RegisterId::Errors => 0,
            RegisterId::SensorState => 0,
            RegisterId::ActuatorState => 0,
            RegisterId::WatchdogTimeout => 1000,
        }
    }

    /// Bring `value` into this register's legal range
    pub fn clamp(self, value: u16) -> u16 {
        match self {
            RegisterId::DeviceAddress => value.min(0x00FF),
            RegisterId::BaudRate => {
                if value < BaudRate::MIN_CODE {
                    BaudRate::DEFAULT.code()
                } else {
                    value.min(BaudRate::MAX_CODE)
                }
            }
            RegisterId::TransmitTimeout => value.clamp(5, 1000),
            RegisterId::TransmitRetries => value.min(5),
            RegisterId::Errors => value.min(ERROR_MASK_CEILING),
            RegisterId::SensorState | RegisterId::ActuatorState | RegisterId::WatchdogTimeout => {
                value
            }
        }
    }
}

/// The holding register database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldingRegisters {
    values: [u16; REGISTER_COUNT],
}

impl HoldingRegisters {
    /// A table holding every register's default
    pub const fn new() -> Self {
        let mut values = [0u16; REGISTER_COUNT];
        let mut i = 0;
        while i < REGISTER_COUNT {
            values[i] = RegisterId::ALL[i].default_value();
            i += 1;
        }
        Self { values }
    }

    /// Current value of `id`
    #[inline]
    pub fn read(&self, id: RegisterId) -> u16 {
        self.values[id.index()]
    }

    /// Store `value` into `id`, clamped. Returns what was stored.
    pub fn write(&mut self, id: RegisterId, value: u16) -> u16 {
        let clamped = id.clamp(value);
        if clamped != value {
            mb_debug!("register {} clamped {} -> {}", id, value, clamped);
        }
        self.values[id.index()] = clamped;
        clamped
    }

    /// Set `kind`'s bit in the error register
    ///
    /// The register saturates at [`ERROR_MASK_CEILING`].
    pub fn record_error(&mut self, kind: ErrorKind) {
        let old = self.read(RegisterId::Errors);
        self.write(RegisterId::Errors, old | kind.bit());
    }

    /// The accumulated error bits
    #[inline]
    pub fn errors(&self) -> u16 {
        self.read(RegisterId::Errors)
    }

    /// Has `kind` been recorded since the register was last cleared?
    pub fn has_error(&self, kind: ErrorKind) -> bool {
        self.errors() & kind.bit() != 0
    }

    /// Our bus address
    #[inline]
    pub fn device_address(&self) -> u8 {
        // Clamped to one byte on every write
        self.read(RegisterId::DeviceAddress) as u8
    }

    /// The transmit timeout as a [`Duration`]
    pub fn transmit_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.read(RegisterId::TransmitTimeout)))
    }

    /// How many retries a timed out transmission gets
    #[inline]
    pub fn transmit_retries(&self) -> u8 {
        self.read(RegisterId::TransmitRetries) as u8
    }

    /// The watchdog timeout as a [`Duration`]
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.read(RegisterId::WatchdogTimeout)))
    }

    /// Every register, in address order
    #[inline]
    pub fn values(&self) -> &[u16; REGISTER_COUNT] {
        &self.values
    }
}

impl Default for HoldingRegisters {
    fn default() -> Self {
        Self::new()
    }
}
