use core::fmt;

/// Low byte of an operand, stored next to the opcode byte in a code unit.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct OpArgByte(u8);

impl OpArgByte {
    pub const NULL: Self = Self::new(0);

    #[must_use]
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl From<u8> for OpArgByte {
    fn from(raw: u8) -> Self {
        Self::new(raw)
    }
}

impl From<OpArgByte> for u8 {
    fn from(value: OpArgByte) -> Self {
        value.0
    }
}

impl fmt::Debug for OpArgByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Full 32-bit operand, including the bytes supplied by `EXTENDED_ARG` prefixes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct OpArg(u32);

impl OpArg {
    pub const NULL: Self = Self::new(0);

    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Number of code units an instruction carrying this operand occupies,
    /// counting its `EXTENDED_ARG` prefixes.
    #[inline]
    #[must_use]
    pub const fn instr_size(self) -> usize {
        (self.0 > 0xff) as usize + (self.0 > 0xff_ff) as usize + (self.0 > 0xff_ff_ff) as usize + 1
    }

    /// Splits the operand into its prefix bytes (most significant first) and
    /// the byte that goes next to the real opcode.
    #[inline]
    pub fn split(self) -> (impl ExactSizeIterator<Item = OpArgByte>, OpArgByte) {
        let bytes = self.0.to_le_bytes();
        let size = self.instr_size();
        let prefixes = (1..size).rev().map(move |i| OpArgByte(bytes[i]));
        (prefixes, OpArgByte(bytes[0]))
    }
}

impl From<u32> for OpArg {
    fn from(raw: u32) -> Self {
        Self::new(raw)
    }
}

impl From<OpArg> for u32 {
    fn from(value: OpArg) -> Self {
        value.0
    }
}

impl fmt::Display for OpArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Accumulates operand bytes across a run of `EXTENDED_ARG` prefixes.
#[derive(Default, Copy, Clone, Debug)]
pub struct OpArgState {
    state: u32,
}

impl OpArgState {
    /// Feeds one code unit; returns the complete operand once `is_prefix` is false.
    #[inline]
    pub fn step(&mut self, arg: OpArgByte, is_prefix: bool) -> Option<OpArg> {
        self.state = (self.state << 8) | u32::from(arg.0);
        if is_prefix {
            None
        } else {
            let full = OpArg(self.state);
            self.state = 0;
            Some(full)
        }
    }
}
