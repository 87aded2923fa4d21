use std::fmt::{Display, Formatter};

/// Server-assigned identifier of a client association. `ConnId::NONE` is what a client uses
///  before its connection is established (and what `Connect` messages carry).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ConnId(u32);

impl Display for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl ConnId {
    pub const NONE: ConnId = ConnId(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> ConnId {
        ConnId(self.0.wrapping_add(1))
    }
}


#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SeqNum(u32);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    /// Sequence number of `Connect` and of heartbeats; data starts at `FIRST`
    pub const ZERO: SeqNum = SeqNum(0);
    pub const FIRST: SeqNum = SeqNum(1);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SeqNum {
        SeqNum(self.0.wrapping_add(1))
    }

    /// NB: saturates at zero, which is never a data sequence number
    pub fn prev(&self) -> SeqNum {
        SeqNum(self.0.saturating_sub(1))
    }

    pub fn plus(&self, n: usize) -> SeqNum {
        let n: u32 = n.try_into().unwrap_or(u32::MAX);
        SeqNum(self.0.saturating_add(n))
    }
}


/// Number of epoch timer ticks since the timer was started
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Epoch(u64);

impl Display for Epoch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "E{}", self.0)
    }
}

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Epoch {
        Epoch(self.0 + 1)
    }

    /// number of epochs that passed between `earlier` and `self`, zero if `earlier` is later
    pub fn since(&self, earlier: Epoch) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}
