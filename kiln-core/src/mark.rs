//! Circular sequence marks for console streaming.
//!
//! Console chunks are tagged with 32-bit marks drawn from the ring
//! `{1..=0xFFFF_FFFE}`. Two values are reserved and never allocated to
//! chunks: `0` means "nothing received yet" and `0xFFFF_FFFF` means "now",
//! used as an open-ended upper bound in retransmission requests. Both
//! sentinels are absorbing under displacement arithmetic so callers can
//! shift marks without guarding for them at every site.

/// A sequence mark on the console streaming ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Mark(u32);

/// Size of the usable ring `{1..=0xFFFF_FFFE}`.
const MODULUS: u64 = 0xFFFF_FFFE;

impl Mark {
    /// The "nothing received yet" sentinel.
    pub const NEVER: Mark = Mark(0);
    /// The "now" sentinel, used as an open-ended range upper bound.
    pub const NOW: Mark = Mark(0xFFFF_FFFF);

    pub const fn new(raw: u32) -> Self {
        Mark(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this mark is one of the two reserved sentinels.
    pub const fn is_sentinel(self) -> bool {
        self.0 == Self::NEVER.0 || self.0 == Self::NOW.0
    }

    /// Whether `self` lies in the modular closed interval `[start, end]`.
    ///
    /// A non-wrapping interval (`start <= end` numerically) contains the
    /// sentinels only when they are its boundaries. A wrapping interval
    /// never contains either sentinel.
    pub fn in_range(self, start: Mark, end: Mark) -> bool {
        if start.0 <= end.0 {
            self.0 >= start.0 && self.0 <= end.0
        } else {
            !self.is_sentinel() && (self.0 >= start.0 || self.0 <= end.0)
        }
    }

    /// Add a signed displacement to this mark with wraparound on the ring.
    ///
    /// The sentinels are fixed points: displacing `NEVER` or `NOW` by any
    /// amount returns the sentinel unchanged. For ring members the
    /// displacement is reduced to a canonical shift in `{1..=MODULUS}` and
    /// applied with the ring's closed addition, so
    /// `m.add_disp(d).add_disp(-d) == m` for every ring member and every
    /// displacement.
    pub fn add_disp(self, d: i64) -> Mark {
        if self.is_sentinel() {
            return self;
        }

        // Encode the displacement as a ring member acting by addition.
        let b = if d >= 0 {
            (d as u64) % MODULUS + 1
        } else {
            let fwd = d.unsigned_abs() % MODULUS + 1;
            if fwd == 1 {
                1
            } else {
                2 + (MODULUS - fwd)
            }
        };

        Mark(((u64::from(self.0) + b - 2) % MODULUS + 1) as u32)
    }

    /// The mark immediately before this one on the ring.
    pub fn pred(self) -> Mark {
        self.add_disp(-1)
    }
}

impl From<u32> for Mark {
    fn from(raw: u32) -> Self {
        Mark(raw)
    }
}

impl std::fmt::Display for Mark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Mark::NEVER => write!(f, "never"),
            Mark::NOW => write!(f, "now"),
            Mark(raw) => write!(f, "{}", raw),
        }
    }
}
