//! Provider-facing device slot names and free-slot selection.

use std::collections::BTreeSet;
use std::fmt;

const SLOT_PREFIX: &str = "sd";
/// Prefixes that spell the same slot namespace differently.
const SLOT_ALIASES: [&str; 4] = ["xvd", "sd", "vd", "hd"];

/// Letter occupied by the boot device on every instance.
pub const BOOT_DEVICE_LETTER: char = 'a';
/// Lowest letter considered for new attachments by default.
pub const DEFAULT_LOWEST_LETTER: char = 'c';

/// Canonical three-character slot name (`sd` followed by one letter).
///
/// Raw device names such as `/dev/xvdf`, `sdf1`, or `xvdf` all normalise to
/// the same slot so that cosmetically different spellings are treated as
/// one reservation.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DeviceSlot {
    letter: char,
}

impl DeviceSlot {
    /// Builds a slot from its letter suffix.
    #[must_use]
    pub const fn from_letter(letter: char) -> Option<Self> {
        if letter.is_ascii_lowercase() {
            Some(Self { letter })
        } else {
            None
        }
    }

    /// Builds a slot from a zero-based position (`0` is `sda`).
    #[must_use]
    pub fn from_index(index: u32) -> Option<Self> {
        let code = u32::from(b'a').checked_add(index)?;
        char::from_u32(code).and_then(Self::from_letter)
    }

    /// Normalises a raw device name into its slot.
    ///
    /// Only the last path component is considered, alias prefixes are mapped
    /// to `sd`, and anything after the first letter (such as a partition
    /// number) is dropped. Returns `None` when the name is outside the slot
    /// namespace.
    #[must_use]
    pub fn normalise(raw: &str) -> Option<Self> {
        let name = raw.trim().rsplit('/').next()?;
        let suffix = SLOT_ALIASES
            .iter()
            .find_map(|prefix| name.strip_prefix(prefix))?;
        suffix.chars().next().and_then(Self::from_letter)
    }

    /// Letter suffix of the slot.
    #[must_use]
    pub const fn letter(self) -> char {
        self.letter
    }

    /// Zero-based position of the slot (`sda` is `0`).
    #[must_use]
    pub fn index(self) -> u32 {
        u32::from(self.letter) - u32::from('a')
    }

    /// Device path requested from the provider, for example `/dev/sdf`.
    #[must_use]
    pub fn device_name(self) -> String {
        format!("/dev/{self}")
    }
}

impl fmt::Display for DeviceSlot {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{SLOT_PREFIX}{}", self.letter)
    }
}

/// Range of letters eligible for new attachments.
///
/// The boot device letter is never a candidate. The default lowest letter
/// also skips the slot right after it, which base images commonly use for a
/// secondary root or ephemeral disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SlotPolicy {
    lowest_letter: char,
}

impl SlotPolicy {
    /// Creates a policy whose candidates run from `z` down to
    /// `lowest_letter`. Returns `None` unless the letter lies after the boot
    /// device letter.
    #[must_use]
    pub const fn new(lowest_letter: char) -> Option<Self> {
        if lowest_letter.is_ascii_lowercase() && lowest_letter > BOOT_DEVICE_LETTER {
            Some(Self { lowest_letter })
        } else {
            None
        }
    }

    /// Lowest candidate letter.
    #[must_use]
    pub const fn lowest_letter(self) -> char {
        self.lowest_letter
    }

    /// Candidate slots in reverse lexical order.
    pub fn candidates(self) -> impl Iterator<Item = DeviceSlot> {
        (self.lowest_letter..='z')
            .rev()
            .filter_map(DeviceSlot::from_letter)
    }

    /// Picks the highest candidate not present in `reserved`.
    ///
    /// Scanning from the top biases new volumes away from the low letters
    /// the base image's boot and root devices occupy.
    #[must_use]
    pub fn select(self, reserved: &BTreeSet<DeviceSlot>) -> Option<DeviceSlot> {
        self.candidates().find(|slot| !reserved.contains(slot))
    }
}

impl Default for SlotPolicy {
    fn default() -> Self {
        Self {
            lowest_letter: DEFAULT_LOWEST_LETTER,
        }
    }
}
