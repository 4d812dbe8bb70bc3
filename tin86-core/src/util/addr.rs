// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::fmt;

/// Compute the physical address for a real mode segment:offset pair.
pub fn to_physical(segment: u16, offset: u16) -> u32 {
    (u32::from(segment) << 4) + u32::from(offset)
}

/// A segment:offset pair as seen by real mode code.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentedAddress {
    pub segment: u16,
    pub offset: u16,
}

impl SegmentedAddress {
    pub fn new(segment: u16, offset: u16) -> Self {
        SegmentedAddress { segment, offset }
    }

    pub fn to_physical(self) -> u32 {
        to_physical(self.segment, self.offset)
    }
}

impl fmt::Display for SegmentedAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.segment, self.offset)
    }
}
