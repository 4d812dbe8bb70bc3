// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

mod addr;
mod shared;

pub use self::addr::{to_physical, SegmentedAddress};
pub use self::shared::{new_shared, Shared};
