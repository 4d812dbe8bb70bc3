// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::sync::{Arc, Mutex};

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
