// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! External store contracts and the in-process implementation.

pub mod traits;
pub mod ranking;
pub mod memory;
