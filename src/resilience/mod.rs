// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport resilience: backoff policy and supervised subscriptions.

pub mod retry;
pub mod reconnect;
