// SPDX-License-Identifier: PMPL-1.0-or-later

//! Outbound rate control.

pub mod rate_limiter;
pub mod throttle;

pub use rate_limiter::{RateLimiter, RateLimiterStats};
pub use throttle::Throttle;
