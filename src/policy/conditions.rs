//! Policy condition checks.
//!
//! Each check covers one axis; a missing key constrains nothing. Malformed
//! condition data (unparseable zone, hour, or CIDR) fails the check: a
//! policy that cannot be evaluated must not match.

use std::net::IpAddr;

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;

use crate::types::{Agent, HoursWindow, PolicyConditions, RequestContext};

/// Do all declared conditions other than the daily quota hold?
///
/// The quota is consulted separately by the engine because it needs the
/// rate limiter; everything here is pure.
pub(crate) fn static_conditions_hold(
    conditions: &PolicyConditions,
    agent: &Agent,
    ctx: &RequestContext,
    now: DateTime<Utc>,
) -> bool {
    if let Some(required) = &conditions.required_roles {
        if !required.is_subset(&agent.roles) {
            return false;
        }
    }

    if let Some(any) = &conditions.any_roles {
        if any.intersection(&agent.roles).next().is_none() {
            return false;
        }
    }

    if let Some(window) = &conditions.allowed_hours {
        if !within_hours(window, now) {
            return false;
        }
    }

    if let Some(days) = &conditions.allowed_days {
        if !on_allowed_day(conditions, days, now) {
            return false;
        }
    }

    if let Some(cidrs) = &conditions.ip_cidrs {
        match ctx.remote_ip {
            Some(ip) => {
                if !cidrs.iter().any(|cidr| cidr_contains(cidr, ip)) {
                    return false;
                }
            }
            // An IP constraint with no caller IP cannot be satisfied.
            None => return false,
        }
    }

    true
}

/// Is `now` inside the window, evaluated in the window's declared zone at
/// minute granularity? Inclusive of `start`, exclusive of `end`; when
/// `end <= start` the window wraps past midnight.
///
/// Converting an instant into a zone is total, so spring-forward wall
/// times that do not exist are naturally never "now" (the gap denies), and
/// fall-back wall times that occur twice are inside the window on both
/// passes (the overlap allows).
fn within_hours(window: &HoursWindow, now: DateTime<Utc>) -> bool {
    let tz: Tz = match window.tz.parse() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!(tz = %window.tz, "unparseable policy time zone");
            return false;
        }
    };
    let (Some(start), Some(end)) = (parse_minute(&window.start), parse_minute(&window.end)) else {
        tracing::warn!(start = %window.start, end = %window.end, "unparseable policy hours");
        return false;
    };

    let local = now.with_timezone(&tz);
    let minute = local.hour() * 60 + local.minute();

    if start < end {
        (start..end).contains(&minute)
    } else {
        // Wrapping window, e.g. 22:00–06:00.
        minute >= start || minute < end
    }
}

/// Is `now` on an allowed weekday (0 = Monday), evaluated in the policy's
/// zone when one is declared and in UTC otherwise?
fn on_allowed_day(conditions: &PolicyConditions, days: &[u8], now: DateTime<Utc>) -> bool {
    let weekday = match conditions
        .allowed_hours
        .as_ref()
        .and_then(|w| w.tz.parse::<Tz>().ok())
    {
        Some(tz) => now.with_timezone(&tz).weekday(),
        None => now.weekday(),
    };
    let day = weekday.num_days_from_monday();
    days.iter().any(|&allowed| u32::from(allowed) == day)
}

/// "HH:MM" to minute-of-day.
fn parse_minute(raw: &str) -> Option<u32> {
    let (hours, minutes) = raw.split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// Does the CIDR block contain `ip`? Mixed address families never match;
/// an unparseable block never matches.
pub(crate) fn cidr_contains(cidr: &str, ip: IpAddr) -> bool {
    let Some((network, prefix)) = parse_cidr(cidr) else {
        tracing::warn!(cidr, "unparseable policy CIDR block");
        return false;
    };

    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            if prefix > 32 {
                return false;
            }
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            (u32::from(net) & mask) == (u32::from(addr) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            if prefix > 128 {
                return false;
            }
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix)
            };
            (u128::from(net) & mask) == (u128::from(addr) & mask)
        }
        _ => false,
    }
}

fn parse_cidr(raw: &str) -> Option<(IpAddr, u8)> {
    match raw.split_once('/') {
        Some((addr, prefix)) => {
            let addr: IpAddr = addr.parse().ok()?;
            let prefix: u8 = prefix.parse().ok()?;
            Some((addr, prefix))
        }
        // A bare address is an exact-match block.
        None => {
            let addr: IpAddr = raw.parse().ok()?;
            let prefix = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            Some((addr, prefix))
        }
    }
}
