//! Go-style duration strings ("300ms", "1.5s", "2m", "1h30m")

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1},
    combinator::{all_consuming, map, map_res, opt, recognize},
    multi::many1,
    sequence::{pair, preceded},
    IResult,
};
use std::time::Duration;

use crate::{Error, Result};

/// Parse a decimal number with optional fraction
fn number(input: &str) -> IResult<&str, f64> {
    map_res(
        recognize(pair(digit1, opt(preceded(char('.'), digit1)))),
        |s: &str| s.parse::<f64>(),
    )(input)
}

/// Parse a unit suffix into its length in nanoseconds
fn unit(input: &str) -> IResult<&str, f64> {
    alt((
        map(tag("ns"), |_| 1.0),
        map(tag("us"), |_| 1e3),
        map(tag("µs"), |_| 1e3),
        map(tag("μs"), |_| 1e3),
        map(tag("ms"), |_| 1e6),
        map(tag("s"), |_| 1e9),
        map(tag("m"), |_| 60e9),
        map(tag("h"), |_| 3600e9),
    ))(input)
}

fn components(input: &str) -> IResult<&str, Vec<f64>> {
    all_consuming(many1(map(pair(number, unit), |(n, u)| n * u)))(input)
}

pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let (_, parts) =
        components(s).map_err(|_| Error::InvalidDuration(format!("invalid duration {:?}", input)))?;

    let nanos: f64 = parts.iter().sum();
    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return Err(Error::InvalidDuration(format!("duration {:?} out of range", input)));
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}

/// Render a duration the way it was most likely written ("4s", "1m30s", "250ms")
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    if d < Duration::from_secs(1) {
        return format!("{}ms", d.as_millis());
    }

    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let millis = d.subsec_millis();

    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if h > 0 || m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if millis > 0 {
        let frac = format!("{:03}", millis);
        out.push_str(&format!("{}.{}s", s, frac.trim_end_matches('0')));
    } else {
        out.push_str(&format!("{}s", s));
    }
    out
}
