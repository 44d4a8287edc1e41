//! ISO 6709 coordinates in the compact decimal-degree form used by the
//! submitting channels, e.g. `+40.20361-075.00417/`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0:?} is not an ISO 6709 coordinate")]
pub struct InvalidCoordinate(pub String);

/// A signed latitude/longitude pair in decimal degrees.
///
/// A parsed coordinate keeps the submitted digits, so it serialises back to
/// the same ISO 6709 string (with a trailing `/`) at whatever precision the
/// channel sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Coordinate {
  latitude:  f64,
  longitude: f64,
  text:      String,
}

impl Coordinate {
  /// Build from degrees; rendered with five decimal places.
  pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
    in_range(latitude, longitude).then(|| Self {
      latitude,
      longitude,
      text: format!("{latitude:+09.5}{longitude:+010.5}/"),
    })
  }

  pub fn latitude(&self) -> f64 { self.latitude }

  pub fn longitude(&self) -> f64 { self.longitude }
}

fn in_range(latitude: f64, longitude: f64) -> bool {
  (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude)
}

impl FromStr for Coordinate {
  type Err = InvalidCoordinate;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || InvalidCoordinate(s.to_owned());
    let trimmed = s.trim();
    let body = trimmed.strip_suffix('/').unwrap_or(trimmed);

    // The longitude starts at the second sign character.
    let split = body
      .char_indices()
      .skip(1)
      .find(|(_, c)| *c == '+' || *c == '-')
      .map(|(i, _)| i)
      .ok_or_else(invalid)?;
    let (lat, lon) = body.split_at(split);

    let latitude = parse_component(lat, 2).ok_or_else(invalid)?;
    let longitude = parse_component(lon, 3).ok_or_else(invalid)?;
    if !in_range(latitude, longitude) {
      return Err(invalid());
    }
    Ok(Self { latitude, longitude, text: format!("{body}/") })
  }
}

/// Parse `±D…D[.D…]` with exactly `int_digits` integer digits.
fn parse_component(s: &str, int_digits: usize) -> Option<f64> {
  let (sign, rest) = match s.as_bytes().first()? {
    b'+' => (1.0, &s[1..]),
    b'-' => (-1.0, &s[1..]),
    _ => return None,
  };
  let (int, frac) = match rest.split_once('.') {
    Some((int, frac)) => (int, Some(frac)),
    None => (rest, None),
  };
  let all_digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
  if int.len() != int_digits || !all_digits(int) {
    return None;
  }
  if let Some(frac) = frac
    && !all_digits(frac)
  {
    return None;
  }
  rest.parse::<f64>().ok().map(|v| sign * v)
}

impl fmt::Display for Coordinate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.text)
  }
}

impl TryFrom<String> for Coordinate {
  type Error = InvalidCoordinate;

  fn try_from(value: String) -> Result<Self, Self::Error> { value.parse() }
}

impl From<Coordinate> for String {
  fn from(value: Coordinate) -> Self { value.to_string() }
}
