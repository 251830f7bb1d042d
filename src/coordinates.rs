//! Coordinate input normalisation.
//!
//! Routes are entered as either a DMS pair (`33°55'12"S 18°25'26"E`) or a
//! decimal pair (`-33.92 18.42` / `-33.92,18.42`). Everything is stored in
//! decimal degrees. Invalid input is rejected here, before a route record
//! exists.

use crate::model::{Coordinate, CoordinateError};

const MAX_LATITUDE: f64 = 90.0;
const MAX_LONGITUDE: f64 = 180.0;

// ---------------------------------------------------------------------------
// DMS
// ---------------------------------------------------------------------------

/// Hemisphere letter of a DMS component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hemisphere {
    North,
    South,
    East,
    West,
}

impl Hemisphere {
    fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'N' => Some(Hemisphere::North),
            'S' => Some(Hemisphere::South),
            'E' => Some(Hemisphere::East),
            'W' => Some(Hemisphere::West),
            _ => None,
        }
    }

    fn is_latitude(&self) -> bool {
        matches!(self, Hemisphere::North | Hemisphere::South)
    }

    fn sign(&self) -> f64 {
        match self {
            Hemisphere::South | Hemisphere::West => -1.0,
            Hemisphere::North | Hemisphere::East => 1.0,
        }
    }
}

fn all_digits(s: &str, min_len: usize, max_len: usize) -> bool {
    (min_len..=max_len).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
}

/// Seconds may carry a fractional part: `12` or `12.5`.
fn valid_seconds(s: &str) -> bool {
    match s.split_once('.') {
        Some((whole, frac)) => all_digits(whole, 1, 2) && all_digits(frac, 1, usize::MAX),
        None => all_digits(s, 1, 2),
    }
}

/// Parses one DMS component such as `33°55'12"S` into signed decimal degrees.
///
/// Accepts ASCII `'`/`"` as well as the typographic prime `′` and double prime
/// `″`. The hemisphere letter is case-insensitive and sets the sign.
pub fn dms_to_decimal(input: &str) -> Result<(f64, Hemisphere), CoordinateError> {
    let invalid = || CoordinateError::InvalidFormat(input.to_string());
    let s = input.trim();

    let (deg, rest) = s.split_once('°').ok_or_else(invalid)?;
    let (min, rest) = rest.split_once(|c: char| c == '\'' || c == '′').ok_or_else(invalid)?;
    let (sec, hemi) = rest.split_once(|c: char| c == '"' || c == '″').ok_or_else(invalid)?;

    if !all_digits(deg, 1, 3) || !all_digits(min, 1, 2) || !valid_seconds(sec) {
        return Err(invalid());
    }

    let mut hemi_chars = hemi.chars();
    let hemisphere = match (hemi_chars.next(), hemi_chars.next()) {
        (Some(c), None) => Hemisphere::from_char(c).ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };

    let degrees: f64 = deg.parse().map_err(|_| invalid())?;
    let minutes: f64 = min.parse().map_err(|_| invalid())?;
    let seconds: f64 = sec.parse().map_err(|_| invalid())?;

    if minutes >= 60.0 || seconds >= 60.0 {
        return Err(invalid());
    }

    let magnitude = degrees + minutes / 60.0 + seconds / 3600.0;
    let limit = if hemisphere.is_latitude() { MAX_LATITUDE } else { MAX_LONGITUDE };
    if magnitude > limit {
        return Err(CoordinateError::OutOfRange { value: magnitude, limit });
    }

    Ok((magnitude * hemisphere.sign(), hemisphere))
}

// ---------------------------------------------------------------------------
// Pairs
// ---------------------------------------------------------------------------

/// Parses a latitude/longitude pair in either DMS or decimal form.
pub fn parse_coordinate(input: &str) -> Result<Coordinate, CoordinateError> {
    let trimmed = input.trim();
    if trimmed.contains('°') {
        parse_dms_pair(trimmed)
    } else {
        parse_decimal_pair(trimmed)
    }
}

/// Space-separated DMS pair, latitude first.
pub fn parse_dms_pair(input: &str) -> Result<Coordinate, CoordinateError> {
    let parts: Vec<&str> = input.split_whitespace().collect();
    if parts.len() != 2 {
        return Err(CoordinateError::InvalidPair(input.to_string()));
    }

    let (latitude, lat_hemi) = dms_to_decimal(parts[0])?;
    let (longitude, lng_hemi) = dms_to_decimal(parts[1])?;

    if !lat_hemi.is_latitude() || lng_hemi.is_latitude() {
        return Err(CoordinateError::InvalidPair(format!(
            "{} (expected N/S latitude followed by E/W longitude)",
            input
        )));
    }

    Ok(Coordinate::new(latitude, longitude))
}

/// Decimal pair separated by a comma and/or whitespace, latitude first.
pub fn parse_decimal_pair(input: &str) -> Result<Coordinate, CoordinateError> {
    let parts: Vec<&str> = input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() != 2 {
        return Err(CoordinateError::InvalidPair(input.to_string()));
    }

    let parse = |s: &str| -> Result<f64, CoordinateError> {
        let value: f64 = s
            .parse()
            .map_err(|_| CoordinateError::InvalidFormat(s.to_string()))?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(CoordinateError::InvalidFormat(s.to_string()))
        }
    };

    let latitude = parse(parts[0])?;
    let longitude = parse(parts[1])?;
    if latitude.abs() > MAX_LATITUDE {
        return Err(CoordinateError::OutOfRange { value: latitude, limit: MAX_LATITUDE });
    }
    if longitude.abs() > MAX_LONGITUDE {
        return Err(CoordinateError::OutOfRange { value: longitude, limit: MAX_LONGITUDE });
    }

    Ok(Coordinate::new(latitude, longitude))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    // --- DMS components -----------------------------------------------------

    #[test]
    fn test_south_latitude_is_negative() {
        let (value, hemi) = dms_to_decimal("33°55'12\"S").expect("valid DMS");
        assert_eq!(hemi, Hemisphere::South);
        assert!(approx(value, -(33.0 + 55.0 / 60.0 + 12.0 / 3600.0)), "got {}", value);
    }

    #[test]
    fn test_east_longitude_is_positive() {
        let (value, _) = dms_to_decimal("18°25'26\"E").expect("valid DMS");
        assert!(value > 0.0);
    }

    #[test]
    fn test_fractional_seconds_and_lowercase_hemisphere() {
        let (value, _) = dms_to_decimal("0°0'36.0\"w").expect("valid DMS");
        assert!(approx(value, -0.01), "got {}", value);
    }

    #[test]
    fn test_typographic_primes_accepted() {
        let (value, _) = dms_to_decimal("45°30′0″N").expect("valid DMS");
        assert!(approx(value, 45.5));
    }

    #[test]
    fn test_malformed_dms_rejected() {
        for bad in ["33°55'S", "33 55 12 S", "33°75'12\"S", "33°55'12\"X", "1234°0'0\"N", ""] {
            assert!(dms_to_decimal(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_latitude_beyond_90_rejected() {
        let err = dms_to_decimal("91°0'0\"N").unwrap_err();
        assert!(matches!(err, CoordinateError::OutOfRange { .. }));
    }

    // --- Pairs --------------------------------------------------------------

    #[test]
    fn test_dms_pair_round_trips_to_decimal() {
        let c = parse_coordinate("33°55'12\"S 18°25'26\"E").expect("valid pair");
        assert!(c.latitude < 0.0 && c.longitude > 0.0);
    }

    #[test]
    fn test_dms_pair_with_swapped_axes_rejected() {
        let err = parse_coordinate("18°25'26\"E 33°55'12\"S").unwrap_err();
        assert!(matches!(err, CoordinateError::InvalidPair(_)));
    }

    #[test]
    fn test_decimal_pair_forms() {
        let a = parse_coordinate("-33.92 18.42").expect("space separated");
        let b = parse_coordinate("-33.92,18.42").expect("comma separated");
        let c = parse_coordinate("-33.92, 18.42").expect("comma and space");
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_decimal_pair_validation() {
        assert!(parse_coordinate("-33.92").is_err());
        assert!(parse_coordinate("abc 18.42").is_err());
        assert!(parse_coordinate("95.0 18.42").is_err());
        assert!(parse_coordinate("45.0 200.0").is_err());
        assert!(parse_coordinate("NaN 1.0").is_err());
    }
}
