use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use super::DriverError;

/// Format marker for values copied verbatim
pub const STRING_FORMAT: &str = "string";

lazy_static! {
    /* A single printf conversion with optional literal text around it, e.g. "%.1f" or "%03d min" */
    static ref FORMAT_SPEC: Regex = Regex::new(
        r"^(?P<pre>(?:[^%]|%%)*)%(?P<zero>0)?(?P<width>[1-9][0-9]*)?(?:\.(?P<prec>[0-9]+))?(?P<conv>[diufsxX])(?P<post>.*)$"
    ).unwrap();
}

#[derive(Debug, Clone, PartialEq)]
struct FormatSpec {
    prefix: String,
    zero_pad: bool,
    width: usize,
    precision: Option<usize>,
    conversion: char,
    suffix: String,
}

fn parse_format(format: &str) -> Result<FormatSpec, DriverError> {
    let caps = FORMAT_SPEC
        .captures(format)
        .ok_or_else(|| DriverError::InvalidFormat(format.to_string()))?;

    let suffix = caps["post"].to_string();
    if suffix.replace("%%", "").contains('%') {
        return Err(DriverError::InvalidFormat(format.to_string()));
    }

    Ok(FormatSpec {
        prefix: caps["pre"].replace("%%", "%"),
        zero_pad: caps.name("zero").is_some(),
        width: caps.name("width").map(|w| w.as_str().parse().unwrap_or(0)).unwrap_or(0),
        precision: caps.name("prec").map(|p| p.as_str().parse().unwrap_or(0)),
        conversion: caps["conv"].chars().next().unwrap_or('f'),
        suffix: suffix.replace("%%", "%"),
    })
}

/// Check a format string without rendering anything
pub fn validate_format(format: &str) -> Result<(), DriverError> {
    if format == STRING_FORMAT {
        return Ok(());
    }
    parse_format(format).map(|_| ())
}

/// Convert a raw value into its published representation.
///
/// `"string"` copies the raw value, a scale of zero publishes the format
/// string itself as a constant, everything else is parsed, multiplied and
/// rendered with the printf-style `format`.
pub fn transform(raw: &str, scale: f64, format: &str) -> Result<String, DriverError> {
    if format == STRING_FORMAT {
        return Ok(raw.to_string());
    }

    if scale == 0.0 {
        return Ok(format.to_string());
    }

    let value = scale_value(raw, scale, 0.0)?;
    format_value(value, format)
}

/// Copy a string value, silently cutting it to `max_len` characters
pub fn transform_string(raw: &str, max_len: Option<usize>) -> String {
    match max_len {
        Some(len) if raw.chars().count() > len => {
            debug!("Truncating {raw:?} to {len} characters");
            raw.chars().take(len).collect()
        }
        _ => raw.to_string(),
    }
}

pub fn parse_number(raw: &str) -> Result<f64, DriverError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DriverError::BadValue("empty value".to_string()));
    }

    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16)
            .map(|v| v as f64)
            .map_err(|_| DriverError::BadValue(raw.to_string()));
    }

    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(DriverError::BadValue(raw.to_string())),
    }
}

pub fn scale_value(raw: &str, scale: f64, offset: f64) -> Result<f64, DriverError> {
    Ok(parse_number(raw)? * scale + offset)
}

/// Undo offset and scale for values written back to the device
pub fn reverse_value(value: &str, scale: f64, offset: f64) -> Result<f64, DriverError> {
    if scale == 0.0 {
        return Err(DriverError::BadValue(format!("{value} can not be written to a constant")));
    }
    Ok((parse_number(value)? - offset) / scale)
}

pub fn format_value(value: f64, format: &str) -> Result<String, DriverError> {
    let spec = parse_format(format)?;
    let w = spec.width;

    let body = match spec.conversion {
        'f' => {
            let p = spec.precision.unwrap_or(6);
            if spec.zero_pad {
                format!("{:0w$.p$}", value)
            } else {
                format!("{:w$.p$}", value)
            }
        }
        'd' | 'i' | 'u' | 'x' | 'X' => {
            let n = value.round() as i64;
            if n < 0 && spec.conversion != 'd' && spec.conversion != 'i' {
                return Err(DriverError::BadValue(format!("{value} is negative for {format}")));
            }
            match (spec.conversion, spec.zero_pad) {
                ('x', true) => format!("{:0w$x}", n),
                ('x', false) => format!("{:w$x}", n),
                ('X', true) => format!("{:0w$X}", n),
                ('X', false) => format!("{:w$X}", n),
                (_, true) => format!("{:0w$}", n),
                (_, false) => format!("{:w$}", n),
            }
        }
        _ => {
            /* %s renders the shortest representation */
            let s = if value.fract() == 0.0 && value.abs() < 1e15 {
                format!("{:.0}", value)
            } else {
                format!("{}", value)
            };
            format!("{:>w$}", s)
        }
    };

    Ok(format!("{}{}{}", spec.prefix, body, spec.suffix))
}
