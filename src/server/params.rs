//! Path grammar of the image endpoint.
//!
//! ```text
//! /{identifier}/{region}/{size}/{rotation}/{quality}.{format}
//!
//! identifier  id | id;n:d            (n:d is a scale constraint)
//! region      full | square | x,y,w,h | pct:x,y,w,h
//! size        max | full | w, | ,h | w,h | !w,h | pct:n
//! rotation    degrees | !degrees     (! mirrors first)
//! quality     default | color
//! ```

use crate::error::RequestError;
use crate::image::{
    Crop, Encode, Format, Identifier, Operation, OperationList, Rotate, Scale, ScaleConstraint,
};

/// Split a meta-identifier into the identifier and its scale constraint.
pub fn parse_identifier(raw: &str) -> Result<(Identifier, ScaleConstraint), RequestError> {
    if let Some((base, constraint)) = raw.rsplit_once(';') {
        if let Some((n, d)) = constraint.split_once(':') {
            if let (Ok(n), Ok(d)) = (n.parse::<u32>(), d.parse::<u32>()) {
                return Ok((Identifier::from(base), ScaleConstraint::new(n, d)?));
            }
        }
    }
    if raw.is_empty() {
        return Err(illegal("identifier is empty"));
    }
    Ok((Identifier::from(raw), ScaleConstraint::default()))
}

pub fn parse_region(region: &str) -> Result<Crop, RequestError> {
    match region {
        "full" => Ok(Crop::Full),
        "square" => Ok(Crop::Square),
        _ => {
            if let Some(pct) = region.strip_prefix("pct:") {
                let [x, y, width, height] = parse_numbers::<f64, 4>(pct, "region")?;
                if [x, y, width, height].iter().any(|v| !(0.0..=100.0).contains(v)) {
                    return Err(illegal(format!("region percentages out of range: {}", region)));
                }
                Ok(Crop::Percent {
                    x: x / 100.0,
                    y: y / 100.0,
                    width: width / 100.0,
                    height: height / 100.0,
                })
            } else {
                let [x, y, width, height] = parse_numbers::<u32, 4>(region, "region")?;
                Ok(Crop::Pixels {
                    x,
                    y,
                    width,
                    height,
                })
            }
        }
    }
}

pub fn parse_size(size: &str) -> Result<Scale, RequestError> {
    if size == "max" || size == "full" {
        return Ok(Scale::Max);
    }
    if let Some(pct) = size.strip_prefix("pct:") {
        let [percent] = parse_numbers::<f64, 1>(pct, "size")?;
        if percent <= 0.0 {
            return Err(illegal(format!("invalid size: {}", size)));
        }
        return Ok(Scale::Percent(percent / 100.0));
    }
    let (fit, dims) = match size.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, size),
    };
    let (w, h) = dims
        .split_once(',')
        .ok_or_else(|| illegal(format!("invalid size: {}", size)))?;
    let parse = |v: &str| -> Result<Option<u32>, RequestError> {
        if v.is_empty() {
            Ok(None)
        } else {
            v.parse()
                .map(Some)
                .map_err(|_| illegal(format!("invalid size: {}", size)))
        }
    };
    match (fit, parse(w)?, parse(h)?) {
        (false, Some(width), None) => Ok(Scale::Width(width)),
        (false, None, Some(height)) => Ok(Scale::Height(height)),
        (false, Some(width), Some(height)) => Ok(Scale::NonAspectFill { width, height }),
        (true, Some(width), Some(height)) => Ok(Scale::AspectFit { width, height }),
        _ => Err(illegal(format!("invalid size: {}", size))),
    }
}

pub fn parse_rotation(rotation: &str) -> Result<Rotate, RequestError> {
    let (mirror, degrees) = match rotation.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, rotation),
    };
    let degrees: f64 = degrees
        .parse()
        .map_err(|_| illegal(format!("invalid rotation: {}", rotation)))?;
    if !(0.0..=360.0).contains(&degrees) {
        return Err(illegal(format!("rotation out of range: {}", rotation)));
    }
    Ok(if mirror {
        Rotate::mirrored(degrees)
    } else {
        Rotate::new(degrees)
    })
}

/// Parse `{quality}.{format}`.
pub fn parse_filename(filename: &str) -> Result<Format, RequestError> {
    let (quality, extension) = filename
        .rsplit_once('.')
        .ok_or_else(|| illegal(format!("missing output format: {}", filename)))?;
    if quality != "default" && quality != "color" {
        return Err(illegal(format!("unsupported quality: {}", quality)));
    }
    Format::from_key(&extension.to_ascii_lowercase())
        .filter(|format| !format.is_unknown())
        .ok_or_else(|| illegal(format!("unsupported output format: {}", extension)))
}

/// Build the (unfrozen) operation list for an image request.
pub fn operation_list(
    identifier: &str,
    region: &str,
    size: &str,
    rotation: &str,
    filename: &str,
) -> Result<OperationList, RequestError> {
    let (identifier, constraint) = parse_identifier(identifier)?;
    let rotate = parse_rotation(rotation)?;

    let mut ops = OperationList::new(identifier);
    ops.set_scale_constraint(constraint)?;
    ops.add(Operation::Crop(parse_region(region)?))?;
    ops.add(Operation::Scale(parse_size(size)?))?;
    if rotate.has_effect() {
        ops.add(Operation::Rotate(rotate))?;
    }
    ops.add(Operation::Encode(Encode::new(parse_filename(filename)?)))?;
    Ok(ops)
}

fn parse_numbers<T: std::str::FromStr, const N: usize>(
    value: &str,
    what: &str,
) -> Result<[T; N], RequestError> {
    let parsed: Vec<T> = value
        .split(',')
        .map(|v| v.trim().parse::<T>())
        .collect::<Result<_, _>>()
        .map_err(|_| illegal(format!("invalid {}: {}", what, value)))?;
    parsed
        .try_into()
        .map_err(|_| illegal(format!("invalid {}: {}", what, value)))
}

fn illegal(message: impl Into<String>) -> RequestError {
    RequestError::IllegalArgument(message.into())
}
