use crate::image_codec::OutputFormat;
use axum::http;
use headers::{Header, HeaderName, HeaderValue};
use mime::Mime;
use tracing::debug;

/// Media types from an `Accept` header, most preferred first.
///
/// Entries are ordered by their `q` weight (stable for equal weights) and
/// entries with `q=0` are dropped. Malformed entries are skipped instead of
/// failing the whole request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accept(pub Vec<Mime>);

fn quality(mime: &Mime) -> f32 {
    mime.get_param("q")
        .and_then(|q| q.as_str().parse::<f32>().ok())
        .filter(|q| q.is_finite())
        .map_or(1.0, |q| q.clamp(0.0, 1.0))
}

impl Header for Accept {
    fn name() -> &'static HeaderName {
        &http::header::ACCEPT
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let mut weighted = Vec::new();
        for value in values {
            let Ok(mimes_str) = value.to_str() else {
                debug!("Ignoring non-ASCII Accept header value");
                continue;
            };
            for mime_str in mimes_str.split(',') {
                let mime_str = mime_str.trim();
                if mime_str.is_empty() {
                    continue;
                }
                match mime_str.parse::<Mime>() {
                    Ok(mime) => {
                        let q = quality(&mime);
                        if q > 0.0 {
                            weighted.push((q, mime));
                        }
                    }
                    Err(_) => debug!("Ignoring invalid media type in Accept: {}", mime_str),
                }
            }
        }

        weighted.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(Accept(weighted.into_iter().map(|(_, mime)| mime).collect()))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let str = self
            .0
            .iter()
            .map(|mime| mime.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        if let Ok(value) = HeaderValue::from_str(&str) {
            values.extend(std::iter::once(value));
        }
    }
}

impl Accept {
    /// The most preferred format this endpoint can produce. Wildcards and
    /// lists without a usable image type select `default`; formats without
    /// alpha are skipped when `needs_alpha` is set.
    pub fn preferred_format(&self, default: OutputFormat, needs_alpha: bool) -> OutputFormat {
        for mime in &self.0 {
            let wildcard = mime.type_() == mime::STAR
                || (mime.type_() == mime::IMAGE && mime.subtype() == mime::STAR);
            if wildcard {
                return default;
            }
            if let Ok(format) = OutputFormat::try_from(mime) {
                if !needs_alpha || format.supports_alpha() {
                    return format;
                }
            }
        }
        default
    }
}

pub fn negotiate_format(
    accept: Option<&Accept>,
    default: OutputFormat,
    needs_alpha: bool,
) -> OutputFormat {
    accept.map_or(default, |accept| accept.preferred_format(default, needs_alpha))
}
