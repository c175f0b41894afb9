//! Cache policy: given a request and a stored candidate, decide what (if
//! anything) goes to the network and what (if anything) is served from the
//! cache.

use std::time::{Duration, SystemTime};

use http::header::{
    HeaderMap, HeaderValue, CACHE_CONTROL, DATE, ETAG, EXPIRES, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED, PRAGMA, VARY, WARNING,
};
use http::Method;

use crate::request::Request;
use crate::response::Response;

/// A `max-stale` with no value accepts any staleness; bounded so freshness
/// arithmetic cannot overflow.
const MAX_STALE_UNBOUNDED: Duration = Duration::from_secs(u32::MAX as u64);

/// One day, the threshold past which serving heuristically-fresh responses
/// warrants a warning header.
const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Parsed `Cache-Control` (and `Pragma`) directives.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<Duration>,
    pub s_max_age: Option<Duration>,
    pub is_private: bool,
    pub is_public: bool,
    pub must_revalidate: bool,
    pub max_stale: Option<Duration>,
    /// `max-stale` present without a value: any staleness is acceptable.
    pub max_stale_unbounded: bool,
    pub min_fresh: Option<Duration>,
    pub only_if_cached: bool,
    pub no_transform: bool,
    pub immutable: bool,
}

impl CacheControl {
    /// Parse the cache directives out of `headers`. `Pragma: no-cache` is
    /// honored for compatibility.
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut parsed = Self::default();

        let values = headers
            .get_all(CACHE_CONTROL)
            .iter()
            .chain(headers.get_all(PRAGMA).iter());

        for value in values {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for directive in value.split(',') {
                let directive = directive.trim();
                let (name, argument) = match directive.split_once('=') {
                    Some((name, argument)) => {
                        (name.trim(), Some(argument.trim().trim_matches('"')))
                    }
                    None => (directive, None),
                };
                let seconds = argument.and_then(|a| a.parse::<u64>().ok()).map(
                    // Directive values cap at what fits a signed 32-bit
                    // seconds count, matching common cache behavior.
                    |secs| Duration::from_secs(secs.min(i32::MAX as u64)),
                );

                match name.to_ascii_lowercase().as_str() {
                    "no-cache" => parsed.no_cache = true,
                    "no-store" => parsed.no_store = true,
                    "max-age" => parsed.max_age = seconds,
                    "s-maxage" => parsed.s_max_age = seconds,
                    "private" => parsed.is_private = true,
                    "public" => parsed.is_public = true,
                    "must-revalidate" => parsed.must_revalidate = true,
                    "max-stale" => match seconds {
                        Some(seconds) => parsed.max_stale = Some(seconds),
                        None => parsed.max_stale_unbounded = true,
                    },
                    "min-fresh" => parsed.min_fresh = seconds,
                    "only-if-cached" => parsed.only_if_cached = true,
                    "no-transform" => parsed.no_transform = true,
                    "immutable" => parsed.immutable = true,
                    _ => {}
                }
            }
        }

        parsed
    }
}

/// The outcome of cache policy evaluation.
///
/// `(None, None)` means the request required a cached response and none
/// was acceptable: the engine synthesizes a 504. `(None, Some)` serves the
/// cache directly. `(Some, None)` goes to the network. `(Some, Some)` is a
/// conditional revalidation.
pub struct CacheStrategy {
    /// The request to send over the network, if any.
    pub network_request: Option<Request>,

    /// The cached response to serve or validate against, if any.
    pub cache_response: Option<Response>,
}

impl CacheStrategy {
    fn network_only(request: &Request) -> Self {
        Self {
            network_request: Some(request.clone()),
            cache_response: None,
        }
    }

    /// Evaluate cache policy for `request` against `cached` at `now`.
    pub fn compute(now: SystemTime, request: &Request, cached: Option<Response>) -> Self {
        let candidate = Self::compute_candidate(now, request, cached);

        if candidate.network_request.is_some()
            && CacheControl::parse(request.headers()).only_if_cached
        {
            // Forbidden from using the network, and the cache is not
            // sufficient.
            return Self {
                network_request: None,
                cache_response: None,
            };
        }

        candidate
    }

    fn compute_candidate(now: SystemTime, request: &Request, cached: Option<Response>) -> Self {
        let Some(cached) = cached else {
            return Self::network_only(request);
        };

        // A cached response for an encrypted request is unusable without
        // its handshake record.
        if request.is_https() && cached.handshake().is_none() {
            return Self::network_only(request);
        }

        if !is_cacheable(&cached, request) {
            return Self::network_only(request);
        }

        let request_control = CacheControl::parse(request.headers());
        if request_control.no_cache || has_conditions(request) {
            return Self::network_only(request);
        }

        let response_control = CacheControl::parse(cached.headers());

        let age = response_age(now, &cached);
        let mut freshness = freshness_lifetime(&cached);
        if let Some(max_age) = request_control.max_age {
            freshness = freshness.min(max_age);
        }

        let min_fresh = request_control.min_fresh.unwrap_or(Duration::ZERO);

        let mut max_stale = Duration::ZERO;
        if !response_control.must_revalidate {
            if request_control.max_stale_unbounded {
                max_stale = MAX_STALE_UNBOUNDED;
            } else if let Some(stale) = request_control.max_stale {
                max_stale = stale;
            }
        }

        if !response_control.no_cache
            && age.saturating_add(min_fresh) < freshness.saturating_add(max_stale)
        {
            let heuristic_expiry = has_no_explicit_expiry(cached.headers());
            let mut builder = cached.into_builder();
            if age.saturating_add(min_fresh) >= freshness {
                builder = builder.header(
                    WARNING,
                    HeaderValue::from_static("110 - \"Response is stale\""),
                );
            }
            if age > ONE_DAY && heuristic_expiry {
                builder = builder.header(
                    WARNING,
                    HeaderValue::from_static("113 - \"Heuristic expiration\""),
                );
            }
            return Self {
                network_request: None,
                cache_response: Some(builder.build()),
            };
        }

        // Stale: find a validator for a conditional request.
        let (condition_name, condition_value) = if let Some(etag) = cached.headers().get(ETAG) {
            (IF_NONE_MATCH, etag.clone())
        } else if let Some(last_modified) = cached.headers().get(LAST_MODIFIED) {
            (IF_MODIFIED_SINCE, last_modified.clone())
        } else if let Some(date) = cached.headers().get(DATE) {
            (IF_MODIFIED_SINCE, date.clone())
        } else {
            // No validator: the candidate is useless, go straight out.
            return Self::network_only(request);
        };

        let mut conditional = request.clone();
        conditional
            .headers_mut()
            .insert(condition_name, condition_value);

        Self {
            network_request: Some(conditional),
            cache_response: Some(cached),
        }
    }
}

/// The header fields a response's `Vary` names, lowercased.
fn vary_fields(headers: &HeaderMap) -> impl Iterator<Item = String> + '_ {
    headers
        .get_all(VARY)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|field| field.trim().to_ascii_lowercase())
        .filter(|field| !field.is_empty())
}

/// Whether the response's `Vary` names `*`. Such a response can never be
/// matched to a later request and is never cached.
pub fn has_vary_all(headers: &HeaderMap) -> bool {
    vary_fields(headers).any(|field| field == "*")
}

/// RFC 7234 §4.1: a stored response satisfies a request only when every
/// header named by its `Vary` carries the same values on the new request
/// as it did on the request the response was stored under. Stores keep
/// the original request's headers on [`Response::request`] for this.
pub fn vary_matches(cached: &Response, request: &Request) -> bool {
    vary_fields(cached.headers()).all(|field| {
        if field == "*" {
            return false;
        }
        let stored: Vec<&HeaderValue> = cached
            .request()
            .headers()
            .get_all(field.as_str())
            .iter()
            .collect();
        let current: Vec<&HeaderValue> = request.headers().get_all(field.as_str()).iter().collect();
        stored == current
    })
}

/// Whether a response with this status and these directives may be stored
/// and later served.
pub(crate) fn is_cacheable(response: &Response, request: &Request) -> bool {
    if has_vary_all(response.headers()) {
        return false;
    }

    match response.status().as_u16() {
        200 | 203 | 204 | 300 | 301 | 308 | 404 | 405 | 410 | 414 | 501 => {}
        302 | 307 => {
            // Cacheable only with explicit expiry or visibility.
            let control = CacheControl::parse(response.headers());
            if response.headers().get(EXPIRES).is_none()
                && control.max_age.is_none()
                && !control.is_public
                && !control.is_private
            {
                return false;
            }
        }
        _ => return false,
    }

    !CacheControl::parse(response.headers()).no_store
        && !CacheControl::parse(request.headers()).no_store
}

/// Whether a successful response to this method invalidates a cached
/// entry for the URL.
pub(crate) fn invalidates_cache(method: &Method) -> bool {
    matches!(method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE" | "MOVE")
}

fn has_conditions(request: &Request) -> bool {
    request.headers().contains_key(IF_MODIFIED_SINCE)
        || request.headers().contains_key(IF_NONE_MATCH)
}

fn header_date(headers: &HeaderMap, name: http::header::HeaderName) -> Option<SystemTime> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
}

fn has_no_explicit_expiry(headers: &HeaderMap) -> bool {
    CacheControl::parse(headers).max_age.is_none() && headers.get(EXPIRES).is_none()
}

/// RFC 7234 §4.2.3 current age.
fn response_age(now: SystemTime, cached: &Response) -> Duration {
    let received_at = cached.received_at();
    let sent_at = cached.sent_at();

    let apparent_age = header_date(cached.headers(), DATE)
        .and_then(|served| received_at.duration_since(served).ok())
        .unwrap_or(Duration::ZERO);

    let age_header = cached
        .header("age")
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO);

    let received_age = apparent_age.max(age_header);
    let response_duration = received_at
        .duration_since(sent_at)
        .unwrap_or(Duration::ZERO);
    let resident_duration = now.duration_since(received_at).unwrap_or(Duration::ZERO);

    received_age
        .saturating_add(response_duration)
        .saturating_add(resident_duration)
}

/// RFC 7234 §4.2.1 freshness lifetime, with the common 10% heuristic when
/// only `Last-Modified` is available.
fn freshness_lifetime(cached: &Response) -> Duration {
    let control = CacheControl::parse(cached.headers());
    if let Some(max_age) = control.max_age {
        return max_age;
    }

    let served = header_date(cached.headers(), DATE).unwrap_or_else(|| cached.received_at());

    if let Some(expires) = header_date(cached.headers(), EXPIRES) {
        return expires.duration_since(served).unwrap_or(Duration::ZERO);
    }

    if let Some(last_modified) = header_date(cached.headers(), LAST_MODIFIED) {
        // Heuristic freshness only applies to URLs without a query.
        if cached.request().uri().query().is_none() {
            let since_modified = served.duration_since(last_modified).unwrap_or(Duration::ZERO);
            return since_modified / 10;
        }
    }

    Duration::ZERO
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ResponseBody;
    use http::Uri;

    fn request(uri: &'static str) -> Request {
        Request::get(Uri::from_static(uri))
    }

    fn cached_response(
        now: SystemTime,
        age: Duration,
        headers: &[(&str, String)],
    ) -> Response {
        let served = now - age;
        let mut builder = Response::builder()
            .request(request("http://example.com/resource"))
            .sent_at(served)
            .received_at(served)
            .header(DATE, date_value(served))
            .body(ResponseBody::bytes("cached"));
        for (name, value) in headers {
            builder = builder.header(
                name.parse().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        builder.build()
    }

    fn date_value(at: SystemTime) -> HeaderValue {
        HeaderValue::from_str(&httpdate::fmt_http_date(at)).unwrap()
    }

    #[test]
    fn parse_cache_control() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CACHE_CONTROL,
            "no-cache, max-age=120, max-stale, min-fresh=10".parse().unwrap(),
        );
        let control = CacheControl::parse(&headers);
        assert!(control.no_cache);
        assert_eq!(control.max_age, Some(Duration::from_secs(120)));
        assert!(control.max_stale_unbounded);
        assert_eq!(control.min_fresh, Some(Duration::from_secs(10)));
        assert!(!control.no_store);
    }

    #[test]
    fn parse_pragma_no_cache() {
        let mut headers = HeaderMap::new();
        headers.insert(PRAGMA, "no-cache".parse().unwrap());
        assert!(CacheControl::parse(&headers).no_cache);
    }

    #[test]
    fn no_candidate_goes_to_network() {
        let now = SystemTime::now();
        let request = request("http://example.com/");
        let strategy = CacheStrategy::compute(now, &request, None);
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn fresh_response_served_from_cache() {
        let now = SystemTime::now();
        let request = request("http://example.com/resource");
        let cached = cached_response(
            now,
            Duration::from_secs(30),
            &[("cache-control", "max-age=60".to_owned())],
        );
        let strategy = CacheStrategy::compute(now, &request, Some(cached));
        assert!(strategy.network_request.is_none());
        assert!(strategy.cache_response.is_some());
    }

    #[test]
    fn stale_response_revalidates_with_etag() {
        let now = SystemTime::now();
        let request = request("http://example.com/resource");
        let cached = cached_response(
            now,
            Duration::from_secs(120),
            &[
                ("cache-control", "max-age=60".to_owned()),
                ("etag", "\"v1\"".to_owned()),
            ],
        );
        let strategy = CacheStrategy::compute(now, &request, Some(cached));
        let network = strategy.network_request.expect("conditional request");
        assert_eq!(network.header("if-none-match"), Some("\"v1\""));
        assert!(strategy.cache_response.is_some());
    }

    #[test]
    fn stale_response_revalidates_with_last_modified() {
        let now = SystemTime::now();
        let request = request("http://example.com/resource");
        let modified = date_value(now - Duration::from_secs(3600));
        let cached = cached_response(
            now,
            Duration::from_secs(120),
            &[
                ("cache-control", "max-age=60".to_owned()),
                ("last-modified", modified.to_str().unwrap().to_owned()),
            ],
        );
        let strategy = CacheStrategy::compute(now, &request, Some(cached));
        let network = strategy.network_request.expect("conditional request");
        assert!(network.header("if-modified-since").is_some());
    }

    #[test]
    fn only_if_cached_miss_yields_neither() {
        let now = SystemTime::now();
        let mut request = request("http://example.com/resource");
        request
            .headers_mut()
            .insert(CACHE_CONTROL, "only-if-cached".parse().unwrap());
        let strategy = CacheStrategy::compute(now, &request, None);
        assert!(strategy.network_request.is_none());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn request_no_cache_forces_network() {
        let now = SystemTime::now();
        let mut request = request("http://example.com/resource");
        request
            .headers_mut()
            .insert(CACHE_CONTROL, "no-cache".parse().unwrap());
        let cached = cached_response(
            now,
            Duration::from_secs(1),
            &[("cache-control", "max-age=60".to_owned())],
        );
        let strategy = CacheStrategy::compute(now, &request, Some(cached));
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn max_stale_accepts_stale_responses() {
        let now = SystemTime::now();
        let mut request = request("http://example.com/resource");
        request
            .headers_mut()
            .insert(CACHE_CONTROL, "max-stale".parse().unwrap());
        let cached = cached_response(
            now,
            Duration::from_secs(120),
            &[("cache-control", "max-age=60".to_owned())],
        );
        let strategy = CacheStrategy::compute(now, &request, Some(cached));
        assert!(strategy.network_request.is_none());
        let served = strategy.cache_response.unwrap();
        assert!(served
            .headers()
            .get_all(WARNING)
            .iter()
            .any(|warning| warning.to_str().unwrap().starts_with("110")));
    }

    #[test]
    fn must_revalidate_ignores_max_stale() {
        let now = SystemTime::now();
        let mut request = request("http://example.com/resource");
        request
            .headers_mut()
            .insert(CACHE_CONTROL, "max-stale".parse().unwrap());
        let cached = cached_response(
            now,
            Duration::from_secs(120),
            &[
                ("cache-control", "max-age=60, must-revalidate".to_owned()),
                ("etag", "\"v2\"".to_owned()),
            ],
        );
        let strategy = CacheStrategy::compute(now, &request, Some(cached));
        assert!(strategy.network_request.is_some());
    }

    #[test]
    fn uncacheable_status_goes_to_network() {
        let now = SystemTime::now();
        let request = request("http://example.com/resource");
        let mut cached = cached_response(
            now,
            Duration::from_secs(1),
            &[("cache-control", "max-age=60".to_owned())],
        );
        cached = cached
            .into_builder()
            .status(http::StatusCode::INTERNAL_SERVER_ERROR)
            .build();
        let strategy = CacheStrategy::compute(now, &request, Some(cached));
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn invalidating_methods() {
        assert!(invalidates_cache(&Method::POST));
        assert!(invalidates_cache(&Method::DELETE));
        assert!(invalidates_cache(&Method::from_bytes(b"MOVE").unwrap()));
        assert!(!invalidates_cache(&Method::GET));
    }

    #[test]
    fn vary_star_is_never_cacheable() {
        let now = SystemTime::now();
        let request = request("http://example.com/resource");
        let cached = cached_response(
            now,
            Duration::from_secs(1),
            &[
                ("cache-control", "max-age=60".to_owned()),
                ("vary", "accept-encoding, *".to_owned()),
            ],
        );
        assert!(has_vary_all(cached.headers()));
        assert!(!is_cacheable(&cached, &request));

        let strategy = CacheStrategy::compute(now, &request, Some(cached));
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn vary_matching_compares_stored_request_headers() {
        let mut stored_request = request("http://example.com/resource");
        stored_request
            .headers_mut()
            .insert("accept-language", "en".parse().unwrap());
        let cached = Response::builder()
            .request(stored_request)
            .header(VARY, HeaderValue::from_static("Accept-Language"))
            .body(ResponseBody::bytes("cached"))
            .build();

        let mut same = request("http://example.com/resource");
        same.headers_mut()
            .insert("accept-language", "en".parse().unwrap());
        assert!(vary_matches(&cached, &same));

        let mut different = request("http://example.com/resource");
        different
            .headers_mut()
            .insert("accept-language", "fr".parse().unwrap());
        assert!(!vary_matches(&cached, &different));

        // Absent on the new request is a mismatch too.
        let missing = request("http://example.com/resource");
        assert!(!vary_matches(&cached, &missing));

        // No Vary: everything matches.
        let unvaried = Response::builder()
            .request(request("http://example.com/resource"))
            .body(ResponseBody::bytes("cached"))
            .build();
        assert!(vary_matches(&unvaried, &missing));
    }
}
