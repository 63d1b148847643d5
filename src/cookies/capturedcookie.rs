use cookie::Cookie;
use time::OffsetDateTime;

/// A cookie observed in a third-party `Set-Cookie` header.
///
/// Identity is `(name, domain)`; everything else is replaced when the same
/// identity is observed again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// `Expires` attribute, if the server sent one.
    pub expires: Option<OffsetDateTime>,
    /// `Max-Age` in seconds. Zero or negative values are stored as `-1`.
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    /// Host whose response carried the header.
    pub source_host: String,
    pub first_seen: OffsetDateTime,
    pub last_seen: OffsetDateTime,
}

impl CapturedCookie {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
        observed_at: OffsetDateTime,
    ) -> Self {
        let domain = domain.into();
        Self {
            name: name.into(),
            value: value.into(),
            source_host: domain.clone(),
            domain,
            path: "/".to_string(),
            expires: None,
            max_age: None,
            secure: false,
            http_only: false,
            first_seen: observed_at,
            last_seen: observed_at,
        }
    }

    pub fn with_expires(mut self, expires: OffsetDateTime) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    /// Parse one `Set-Cookie` header value received from `responding_host`.
    ///
    /// A cookie without a `Domain` attribute belongs to the responding host.
    /// Returns `None` for lines the cookie grammar rejects.
    pub fn from_set_cookie(
        line: &str,
        responding_host: &str,
        observed_at: OffsetDateTime,
    ) -> Option<Self> {
        let parsed = match Cookie::parse(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(host = %responding_host, error = %e, "unparsable Set-Cookie");
                return None;
            }
        };

        let domain = parsed
            .domain()
            .map(|d| d.trim_start_matches('.').to_ascii_lowercase())
            .unwrap_or_else(|| responding_host.to_ascii_lowercase());

        // cookie clamps negative Max-Age to zero; both mean "delete now".
        let max_age = parsed.max_age().map(|age| {
            let secs = age.whole_seconds();
            if secs <= 0 {
                -1
            } else {
                secs
            }
        });

        Some(Self {
            name: parsed.name().to_string(),
            value: parsed.value().to_string(),
            domain,
            path: parsed.path().unwrap_or("/").to_string(),
            expires: parsed.expires_datetime(),
            max_age,
            secure: parsed.secure().unwrap_or(false),
            http_only: parsed.http_only().unwrap_or(false),
            source_host: responding_host.to_ascii_lowercase(),
            first_seen: observed_at,
            last_seen: observed_at,
        })
    }

    /// An expired cookie has no expiry, an expiry at or before `now`, or a
    /// negative max-age.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        match self.expires {
            None => true,
            Some(_) if self.max_age.is_some_and(|age| age < 0) => true,
            Some(expires) => expires <= now,
        }
    }

    /// Take over every mutable field of `newer`, keeping identity and
    /// `first_seen`.
    pub(crate) fn refresh_from(&mut self, newer: CapturedCookie) {
        self.value = newer.value;
        self.path = newer.path;
        self.expires = newer.expires;
        self.max_age = newer.max_age;
        self.secure = newer.secure;
        self.http_only = newer.http_only;
        self.source_host = newer.source_host;
        self.last_seen = newer.last_seen;
    }
}
