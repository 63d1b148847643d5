use crate::cookies::capturedcookie::CapturedCookie;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Identity of a captured cookie.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CookieKey {
    name: String,
    domain: String,
}

impl CookieKey {
    fn of(cookie: &CapturedCookie) -> Self {
        Self {
            name: cookie.name.clone(),
            domain: cookie.domain.to_ascii_lowercase(),
        }
    }
}

/// What an [`CookieStore::upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

/// Third-party cookies captured during one domain visit.
///
/// Cloning is cheap and every clone shares the same entries, so the proxy's
/// response handlers and the request decorator can each hold one.
#[derive(Clone, Default)]
pub struct CookieStore {
    entries: Arc<DashMap<CookieKey, CapturedCookie>>,
}

impl CookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `cookie`, or refresh the entry with the same `(name, domain)`.
    pub fn upsert(&self, cookie: CapturedCookie) -> Upsert {
        match self.entries.entry(CookieKey::of(&cookie)) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().refresh_from(cookie);
                Upsert::Replaced
            }
            Entry::Vacant(slot) => {
                slot.insert(cookie);
                Upsert::Inserted
            }
        }
    }

    /// Copy of the current entries, ordered by first observation.
    pub fn snapshot(&self) -> Vec<CapturedCookie> {
        let mut cookies: Vec<CapturedCookie> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        cookies.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.domain.cmp(&b.domain))
                .then_with(|| a.name.cmp(&b.name))
        });
        cookies
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for CookieStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieStore")
            .field("count", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn cookie(name: &str, domain: &str, value: &str) -> CapturedCookie {
        CapturedCookie::new(name, value, domain, OffsetDateTime::now_utc())
    }

    #[test]
    fn test_upsert_replaces_same_identity() {
        let store = CookieStore::new();
        assert_eq!(store.upsert(cookie("id", "x.example", "1")), Upsert::Inserted);
        assert_eq!(store.upsert(cookie("id", "x.example", "2")), Upsert::Replaced);

        let all = store.snapshot();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, "2");
    }

    #[test]
    fn test_identity_is_name_and_domain() {
        let store = CookieStore::new();
        store.upsert(cookie("id", "x.example", "1"));
        store.upsert(cookie("id", "y.example", "1"));
        store.upsert(cookie("other", "x.example", "1"));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_domain_identity_ignores_case() {
        let store = CookieStore::new();
        store.upsert(cookie("id", "X.Example", "1"));
        store.upsert(cookie("id", "x.example", "2"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_refresh_keeps_first_seen() {
        let store = CookieStore::new();
        let early = OffsetDateTime::now_utc() - time::Duration::minutes(5);
        store.upsert(CapturedCookie::new("id", "1", "x.example", early));
        store.upsert(cookie("id", "x.example", "2"));

        let all = store.snapshot();
        assert_eq!(all[0].first_seen, early);
        assert!(all[0].last_seen > early);
    }

    #[test]
    fn test_clones_share_entries() {
        let store = CookieStore::new();
        let handle = store.clone();
        handle.upsert(cookie("id", "x.example", "1"));
        assert_eq!(store.len(), 1);
    }
}
