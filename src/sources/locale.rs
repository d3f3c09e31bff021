//! Locale name expansion with an expiring cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long an unused expansion stays cached.
pub const LOCALE_CACHE_MAX_AGE: Duration = Duration::from_secs(60 * 30);

const CODESET: u8 = 1 << 0;
const TERRITORY: u8 = 1 << 1;
const MODIFIER: u8 = 1 << 2;

/// Expand a locale list such as `en_US.UTF-8@euro:fr` into every fallback
/// variant, most specific first, ending with `C`.
pub fn expand_locale(locale: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in locale.split(':').map(str::trim).filter(|p| !p.is_empty()) {
        for variant in variants_of(part) {
            if !out.contains(&variant) {
                out.push(variant);
            }
        }
    }
    if !out.iter().any(|v| v == "C") {
        out.push("C".to_string());
    }
    out
}

fn variants_of(locale: &str) -> Vec<String> {
    if locale == "C" || locale == "POSIX" {
        return vec!["C".to_string()];
    }

    let (rest, modifier) = match locale.find('@') {
        Some(idx) => (&locale[..idx], &locale[idx..]),
        None => (locale, ""),
    };
    let (rest, codeset) = match rest.find('.') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let (language, territory) = match rest.find('_') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };

    let mut mask = 0u8;
    if !codeset.is_empty() {
        mask |= CODESET;
    }
    if !territory.is_empty() {
        mask |= TERRITORY;
    }
    if !modifier.is_empty() {
        mask |= MODIFIER;
    }

    (0..=mask)
        .rev()
        .filter(|i| i & !mask == 0)
        .map(|i| {
            let mut v = language.to_string();
            if i & TERRITORY != 0 {
                v.push_str(territory);
            }
            if i & CODESET != 0 {
                v.push_str(codeset);
            }
            if i & MODIFIER != 0 {
                v.push_str(modifier);
            }
            v
        })
        .collect()
}

struct CachedLocale {
    variants: Vec<String>,
    last_used: Instant,
}

/// Remembers locale expansions so repeated lookups don't re-split names.
#[derive(Default)]
pub struct LocaleCache {
    entries: HashMap<String, CachedLocale>,
}

impl LocaleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `locale` into its variant list. `None` yields an empty list,
    /// which sources treat as "locale-independent values only".
    pub fn lookup(&mut self, locale: Option<&str>, now: Instant) -> Vec<String> {
        let Some(locale) = locale.filter(|l| !l.is_empty()) else {
            return Vec::new();
        };
        let entry = self
            .entries
            .entry(locale.to_string())
            .or_insert_with(|| CachedLocale {
                variants: expand_locale(locale),
                last_used: now,
            });
        entry.last_used = now;
        entry.variants.clone()
    }

    /// Drop expansions unused for longer than `max_age`. Returns how many
    /// were dropped.
    pub fn expire(&mut self, max_age: Duration, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, cached| now.saturating_duration_since(cached.last_used) <= max_age);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_locale_expands_most_specific_first() {
        assert_eq!(
            expand_locale("en_US.UTF-8@euro"),
            vec![
                "en_US.UTF-8@euro",
                "en_US@euro",
                "en.UTF-8@euro",
                "en@euro",
                "en_US.UTF-8",
                "en_US",
                "en.UTF-8",
                "en",
                "C",
            ]
        );
    }

    #[test]
    fn list_of_locales_is_deduplicated() {
        assert_eq!(expand_locale("de_DE:de"), vec!["de_DE", "de", "C"]);
        assert_eq!(expand_locale("C"), vec!["C"]);
        assert_eq!(expand_locale("POSIX"), vec!["C"]);
    }

    #[test]
    fn cache_expires_unused_entries() {
        let mut cache = LocaleCache::new();
        let t0 = Instant::now();
        assert_eq!(cache.lookup(Some("fr_FR"), t0), vec!["fr_FR", "fr", "C"]);
        assert!(cache.lookup(None, t0).is_empty());
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.expire(LOCALE_CACHE_MAX_AGE, t0 + Duration::from_secs(60)), 0);
        let later = t0 + LOCALE_CACHE_MAX_AGE + Duration::from_secs(1);
        assert_eq!(cache.expire(LOCALE_CACHE_MAX_AGE, later), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn lookup_refreshes_last_used() {
        let mut cache = LocaleCache::new();
        let t0 = Instant::now();
        cache.lookup(Some("fr_FR"), t0);
        let t1 = t0 + Duration::from_secs(20 * 60);
        cache.lookup(Some("fr_FR"), t1);
        assert_eq!(
            cache.expire(LOCALE_CACHE_MAX_AGE, t0 + Duration::from_secs(40 * 60)),
            0
        );
    }
}
