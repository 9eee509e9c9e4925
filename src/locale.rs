//! Account Localizer
//!
//! Windows localizes the name of the built-in "everyone" group, so a
//! permission grant has to use the right name for the host language. The
//! name is looked up from a fixed table keyed on the language part of the
//! locale; anything unmapped falls back to the English name with a warning.
//!
//! The system locale is detected once per process and cached.

use crate::error::MigrationError;
use std::sync::OnceLock;

/// English name of the built-in "everyone" principal
pub const EVERYONE_FALLBACK: &str = "Everyone";

/// Language prefix -> localized principal name
const PRINCIPAL_TABLE: &[(&str, &str)] = &[
    ("en", "Everyone"),
    ("c", "Everyone"),
    ("posix", "Everyone"),
    ("pt", "Todos"),
    ("es", "Todos"),
    ("fr", "Tout le monde"),
    ("de", "Jeder"),
    // Windows ships the English name on Italian installs
    ("it", "Everyone"),
];

/// Environment variables consulted for the system locale, in priority order
const LOCALE_VARS: &[&str] = &["LC_ALL", "LC_MESSAGES", "LANG"];

static SYSTEM_LOCALE: OnceLock<String> = OnceLock::new();

/// Resolved principal name, with a warning when the locale was not mapped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalName {
    /// Name to hand to the permission grantor
    pub name: String,
    /// The locale that had no table entry, if the fallback was used
    pub unmapped_locale: Option<String>,
}

impl PrincipalName {
    /// Non-fatal warning for an unmapped locale
    pub fn warning(&self) -> Option<MigrationError> {
        self.unmapped_locale
            .as_ref()
            .map(|locale| MigrationError::LocaleNotMapped(locale.clone()))
    }
}

/// Extract the lowercase language prefix (`pt_BR.UTF-8` -> `pt`)
fn language_prefix(locale: &str) -> String {
    locale
        .split(['_', '-', '.', '@'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Resolve the "everyone" principal name for an explicit locale.
pub fn resolve_everyone_account_name(locale: &str) -> PrincipalName {
    let prefix = language_prefix(locale);
    let prefix = if prefix.is_empty() { "c".to_string() } else { prefix };

    match PRINCIPAL_TABLE.iter().find(|(lang, _)| *lang == prefix) {
        Some((_, name)) => PrincipalName {
            name: (*name).to_string(),
            unmapped_locale: None,
        },
        None => {
            tracing::warn!("Locale '{}' not mapped, using '{}'", locale, EVERYONE_FALLBACK);
            PrincipalName {
                name: EVERYONE_FALLBACK.to_string(),
                unmapped_locale: Some(locale.to_string()),
            }
        }
    }
}

/// Resolve the principal name for the cached system locale.
pub fn resolve_system_everyone_account_name() -> PrincipalName {
    resolve_everyone_account_name(system_locale())
}

/// System locale, detected on first use and cached for the process lifetime.
pub fn system_locale() -> &'static str {
    SYSTEM_LOCALE.get_or_init(|| {
        let locale = detect_locale_with(|var| std::env::var(var).ok());
        tracing::debug!("Detected system locale: {}", locale);
        locale
    })
}

/// Pick the first non-empty locale variable from `lookup`, defaulting to `C`.
pub fn detect_locale_with<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    LOCALE_VARS
        .iter()
        .filter_map(|var| lookup(var))
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "C".to_string())
}

/// Locale source for a migration run: an explicit override or the system.
#[derive(Debug, Clone, Default)]
pub struct AccountLocalizer {
    locale_override: Option<String>,
}

impl AccountLocalizer {
    /// Localizer that uses the cached system locale
    pub fn system() -> Self {
        Self::default()
    }

    /// Localizer pinned to `locale`, bypassing detection
    pub fn with_locale(locale: impl Into<String>) -> Self {
        Self {
            locale_override: Some(locale.into()),
        }
    }

    /// Locale this localizer resolves against
    pub fn locale(&self) -> &str {
        self.locale_override
            .as_deref()
            .unwrap_or_else(|| system_locale())
    }

    /// Localized "everyone" principal
    pub fn everyone(&self) -> PrincipalName {
        resolve_everyone_account_name(self.locale())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_known_locales() {
        assert_eq!(resolve_everyone_account_name("pt_BR").name, "Todos");
        assert_eq!(resolve_everyone_account_name("es_ES.UTF-8").name, "Todos");
        assert_eq!(resolve_everyone_account_name("fr-FR").name, "Tout le monde");
        assert_eq!(resolve_everyone_account_name("de_DE@euro").name, "Jeder");
        assert_eq!(resolve_everyone_account_name("it_IT").name, "Everyone");
        assert_eq!(resolve_everyone_account_name("en_US").name, "Everyone");
        assert_eq!(resolve_everyone_account_name("POSIX").name, "Everyone");
    }

    #[test]
    fn test_locale_separators_map_identically() {
        let a = resolve_everyone_account_name("pt_BR");
        let b = resolve_everyone_account_name("pt-BR");
        let c = resolve_everyone_account_name("pt_BR.UTF-8");
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert!(a.warning().is_none());
    }

    #[test]
    fn test_unmapped_locale_falls_back_with_warning() {
        let resolved = resolve_everyone_account_name("xx_XX");
        assert_eq!(resolved.name, "Everyone");
        assert!(matches!(
            resolved.warning(),
            Some(MigrationError::LocaleNotMapped(ref l)) if l == "xx_XX"
        ));
    }

    #[test]
    fn test_detection_priority() {
        let env: HashMap<&str, &str> =
            [("LC_ALL", ""), ("LC_MESSAGES", "de_DE.UTF-8"), ("LANG", "fr_FR")].into();
        let locale = detect_locale_with(|var| env.get(var).map(|v| v.to_string()));
        assert_eq!(locale, "de_DE.UTF-8");

        let locale = detect_locale_with(|_| None);
        assert_eq!(locale, "C");
    }

    #[test]
    fn test_override_bypasses_detection() {
        let localizer = AccountLocalizer::with_locale("pt_BR");
        assert_eq!(localizer.locale(), "pt_BR");
        assert_eq!(localizer.everyone().name, "Todos");
    }

    #[test]
    fn test_system_localizer_borrows_detected_locale() {
        let localizer = AccountLocalizer::system();
        let locale: &str = localizer.locale();
        assert_eq!(locale, system_locale());
        assert_eq!(localizer.everyone(), resolve_everyone_account_name(locale));
    }

    #[test]
    fn test_system_locale_is_cached() {
        let first = system_locale();
        let second = system_locale();
        assert!(std::ptr::eq(first, second));
    }
}
