//! Secret resolver (§6 collaborator): resolves `secretref:<provider>:<key>`
//! placeholders found in backend auth references into literal values at
//! connect time. Only one provider ships here — `env`, which looks the key
//! up via `std::env::var` — but the trait leaves room for others without
//! requiring a specific vendor SDK.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use regex::Regex;

/// A provider that can resolve secret references for a given scheme.
pub trait SecretProvider: Send + Sync {
    /// Provider name, matched against the middle segment of
    /// `secretref:<name>:<reference>`.
    fn name(&self) -> &str;

    /// Resolve a reference string to its value.
    fn resolve(&self, reference: &str) -> Result<String>;
}

/// Resolves `secretref:env:KEY` by reading the process environment.
pub struct EnvProvider;

impl SecretProvider for EnvProvider {
    fn name(&self) -> &str {
        "env"
    }

    fn resolve(&self, reference: &str) -> Result<String> {
        std::env::var(reference)
            .with_context(|| format!("secretref:env:{reference} — environment variable not set"))
    }
}

/// Resolves `secretref:<provider>:<reference>` patterns in config values.
pub struct SecretResolver {
    providers: HashMap<String, Box<dyn SecretProvider>>,
    pattern: Regex,
    strict: bool,
}

impl SecretResolver {
    /// `strict` controls whether an empty resolved value is treated as an
    /// error (per [`crate::config::SecretsConfig::strict`]).
    pub fn new(strict: bool) -> Self {
        Self {
            providers: HashMap::new(),
            pattern: Regex::new(r"secretref:([^:\s]+):([\w/.\-]+)").unwrap(),
            strict,
        }
    }

    /// A resolver preloaded with the [`EnvProvider`], the only provider this
    /// crate ships.
    pub fn with_defaults(strict: bool) -> Self {
        let mut resolver = Self::new(strict);
        resolver.register(Box::new(EnvProvider));
        resolver
    }

    pub fn register(&mut self, provider: Box<dyn SecretProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Resolve every `secretref:` occurrence in `value`. A value that
    /// contains no `secretref:` substring is returned unchanged without
    /// invoking the regex engine.
    pub fn resolve_value(&self, value: &str) -> Result<String> {
        if !value.contains("secretref:") {
            return Ok(value.to_string());
        }

        let captures: Vec<_> = self.pattern.captures_iter(value).collect();
        if captures.len() == 1 {
            let cap = &captures[0];
            let full_match = cap.get(0).unwrap();
            if full_match.start() == 0 && full_match.end() == value.len() {
                return self.resolve_single(&cap[1], &cap[2]);
            }
        }

        let mut result = value.to_string();
        let matches: Vec<_> = self
            .pattern
            .captures_iter(value)
            .map(|cap| {
                let full = cap.get(0).unwrap();
                (full.start(), full.end(), cap[1].to_string(), cap[2].to_string())
            })
            .collect();

        for (start, end, provider_name, reference) in matches.into_iter().rev() {
            let resolved = self.resolve_single(&provider_name, &reference)?;
            result.replace_range(start..end, &resolved);
        }
        Ok(result)
    }

    pub fn resolve_map(&self, map: &mut HashMap<String, String>) -> Result<()> {
        for (key, value) in map.iter_mut() {
            *value = self
                .resolve_value(value)
                .with_context(|| format!("resolving key '{key}'"))?;
        }
        Ok(())
    }

    pub fn resolve_option(&self, opt: &Option<String>) -> Result<Option<String>> {
        opt.as_ref().map(|v| self.resolve_value(v)).transpose()
    }

    fn resolve_single(&self, provider_name: &str, reference: &str) -> Result<String> {
        let provider = self
            .providers
            .get(provider_name)
            .with_context(|| format!("unknown secret provider: '{provider_name}'"))?;

        let resolved = provider
            .resolve(reference)
            .with_context(|| format!("provider '{provider_name}' failed to resolve '{reference}'"))?;

        if self.strict && resolved.is_empty() {
            bail!("secret provider '{provider_name}' returned empty value for '{reference}' (strict mode)");
        }
        Ok(resolved)
    }
}

/// Resolves a backend's `auth_ref` (if set) into a bearer token suitable for
/// an `Authorization` header or a STDIO child's environment, per the
/// transport's needs.
pub fn resolve_auth_ref(resolver: &SecretResolver, auth_ref: &Option<String>) -> Result<Option<String>> {
    resolver.resolve_option(auth_ref)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProvider {
        secrets: HashMap<String, String>,
    }

    impl StubProvider {
        fn new(secrets: Vec<(&str, &str)>) -> Self {
            Self {
                secrets: secrets.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            }
        }
    }

    impl SecretProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        fn resolve(&self, reference: &str) -> Result<String> {
            self.secrets.get(reference).cloned().with_context(|| format!("secret not found: {reference}"))
        }
    }

    fn make_resolver(strict: bool) -> SecretResolver {
        let mut resolver = SecretResolver::new(strict);
        resolver.register(Box::new(StubProvider::new(vec![
            ("API_KEY", "sk-12345"),
            ("TOKEN", "tok-abc"),
            ("EMPTY", ""),
        ])));
        resolver
    }

    #[test]
    fn resolves_full_value() {
        let resolver = make_resolver(false);
        assert_eq!(resolver.resolve_value("secretref:stub:API_KEY").unwrap(), "sk-12345");
    }

    #[test]
    fn resolves_inline_within_surrounding_text() {
        let resolver = make_resolver(false);
        assert_eq!(
            resolver.resolve_value("Bearer secretref:stub:TOKEN").unwrap(),
            "Bearer tok-abc"
        );
    }

    #[test]
    fn passes_through_values_without_secretref() {
        let resolver = make_resolver(false);
        assert_eq!(resolver.resolve_value("plain-value").unwrap(), "plain-value");
    }

    #[test]
    fn unknown_provider_errors() {
        let resolver = make_resolver(false);
        let err = resolver.resolve_value("secretref:unknown:x").unwrap_err();
        assert!(err.to_string().contains("unknown secret provider"));
    }

    #[test]
    fn strict_mode_rejects_empty_values() {
        let resolver = make_resolver(true);
        let err = resolver.resolve_value("secretref:stub:EMPTY").unwrap_err();
        assert!(err.to_string().contains("empty value"));
    }

    #[test]
    fn lenient_mode_allows_empty_values() {
        let resolver = make_resolver(false);
        assert_eq!(resolver.resolve_value("secretref:stub:EMPTY").unwrap(), "");
    }

    #[test]
    fn env_provider_resolves_from_process_environment() {
        // SAFETY: test runs single-threaded within this crate's test harness.
        unsafe { std::env::set_var("ONLY1MCP_TEST_SECRET", "from-env") };
        let provider = EnvProvider;
        assert_eq!(provider.resolve("ONLY1MCP_TEST_SECRET").unwrap(), "from-env");
        unsafe { std::env::remove_var("ONLY1MCP_TEST_SECRET") };
    }

    #[test]
    fn env_provider_missing_key_errors() {
        unsafe { std::env::remove_var("ONLY1MCP_TEST_MISSING") };
        let provider = EnvProvider;
        assert!(provider.resolve("ONLY1MCP_TEST_MISSING").is_err());
    }
}
