//! Security requirement validation
//!
//! Startup gate that refuses to run a gateway whose authentication was not
//! configured on purpose. Every violated requirement is reported at once so
//! the operator can fix the configuration in a single pass.

use super::types::{AuthMode, Config};
use crate::error::{Error, Result};
use secrecy::ExposeSecret;

/// A mandatory security requirement
#[derive(Debug, Clone, Copy)]
pub struct SecurityRequirement {
    /// Config field the requirement is about
    pub field: &'static str,
    /// What is required
    pub description: &'static str,
    /// How to fix a violation
    pub remediation: &'static str,
    /// Returns true when the config satisfies the requirement
    pub check: fn(&Config) -> bool,
}

/// Requirements every gateway config must satisfy before binding a socket
pub const MANDATORY_SECURITY_REQUIREMENTS: &[SecurityRequirement] = &[
    SecurityRequirement {
        field: "gateway.auth.mode",
        description: "An authentication mode must be set (token, password or trusted-proxy)",
        remediation: "Set gateway.auth.mode to \"token\", \"password\" or \"trusted-proxy\"",
        check: has_auth_mode,
    },
    SecurityRequirement {
        field: "gateway.auth.credential",
        description: "The credential for the selected authentication mode must be present",
        remediation: "Set gateway.auth.token (or OPENGATE_GATEWAY_TOKEN), gateway.auth.password \
                      (or OPENGATE_GATEWAY_PASSWORD), or gateway.auth.trustedProxy.userHeader",
        check: has_mode_credential,
    },
    SecurityRequirement {
        field: "gateway.securityConfigured",
        description: "Security must be explicitly acknowledged as configured",
        remediation: "Set gateway.securityConfigured to true after reviewing the auth settings",
        check: is_security_acknowledged,
    },
];

/// Outcome of validating the security requirements
#[derive(Debug, Clone)]
pub struct SecurityValidationResult {
    /// True when no requirement failed
    pub valid: bool,
    /// Every violated requirement, in declaration order
    pub failures: Vec<SecurityRequirement>,
}

fn has_auth_mode(config: &Config) -> bool {
    config.gateway.auth.mode.is_some()
}

fn has_mode_credential(config: &Config) -> bool {
    let auth = &config.gateway.auth;
    let non_empty = |secret: &Option<secrecy::SecretString>| {
        secret
            .as_ref()
            .is_some_and(|s| !s.expose_secret().trim().is_empty())
    };

    match auth.mode {
        Some(AuthMode::Token) => non_empty(&auth.token),
        Some(AuthMode::Password) => non_empty(&auth.password),
        Some(AuthMode::TrustedProxy) => auth
            .trusted_proxy
            .as_ref()
            .is_some_and(|p| !p.user_header.trim().is_empty()),
        None => false,
    }
}

fn is_security_acknowledged(config: &Config) -> bool {
    config.gateway.security_configured == Some(true)
}

/// Check every mandatory requirement and collect the failures
pub fn validate_security_requirements(config: &Config) -> SecurityValidationResult {
    let failures: Vec<SecurityRequirement> = MANDATORY_SECURITY_REQUIREMENTS
        .iter()
        .filter(|req| !(req.check)(config))
        .copied()
        .collect();

    SecurityValidationResult {
        valid: failures.is_empty(),
        failures,
    }
}

/// Render failures as an operator-facing message
pub fn format_security_failures(failures: &[SecurityRequirement]) -> String {
    let mut lines = vec![
        "Gateway startup blocked: mandatory security requirements are not met.".to_string(),
        String::new(),
    ];

    for failure in failures {
        lines.push(format!("  ✗ {}: {}", failure.field, failure.description));
        lines.push(format!("    → {}", failure.remediation));
        lines.push(String::new());
    }

    lines.push("Run `opengate configure` to set up authentication,".to_string());
    lines.push("or `opengate security audit` to review the current settings.".to_string());
    lines.join("\n")
}

/// Fail-closed gate: error out with the formatted failure list
pub fn ensure_security_requirements(config: &Config) -> Result<()> {
    let result = validate_security_requirements(config);
    if result.valid {
        Ok(())
    } else {
        Err(Error::SecurityValidation(format_security_failures(
            &result.failures,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::TrustedProxyConfig;
    use secrecy::SecretString;

    fn config_with(mode: Option<AuthMode>, configured: Option<bool>) -> Config {
        let mut config = Config::default();
        config.gateway.auth.mode = mode;
        config.gateway.security_configured = configured;
        config
    }

    fn token_config() -> Config {
        let mut config = config_with(Some(AuthMode::Token), Some(true));
        config.gateway.auth.token = Some(SecretString::from("test-token"));
        config
    }

    fn fields(result: &SecurityValidationResult) -> Vec<&'static str> {
        result.failures.iter().map(|f| f.field).collect()
    }

    #[test]
    fn test_exactly_three_requirements() {
        assert_eq!(MANDATORY_SECURITY_REQUIREMENTS.len(), 3);
        for req in MANDATORY_SECURITY_REQUIREMENTS {
            assert!(!req.field.is_empty());
            assert!(!req.description.is_empty());
            assert!(!req.remediation.is_empty());
        }
    }

    #[test]
    fn test_token_config_passes() {
        let result = validate_security_requirements(&token_config());
        assert!(result.valid);
        assert!(result.failures.is_empty());
    }

    #[test]
    fn test_password_config_passes() {
        let mut config = config_with(Some(AuthMode::Password), Some(true));
        config.gateway.auth.password = Some(SecretString::from("hunter2"));
        assert!(validate_security_requirements(&config).valid);
    }

    #[test]
    fn test_trusted_proxy_config_passes() {
        let mut config = config_with(Some(AuthMode::TrustedProxy), Some(true));
        config.gateway.auth.trusted_proxy = Some(TrustedProxyConfig {
            user_header: "x-forwarded-user".to_string(),
            required_headers: vec!["x-forwarded-proto".to_string()],
            allow_users: vec!["user@example.com".to_string()],
            trusted_proxies: Vec::new(),
        });
        assert!(validate_security_requirements(&config).valid);
    }

    #[test]
    fn test_missing_mode_fails() {
        let config = config_with(None, Some(true));
        let result = validate_security_requirements(&config);
        assert!(!result.valid);
        assert!(fields(&result).contains(&"gateway.auth.mode"));
    }

    #[test]
    fn test_missing_credential_fails() {
        let config = config_with(Some(AuthMode::Token), Some(true));
        let result = validate_security_requirements(&config);
        assert_eq!(fields(&result), vec!["gateway.auth.credential"]);

        let mut blank = config_with(Some(AuthMode::Password), Some(true));
        blank.gateway.auth.password = Some(SecretString::from("   "));
        assert!(!validate_security_requirements(&blank).valid);

        let mut proxy = config_with(Some(AuthMode::TrustedProxy), Some(true));
        proxy.gateway.auth.trusted_proxy = Some(TrustedProxyConfig::default());
        assert!(!validate_security_requirements(&proxy).valid);
    }

    #[test]
    fn test_security_configured_must_be_true() {
        let mut config = token_config();
        config.gateway.security_configured = Some(false);
        assert_eq!(
            fields(&validate_security_requirements(&config)),
            vec!["gateway.securityConfigured"]
        );

        config.gateway.security_configured = None;
        assert!(!validate_security_requirements(&config).valid);
    }

    #[test]
    fn test_empty_config_reports_every_failure() {
        let result = validate_security_requirements(&Config::default());
        assert!(!result.valid);
        assert_eq!(result.failures.len(), 3);
    }

    #[test]
    fn test_format_layout() {
        let output = format_security_failures(MANDATORY_SECURITY_REQUIREMENTS);
        let lines: Vec<&str> = output.split('\n').collect();
        assert!(lines[0].contains("Gateway startup blocked"));
        assert_eq!(lines[1], "");
        assert_eq!(output.matches('✗').count(), 3);
        assert_eq!(output.matches('→').count(), 3);
        assert!(output.contains("opengate security audit"));
        assert!(output.contains("opengate configure"));
        for req in MANDATORY_SECURITY_REQUIREMENTS {
            assert!(output.contains(req.field));
            assert!(output.contains(req.description));
            assert!(output.contains(req.remediation));
        }
    }

    #[test]
    fn test_format_empty_list_still_has_header_and_footer() {
        let output = format_security_failures(&[]);
        assert!(output.contains("Gateway startup blocked"));
        assert!(output.contains("opengate security audit"));
    }

    #[test]
    fn test_ensure_fails_closed() {
        let err = ensure_security_requirements(&Config::default()).unwrap_err();
        assert!(matches!(err, Error::SecurityValidation(_)));
        assert!(err.to_string().contains("gateway.securityConfigured"));
        assert!(ensure_security_requirements(&token_config()).is_ok());
    }
}
