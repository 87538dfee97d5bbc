use config::LimitScope;
use serde::Serialize;

/// A named, reusable limit that can be applied to any endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitTemplate {
    /// Template name used to apply it.
    pub name: &'static str,
    /// Maximum number of requests in the window.
    pub max_requests: u32,
    /// Window width in seconds.
    pub window_seconds: u64,
    /// Identifiers the limit applies to.
    pub scope: LimitScope,
    /// What the template is meant for.
    pub description: &'static str,
}

const TEMPLATES: &[LimitTemplate] = &[
    LimitTemplate {
        name: "login",
        max_requests: 5,
        window_seconds: 300,
        scope: LimitScope::Ip,
        description: "Login attempts",
    },
    LimitTemplate {
        name: "register",
        max_requests: 3,
        window_seconds: 600,
        scope: LimitScope::Ip,
        description: "Account registration",
    },
    LimitTemplate {
        name: "search",
        max_requests: 100,
        window_seconds: 60,
        scope: LimitScope::Ip,
        description: "Search queries",
    },
    LimitTemplate {
        name: "password-reset",
        max_requests: 3,
        window_seconds: 3600,
        scope: LimitScope::Ip,
        description: "Password reset requests",
    },
    LimitTemplate {
        name: "comment",
        max_requests: 10,
        window_seconds: 60,
        scope: LimitScope::Both,
        description: "Posting comments",
    },
    LimitTemplate {
        name: "upload",
        max_requests: 20,
        window_seconds: 3600,
        scope: LimitScope::User,
        description: "File uploads",
    },
    LimitTemplate {
        name: "api-default",
        max_requests: 60,
        window_seconds: 60,
        scope: LimitScope::Both,
        description: "General API traffic",
    },
];

/// The template catalog.
pub fn templates() -> &'static [LimitTemplate] {
    TEMPLATES
}

/// Looks a template up by name.
pub fn template(name: &str) -> Option<&'static LimitTemplate> {
    TEMPLATES.iter().find(|template| template.name == name)
}

/// Limits compiled into the binary, applied unless configuration or an override says otherwise.
pub(crate) const BUILTIN_LIMITS: &[(&str, &str)] = &[
    ("/login", "login"),
    ("/register", "register"),
    ("/search", "search"),
    ("/password/reset", "password-reset"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = templates().iter().map(|t| t.name).collect();
        names.sort_unstable();
        names.dedup();

        assert_eq!(names.len(), templates().len());
    }

    #[test]
    fn builtin_limits_reference_templates() {
        for (endpoint, name) in BUILTIN_LIMITS {
            assert!(template(name).is_some(), "{endpoint} refers to missing template {name}");
        }
    }

    #[test]
    fn login_template() {
        insta::assert_json_snapshot!(template("login").unwrap(), @r#"
        {
          "name": "login",
          "max_requests": 5,
          "window_seconds": 300,
          "scope": "ip",
          "description": "Login attempts"
        }
        "#);
    }
}
