use std::{path::Path, str::FromStr};

use anyhow::bail;
use indoc::formatdoc;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_dynamic_string::DynamicString;
use std::fmt::Write;
use toml::Value;

use crate::{Config, EndpointLimit};

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref().to_path_buf();
    let content = std::fs::read_to_string(&path)?;

    parse(&content)
}

pub(crate) fn parse(content: &str) -> anyhow::Result<Config> {
    let mut raw_config: Value = toml::from_str(content)?;
    expand_dynamic_strings(&mut Vec::new(), &mut raw_config)?;

    let config = Config::deserialize(raw_config)?;
    validate(&config)?;

    if !config.rate_limit.enabled {
        log::warn!("Rate limiting is disabled, every request will be admitted");
    }

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    let rate_limit = &config.rate_limit;

    if !(rate_limit.warning_threshold > 0.0 && rate_limit.warning_threshold <= 1.0) {
        bail!(
            "rate_limit.warning_threshold must be within (0, 1], got {}",
            rate_limit.warning_threshold
        );
    }

    if rate_limit.override_ttl.as_secs() == 0 {
        bail!("rate_limit.override_ttl must be at least one second");
    }

    validate_endpoint_limit("rate_limit.default", &rate_limit.default)?;

    for (path, limit) in &rate_limit.endpoints {
        if !path.starts_with('/') {
            bail!("Endpoint '{path}' in rate_limit.endpoints must start with '/'");
        }

        validate_endpoint_limit(&format!("rate_limit.endpoints.\"{path}\""), limit)?;
    }

    let alerts = &config.alerts;

    if alerts.cooldown.as_secs() < 2 {
        bail!("alerts.cooldown must be at least two seconds");
    }

    if alerts.queue_capacity == 0 {
        bail!("alerts.queue_capacity must be greater than zero");
    }

    if alerts.stats_retention.as_secs() < 24 * 60 * 60 {
        bail!("alerts.stats_retention must be at least one day");
    }

    if config.server.client_ip.trusted_proxies == 0 {
        bail!("server.client_ip.trusted_proxies must be at least one");
    }

    let admin = &config.server.admin;
    let has_token = admin.token.as_ref().is_some_and(|t| !t.expose_secret().is_empty());

    if admin.enabled && !has_token {
        bail!(formatdoc! {r#"
            The administrative API is enabled without a token. Configure one, for example:

              [server.admin]
              enabled = true
              token = "{{{{ env.FLOODGATE_ADMIN_TOKEN }}}}"
        "#});
    }

    Ok(())
}

fn validate_endpoint_limit(path: &str, limit: &EndpointLimit) -> anyhow::Result<()> {
    if limit.max_requests == 0 {
        bail!("{path}.max_requests must be greater than zero");
    }

    if limit.window.as_secs() == 0 {
        bail!("{path}.window must be at least one second");
    }

    Ok(())
}

fn expand_dynamic_strings<'a>(path: &mut Vec<Result<&'a str, usize>>, value: &'a mut Value) -> anyhow::Result<()> {
    match value {
        Value::String(s) => match DynamicString::<String>::from_str(s) {
            Ok(out) => *s = out.into_inner(),
            Err(err) => {
                let mut p = String::new();
                for segment in path {
                    match segment {
                        Ok(s) => {
                            p.push_str(s);
                            p.push('.');
                        }
                        Err(i) => write!(p, "[{i}]")?,
                    }
                }
                if p.ends_with('.') {
                    p.pop();
                }

                bail!("Failed to expand dynamic string at path '{p}': {err}");
            }
        },
        Value::Array(values) => {
            for (i, value) in values.iter_mut().enumerate() {
                path.push(Err(i));
                expand_dynamic_strings(path, value)?;
                path.pop();
            }
        }
        Value::Table(map) => {
            for (key, value) in map {
                path.push(Ok(key.as_str()));
                expand_dynamic_strings(path, value)?;
                path.pop();
            }
        }
        Value::Integer(_) | Value::Float(_) | Value::Boolean(_) | Value::Datetime(_) => (),
    }

    Ok(())
}
