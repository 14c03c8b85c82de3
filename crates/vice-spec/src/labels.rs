//! Label construction for analysis resources.
//!
//! Kubernetes label values are restricted to 63 characters drawn from
//! `[A-Za-z0-9-_.]` (with alphanumeric ends), while app and analysis names
//! are free-form user text. Everything user-controlled goes through
//! [`sanitize`] before it lands in a label.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::model::EXTERNAL_ID_LABEL;

/// Maximum length of a Kubernetes label value.
pub const MAX_LABEL_LEN: usize = 63;

/// The `app-type` value marking resources of interactive analyses.
pub const APP_TYPE_INTERACTIVE: &str = "interactive";

/// Derives the stable per-analysis subdomain from the user id and external
/// id. Nine characters, always starting with a letter, deterministic across
/// time so restarted analyses keep their URL.
pub fn subdomain(user_id: &str, external_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(external_id.as_bytes());

    let mut name = format!("a{}", hex::encode(hasher.finalize()));
    name.truncate(9);
    name
}

/// Reduces free-form text to a legal Kubernetes label value: characters
/// outside `[A-Za-z0-9-_.]` become `-`, runs are collapsed, separator
/// characters are stripped from both ends, and the result is capped at
/// [`MAX_LABEL_LEN`].
pub fn sanitize(value: &str) -> String {
    let mut out = String::with_capacity(value.len().min(MAX_LABEL_LEN));
    let mut last_was_separator = false;

    for ch in value.chars() {
        let ch = if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' {
            ch
        } else {
            '-'
        };

        if ch == '-' {
            if last_was_separator || out.is_empty() {
                continue;
            }
            last_was_separator = true;
        } else {
            last_was_separator = false;
        }
        out.push(ch);
    }

    out.truncate(MAX_LABEL_LEN);
    while out.ends_with(['-', '.', '_']) {
        out.pop();
    }
    out
}

/// Arguments for [`label_set`]; everything an analysis stamps on its
/// resources.
pub struct LabelInputs<'a> {
    pub external_id: &'a str,
    pub app_id: &'a str,
    pub user_id: &'a str,
    pub username: &'a str,
    pub app_name: &'a str,
    pub analysis_name: &'a str,
    pub subdomain: &'a str,
    pub login_ip: Option<&'a str>,
}

/// The fixed label set carried by every resource of one analysis.
pub fn label_set(inputs: &LabelInputs<'_>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();

    labels.insert(EXTERNAL_ID_LABEL.to_string(), inputs.external_id.to_string());
    labels.insert("app-id".to_string(), inputs.app_id.to_string());
    labels.insert("user-id".to_string(), inputs.user_id.to_string());
    labels.insert("username".to_string(), sanitize(inputs.username));
    labels.insert("app-name".to_string(), sanitize(inputs.app_name));
    labels.insert("analysis-name".to_string(), sanitize(inputs.analysis_name));
    labels.insert("app-type".to_string(), APP_TYPE_INTERACTIVE.to_string());
    labels.insert("subdomain".to_string(), inputs.subdomain.to_string());

    if let Some(login_ip) = inputs.login_ip {
        labels.insert("login-ip".to_string(), sanitize(login_ip));
    }

    labels
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn subdomain_is_deterministic() {
        let first = subdomain("u-1", "inv-1");
        let second = subdomain("u-1", "inv-1");
        assert_eq!(first, second);
    }

    #[test]
    fn subdomain_shape() {
        for (user, invocation) in [("u-1", "inv-1"), ("", ""), ("user", "0000")] {
            let name = subdomain(user, invocation);
            assert_eq!(name.len(), 9);
            assert!(name.starts_with(|c: char| c.is_ascii_alphabetic()));
            assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn subdomain_differs_per_analysis() {
        assert_ne!(subdomain("u-1", "inv-1"), subdomain("u-1", "inv-2"));
        assert_ne!(subdomain("u-1", "inv-1"), subdomain("u-2", "inv-1"));
    }

    #[rstest]
    #[case("jupyter-lab", "jupyter-lab")]
    #[case("JupyterLab 4.1", "JupyterLab-4.1")]
    #[case("my awesome analysis!!", "my-awesome-analysis")]
    #[case("--weird--", "weird")]
    #[case("name_with_underscores", "name_with_underscores")]
    #[case("ünïcodé", "n-cod")]
    fn sanitize_examples(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(sanitize(raw), expected);
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(200);
        assert_eq!(sanitize(&long).len(), MAX_LABEL_LEN);
    }

    #[test]
    fn label_set_contents() {
        let labels = label_set(&LabelInputs {
            external_id: "inv-1",
            app_id: "app-1",
            user_id: "u-1",
            username: "ipcdev",
            app_name: "JupyterLab",
            analysis_name: "JupyterLab analysis1",
            subdomain: "abc123def",
            login_ip: Some("192.168.0.1"),
        });

        assert_eq!(labels["external-id"], "inv-1");
        assert_eq!(labels["app-type"], "interactive");
        assert_eq!(labels["analysis-name"], "JupyterLab-analysis1");
        assert_eq!(labels["login-ip"], "192.168.0.1");
    }

    #[test]
    fn label_set_without_login_ip() {
        let labels = label_set(&LabelInputs {
            external_id: "inv-1",
            app_id: "app-1",
            user_id: "u-1",
            username: "ipcdev",
            app_name: "app",
            analysis_name: "run",
            subdomain: "abc123def",
            login_ip: None,
        });
        assert!(!labels.contains_key("login-ip"));
    }
}
